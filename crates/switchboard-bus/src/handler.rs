use async_trait::async_trait;
use std::sync::Arc;
use switchboard_core::{Message, SwitchboardResult};

/// Per-type hook invoked by the delivery loop before routing.
///
/// Returned messages are enqueued on the bus after the handler finishes. An
/// `Err` (or a panic) is logged, counted, and reported to the sender as an
/// `Error` message; it never stops the delivery loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> SwitchboardResult<Vec<Message>>;
}

/// Adapter that turns a synchronous closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&Message) -> SwitchboardResult<Vec<Message>> + Send + Sync,
{
    async fn handle(&self, message: &Message) -> SwitchboardResult<Vec<Message>> {
        (self.func)(message)
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F>(func: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&Message) -> SwitchboardResult<Vec<Message>> + Send + Sync + 'static,
{
    Arc::new(FnHandler { func })
}
