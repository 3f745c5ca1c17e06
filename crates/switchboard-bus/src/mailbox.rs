use std::time::Duration;
use switchboard_core::Message;
use tokio::sync::mpsc;

/// Receiving end of a component's inbox.
///
/// Returned by [`MessageBus::connect`](crate::MessageBus::connect). Dropping it
/// makes further deliveries to the component count as failures.
pub struct Mailbox {
    component_id: String,
    receiver: mpsc::Receiver<Message>,
}

impl Mailbox {
    pub(crate) fn new(component_id: String, receiver: mpsc::Receiver<Message>) -> Self {
        Self {
            component_id,
            receiver,
        }
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    /// Wait for the next message. `None` once the bus has dropped the sender.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Wait for the next message for at most `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    /// Take everything currently waiting, in delivery order.
    pub fn drain(&mut self) -> Vec<Message> {
        std::iter::from_fn(|| self.receiver.try_recv().ok()).collect()
    }
}
