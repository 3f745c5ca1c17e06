use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use switchboard_core::{SwitchboardError, SwitchboardResult, BROADCAST};
use tokio::sync::RwLock;

/// Self-reported state of a connected component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Active,
    Busy,
    Idle,
    Error,
}

/// A participant connected to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    pub component_type: String,
    pub capabilities: BTreeSet<String>,
    pub status: ComponentStatus,
    pub registered_at: DateTime<Utc>,
    /// Refreshed by heartbeats; drives liveness eviction.
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Component {
    /// How long ago the component was last seen, relative to `now`.
    pub fn silent_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_seen).to_std().unwrap_or_default()
    }
}

/// What a component declares about itself when joining.
#[derive(Debug, Clone)]
pub struct ComponentRegistration {
    pub id: String,
    pub component_type: String,
    pub capabilities: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ComponentRegistration {
    pub fn new(id: impl Into<String>, component_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            component_type: component_type.into(),
            capabilities: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Tracks every component connected to the bus.
///
/// Entries are created by [`register`](Self::register), refreshed by
/// [`heartbeat`](Self::heartbeat), and removed by
/// [`unregister`](Self::unregister) or [`evict_stale`](Self::evict_stale).
pub struct ComponentRegistry {
    components: RwLock<HashMap<String, Component>>,
    liveness_timeout: Duration,
}

impl ComponentRegistry {
    /// Create a registry whose entries go stale after `liveness_timeout`
    /// without a heartbeat.
    pub fn new(liveness_timeout: Duration) -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            liveness_timeout,
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// Register a component.
    ///
    /// Fails with [`SwitchboardError::AlreadyRegistered`] while an entry with the
    /// same id is still live. A stale entry (silent past the liveness timeout)
    /// is replaced.
    pub async fn register(&self, registration: ComponentRegistration) -> SwitchboardResult<Component> {
        let (component, _) = self.register_replacing(registration).await?;
        Ok(component)
    }

    /// Like [`register`](Self::register), but also hands back the stale entry
    /// that was replaced, if any, so the caller can tear it down.
    pub async fn register_replacing(
        &self,
        registration: ComponentRegistration,
    ) -> SwitchboardResult<(Component, Option<Component>)> {
        let id = registration.id.trim().to_string();
        if id.is_empty() || id == BROADCAST {
            return Err(SwitchboardError::InvalidComponentId(registration.id));
        }

        let now = Utc::now();
        let mut components = self.components.write().await;
        if let Some(existing) = components.get(&id) {
            if existing.silent_for(now) <= self.liveness_timeout {
                return Err(SwitchboardError::AlreadyRegistered(id));
            }
            tracing::info!(component_id = %id, "Replacing stale component registration");
        }

        let component = Component {
            id: id.clone(),
            component_type: registration.component_type,
            capabilities: registration.capabilities.into_iter().collect(),
            status: ComponentStatus::Active,
            registered_at: now,
            last_seen: now,
            metadata: registration.metadata,
        };
        let replaced = components.insert(id.clone(), component.clone());
        tracing::info!(
            component_id = %id,
            component_type = %component.component_type,
            "Component registered"
        );
        Ok((component, replaced))
    }

    /// Remove a component.
    pub async fn unregister(&self, id: &str) -> SwitchboardResult<Component> {
        let removed = self.components.write().await.remove(id);
        match removed {
            Some(component) => {
                tracing::info!(component_id = %id, "Component unregistered");
                Ok(component)
            }
            None => Err(SwitchboardError::ComponentNotFound(id.to_string())),
        }
    }

    /// Refresh `last_seen`. Returns `false` (and does nothing) for unknown ids.
    pub async fn heartbeat(&self, id: &str) -> bool {
        let mut components = self.components.write().await;
        match components.get_mut(id) {
            Some(component) => {
                component.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Update a component's reported status (Busy/Idle as agents take and finish work).
    pub async fn set_status(&self, id: &str, status: ComponentStatus) -> SwitchboardResult<()> {
        let mut components = self.components.write().await;
        let component = components
            .get_mut(id)
            .ok_or_else(|| SwitchboardError::ComponentNotFound(id.to_string()))?;
        component.status = status;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> SwitchboardResult<Component> {
        self.components
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SwitchboardError::ComponentNotFound(id.to_string()))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.components.read().await.contains_key(id)
    }

    /// Capabilities of a registered component, sorted.
    pub async fn capabilities(&self, id: &str) -> Option<Vec<String>> {
        self.components
            .read()
            .await
            .get(id)
            .map(|c| c.capabilities.iter().cloned().collect())
    }

    /// Number of registered components.
    pub async fn active_count(&self) -> usize {
        self.components.read().await.len()
    }

    /// Snapshot of all components, oldest registration first.
    pub async fn list(&self) -> Vec<Component> {
        let mut components: Vec<Component> =
            self.components.read().await.values().cloned().collect();
        components.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        components
    }

    /// Remove and return every component silent for longer than the
    /// liveness timeout.
    pub async fn evict_stale(&self) -> Vec<Component> {
        let now = Utc::now();
        let mut components = self.components.write().await;
        let stale: Vec<String> = components
            .values()
            .filter(|c| c.silent_for(now) > self.liveness_timeout)
            .map(|c| c.id.clone())
            .collect();
        let mut evicted: Vec<Component> = stale
            .iter()
            .filter_map(|id| components.remove(id))
            .collect();
        evicted.sort_by(|a, b| a.id.cmp(&b.id));
        evicted
    }

    /// Serialize the registry for status endpoints.
    pub async fn to_json(&self) -> serde_json::Value {
        let components = self.list().await;
        serde_json::json!({
            "count": components.len(),
            "components": components,
        })
    }
}
