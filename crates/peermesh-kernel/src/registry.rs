//! Component registry: the locally hosted components, in registration order.

use chrono::{DateTime, Utc};
use peermesh_types::component::{Component, ComponentState};
use peermesh_types::envelope::Payload;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tracing::info;

/// A registered component.
#[derive(Clone)]
pub struct Registration {
    pub component: Arc<dyn Component>,
    pub registered_at: DateTime<Utc>,
}

/// Serializable view of one component, used in status replies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentSummary {
    pub id: String,
    pub component_type: String,
    pub status: ComponentState,
    pub registered_at: DateTime<Utc>,
    pub details: Payload,
}

/// Thread-safe registry of local components.
///
/// Registering an id that already exists replaces it and moves it to the end
/// of the registration order.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    entries: Arc<RwLock<Vec<Registration>>>,
}

impl ComponentRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component. Returns the registration it replaced, if any.
    pub fn register(&self, component: Arc<dyn Component>) -> Option<Registration> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let replaced = entries
            .iter()
            .position(|r| r.component.id() == component.id())
            .map(|i| entries.remove(i));
        info!(
            component = component.id(),
            component_type = component.component_type(),
            replaced = replaced.is_some(),
            "Component registered"
        );
        entries.push(Registration {
            component,
            registered_at: Utc::now(),
        });
        replaced
    }

    /// Remove a component by id.
    pub fn unregister(&self, id: &str) -> Option<Registration> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let index = entries.iter().position(|r| r.component.id() == id)?;
        Some(entries.remove(index))
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Component>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .find(|r| r.component.id() == id)
            .map(|r| Arc::clone(&r.component))
    }

    /// The most recently registered component of this type.
    pub fn find_by_type(&self, component_type: &str) -> Option<Arc<dyn Component>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .rev()
            .find(|r| r.component.component_type() == component_type)
            .map(|r| Arc::clone(&r.component))
    }

    /// All components in registration order.
    pub fn all(&self) -> Vec<Arc<dyn Component>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().map(|r| Arc::clone(&r.component)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status of every component, in registration order.
    pub fn summaries(&self) -> Vec<ComponentSummary> {
        let entries: Vec<Registration> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        entries
            .into_iter()
            .map(|r| ComponentSummary {
                id: r.component.id().to_string(),
                component_type: r.component.component_type().to_string(),
                status: r.component.status(),
                registered_at: r.registered_at,
                details: r.component.status_snapshot(),
            })
            .collect()
    }
}
