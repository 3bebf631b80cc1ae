//! Host component registry.
//!
//! Components opt into capabilities explicitly by handing the registry a
//! [`Lifecycle`] and/or a [`MemoryReporter`] at registration time. The
//! resulting [`Capabilities`] are computed once and stored, so cleanup and
//! restart code never probes a component for methods it may not have.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{RuntimeError, ServiceError};

/// Start/stop capability of a managed service.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Starts (or restarts) the service.
    async fn start(&self) -> Result<(), ServiceError>;

    /// Stops the service, releasing what it can.
    async fn stop(&self) -> Result<(), ServiceError>;
}

/// Memory-usage capability of a managed service.
pub trait MemoryReporter: Send + Sync {
    /// Approximate bytes attributable to this component.
    fn memory_usage(&self) -> u64;
}

impl<F> MemoryReporter for F
where
    F: Fn() -> u64 + Send + Sync,
{
    fn memory_usage(&self) -> u64 {
        self()
    }
}

/// Capabilities a component opted into at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Component can be stopped and started.
    pub lifecycle: bool,
    /// Component reports its memory usage.
    pub memory: bool,
}

/// Registration request for a host component.
///
/// # Example
///
/// ```rust
/// use guardian_runtime::{ComponentRegistration, ComponentRegistry};
///
/// let registry = ComponentRegistry::new();
/// let caps = registry.register(
///     ComponentRegistration::new("session-cache")
///         .with_priority(20)
///         .with_memory_reporter(|| 4096u64),
/// );
/// assert!(caps.memory);
/// assert!(!caps.lifecycle);
/// ```
#[derive(Clone)]
pub struct ComponentRegistration {
    name: String,
    priority: u32,
    lifecycle: Option<Arc<dyn Lifecycle>>,
    memory: Option<Arc<dyn MemoryReporter>>,
}

impl ComponentRegistration {
    /// Default priority for components that do not set one.
    pub const DEFAULT_PRIORITY: u32 = 100;

    /// Creates a registration with default priority and no capabilities.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: Self::DEFAULT_PRIORITY,
            lifecycle: None,
            memory: None,
        }
    }

    /// Sets the priority. Lower values stop first.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Opts into the start/stop capability.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn Lifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Opts into the memory-usage capability.
    #[must_use]
    pub fn with_memory_reporter(mut self, reporter: impl MemoryReporter + 'static) -> Self {
        self.memory = Some(Arc::new(reporter));
        self
    }

    /// Component name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ComponentRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistration")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("lifecycle", &self.lifecycle.is_some())
            .field("memory", &self.memory.is_some())
            .finish()
    }
}

/// A component as stored in the registry.
#[derive(Clone, Debug)]
pub struct RegisteredComponent {
    registration: ComponentRegistration,
    sequence: u64,
    capabilities: Capabilities,
}

impl RegisteredComponent {
    /// Component name.
    pub fn name(&self) -> &str {
        &self.registration.name
    }

    /// Shutdown priority (lower first).
    pub fn priority(&self) -> u32 {
        self.registration.priority
    }

    /// Registration order, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Capabilities recorded at registration.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Current memory usage, if the component reports it.
    pub fn memory_usage(&self) -> Option<u64> {
        self.registration.memory.as_ref().map(|m| m.memory_usage())
    }

    /// Stops the component.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::MissingCapability`] if it has no lifecycle, or the
    /// service's own failure.
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        let lifecycle = self.lifecycle("stop")?;
        lifecycle.stop().await.map_err(RuntimeError::from)
    }

    /// Starts the component.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::MissingCapability`] if it has no lifecycle, or the
    /// service's own failure.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let lifecycle = self.lifecycle("start")?;
        lifecycle.start().await.map_err(RuntimeError::from)
    }

    fn lifecycle(&self, capability: &'static str) -> Result<&Arc<dyn Lifecycle>, RuntimeError> {
        self.registration
            .lifecycle
            .as_ref()
            .ok_or_else(|| RuntimeError::MissingCapability {
                name: self.registration.name.clone(),
                capability,
            })
    }
}

#[derive(Default)]
struct RegistryInner {
    components: HashMap<String, RegisteredComponent>,
    next_sequence: u64,
}

/// Shared registry of host components.
///
/// Cloning yields another handle to the same registry. The registry is
/// owned by the guardian facade and injected into the components that need
/// it; nothing in the workspace keeps it in a static.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ComponentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a component, replacing any previous registration with the
    /// same name. Returns the capabilities it opted into.
    pub fn register(&self, registration: ComponentRegistration) -> Capabilities {
        let capabilities = Capabilities {
            lifecycle: registration.lifecycle.is_some(),
            memory: registration.memory.is_some(),
        };
        let mut inner = self.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let name = registration.name.clone();
        let previous = inner.components.insert(
            name.clone(),
            RegisteredComponent {
                registration,
                sequence,
                capabilities,
            },
        );
        if previous.is_some() {
            warn!(component = %name, "component re-registered, replacing previous entry");
        } else {
            debug!(component = %name, ?capabilities, "component registered");
        }
        capabilities
    }

    /// Removes a component. Returns `true` if it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.lock().components.remove(name).is_some();
        if removed {
            debug!(component = %name, "component unregistered");
        }
        removed
    }

    /// Looks up a component by name.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::ComponentNotFound`] if no such component exists.
    pub fn get(&self, name: &str) -> Result<RegisteredComponent, RuntimeError> {
        self.lock()
            .components
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::ComponentNotFound(name.to_string()))
    }

    /// Returns true if a component with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().components.contains_key(name)
    }

    /// Number of registered components.
    pub fn len(&self) -> usize {
        self.lock().components.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().components.is_empty()
    }

    /// All components in registration order.
    pub fn in_registration_order(&self) -> Vec<RegisteredComponent> {
        let mut all: Vec<_> = self.lock().components.values().cloned().collect();
        all.sort_by_key(RegisteredComponent::sequence);
        all
    }

    /// All components in ascending priority, ties broken by registration order.
    pub fn by_priority(&self) -> Vec<RegisteredComponent> {
        let mut all: Vec<_> = self.lock().components.values().cloned().collect();
        all.sort_by_key(|c| (c.priority(), c.sequence()));
        all
    }

    /// Memory usage of every component that reports it.
    pub fn component_sizes(&self) -> BTreeMap<String, u64> {
        let reporters: Vec<_> = self
            .lock()
            .components
            .values()
            .filter(|c| c.capabilities.memory)
            .cloned()
            .collect();
        // Reporters run outside the lock; they are host code.
        reporters
            .into_iter()
            .filter_map(|c| c.memory_usage().map(|bytes| (c.name().to_string(), bytes)))
            .collect()
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Toggle {
        running: AtomicBool,
    }

    #[async_trait]
    impl Lifecycle for Toggle {
        async fn start(&self) -> Result<(), ServiceError> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), ServiceError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_capabilities_recorded_at_registration() {
        let registry = ComponentRegistry::new();
        let caps = registry.register(ComponentRegistration::new("plain"));
        assert_eq!(caps, Capabilities::default());

        let toggle = Arc::new(Toggle {
            running: AtomicBool::new(true),
        });
        let caps = registry.register(
            ComponentRegistration::new("svc")
                .with_lifecycle(toggle)
                .with_memory_reporter(|| 10u64),
        );
        assert!(caps.lifecycle);
        assert!(caps.memory);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_priority_order_with_ties() {
        let registry = ComponentRegistry::new();
        registry.register(ComponentRegistration::new("c").with_priority(5));
        registry.register(ComponentRegistration::new("a").with_priority(1));
        registry.register(ComponentRegistration::new("b").with_priority(5));

        let names: Vec<_> = registry
            .by_priority()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "c", "b"]);

        let names: Vec<_> = registry
            .in_registration_order()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_component_sizes_only_reporters() {
        let registry = ComponentRegistry::new();
        registry.register(ComponentRegistration::new("silent"));
        registry.register(ComponentRegistration::new("loud").with_memory_reporter(|| 2048u64));

        let sizes = registry.component_sizes();
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes["loud"], 2048);
    }

    #[test]
    fn test_unregister_and_missing_lookup() {
        let registry = ComponentRegistry::new();
        registry.register(ComponentRegistration::new("x"));
        assert!(registry.unregister("x"));
        assert!(!registry.unregister("x"));
        assert!(matches!(
            registry.get("x"),
            Err(RuntimeError::ComponentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_requires_lifecycle() {
        let registry = ComponentRegistry::new();
        registry.register(ComponentRegistration::new("plain"));
        let component = registry.get("plain").unwrap();
        let err = component.stop().await.unwrap_err();
        assert!(matches!(err, RuntimeError::MissingCapability { .. }));

        let toggle = Arc::new(Toggle {
            running: AtomicBool::new(true),
        });
        registry.register(ComponentRegistration::new("svc").with_lifecycle(toggle.clone()));
        registry.get("svc").unwrap().stop().await.unwrap();
        assert!(!toggle.running.load(Ordering::SeqCst));
    }
}
