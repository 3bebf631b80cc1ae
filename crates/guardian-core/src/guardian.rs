//! The unified guardian facade.
//!
//! [`Guardian`] owns one of everything: the event bus, the component
//! registry, the reclaimer, the shutdown engine, the stack monitor and the
//! memory manager, all sharing one clock and one probe.

use std::fmt;
use std::sync::Arc;

use guardian_memory::{
    CollectionKind, ManagedCollection, ManagerStatus, ManagerTick, MemoryManager,
};
use guardian_runtime::{
    Capabilities, ComponentRegistration, ComponentRegistry, EventBus, GuardianEvent, MemoryProbe,
    ProcessProbe, Reclaimer, RuntimeError, ServiceError, SharedClock, SystemClock,
};
use guardian_shutdown::{
    EmergencyState, ProcessTerminator, ShutdownEngine, ShutdownReport, Terminator,
};
use guardian_stack::{
    MonitorStatus, MonitoringError, ShadowStack, StackMonitor, StackRecoveryHooks, StackSource,
    TickReport,
};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::GuardianConfig;
use crate::Result;

fn into_service_error(err: RuntimeError) -> ServiceError {
    match err {
        RuntimeError::Service(err) => err,
        other => ServiceError::failed(other.to_string()),
    }
}

/// What one on-demand check observed.
#[derive(Debug, Clone)]
pub struct CheckReport {
    /// Stack monitor pass.
    pub stack: std::result::Result<TickReport, MonitoringError>,
    /// Memory manager pass.
    pub memory: ManagerTick,
}

/// Point-in-time status of every component.
#[derive(Debug, Clone)]
pub struct GuardianStatus {
    /// Either periodic loop is running.
    pub running: bool,
    /// Registered host components.
    pub components: usize,
    /// Stack monitor status.
    pub stack: MonitorStatus,
    /// Memory manager status.
    pub memory: ManagerStatus,
    /// Shutdown engine state.
    pub shutdown: EmergencyState,
}

/// Builder for [`Guardian`].
pub struct GuardianBuilder {
    config: GuardianConfig,
    probe: Option<Arc<dyn MemoryProbe>>,
    clock: Option<SharedClock>,
    terminator: Option<Arc<dyn Terminator>>,
    source: Option<Arc<dyn StackSource>>,
    hooks: Option<Arc<dyn StackRecoveryHooks>>,
}

impl GuardianBuilder {
    /// Reads memory from `probe` instead of the process probe.
    #[must_use]
    pub fn probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Uses `clock` everywhere instead of the system clock.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Terminates through `terminator` instead of exiting the process.
    #[must_use]
    pub fn terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    /// Samples stacks from `source` instead of the shadow stack.
    #[must_use]
    pub fn stack_source(mut self, source: impl StackSource + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Host routines the stack monitor runs during recovery.
    #[must_use]
    pub fn stack_hooks(mut self, hooks: Arc<dyn StackRecoveryHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Validates the config and wires every component.
    ///
    /// # Errors
    ///
    /// [`crate::GuardianError`] when the config is invalid or the snapshot
    /// directory cannot be created.
    pub fn build(self) -> Result<Guardian> {
        let config = self.config;
        config.validate()?;

        let events = EventBus::new(config.event_capacity);
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let probe: Arc<dyn MemoryProbe> = self
            .probe
            .unwrap_or_else(|| Arc::new(ProcessProbe::new(config.heap_limit)));
        let terminator: Arc<dyn Terminator> =
            self.terminator.unwrap_or_else(|| Arc::new(ProcessTerminator));
        let registry = ComponentRegistry::new();
        let reclaimer = Reclaimer::new(Arc::clone(&probe), Arc::clone(&clock));

        let engine = ShutdownEngine::with_terminator(
            config.shutdown.clone(),
            events.clone(),
            Arc::clone(&clock),
            terminator,
        )?;

        let shadow = config.stack.shadow_stack();
        let mut stack = StackMonitor::builder(config.stack.clone(), events.clone())
            .shadow_stack(shadow.clone())
            .shutdown_engine(engine.clone())
            .reclaimer(reclaimer.clone())
            .probe(Arc::clone(&probe))
            .clock(Arc::clone(&clock));
        if let Some(source) = self.source {
            stack = stack.source(source);
        }
        if let Some(hooks) = self.hooks {
            stack = stack.hooks(hooks);
        }
        let stack = stack.build()?;

        let memory = MemoryManager::builder(config.memory.clone(), Arc::clone(&probe), events.clone())
            .clock(Arc::clone(&clock))
            .registry(registry.clone())
            .reclaimer(reclaimer.clone())
            .shutdown_engine(engine.clone())
            .build()?;

        info!(
            stack = config.enable_stack_monitoring,
            memory = config.enable_memory_management,
            heap_limit = ?config.heap_limit,
            "guardian initialized"
        );

        Ok(Guardian {
            config,
            events,
            registry,
            reclaimer,
            engine,
            shadow,
            stack,
            memory,
        })
    }
}

/// The unified resource guardian. Clones share every component.
///
/// # Example
///
/// ```rust
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), guardian_core::GuardianError> {
/// use std::sync::Arc;
/// use guardian_core::{Guardian, GuardianConfig};
/// use guardian_runtime::{ManualProbe, PressureLevel, RawMemoryStats};
///
/// let probe = ManualProbe::new(RawMemoryStats {
///     heap_used: 30,
///     heap_limit: 100,
///     ..RawMemoryStats::default()
/// });
/// let guardian = Guardian::builder(GuardianConfig::new())
///     .probe(Arc::new(probe))
///     .build()?;
///
/// let report = guardian.check_now().await;
/// assert_eq!(report.memory.level, PressureLevel::Normal);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Guardian {
    config: GuardianConfig,
    events: EventBus,
    registry: ComponentRegistry,
    reclaimer: Reclaimer,
    engine: ShutdownEngine,
    shadow: ShadowStack,
    stack: StackMonitor,
    memory: MemoryManager,
}

impl Guardian {
    /// Starts building a guardian.
    pub fn builder(config: GuardianConfig) -> GuardianBuilder {
        GuardianBuilder {
            config,
            probe: None,
            clock: None,
            terminator: None,
            source: None,
            hooks: None,
        }
    }

    /// Builds a guardian watching the current process.
    ///
    /// # Errors
    ///
    /// As [`GuardianBuilder::build`].
    pub fn new(config: GuardianConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Active configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &GuardianConfig {
        &self.config
    }

    /// The event bus every component emits on.
    #[inline]
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// New receiver for every subsequent event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GuardianEvent> {
        self.events.subscribe()
    }

    /// Host component registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Forced-collection hooks.
    #[inline]
    #[must_use]
    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    /// Shutdown engine.
    #[inline]
    #[must_use]
    pub fn shutdown_engine(&self) -> &ShutdownEngine {
        &self.engine
    }

    /// Shadow stack for instrumented call tracking.
    #[inline]
    #[must_use]
    pub fn shadow_stack(&self) -> &ShadowStack {
        &self.shadow
    }

    /// Stack monitor.
    #[inline]
    #[must_use]
    pub fn stack_monitor(&self) -> &StackMonitor {
        &self.stack
    }

    /// Memory manager.
    #[inline]
    #[must_use]
    pub fn memory_manager(&self) -> &MemoryManager {
        &self.memory
    }

    /// Registers a host component. Components with a lifecycle are also
    /// stopped by the shutdown engine at the same priority and restarted by
    /// its recovery.
    pub fn register_component(&self, registration: ComponentRegistration) -> Capabilities {
        let name = registration.name().to_string();
        let capabilities = self.registry.register(registration);
        if !capabilities.lifecycle {
            return capabilities;
        }
        let Ok(component) = self.registry.get(&name) else {
            return capabilities;
        };

        let stopper = component.clone();
        self.engine.register_component(
            name.clone(),
            move || {
                let component = stopper.clone();
                async move { component.stop().await.map_err(into_service_error) }
            },
            component.priority(),
        );
        self.engine.register_component_recovery(name.clone(), move || {
            let component = component.clone();
            async move { component.start().await.map_err(into_service_error) }
        });
        debug!(component = %name, "component registered with shutdown engine");
        capabilities
    }

    /// Removes a host component everywhere. Returns whether it existed.
    pub fn unregister_component(&self, name: &str) -> bool {
        let in_engine = self.engine.unregister_component(name);
        self.registry.unregister(name) || in_engine
    }

    /// Registers a collection for the cleanup strategies.
    pub fn register_collection(
        &self,
        name: impl Into<String>,
        kind: CollectionKind,
        collection: Arc<dyn ManagedCollection>,
    ) {
        self.memory.cleanup().register_collection(name, kind, collection);
    }

    /// Starts the enabled periodic loops. Returns false if nothing started.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(&self) -> bool {
        let mut started = false;
        if self.config.enable_stack_monitoring {
            started |= self.stack.start();
        }
        if self.config.enable_memory_management {
            started |= self.memory.start();
        }
        if started {
            info!("guardian started");
        }
        started
    }

    /// Stops both periodic loops. Returns false if neither was running.
    pub fn stop(&self) -> bool {
        let stack = self.stack.stop();
        let memory = self.memory.stop();
        if stack || memory {
            info!("guardian stopped");
        }
        stack || memory
    }

    /// Returns true while either periodic loop runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.stack.is_enabled() || self.memory.is_enabled()
    }

    /// Runs one stack pass and one memory pass now, regardless of the
    /// enable flags.
    pub async fn check_now(&self) -> CheckReport {
        let stack = self.stack.tick();
        let memory = self.memory.tick().await;
        CheckReport { stack, memory }
    }

    /// Stops the periodic loops and runs a coordinated shutdown.
    ///
    /// # Errors
    ///
    /// [`crate::GuardianError::Shutdown`] if a shutdown is already running
    /// or ended in termination.
    pub async fn shutdown(&self, reason: &str) -> Result<ShutdownReport> {
        self.stop();
        Ok(self.engine.initiate_shutdown(reason).await?)
    }

    /// Status of every component.
    #[must_use]
    pub fn status(&self) -> GuardianStatus {
        GuardianStatus {
            running: self.is_running(),
            components: self.registry.len(),
            stack: self.stack.status(),
            memory: self.memory.status(),
            shutdown: self.engine.state(),
        }
    }
}

impl fmt::Debug for Guardian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guardian")
            .field("running", &self.is_running())
            .field("components", &self.registry.len())
            .field("stack", &self.stack.is_enabled())
            .field("memory", &self.memory)
            .finish()
    }
}
