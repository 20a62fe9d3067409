//! Process-wide registry of named engines.
//!
//! Code that needs "the" engine of a process (for example a plugin that
//! submits commands locally) looks it up here instead of reaching for a
//! hidden static. The registry owns the engines it holds: [`remove`]
//! hands ownership back without stopping the engine, while
//! [`shutdown_all`] stops every engine and empties the registry.
//!
//! [`remove`]: EngineRegistry::remove
//! [`shutdown_all`]: EngineRegistry::shutdown_all

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use async_trait::async_trait;
use jobmq_core::CleanupError;

use crate::command::RemoteCommand;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::state::EngineState;

/// Name of the lazily created default instance.
pub const DEFAULT_ENGINE: &str = "default";

/// Type-erased view of an engine, whatever command type it runs.
#[async_trait]
pub trait ManagedEngine: Send + Sync + 'static {
    fn state(&self) -> EngineState;

    async fn start(&self) -> Result<(), EngineError>;

    async fn stop(&self) -> Result<(), EngineError>;

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
impl<C: RemoteCommand> ManagedEngine for Engine<C> {
    fn state(&self) -> EngineState {
        Engine::state(self)
    }

    async fn start(&self) -> Result<(), EngineError> {
        Engine::start(self).await
    }

    async fn stop(&self) -> Result<(), EngineError> {
        Engine::stop(self).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct EngineRegistry {
    engines: RwLock<HashMap<String, Arc<dyn ManagedEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process.
    pub fn global() -> &'static EngineRegistry {
        static GLOBAL: OnceLock<EngineRegistry> = OnceLock::new();
        GLOBAL.get_or_init(EngineRegistry::new)
    }

    /// Register `engine` under `name`, returning the engine it replaced.
    pub fn register(
        &self,
        name: impl Into<String>,
        engine: impl ManagedEngine,
    ) -> Option<Arc<dyn ManagedEngine>> {
        let name = name.into();
        tracing::debug!(engine = %name, "Registering engine");
        self.write().insert(name, Arc::new(engine))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ManagedEngine>> {
        self.read().get(name).cloned()
    }

    /// Look up an engine by name and concrete type.
    pub fn get_as<E: ManagedEngine + Clone>(&self, name: &str) -> Option<E> {
        self.get(name)
            .and_then(|engine| engine.as_any().downcast_ref::<E>().cloned())
    }

    /// The default engine, created by `factory` on first use.
    ///
    /// The factory runs at most once even under concurrent callers. If it
    /// fails nothing is registered and the next call tries again.
    pub fn default_or_init<E, F>(&self, factory: F) -> Result<Arc<dyn ManagedEngine>, EngineError>
    where
        E: ManagedEngine,
        F: FnOnce() -> Result<E, EngineError>,
    {
        if let Some(engine) = self.get(DEFAULT_ENGINE) {
            return Ok(engine);
        }

        let mut engines = self.write();
        if let Some(engine) = engines.get(DEFAULT_ENGINE) {
            return Ok(Arc::clone(engine));
        }
        let engine: Arc<dyn ManagedEngine> = Arc::new(factory()?);
        engines.insert(DEFAULT_ENGINE.to_string(), Arc::clone(&engine));
        tracing::info!("Created default engine");
        Ok(engine)
    }

    /// Take an engine out of the registry. It keeps running.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn ManagedEngine>> {
        self.write().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop and drop every registered engine.
    ///
    /// All engines are stopped even if some fail; the failures are
    /// reported together.
    pub async fn shutdown_all(&self) -> Result<(), CleanupError> {
        let engines: Vec<(String, Arc<dyn ManagedEngine>)> = self.write().drain().collect();
        let mut errors = CleanupError::new();

        for (name, engine) in engines {
            match engine.stop().await {
                Ok(()) => tracing::info!(engine = %name, "Engine shut down"),
                Err(e) => errors.push(format!("stop engine {name}"), e),
            }
        }
        errors.into_result()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn ManagedEngine>>> {
        self.engines.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn ManagedEngine>>> {
        self.engines.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
