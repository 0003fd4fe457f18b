//! Identity -> module constructor registry.

use std::collections::BTreeMap;
use std::fmt;

use hybridcell_core::{CellError, Result};
use hybridcell_sbml::ModelHandler;

use crate::config::RunConfig;
use crate::module::{DeterministicModule, Module, ModuleKind, StochasticModule};

/// What a factory gets besides the handler
#[derive(Debug, Clone, Copy)]
pub struct ModuleContext<'a> {
    pub config: &'a RunConfig,
    /// Seed of this module's own random stream
    pub seed: Option<u64>,
}

type ModuleFactory =
    Box<dyn Fn(Box<dyn ModelHandler>, &str, &ModuleContext<'_>) -> Result<Module>>;

struct Registration {
    kind: ModuleKind,
    default_target: String,
    factory: ModuleFactory,
}

/// Maps a model identity to the formalism that runs it
pub struct ModuleRegistry {
    entries: BTreeMap<String, Registration>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(id, r)| (id, (r.kind, &r.default_target))),
            )
            .finish()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ModuleRegistry {
    /// Registry with nothing registered
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// "Deterministic" and "Stochastic", each targeting the other
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "Deterministic",
            "Stochastic",
            ModuleKind::Deterministic,
            |handler, target, ctx| Ok(DeterministicModule::new(handler, target, ctx.config)?.into()),
        );
        registry.register(
            "Stochastic",
            "Deterministic",
            ModuleKind::Stochastic,
            |handler, target, ctx| {
                Ok(StochasticModule::new(handler, target, ctx.config, ctx.seed)?.into())
            },
        );
        registry
    }

    /// Register or replace the constructor for `identity`
    pub fn register<F>(&mut self, identity: &str, default_target: &str, kind: ModuleKind, factory: F)
    where
        F: Fn(Box<dyn ModelHandler>, &str, &ModuleContext<'_>) -> Result<Module> + 'static,
    {
        self.entries.insert(
            identity.to_string(),
            Registration {
                kind,
                default_target: default_target.to_string(),
                factory: Box::new(factory),
            },
        );
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn identities(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// (identity, formalism, default target) of every registration
    pub fn describe(&self) -> Vec<(&str, ModuleKind, &str)> {
        self.entries
            .iter()
            .map(|(id, r)| (id.as_str(), r.kind, r.default_target.as_str()))
            .collect()
    }

    /// Build the module for a handler's declared identity; the model's own
    /// target declaration wins over the registered default
    pub fn create(&self, handler: Box<dyn ModelHandler>, ctx: &ModuleContext<'_>) -> Result<Module> {
        let identity = handler.model_id().to_string();
        let registration = self.entries.get(&identity).ok_or_else(|| {
            CellError::ConfigError(format!(
                "no module registered for model identity '{}' (known: {})",
                identity,
                self.identities().join(", ")
            ))
        })?;

        let target = handler
            .declared_target()
            .map(str::to_string)
            .unwrap_or_else(|| registration.default_target.clone());

        (registration.factory)(handler, &target, ctx)
    }
}
