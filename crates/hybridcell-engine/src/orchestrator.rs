//! Drives every module of a run in lockstep.

use std::path::Path;

use hybridcell_core::{matrix, CellError, Result, SimulationSettings, Time};
use hybridcell_sbml::{ModelHandler, SbmlHandler, SbmlModel};
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::module::{ExchangePlan, ExchangeReport, Module, ModuleHandle};
use crate::registry::{ModuleContext, ModuleRegistry};
use crate::results::SimulationResults;
use crate::tau_leap::derive_seed;

/// Owns the loaded models, the registry and, once a run starts, every module
pub struct Orchestrator {
    registry: ModuleRegistry,
    config: RunConfig,
    handlers: Vec<Box<dyn ModelHandler>>,
    modules: Vec<Module>,
}

impl Orchestrator {
    pub fn new(config: RunConfig) -> Self {
        Self::with_registry(ModuleRegistry::with_defaults(), config)
    }

    pub fn with_registry(registry: ModuleRegistry, config: RunConfig) -> Self {
        Self {
            registry,
            config,
            handlers: Vec::new(),
            modules: Vec::new(),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Modules of the last run, in instantiation order
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Models waiting for the next run
    pub fn num_loaded(&self) -> usize {
        self.handlers.len()
    }

    pub fn add_handler(&mut self, handler: Box<dyn ModelHandler>) {
        self.handlers.push(handler);
    }

    pub fn add_model(&mut self, model: SbmlModel) -> Result<()> {
        self.add_handler(Box::new(SbmlHandler::new(model)?));
        Ok(())
    }

    pub fn load_model(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let handler = SbmlHandler::from_path(path)?;
        info!(path = %path.display(), model = handler.model().id.as_str(), "model loaded");
        self.add_handler(Box::new(handler));
        Ok(())
    }

    /// Run every loaded model over the time range held in [`RunConfig::settings`]
    pub fn run(&mut self, overrides: &[(String, f64)]) -> Result<SimulationResults> {
        self.run_with_observer(overrides, |_, _| {})
    }

    /// As [`run`](Self::run), with a per-step observer
    pub fn run_with_observer<F>(
        &mut self,
        overrides: &[(String, f64)],
        observer: F,
    ) -> Result<SimulationResults>
    where
        F: FnMut(usize, usize),
    {
        let settings = self.config.settings;
        self.simulate_with_observer(overrides, settings, observer)
    }

    /// Run every loaded model from `start` to `stop` in steps of `step`.
    /// Loaded models are consumed; the modules stay available afterwards.
    pub fn simulate(
        &mut self,
        overrides: &[(String, f64)],
        start: Time,
        stop: Time,
        step: Time,
    ) -> Result<SimulationResults> {
        self.simulate_with_observer(overrides, SimulationSettings::new(start, stop, step), |_, _| {})
    }

    /// As [`simulate`](Self::simulate), calling `observer(i, n)` after step `i` of `n`
    pub fn simulate_with_observer<F>(
        &mut self,
        overrides: &[(String, f64)],
        settings: SimulationSettings,
        mut observer: F,
    ) -> Result<SimulationResults>
    where
        F: FnMut(usize, usize),
    {
        settings.validate()?;
        self.instantiate()?;
        self.assign_targets()?;
        self.resolve_overlaps()?;
        self.apply_settings(overrides, &settings)?;

        let n = settings.num_steps();
        if self.modules.len() == 1 && self.config.bulk_single_module {
            info!(module = self.modules[0].module_id(), steps = n, "single module, bulk run");
            self.modules[0].run()?;
            observer(n, n);
        } else {
            info!(modules = self.modules.len(), steps = n, "stepping with exchange");
            for i in 1..=n {
                for module in self.modules.iter_mut() {
                    module.step(i)?;
                }
                self.exchange()?;
                observer(i, n);
            }
        }

        for module in self.modules.iter_mut() {
            module.finalize()?;
        }
        self.collect(&settings)
    }

    /// One module per loaded model; models without species are dropped
    fn instantiate(&mut self) -> Result<()> {
        if self.handlers.is_empty() {
            return Err(CellError::ConfigError("no models loaded".into()));
        }

        self.modules.clear();
        let handlers = std::mem::take(&mut self.handlers);
        for (ordinal, handler) in handlers.into_iter().enumerate() {
            if handler.num_species() == 0 {
                warn!(model = handler.model_id(), "model has no species, discarded");
                continue;
            }
            let ctx = ModuleContext {
                config: &self.config,
                seed: self.config.seed.map(|s| derive_seed(Some(s), ordinal as u64)),
            };
            let module = self.registry.create(handler, &ctx)?;
            debug!(
                module = module.module_id(),
                kind = %module.kind(),
                species = module.num_species(),
                "module instantiated"
            );
            self.modules.push(module);
        }

        if self.modules.is_empty() {
            return Err(CellError::SimulationError(
                "every loaded model is empty".into(),
            ));
        }
        Ok(())
    }

    fn assign_targets(&mut self) -> Result<()> {
        let siblings: Vec<(ModuleHandle, String)> = self
            .modules
            .iter()
            .enumerate()
            .map(|(i, m)| (ModuleHandle(i), m.module_id().to_string()))
            .collect();

        for (i, module) in self.modules.iter_mut().enumerate() {
            module.assign_targets(ModuleHandle(i), &siblings)?;
        }
        Ok(())
    }

    fn resolve_overlaps(&mut self) -> Result<()> {
        let species: Vec<(ModuleHandle, Vec<String>)> = self
            .modules
            .iter()
            .enumerate()
            .map(|(i, m)| (ModuleHandle(i), m.species_ids().to_vec()))
            .collect();

        for module in self.modules.iter_mut() {
            module.resolve_overlaps(&species)?;
        }
        Ok(())
    }

    /// Every override must name an entity of at least one module
    fn apply_settings(
        &mut self,
        overrides: &[(String, f64)],
        settings: &SimulationSettings,
    ) -> Result<()> {
        for (id, _) in overrides {
            if !self.modules.iter().any(|m| m.core().owns(id)) {
                return Err(CellError::EntityNotFound(format!(
                    "override '{}' matches no parameter, species or compartment of any loaded model",
                    id
                )));
            }
        }

        for module in self.modules.iter_mut() {
            module.set_simulation_settings(overrides, settings)?;
        }
        Ok(())
    }

    /// Every module pulls from its targets, then every module writes what it pulled
    pub fn exchange(&mut self) -> Result<Vec<ExchangeReport>> {
        let plans: Vec<ExchangePlan> = self
            .modules
            .iter()
            .map(|m| m.pull_parameters(&self.modules))
            .collect();

        let mut reports = Vec::with_capacity(plans.len());
        for (module, plan) in self.modules.iter_mut().zip(plans) {
            let report = module.update_parameters(plan)?;
            if !report.is_complete() {
                warn!(module = module.module_id(), skipped = ?report.skipped, "partial exchange");
            }
            reports.push(report);
        }
        Ok(reports)
    }

    fn collect(&self, settings: &SimulationSettings) -> Result<SimulationResults> {
        let matrices: Vec<_> = self.modules.iter().map(|m| m.results().clone()).collect();
        let matrix = matrix::concatenate_columns(&matrices)?;

        let mut species_ids = Vec::with_capacity(matrix.ncols());
        let mut module_ids = Vec::with_capacity(matrix.ncols());
        for module in &self.modules {
            for id in module.species_ids() {
                species_ids.push(id.clone());
                module_ids.push(module.module_id().to_string());
            }
        }

        Ok(SimulationResults {
            timepoints: settings.timepoints(),
            species_ids,
            module_ids,
            matrix,
        })
    }
}
