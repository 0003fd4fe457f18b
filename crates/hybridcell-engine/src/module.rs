//! # Simulation modules
//!
//! A module wraps one model with an identity, a results matrix and the
//! handles of the sibling modules it reads coupled values from. Two
//! formalisms exist:
//!
//! - [`DeterministicModule`] integrates the rate laws as ODEs
//! - [`StochasticModule`] advances molecule counts by tau-leaping
//!
//! Both share [`ModuleCore`], which owns the lifecycle:
//!
//! ```text
//! Constructed -> TargetsAssigned -> OverlapsResolved -> SettingsApplied -> Stepping -> Finalized
//! ```
//!
//! Every step reads the row recorded at `i - 1` and writes exactly row `i`.
//! Exchange is split into a read-only pull against all siblings and a write
//! into the module's own handler, so no module ever mutates another.

use std::fmt;

use hybridcell_core::{CellError, Result, SimulationSettings, Time, UnitConverter, UnitSystem};
use hybridcell_sbml::ModelHandler;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::evaluator::{RateLawPolicy, ReactionEvaluator};
use crate::solver::{Dopri5Solver, OdeSolver, RateLawSystem};
use crate::tau_leap::{reaction_scales, TauLeapIntegrator};

// =============================================================================
// HANDLES AND LIFECYCLE
// =============================================================================

/// Stable index of a module inside the orchestrator's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleHandle(pub usize);

impl ModuleHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Constructed,
    TargetsAssigned,
    OverlapsResolved,
    SettingsApplied,
    Stepping,
    Finalized,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Constructed => "constructed",
            Stage::TargetsAssigned => "targets-assigned",
            Stage::OverlapsResolved => "overlaps-resolved",
            Stage::SettingsApplied => "settings-applied",
            Stage::Stepping => "stepping",
            Stage::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// Simulation formalism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKind {
    Deterministic,
    Stochastic,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Deterministic => f.write_str("deterministic"),
            ModuleKind::Stochastic => f.write_str("stochastic"),
        }
    }
}

// =============================================================================
// EXCHANGE TYPES
// =============================================================================

/// Identifiers that are parameters here and species in `target`
#[derive(Debug, Clone, PartialEq)]
pub struct Overlap {
    pub target: ModuleHandle,
    pub identifiers: Vec<String>,
}

/// One value pulled from a target, already in this module's unit
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterUpdate {
    pub identifier: String,
    pub value: f64,
    pub source: ModuleHandle,
}

/// Result of the read-only half of an exchange
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangePlan {
    pub updates: Vec<ParameterUpdate>,
    pub skipped: Vec<String>,
}

/// Outcome of one exchange: identifiers written and identifiers skipped
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeReport {
    pub exchanged: Vec<String>,
    pub skipped: Vec<String>,
}

impl ExchangeReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

// =============================================================================
// MODULE CORE
// =============================================================================

/// State and bookkeeping shared by every formalism
pub struct ModuleCore {
    handle: ModuleHandle,
    identity: String,
    target_identity: String,
    kind: ModuleKind,
    handler: Box<dyn ModelHandler>,
    species_ids: Vec<String>,
    parameter_ids: Vec<String>,
    stoichiometry: Array2<f64>,
    evaluator: ReactionEvaluator,
    converter: UnitConverter,
    policy: RateLawPolicy,
    results: Array2<f64>,
    timepoints: Vec<Time>,
    delta_t: Time,
    targets: Vec<ModuleHandle>,
    overlaps: Vec<Overlap>,
    stage: Stage,
}

impl fmt::Debug for ModuleCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCore")
            .field("handle", &self.handle)
            .field("identity", &self.identity)
            .field("target_identity", &self.target_identity)
            .field("kind", &self.kind)
            .field("species_ids", &self.species_ids)
            .field("stage", &self.stage)
            .field("targets", &self.targets)
            .field("overlaps", &self.overlaps)
            .finish()
    }
}

impl ModuleCore {
    /// Extract the fixed structure of a model. Under [`RateLawPolicy::Strict`]
    /// any rate law that cannot be parsed or resolved rejects the model.
    pub fn new(
        kind: ModuleKind,
        handler: Box<dyn ModelHandler>,
        target_identity: &str,
        policy: RateLawPolicy,
    ) -> Result<Self> {
        let species_ids = handler.species_ids();
        let stoichiometry = handler.stoichiometric_matrix();
        let evaluator = ReactionEvaluator::new(&handler.reaction_expressions());

        if stoichiometry.nrows() != species_ids.len() || stoichiometry.ncols() != evaluator.len() {
            return Err(CellError::SimulationError(format!(
                "model '{}': stoichiometry is {}x{} for {} species and {} rate laws",
                handler.model_id(),
                stoichiometry.nrows(),
                stoichiometry.ncols(),
                species_ids.len(),
                evaluator.len()
            )));
        }

        let issues = evaluator.diagnose(handler.as_ref());
        if policy == RateLawPolicy::Strict {
            if let Some(issue) = issues.into_iter().next() {
                return Err(issue);
            }
        } else {
            for issue in &issues {
                warn!(model = handler.model_id(), "{}", issue);
            }
        }

        let converter = UnitConverter::new(handler.units(), &handler.species_volumes());

        Ok(Self {
            handle: ModuleHandle(0),
            identity: handler.model_id().to_string(),
            target_identity: target_identity.to_string(),
            kind,
            parameter_ids: handler.parameter_ids(),
            results: Array2::zeros((0, species_ids.len())),
            species_ids,
            stoichiometry,
            evaluator,
            converter,
            policy,
            timepoints: Vec::new(),
            delta_t: 0.0,
            targets: Vec::new(),
            overlaps: Vec::new(),
            stage: Stage::Constructed,
            handler,
        })
    }

    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn target_identity(&self) -> &str {
        &self.target_identity
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn handler(&self) -> &dyn ModelHandler {
        self.handler.as_ref()
    }

    pub fn species_ids(&self) -> &[String] {
        &self.species_ids
    }

    pub fn parameter_ids(&self) -> &[String] {
        &self.parameter_ids
    }

    pub fn stoichiometry(&self) -> &Array2<f64> {
        &self.stoichiometry
    }

    pub fn evaluator(&self) -> &ReactionEvaluator {
        &self.evaluator
    }

    pub fn converter(&self) -> &UnitConverter {
        &self.converter
    }

    pub fn units(&self) -> UnitSystem {
        self.converter.units()
    }

    pub fn results(&self) -> &Array2<f64> {
        &self.results
    }

    pub fn timepoints(&self) -> &[Time] {
        &self.timepoints
    }

    pub fn delta_t(&self) -> Time {
        self.delta_t
    }

    pub fn targets(&self) -> &[ModuleHandle] {
        &self.targets
    }

    pub fn overlaps(&self) -> &[Overlap] {
        &self.overlaps
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Number of steps N; the results matrix holds N + 1 rows
    pub fn num_steps(&self) -> usize {
        self.timepoints.len().saturating_sub(1)
    }

    /// True if any of this model's parameters, species or compartments is `id`
    pub fn owns(&self, id: &str) -> bool {
        self.handler.resolve(id).is_some()
    }

    fn require(&self, allowed: &[Stage], operation: &str) -> Result<()> {
        if allowed.contains(&self.stage) {
            return Ok(());
        }
        let expected = allowed
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" or ");
        Err(CellError::LifecycleError {
            module: self.identity.clone(),
            expected: format!("{} before {}", expected, operation),
            actual: self.stage.to_string(),
        })
    }

    /// Record this module's own handle and every sibling whose identity equals
    /// the target identity. A module never targets itself.
    pub fn assign_targets(
        &mut self,
        handle: ModuleHandle,
        siblings: &[(ModuleHandle, String)],
    ) -> Result<()> {
        self.require(&[Stage::Constructed], "assigning targets")?;
        self.handle = handle;
        self.targets = siblings
            .iter()
            .filter(|(h, identity)| *h != handle && *identity == self.target_identity)
            .map(|(h, _)| *h)
            .collect();

        debug!(
            module = %self.identity,
            target = %self.target_identity,
            count = self.targets.len(),
            "targets assigned"
        );
        self.stage = Stage::TargetsAssigned;
        Ok(())
    }

    /// Intersect this module's parameters with each target's species
    pub fn resolve_overlaps(&mut self, species_by_module: &[(ModuleHandle, Vec<String>)]) -> Result<()> {
        self.require(&[Stage::TargetsAssigned], "resolving overlaps")?;

        let mut overlaps = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let Some((_, species)) = species_by_module.iter().find(|(h, _)| h == target) else {
                warn!(module = %self.identity, target = %target, "target has no species list");
                continue;
            };
            let identifiers: Vec<String> = self
                .parameter_ids
                .iter()
                .filter(|p| species.contains(*p))
                .cloned()
                .collect();
            debug!(module = %self.identity, target = %target, ?identifiers, "overlap resolved");
            overlaps.push(Overlap {
                target: *target,
                identifiers,
            });
        }

        self.overlaps = overlaps;
        self.stage = Stage::OverlapsResolved;
        Ok(())
    }

    /// Apply the overrides this model owns, allocate N + 1 result rows and
    /// record the initial state at row 0. Returns the number of overrides applied.
    pub fn apply_settings(
        &mut self,
        overrides: &[(String, f64)],
        settings: &SimulationSettings,
    ) -> Result<usize> {
        self.require(&[Stage::OverlapsResolved], "applying settings")?;
        settings.validate()?;

        let mut applied = 0;
        for (id, value) in overrides {
            if !self.owns(id) {
                continue;
            }
            let kind = self.handler.set_entity_value(id, *value)?;
            debug!(module = %self.identity, id = %id, value, ?kind, "override applied");
            applied += 1;
        }

        // compartment overrides change the conversion factors
        self.converter = UnitConverter::new(self.handler.units(), &self.handler.species_volumes());

        self.timepoints = settings.timepoints();
        self.delta_t = settings.step;
        self.results = Array2::zeros((self.timepoints.len(), self.species_ids.len()));

        let initial = self.handler.initial_state();
        if initial.len() != self.species_ids.len() {
            return Err(CellError::SimulationError(format!(
                "model '{}' reports {} initial values for {} species",
                self.identity,
                initial.len(),
                self.species_ids.len()
            )));
        }
        for (j, v) in initial.iter().enumerate() {
            self.results[[0, j]] = *v;
        }

        self.stage = Stage::SettingsApplied;
        Ok(applied)
    }

    /// Validate a step index and enter the stepping stage
    fn begin_step(&mut self, i: usize) -> Result<()> {
        self.require(&[Stage::SettingsApplied, Stage::Stepping], "stepping")?;
        if i == 0 || i > self.num_steps() {
            return Err(CellError::SimulationError(format!(
                "module '{}': step {} outside 1..={}",
                self.identity,
                i,
                self.num_steps()
            )));
        }
        self.stage = Stage::Stepping;
        Ok(())
    }

    /// Row `i - 1`, or row 0 when `i <= 1`
    pub fn last_step_result(&self, i: usize) -> Vec<f64> {
        let row = i.saturating_sub(1).min(self.results.nrows().saturating_sub(1));
        if self.results.nrows() == 0 {
            return vec![0.0; self.species_ids.len()];
        }
        self.results.row(row).to_vec()
    }

    /// Write row `i` and make it the handler's current state
    fn record(&mut self, i: usize, state: &[f64]) -> Result<()> {
        if i >= self.results.nrows() || state.len() != self.species_ids.len() {
            return Err(CellError::SimulationError(format!(
                "module '{}': cannot record {} values at row {}",
                self.identity,
                state.len(),
                i
            )));
        }
        for (j, v) in state.iter().enumerate() {
            self.results[[i, j]] = *v;
        }
        self.handler.set_state(state)
    }

    /// Rates from the handler's current values under this module's policy
    fn rates(&self) -> Result<Vec<f64>> {
        self.evaluator.rates(self.handler.as_ref(), self.policy)
    }

    /// Read every overlapping species from the targets, converted into this
    /// module's unit. Nothing is written.
    pub fn pull_parameters(&self, modules: &[Module]) -> ExchangePlan {
        let mut plan = ExchangePlan::default();

        for overlap in &self.overlaps {
            let Some(target) = modules.get(overlap.target.index()).map(Module::core) else {
                warn!(module = %self.identity, target = %overlap.target, "target vanished");
                plan.skipped.extend(overlap.identifiers.iter().cloned());
                continue;
            };

            for id in &overlap.identifiers {
                let value = target.handler.species_value(id);
                let volume = target.handler.species_volume(id);
                match (value, volume) {
                    (Some(value), Some(volume)) => {
                        let converted = self.units().convert_from(value, target.units(), volume);
                        plan.updates.push(ParameterUpdate {
                            identifier: id.clone(),
                            value: converted,
                            source: overlap.target,
                        });
                    }
                    _ => {
                        warn!(
                            module = %self.identity,
                            target = %target.identity,
                            id = %id,
                            "species missing in target, not exchanged"
                        );
                        plan.skipped.push(id.clone());
                    }
                }
            }
        }

        plan
    }

    /// Write pulled values into this module's parameters
    pub fn apply_parameters(&mut self, plan: ExchangePlan) -> Result<ExchangeReport> {
        self.require(
            &[Stage::SettingsApplied, Stage::Stepping],
            "updating parameters",
        )?;

        let mut report = ExchangeReport {
            exchanged: Vec::with_capacity(plan.updates.len()),
            skipped: plan.skipped,
        };
        for update in plan.updates {
            match self.handler.set_parameter(&update.identifier, update.value) {
                Ok(()) => report.exchanged.push(update.identifier),
                Err(e) => {
                    warn!(module = %self.identity, error = %e, "parameter not exchanged");
                    report.skipped.push(update.identifier);
                }
            }
        }
        Ok(report)
    }

    fn finalize(&mut self) -> Result<()> {
        self.require(
            &[Stage::SettingsApplied, Stage::Stepping, Stage::Finalized],
            "finalizing",
        )?;
        self.stage = Stage::Finalized;
        Ok(())
    }
}

// =============================================================================
// DETERMINISTIC MODULE
// =============================================================================

/// Integrates the model's rate laws with an ODE solver
#[derive(Debug)]
pub struct DeterministicModule {
    core: ModuleCore,
    solver: Box<dyn OdeSolver>,
}

impl DeterministicModule {
    /// Build with a Dormand-Prince solver over the model's own rate laws
    pub fn new(handler: Box<dyn ModelHandler>, target_identity: &str, config: &RunConfig) -> Result<Self> {
        let solver = Dopri5Solver::new(RateLawSystem::from_handler(handler.as_ref()), config.solver);
        Self::with_solver(handler, target_identity, config.rate_laws, Box::new(solver))
    }

    pub fn with_solver(
        handler: Box<dyn ModelHandler>,
        target_identity: &str,
        policy: RateLawPolicy,
        solver: Box<dyn OdeSolver>,
    ) -> Result<Self> {
        let core = ModuleCore::new(ModuleKind::Deterministic, handler, target_identity, policy)?;
        Ok(Self { core, solver })
    }

    pub fn core(&self) -> &ModuleCore {
        &self.core
    }

    pub fn solver(&self) -> &dyn OdeSolver {
        self.solver.as_ref()
    }

    /// Push every parameter and compartment size of the handler into the solver
    fn sync_solver(&mut self) {
        let handler = self.core.handler();
        let constants: Vec<(String, f64)> = handler
            .parameters()
            .into_iter()
            .chain(handler.compartments())
            .collect();
        self.solver.set_fixed_parameters(&constants);
    }

    pub fn set_simulation_settings(
        &mut self,
        overrides: &[(String, f64)],
        settings: &SimulationSettings,
    ) -> Result<usize> {
        let applied = self.core.apply_settings(overrides, settings)?;
        self.sync_solver();
        Ok(applied)
    }

    /// Integrate [t_{i-1}, t_i] from row i - 1
    pub fn step(&mut self, i: usize) -> Result<()> {
        self.core.begin_step(i)?;
        let y0 = self.core.last_step_result(i);
        let span = [self.core.timepoints[i - 1], self.core.timepoints[i]];

        self.solver.set_timepoints(&span);
        self.solver.set_initial_state(&y0);
        let trajectory = self.solver.run()?;
        let state = trajectory
            .last()
            .map(|s| s.to_vec())
            .ok_or_else(|| CellError::SolverError("empty trajectory".into()))?;

        self.core.record(i, &state)
    }

    /// Integrate every timepoint in one solver call
    pub fn run(&mut self) -> Result<()> {
        self.core.begin_step(1)?;
        let y0 = self.core.last_step_result(1);
        let timepoints = self.core.timepoints.clone();

        self.solver.set_timepoints(&timepoints);
        self.solver.set_initial_state(&y0);
        let trajectory = self.solver.run()?;

        for k in 1..trajectory.len() {
            let state = trajectory
                .state(k)
                .map(|s| s.to_vec())
                .ok_or_else(|| CellError::SolverError(format!("missing row {}", k)))?;
            self.core.record(k, &state)?;
        }
        Ok(())
    }

    pub fn update_parameters(&mut self, plan: ExchangePlan) -> Result<ExchangeReport> {
        let values: Vec<(String, f64)> = plan
            .updates
            .iter()
            .map(|u| (u.identifier.clone(), u.value))
            .collect();
        let report = self.core.apply_parameters(plan)?;
        for (id, value) in values {
            if report.exchanged.contains(&id) {
                self.solver.set_fixed_parameter(&id, value);
            }
        }
        Ok(report)
    }
}

// =============================================================================
// STOCHASTIC MODULE
// =============================================================================

/// Advances molecule counts with a seeded tau-leap integrator
#[derive(Debug)]
pub struct StochasticModule {
    core: ModuleCore,
    integrator: TauLeapIntegrator,
}

impl StochasticModule {
    pub fn new(
        handler: Box<dyn ModelHandler>,
        target_identity: &str,
        config: &RunConfig,
        seed: Option<u64>,
    ) -> Result<Self> {
        let core = ModuleCore::new(ModuleKind::Stochastic, handler, target_identity, config.rate_laws)?;
        let integrator = TauLeapIntegrator::new(core.stoichiometry.clone(), seed);
        Ok(Self { core, integrator })
    }

    pub fn core(&self) -> &ModuleCore {
        &self.core
    }

    pub fn set_simulation_settings(
        &mut self,
        overrides: &[(String, f64)],
        settings: &SimulationSettings,
    ) -> Result<usize> {
        self.core.apply_settings(overrides, settings)
    }

    /// One leap of length delta t from row i - 1
    pub fn step(&mut self, i: usize) -> Result<()> {
        self.core.begin_step(i)?;
        let previous = self.core.last_step_result(i);
        self.core.handler.set_state(&previous)?;

        let scales = reaction_scales(&self.core.stoichiometry, &self.core.converter);
        let rates: Vec<f64> = self
            .core
            .rates()?
            .iter()
            .zip(&scales)
            .map(|(v, c)| v * c)
            .collect();

        let counts = self.core.converter.to_counts(&previous);
        let (next_counts, firings) = self.integrator.leap(&counts, &rates, self.core.delta_t);
        debug!(module = %self.core.identity, step = i, ?firings, "leap");

        let next = self.core.converter.to_concentrations(&next_counts);
        self.core.record(i, &next)
    }

    /// Every step in sequence, without exchange
    pub fn run(&mut self) -> Result<()> {
        for i in 1..=self.core.num_steps() {
            self.step(i)?;
        }
        Ok(())
    }

    pub fn update_parameters(&mut self, plan: ExchangePlan) -> Result<ExchangeReport> {
        self.core.apply_parameters(plan)
    }
}

// =============================================================================
// MODULE
// =============================================================================

/// A simulation module of either formalism
#[derive(Debug)]
pub enum Module {
    Deterministic(DeterministicModule),
    Stochastic(StochasticModule),
}

impl From<DeterministicModule> for Module {
    fn from(module: DeterministicModule) -> Self {
        Module::Deterministic(module)
    }
}

impl From<StochasticModule> for Module {
    fn from(module: StochasticModule) -> Self {
        Module::Stochastic(module)
    }
}

impl Module {
    pub fn core(&self) -> &ModuleCore {
        match self {
            Module::Deterministic(m) => &m.core,
            Module::Stochastic(m) => &m.core,
        }
    }

    fn core_mut(&mut self) -> &mut ModuleCore {
        match self {
            Module::Deterministic(m) => &mut m.core,
            Module::Stochastic(m) => &mut m.core,
        }
    }

    pub fn module_id(&self) -> &str {
        self.core().identity()
    }

    pub fn target_id(&self) -> &str {
        self.core().target_identity()
    }

    pub fn kind(&self) -> ModuleKind {
        self.core().kind()
    }

    pub fn handle(&self) -> ModuleHandle {
        self.core().handle()
    }

    pub fn species_ids(&self) -> &[String] {
        self.core().species_ids()
    }

    pub fn num_species(&self) -> usize {
        self.core().species_ids().len()
    }

    pub fn results(&self) -> &Array2<f64> {
        self.core().results()
    }

    pub fn stage(&self) -> Stage {
        self.core().stage()
    }

    pub fn assign_targets(
        &mut self,
        handle: ModuleHandle,
        siblings: &[(ModuleHandle, String)],
    ) -> Result<()> {
        self.core_mut().assign_targets(handle, siblings)
    }

    pub fn resolve_overlaps(&mut self, species_by_module: &[(ModuleHandle, Vec<String>)]) -> Result<()> {
        self.core_mut().resolve_overlaps(species_by_module)
    }

    pub fn set_simulation_settings(
        &mut self,
        overrides: &[(String, f64)],
        settings: &SimulationSettings,
    ) -> Result<usize> {
        match self {
            Module::Deterministic(m) => m.set_simulation_settings(overrides, settings),
            Module::Stochastic(m) => m.set_simulation_settings(overrides, settings),
        }
    }

    pub fn step(&mut self, i: usize) -> Result<()> {
        match self {
            Module::Deterministic(m) => m.step(i),
            Module::Stochastic(m) => m.step(i),
        }
    }

    pub fn run(&mut self) -> Result<()> {
        match self {
            Module::Deterministic(m) => m.run(),
            Module::Stochastic(m) => m.run(),
        }
    }

    pub fn pull_parameters(&self, modules: &[Module]) -> ExchangePlan {
        self.core().pull_parameters(modules)
    }

    pub fn update_parameters(&mut self, plan: ExchangePlan) -> Result<ExchangeReport> {
        match self {
            Module::Deterministic(m) => m.update_parameters(plan),
            Module::Stochastic(m) => m.update_parameters(plan),
        }
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.core_mut().finalize()
    }
}
