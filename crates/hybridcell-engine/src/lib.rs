//! # HybridCell Engine
//!
//! Couples deterministic and stochastic models of one cell and steps them in
//! lockstep.
//!
//! ## Architecture
//!
//! ```text
//!            +--------------+
//!            | Orchestrator |  owns the registry, the models and the modules
//!            +------+-------+
//!                   |  ModuleRegistry: identity -> constructor
//!        +----------+----------+
//!        |                     |
//! DeterministicModule   StochasticModule
//!   RateLawSystem         ReactionEvaluator
//!   Dopri5Solver          TauLeapIntegrator
//! ```
//!
//! A run goes through instantiation, target wiring by identity, overlap
//! resolution (parameters of one module that are species of a target),
//! settings and overrides, then `N` rounds of "step every module, then let
//! every module pull its coupled parameters". The per-module result matrices
//! are finally joined column-wise into one [`SimulationResults`].
//!
//! ## Example
//!
//! ```no_run
//! use hybridcell_engine::{Orchestrator, RunConfig};
//!
//! let mut orchestrator = Orchestrator::new(RunConfig::default().with_seed(7));
//! orchestrator.load_model("demos/signaling.json")?;
//! orchestrator.load_model("demos/transcription.json")?;
//! let results = orchestrator.simulate(&[], 0.0, 600.0, 1.0)?;
//! assert_eq!(results.nrows(), 601);
//! # Ok::<(), hybridcell_core::CellError>(())
//! ```

pub mod config;
pub mod evaluator;
pub mod module;
pub mod orchestrator;
pub mod registry;
pub mod results;
pub mod solver;
pub mod tau_leap;

pub use config::{parse_entity_overrides, RunConfig};
pub use evaluator::{tokenize, RateLaw, RateLawPolicy, ReactionEvaluator};
pub use module::{
    DeterministicModule, ExchangePlan, ExchangeReport, Module, ModuleCore, ModuleHandle,
    ModuleKind, Overlap, ParameterUpdate, Stage, StochasticModule,
};
pub use orchestrator::Orchestrator;
pub use registry::{ModuleContext, ModuleRegistry};
pub use results::{SimulationResults, TsvOptions};
pub use solver::{Dopri5Solver, OdeSolver, RateLawSystem, Trajectory};
pub use tau_leap::{
    apply_firings, constrain_firings, derive_seed, poisson_sample, reaction_scales,
    TauLeapIntegrator,
};
