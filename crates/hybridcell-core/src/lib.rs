//! # HybridCell Core
//!
//! Shared types and utilities for hybrid deterministic/stochastic single-cell
//! simulation.
//!
//! ## Contents
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`CellError`] | Error type shared by every crate in the workspace |
//! | [`SimulationSettings`] | Time range and fixed step of a run |
//! | [`SolverSettings`] | Tolerances and step limit of the ODE integrator |
//! | [`UnitSystem`] / [`UnitConverter`] | Concentration <-> molecule-count conversion |
//! | [`OdeSystem`] | Right-hand side of a deterministic model |
//! | [`matrix`] | Column extraction and matrix concatenation helpers |
//!
//! ## Unit contract
//!
//! Species values are stored at rest in the unit a model declares. Molecule
//! counts only exist transiently, inside a stochastic step or while a value is
//! carried from one module to another.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum CellError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Rate law {reaction} failed: {message}")]
    ExpressionError { reaction: usize, message: String },

    #[error("Module '{module}' is {actual}, expected {expected}")]
    LifecycleError {
        module: String,
        expected: String,
        actual: String,
    },

    #[error("Simulation error: {0}")]
    SimulationError(String),

    #[error("Solver error: {0}")]
    SolverError(String),

    #[error("Numerical error: {0}")]
    NumericalError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CellError>;

/// Time point
pub type Time = f64;

/// Concentration (declared model unit, nM by default)
pub type Concentration = f64;

/// Discrete molecule count, kept as f64 so it can share vectors with concentrations
pub type MoleculeCount = f64;

/// State vector for ODE systems
pub type StateVector = Array1<f64>;

/// Avogadro's constant as used by the unit conversions
pub const AVOGADRO: f64 = 6.022e23;

// =============================================================================
// SIMULATION SETTINGS
// =============================================================================

/// Largest step count a run may request; every module allocates N + 1 result rows
pub const MAX_STEPS: usize = 10_000_000;

/// Time range and fixed step shared by every module of a run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Start time
    pub start: Time,
    /// End time
    pub stop: Time,
    /// Fixed step size (delta t)
    pub step: Time,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            start: 0.0,
            stop: 60.0,
            step: 30.0,
        }
    }
}

impl SimulationSettings {
    pub fn new(start: Time, stop: Time, step: Time) -> Self {
        Self { start, stop, step }
    }

    /// Reject non-finite bounds, a non-positive step, an empty range and
    /// more than [`MAX_STEPS`] steps
    pub fn validate(&self) -> Result<()> {
        if !self.start.is_finite() || !self.stop.is_finite() || !self.step.is_finite() {
            return Err(CellError::ConfigError(format!(
                "time bounds must be finite (start={}, stop={}, step={})",
                self.start, self.stop, self.step
            )));
        }
        if self.step <= 0.0 {
            return Err(CellError::ConfigError(format!(
                "step must be positive, got {}",
                self.step
            )));
        }
        if self.stop <= self.start {
            return Err(CellError::ConfigError(format!(
                "stop ({}) must be greater than start ({})",
                self.stop, self.start
            )));
        }
        let ratio = (self.stop - self.start) / self.step;
        if !ratio.is_finite() || ratio > MAX_STEPS as f64 {
            return Err(CellError::ConfigError(format!(
                "({} - {}) / {} steps exceeds the limit of {}",
                self.stop, self.start, self.step, MAX_STEPS
            )));
        }
        Ok(())
    }

    /// Number of steps N = ceil((stop - start) / step)
    pub fn num_steps(&self) -> usize {
        let ratio = (self.stop - self.start) / self.step;
        // absorb representation error so that 60/30 stays 2 steps
        let n = (ratio - 1e-9).ceil();
        if n < 1.0 {
            1
        } else {
            n as usize
        }
    }

    /// Timepoints t_k = start + k * step for k = 0..=N
    pub fn timepoints(&self) -> Vec<Time> {
        (0..=self.num_steps())
            .map(|k| self.start + k as f64 * self.step)
            .collect()
    }
}

/// ODE integrator configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub absolute_tolerance: f64,
    pub relative_tolerance: f64,
    /// Maximum number of internal integrator steps per output interval
    pub max_steps: u32,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            absolute_tolerance: 1e-10,
            relative_tolerance: 1e-6,
            max_steps: 100_000,
        }
    }
}

// =============================================================================
// UNITS
// =============================================================================

/// Unit in which a model stores its species values at rest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSystem {
    /// nmol/L, converted with the compartment volume (litres)
    #[default]
    Nanomolar,
    /// Molecules per cell, no conversion
    MoleculeCount,
}

impl UnitSystem {
    /// Molecules per unit of this system in a compartment of `volume` litres
    pub fn molecules_per_unit(&self, volume: f64) -> f64 {
        match self {
            Self::Nanomolar => volume * AVOGADRO * 1e-9,
            Self::MoleculeCount => 1.0,
        }
    }

    pub fn to_molecules(&self, value: f64, volume: f64) -> MoleculeCount {
        value * self.molecules_per_unit(volume)
    }

    pub fn from_molecules(&self, count: MoleculeCount, volume: f64) -> f64 {
        count / self.molecules_per_unit(volume)
    }

    /// Convert a value held in `from` into `self`, for a species living in `volume`
    pub fn convert_from(&self, value: f64, from: UnitSystem, volume: f64) -> f64 {
        if *self == from {
            return value;
        }
        self.from_molecules(from.to_molecules(value, volume), volume)
    }
}

/// nanomolar -> molecules per cell
pub fn nanomolar_to_molecules(value: Concentration, volume: f64) -> MoleculeCount {
    UnitSystem::Nanomolar.to_molecules(value, volume)
}

/// molecules per cell -> nanomolar
pub fn molecules_to_nanomolar(count: MoleculeCount, volume: f64) -> Concentration {
    UnitSystem::Nanomolar.from_molecules(count, volume)
}

/// Fixed per-species conversion factors for one model
#[derive(Debug, Clone, PartialEq)]
pub struct UnitConverter {
    units: UnitSystem,
    /// molecules per stored unit, one entry per species
    factors: Vec<f64>,
}

impl UnitConverter {
    pub fn new(units: UnitSystem, species_volumes: &[f64]) -> Self {
        let factors = species_volumes
            .iter()
            .map(|v| units.molecules_per_unit(*v))
            .collect();
        Self { units, factors }
    }

    pub fn units(&self) -> UnitSystem {
        self.units
    }

    pub fn factors(&self) -> &[f64] {
        &self.factors
    }

    pub fn factor(&self, species: usize) -> f64 {
        self.factors.get(species).copied().unwrap_or(1.0)
    }

    pub fn to_counts(&self, state: &[f64]) -> Vec<MoleculeCount> {
        state
            .iter()
            .zip(&self.factors)
            .map(|(x, f)| x * f)
            .collect()
    }

    pub fn to_concentrations(&self, counts: &[MoleculeCount]) -> Vec<f64> {
        counts
            .iter()
            .zip(&self.factors)
            .map(|(n, f)| if *f == 0.0 { 0.0 } else { n / f })
            .collect()
    }
}

// =============================================================================
// ODE SYSTEM
// =============================================================================

/// ODE system trait (for deterministic modules)
pub trait OdeSystem {
    /// System dimension
    fn dimension(&self) -> usize;

    /// Compute derivatives: dy/dt = f(t, y)
    fn derivatives(&self, t: Time, y: &StateVector) -> StateVector;

    /// Override a named constant of the right-hand side; false if unknown
    fn set_constant(&mut self, _id: &str, _value: f64) -> bool {
        false
    }
}

// =============================================================================
// MATRIX HELPERS
// =============================================================================

pub mod matrix {
    use super::{CellError, Result};
    use ndarray::{concatenate, Array2, ArrayView2, Axis};

    /// Copy column `index` of a matrix into a Vec
    pub fn column(matrix: &Array2<f64>, index: usize) -> Vec<f64> {
        matrix.column(index).to_vec()
    }

    /// Join matrices side by side (species axis); every matrix needs the same row count
    pub fn concatenate_columns(matrices: &[Array2<f64>]) -> Result<Array2<f64>> {
        if matrices.is_empty() {
            return Ok(Array2::zeros((0, 0)));
        }
        let views: Vec<ArrayView2<f64>> = matrices.iter().map(|m| m.view()).collect();
        concatenate(Axis(1), &views).map_err(|e| CellError::NumericalError(e.to_string()))
    }
}
