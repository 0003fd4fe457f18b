//! Deterministic integration of rate-law systems.
//!
//! `RateLawSystem` turns a model's stoichiometry and rate laws into
//! dy/dt = S * v(y). `Dopri5Solver` integrates an [`OdeSystem`] across a list
//! of output times, one interval at a time, and returns a flat trajectory.

use std::collections::HashMap;

use hybridcell_core::{CellError, OdeSystem, Result, SolverSettings, StateVector, Time};
use hybridcell_sbml::{EntityLookup, ModelHandler};
use nalgebra::DVector;
use ndarray::Array2;
use ode_solvers::dop_shared::OutputType;
use ode_solvers::{Dopri5, System};

use crate::evaluator::ReactionEvaluator;

// =============================================================================
// TRAJECTORY
// =============================================================================

/// Flat trajectory buffer: `x[k * nx + i]` is species `i` at `timepoints[k]`
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub timepoints: Vec<Time>,
    pub nx: usize,
    pub x: Vec<f64>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.timepoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timepoints.is_empty()
    }

    pub fn state(&self, k: usize) -> Option<&[f64]> {
        if k >= self.timepoints.len() {
            return None;
        }
        self.x.get(k * self.nx..(k + 1) * self.nx)
    }

    pub fn last(&self) -> Option<&[f64]> {
        self.timepoints.len().checked_sub(1).and_then(|k| self.state(k))
    }

    /// Time x species matrix view of the buffer
    pub fn to_matrix(&self) -> Result<Array2<f64>> {
        Array2::from_shape_vec((self.timepoints.len(), self.nx), self.x.clone())
            .map_err(|e| CellError::NumericalError(e.to_string()))
    }
}

// =============================================================================
// RATE-LAW SYSTEM
// =============================================================================

/// Right-hand side built from a model: stoichiometry times evaluated rates
#[derive(Debug)]
pub struct RateLawSystem {
    species_index: HashMap<String, usize>,
    stoichiometry: Array2<f64>,
    evaluator: ReactionEvaluator,
    parameters: HashMap<String, f64>,
    compartments: HashMap<String, f64>,
}

impl RateLawSystem {
    pub fn from_handler(handler: &dyn ModelHandler) -> Self {
        let species_index = handler
            .species_ids()
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();

        Self {
            species_index,
            stoichiometry: handler.stoichiometric_matrix(),
            evaluator: ReactionEvaluator::new(&handler.reaction_expressions()),
            parameters: handler.parameters().into_iter().collect(),
            compartments: handler.compartments().into_iter().collect(),
        }
    }

    pub fn evaluator(&self) -> &ReactionEvaluator {
        &self.evaluator
    }

    /// Reaction rates at state `y`; failed or non-finite rates carry no flux
    pub fn rates(&self, y: &[f64]) -> Vec<f64> {
        let view = StateView { system: self, y };
        self.evaluator
            .evaluate_all(&view)
            .into_iter()
            .map(|r| match r {
                Ok(v) if v.is_finite() => v,
                _ => 0.0,
            })
            .collect()
    }
}

impl OdeSystem for RateLawSystem {
    fn dimension(&self) -> usize {
        self.stoichiometry.nrows()
    }

    fn derivatives(&self, _t: Time, y: &StateVector) -> StateVector {
        let y = y.to_vec();
        let v = StateVector::from(self.rates(&y));
        self.stoichiometry.dot(&v)
    }

    /// Parameters first, then compartment sizes
    fn set_constant(&mut self, id: &str, value: f64) -> bool {
        if let Some(p) = self.parameters.get_mut(id) {
            *p = value;
            return true;
        }
        if let Some(c) = self.compartments.get_mut(id) {
            *c = value;
            return true;
        }
        false
    }
}

/// Lookup over a trial state `y` plus the system's constants
struct StateView<'a> {
    system: &'a RateLawSystem,
    y: &'a [f64],
}

impl EntityLookup for StateView<'_> {
    fn parameter_value(&self, id: &str) -> Option<f64> {
        self.system.parameters.get(id).copied()
    }

    fn species_value(&self, id: &str) -> Option<f64> {
        self.system
            .species_index
            .get(id)
            .and_then(|&i| self.y.get(i).copied())
    }

    fn compartment_size(&self, id: &str) -> Option<f64> {
        self.system.compartments.get(id).copied()
    }
}

// =============================================================================
// SOLVERS
// =============================================================================

/// Stateful ODE solver: configure, then run to completion
pub trait OdeSolver: std::fmt::Debug {
    fn name(&self) -> &str;

    fn set_timepoints(&mut self, timepoints: &[Time]);

    fn set_initial_state(&mut self, y0: &[f64]);

    /// Override one fixed parameter of the system; false if it has no such constant
    fn set_fixed_parameter(&mut self, id: &str, value: f64) -> bool;

    fn set_tolerances(&mut self, absolute: f64, relative: f64);

    fn set_max_steps(&mut self, max_steps: u32);

    /// Integrate from the first timepoint through the last
    fn run(&mut self) -> Result<Trajectory>;

    fn set_fixed_parameters(&mut self, values: &[(String, f64)]) -> usize {
        values
            .iter()
            .filter(|(id, v)| self.set_fixed_parameter(id, *v))
            .count()
    }
}

/// Adapter from [`OdeSystem`] to the `ode_solvers` right-hand side
struct Rhs<'a, S: OdeSystem> {
    system: &'a S,
}

impl<S: OdeSystem> System<f64, DVector<f64>> for Rhs<'_, S> {
    fn system(&self, t: f64, y: &DVector<f64>, dy: &mut DVector<f64>) {
        let state = StateVector::from(y.as_slice().to_vec());
        let derivatives = self.system.derivatives(t, &state);
        for (d, v) in dy.iter_mut().zip(derivatives.iter()) {
            *d = *v;
        }
    }
}

/// Dormand-Prince 5(4) with adaptive steps
#[derive(Debug)]
pub struct Dopri5Solver<S: OdeSystem = RateLawSystem> {
    system: S,
    settings: SolverSettings,
    timepoints: Vec<Time>,
    initial_state: Vec<f64>,
}

impl<S: OdeSystem> Dopri5Solver<S> {
    pub fn new(system: S, settings: SolverSettings) -> Self {
        Self {
            system,
            settings,
            timepoints: Vec::new(),
            initial_state: Vec::new(),
        }
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    fn advance(&self, y: DVector<f64>, t0: Time, t1: Time) -> Result<DVector<f64>> {
        let span = t1 - t0;
        if span <= 0.0 || y.is_empty() {
            return Ok(y);
        }

        let mut stepper = Dopri5::from_param(
            Rhs {
                system: &self.system,
            },
            t0,
            t1,
            span,
            y,
            self.settings.relative_tolerance,
            self.settings.absolute_tolerance,
            0.9,
            0.04,
            0.2,
            10.0,
            span,
            0.0,
            self.settings.max_steps,
            1000,
            OutputType::Sparse,
        );

        stepper
            .integrate()
            .map_err(|e| CellError::SolverError(format!("[{}, {}]: {:?}", t0, t1, e)))?;

        stepper
            .y_out()
            .last()
            .cloned()
            .ok_or_else(|| CellError::SolverError(format!("no output over [{}, {}]", t0, t1)))
    }
}

impl<S: OdeSystem + std::fmt::Debug> OdeSolver for Dopri5Solver<S> {
    fn name(&self) -> &str {
        "dopri5"
    }

    fn set_timepoints(&mut self, timepoints: &[Time]) {
        self.timepoints = timepoints.to_vec();
    }

    fn set_initial_state(&mut self, y0: &[f64]) {
        self.initial_state = y0.to_vec();
    }

    fn set_fixed_parameter(&mut self, id: &str, value: f64) -> bool {
        self.system.set_constant(id, value)
    }

    fn set_tolerances(&mut self, absolute: f64, relative: f64) {
        self.settings.absolute_tolerance = absolute;
        self.settings.relative_tolerance = relative;
    }

    fn set_max_steps(&mut self, max_steps: u32) {
        self.settings.max_steps = max_steps;
    }

    fn run(&mut self) -> Result<Trajectory> {
        let nx = self.system.dimension();
        if self.initial_state.len() != nx {
            return Err(CellError::SolverError(format!(
                "initial state has {} entries, system has {}",
                self.initial_state.len(),
                nx
            )));
        }

        let mut x = Vec::with_capacity(self.timepoints.len() * nx);
        if self.timepoints.is_empty() {
            return Ok(Trajectory {
                timepoints: Vec::new(),
                nx,
                x,
            });
        }

        let mut y = DVector::from_column_slice(&self.initial_state);
        x.extend(y.iter().copied());

        for k in 1..self.timepoints.len() {
            let t = self.timepoints[k];
            y = self.advance(y, self.timepoints[k - 1], t)?;
            if let Some((i, v)) = y.iter().enumerate().find(|(_, v)| !v.is_finite()) {
                return Err(CellError::NumericalError(format!(
                    "state {} became {} at t={}",
                    i, v, t
                )));
            }
            x.extend(y.iter().copied());
        }

        Ok(Trajectory {
            timepoints: self.timepoints.clone(),
            nx,
            x,
        })
    }
}
