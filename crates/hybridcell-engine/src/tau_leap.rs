//! Tau-leap stochastic integration.
//!
//! One leap draws a Poisson number of firings per reaction for a fixed
//! interval, caps the firings so no species is consumed below zero, and
//! applies the capped firings through the stoichiometric matrix. Everything
//! here works in molecule counts.

use hybridcell_core::UnitConverter;
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Poisson};

/// Seed used when none is given but a reproducible stream is still required
const DEFAULT_SEED: u64 = 0xDEADBEEFCAFEBABE;

/// SplitMix64 finalizer over (seed, stream); gives every module an independent stream
pub fn derive_seed(seed: Option<u64>, stream: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9E3779B97F4A7C15;
    let base = seed.unwrap_or(DEFAULT_SEED);
    let mut z = base ^ stream.wrapping_mul(GOLDEN_GAMMA);
    z = z.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Poisson draw; a non-finite or non-positive mean never fires
pub fn poisson_sample(rng: &mut ChaCha8Rng, mean: f64) -> f64 {
    if !mean.is_finite() || mean <= 0.0 {
        return 0.0;
    }
    match Poisson::new(mean) {
        Ok(dist) => {
            let draw: f64 = dist.sample(rng);
            draw.max(0.0)
        }
        Err(_) => 0.0,
    }
}

/// Cap firings so that consumption never exceeds availability.
///
/// Reactions are visited in column order against a running budget of each
/// species; a reaction consuming `|S|` molecules per firing may fire at most
/// `floor(budget / |S|)` times, and its consumption is then deducted.
pub fn constrain_firings(stoichiometry: &Array2<f64>, counts: &[f64], firings: &mut [f64]) {
    let mut budget: Vec<f64> = counts.iter().map(|c| c.max(0.0)).collect();

    for (j, column) in stoichiometry.columns().into_iter().enumerate() {
        let Some(k) = firings.get_mut(j) else { break };

        for (i, &s) in column.iter().enumerate() {
            if s < 0.0 {
                let bound = (budget.get(i).copied().unwrap_or(0.0) / -s).floor();
                if *k > bound {
                    *k = bound;
                }
            }
        }

        for (i, &s) in column.iter().enumerate() {
            if s < 0.0 {
                if let Some(b) = budget.get_mut(i) {
                    *b = (*b + s * *k).max(0.0);
                }
            }
        }
    }
}

/// counts + S * firings, rounded to whole molecules.
///
/// Non-negativity comes from [`constrain_firings`]; unconstrained firings
/// that overdraw a species trip a debug assertion instead of being clipped.
pub fn apply_firings(stoichiometry: &Array2<f64>, counts: &[f64], firings: &[f64]) -> Vec<f64> {
    counts
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let delta: f64 = stoichiometry
                .row(i)
                .iter()
                .zip(firings)
                .map(|(s, k)| s * k)
                .sum();
            let next = (x + delta).round();
            debug_assert!(
                next >= 0.0,
                "species {} driven to {} by unconstrained firings",
                i,
                x + delta
            );
            next
        })
        .collect()
}

/// Molecules per rate unit for each reaction.
///
/// A rate law is expressed in the model's stored unit per time, so its firing
/// mean is scaled by the factor of the first species it consumes, or of its
/// first product for pure synthesis. Reactions touching no species scale by 1.
pub fn reaction_scales(stoichiometry: &Array2<f64>, converter: &UnitConverter) -> Vec<f64> {
    stoichiometry
        .columns()
        .into_iter()
        .map(|column| {
            let consumed = column.iter().position(|&s| s < 0.0);
            let produced = column.iter().position(|&s| s > 0.0);
            consumed
                .or(produced)
                .map(|i| converter.factor(i))
                .unwrap_or(1.0)
        })
        .collect()
}

/// Seeded tau-leap integrator over a fixed stoichiometric matrix
#[derive(Debug, Clone)]
pub struct TauLeapIntegrator {
    stoichiometry: Array2<f64>,
    rng: ChaCha8Rng,
}

impl TauLeapIntegrator {
    /// `None` seeds from the operating system
    pub fn new(stoichiometry: Array2<f64>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self { stoichiometry, rng }
    }

    pub fn stoichiometry(&self) -> &Array2<f64> {
        &self.stoichiometry
    }

    pub fn num_reactions(&self) -> usize {
        self.stoichiometry.ncols()
    }

    /// Unconstrained firings; `rates` are in molecules per unit time
    pub fn sample_firings(&mut self, rates: &[f64], dt: f64) -> Vec<f64> {
        rates
            .iter()
            .map(|r| poisson_sample(&mut self.rng, r * dt))
            .collect()
    }

    pub fn constrain(&self, counts: &[f64], firings: &mut [f64]) {
        constrain_firings(&self.stoichiometry, counts, firings);
    }

    pub fn apply(&self, counts: &[f64], firings: &[f64]) -> Vec<f64> {
        apply_firings(&self.stoichiometry, counts, firings)
    }

    /// One leap of length `dt`: returns the new counts and the firings used
    pub fn leap(&mut self, counts: &[f64], rates: &[f64], dt: f64) -> (Vec<f64>, Vec<f64>) {
        let mut firings = self.sample_firings(rates, dt);
        self.constrain(counts, &mut firings);
        let next = self.apply(counts, &firings);
        (next, firings)
    }
}
