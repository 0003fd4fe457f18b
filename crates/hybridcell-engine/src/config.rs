//! Run configuration and entity overrides.

use std::path::Path;

use hybridcell_core::{CellError, Result, SimulationSettings, SolverSettings};
use serde::{Deserialize, Serialize};

use crate::evaluator::RateLawPolicy;

/// Everything a run needs besides the models themselves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub settings: SimulationSettings,
    pub solver: SolverSettings,
    /// Base seed for stochastic modules; `None` draws from the OS
    pub seed: Option<u64>,
    pub rate_laws: RateLawPolicy,
    /// Run a lone module through its bulk path instead of the step loop
    pub bulk_single_module: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            settings: SimulationSettings::default(),
            solver: SolverSettings::default(),
            seed: None,
            rate_laws: RateLawPolicy::default(),
            bulk_single_module: true,
        }
    }
}

impl RunConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CellError::ConfigError(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CellError::ConfigError(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_settings(mut self, settings: SimulationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_rate_laws(mut self, policy: RateLawPolicy) -> Self {
        self.rate_laws = policy;
        self
    }
}

/// Parse `{A=50, k1=0.2}` (braces optional) into ordered (identifier, value) pairs.
///
/// Empty input yields no overrides; any malformed pair is an error.
pub fn parse_entity_overrides(input: &str) -> Result<Vec<(String, f64)>> {
    let trimmed = input.trim();
    let body = match (trimmed.strip_prefix('{'), trimmed.ends_with('}')) {
        (Some(rest), true) => &rest[..rest.len() - 1],
        (None, false) => trimmed,
        _ => {
            return Err(CellError::ConfigError(format!(
                "unbalanced braces in overrides '{}'",
                input
            )))
        }
    };

    let mut overrides = Vec::new();
    for pair in body.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (id, value) = pair
            .split_once('=')
            .or_else(|| pair.split_once(':'))
            .ok_or_else(|| {
                CellError::ConfigError(format!("override '{}' is not identifier=value", pair))
            })?;

        let id = id.trim().trim_matches('"').trim_matches('\'');
        if id.is_empty() {
            return Err(CellError::ConfigError(format!(
                "override '{}' has no identifier",
                pair
            )));
        }
        let value: f64 = value.trim().parse().map_err(|_| {
            CellError::ConfigError(format!("override '{}' has a non-numeric value", pair))
        })?;

        overrides.push((id.to_string(), value));
    }

    Ok(overrides)
}
