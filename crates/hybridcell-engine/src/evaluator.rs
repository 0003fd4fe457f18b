//! Rate-law evaluation.
//!
//! A rate law is an infix string such as `kTx*TF` or `Vmax*S/(Km+S)`. Its
//! operand tokens are resolved against the model (parameter, then species,
//! then compartment), bound into an expression context and evaluated with
//! `meval`. Failures stay local to the reaction that produced them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use hybridcell_core::{CellError, Result};
use hybridcell_sbml::EntityLookup;
use meval::{Context, Expr};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Names `meval` resolves on its own, plus the `pow` we register
const BUILTINS: &[&str] = &[
    "sqrt", "exp", "ln", "abs", "sin", "cos", "tan", "asin", "acos", "atan", "atan2", "sinh",
    "cosh", "tanh", "asinh", "acosh", "atanh", "floor", "ceil", "round", "signum", "max", "min",
    "pi", "e", "pow",
];

/// What to do with a reaction whose rate cannot be computed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLawPolicy {
    /// Log it, use NaN for that reaction and keep going
    #[default]
    Degraded,
    /// Abort: unresolved identifiers fail module construction, evaluation errors fail the step
    Strict,
}

/// Split a rate law into operand tokens.
///
/// Operators `+ - * / ^ ( )`, argument commas and whitespace separate tokens;
/// identifiers and numeric literals are kept whole.
pub fn tokenize(expression: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for c in expression.chars() {
        match c {
            '+' | '-' | '*' | '/' | '^' | '(' | ')' | ',' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

fn is_identifier(token: &str) -> bool {
    token
        .chars()
        .next()
        .map(|c| c.is_alphabetic() || c == '_')
        .unwrap_or(false)
}

/// One compiled rate law
#[derive(Debug)]
pub struct RateLaw {
    source: String,
    /// Distinct tokens in order of first appearance
    tokens: Vec<String>,
    compiled: std::result::Result<Expr, String>,
    /// Set once a failure of this law has been reported at warn level
    reported: AtomicBool,
}

impl RateLaw {
    pub fn new(source: &str) -> Self {
        let mut tokens: Vec<String> = Vec::new();
        for token in tokenize(source) {
            if !tokens.contains(&token) {
                tokens.push(token);
            }
        }
        let compiled = source.parse::<Expr>().map_err(|e| e.to_string());

        Self {
            source: source.to_string(),
            tokens,
            compiled,
            reported: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_ok()
    }

    /// True once a degraded evaluation of this law has been reported
    pub fn failure_reported(&self) -> bool {
        self.reported.load(Ordering::Relaxed)
    }

    /// Name -> value table for every token the model can resolve
    pub fn bindings<L: EntityLookup + ?Sized>(&self, lookup: &L) -> HashMap<String, f64> {
        self.tokens
            .iter()
            .filter_map(|t| lookup.resolve(t).map(|v| (t.clone(), v)))
            .collect()
    }

    /// Identifiers that are neither model entities nor builtins
    pub fn unresolved<L: EntityLookup + ?Sized>(&self, lookup: &L) -> Vec<String> {
        self.tokens
            .iter()
            .filter(|t| is_identifier(t))
            .filter(|t| !BUILTINS.contains(&t.as_str()))
            .filter(|t| lookup.resolve(t).is_none())
            .cloned()
            .collect()
    }

    /// Evaluate against the current model values; `reaction` only labels errors
    pub fn evaluate<L: EntityLookup + ?Sized>(&self, reaction: usize, lookup: &L) -> Result<f64> {
        let expr = self
            .compiled
            .as_ref()
            .map_err(|message| CellError::ExpressionError {
                reaction,
                message: format!("cannot parse '{}': {}", self.source, message),
            })?;

        let mut ctx = Context::new();
        ctx.func2("pow", f64::powf);
        for (name, value) in self.bindings(lookup) {
            ctx.var(name, value);
        }

        expr.eval_with_context(ctx)
            .map_err(|e| CellError::ExpressionError {
                reaction,
                message: format!("'{}': {}", self.source, e),
            })
    }
}

/// Rate laws of one model, positionally aligned with its stoichiometric columns
#[derive(Debug)]
pub struct ReactionEvaluator {
    laws: Vec<RateLaw>,
}

impl ReactionEvaluator {
    pub fn new(expressions: &[String]) -> Self {
        Self {
            laws: expressions.iter().map(|e| RateLaw::new(e)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.laws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.laws.is_empty()
    }

    pub fn laws(&self) -> &[RateLaw] {
        &self.laws
    }

    /// Every reaction's outcome, failures included
    pub fn evaluate_all<L: EntityLookup + ?Sized>(&self, lookup: &L) -> Vec<Result<f64>> {
        self.laws
            .iter()
            .enumerate()
            .map(|(i, law)| law.evaluate(i, lookup))
            .collect()
    }

    /// Rate vector under `policy`: NaN for failed reactions, or the first error
    pub fn rates<L: EntityLookup + ?Sized>(
        &self,
        lookup: &L,
        policy: RateLawPolicy,
    ) -> Result<Vec<f64>> {
        let mut rates = Vec::with_capacity(self.laws.len());
        for (i, law) in self.laws.iter().enumerate() {
            match (law.evaluate(i, lookup), policy) {
                (Ok(v), _) => rates.push(v),
                (Err(e), RateLawPolicy::Strict) => return Err(e),
                (Err(e), RateLawPolicy::Degraded) => {
                    // warn on the first failure of each law, the rest go to debug
                    if law.reported.swap(true, Ordering::Relaxed) {
                        debug!(reaction = i, error = %e, "rate law unavailable, using NaN");
                    } else {
                        warn!(reaction = i, error = %e, "rate law unavailable, using NaN");
                    }
                    rates.push(f64::NAN);
                }
            }
        }
        Ok(rates)
    }

    /// Static problems: unparsable laws and identifiers the model cannot resolve
    pub fn diagnose<L: EntityLookup + ?Sized>(&self, lookup: &L) -> Vec<CellError> {
        let mut issues = Vec::new();
        for (i, law) in self.laws.iter().enumerate() {
            if let Err(message) = &law.compiled {
                issues.push(CellError::ExpressionError {
                    reaction: i,
                    message: format!("cannot parse '{}': {}", law.source, message),
                });
                continue;
            }
            let missing = law.unresolved(lookup);
            if !missing.is_empty() {
                issues.push(CellError::ExpressionError {
                    reaction: i,
                    message: format!(
                        "'{}' references unknown identifiers: {}",
                        law.source,
                        missing.join(", ")
                    ),
                });
            }
        }
        issues
    }
}
