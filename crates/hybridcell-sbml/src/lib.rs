//! # HybridCell SBML
//!
//! Biochemical model description and the handler through which simulation
//! modules read and mutate a model.
//!
//! ## Model files
//!
//! Models are exchanged as JSON serialisations of [`SbmlModel`], an SBML-shaped
//! structure (compartments, species, parameters, reactions with kinetic laws).
//! The model's `id` names the simulation formalism that should run it
//! (`"Deterministic"`, `"Stochastic"`, ...).
//!
//! ## Handler contract
//!
//! [`ModelHandler`] is the only view the engine has of a model:
//!
//! 1. species/parameter identifiers and current values
//! 2. the stoichiometric matrix (species x reactions)
//! 3. one infix rate-law string per reaction, aligned with the matrix columns
//! 4. the compartment volume of every species
//! 5. mutators for single entities and for the whole species state
//!
//! Entity lookups resolve in the fixed order parameter -> species -> compartment.

use hybridcell_core::{CellError, Result, UnitSystem};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

// =============================================================================
// SBML CORE TYPES
// =============================================================================

/// Compartment (reaction container)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compartment {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Volume in litres
    pub size: f64,
}

impl Compartment {
    pub fn new(id: &str, size: f64) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            size,
        }
    }
}

/// Species (molecule, protein, transcript)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Species {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub compartment: String,
    /// Initial value in the model's declared unit
    #[serde(default)]
    pub initial_concentration: Option<f64>,
    /// Initial molecule count, used when no concentration is given
    #[serde(default)]
    pub initial_amount: Option<f64>,
    /// Boundary species are never changed by reactions
    #[serde(default)]
    pub boundary_condition: bool,
}

impl Species {
    pub fn new(id: &str, compartment: &str, initial_concentration: f64) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            compartment: compartment.to_string(),
            initial_concentration: Some(initial_concentration),
            initial_amount: None,
            boundary_condition: false,
        }
    }

    /// Same species held fixed by reactions
    pub fn boundary(mut self) -> Self {
        self.boundary_condition = true;
        self
    }
}

/// Parameter (kinetic constant or coupled input)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub value: f64,
    #[serde(default)]
    pub units: Option<String>,
}

impl Parameter {
    pub fn new(id: &str, value: f64) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            value,
            units: None,
        }
    }
}

/// Species reference in a reaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeciesReference {
    pub species: String,
    #[serde(default = "unit_stoichiometry")]
    pub stoichiometry: f64,
}

fn unit_stoichiometry() -> f64 {
    1.0
}

impl SpeciesReference {
    pub fn new(species: &str, stoichiometry: f64) -> Self {
        Self {
            species: species.to_string(),
            stoichiometry,
        }
    }
}

/// Kinetic law expression
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KineticLaw {
    /// Mass action: k * [A]^a * [B]^b
    MassAction { rate_constant: String },
    /// Michaelis-Menten: Vmax * [S] / (Km + [S])
    MichaelisMenten {
        vmax: String,
        km: String,
        substrate: String,
    },
    /// Hill equation: Vmax * [S]^n / (K^n + [S]^n)
    Hill {
        vmax: String,
        k: String,
        substrate: String,
        n: f64,
    },
    /// Reversible Michaelis-Menten on the first reactant and first product
    ReversibleMM {
        vmax_f: String,
        km_f: String,
        vmax_r: String,
        km_r: String,
    },
    /// Custom infix expression
    Custom(String),
}

impl KineticLaw {
    /// Render the law as an infix rate-law string for `reaction`
    pub fn to_expression(&self, reaction: &Reaction) -> String {
        match self {
            Self::MassAction { rate_constant } => {
                let mut terms = vec![rate_constant.clone()];
                for sr in &reaction.reactants {
                    if sr.stoichiometry == 1.0 {
                        terms.push(sr.species.clone());
                    } else {
                        terms.push(format!("{}^{}", sr.species, sr.stoichiometry));
                    }
                }
                terms.join("*")
            }
            Self::MichaelisMenten { vmax, km, substrate } => {
                format!("{vmax}*{substrate}/({km}+{substrate})")
            }
            Self::Hill { vmax, k, substrate, n } => {
                format!("{vmax}*{substrate}^{n}/({k}^{n}+{substrate}^{n})")
            }
            Self::ReversibleMM { vmax_f, km_f, vmax_r, km_r } => {
                match (reaction.reactants.first(), reaction.products.first()) {
                    (Some(s), Some(p)) => {
                        let (s, p) = (&s.species, &p.species);
                        format!(
                            "({vmax_f}*{s}/{km_f}-{vmax_r}*{p}/{km_r})/(1+{s}/{km_f}+{p}/{km_r})"
                        )
                    }
                    _ => "0".to_string(),
                }
            }
            Self::Custom(expr) => expr.clone(),
        }
    }
}

/// Reaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub reversible: bool,
    #[serde(default)]
    pub reactants: Vec<SpeciesReference>,
    #[serde(default)]
    pub products: Vec<SpeciesReference>,
    pub kinetic_law: KineticLaw,
}

impl Reaction {
    pub fn new(
        id: &str,
        reactants: Vec<SpeciesReference>,
        products: Vec<SpeciesReference>,
        kinetic_law: KineticLaw,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            reversible: false,
            reactants,
            products,
            kinetic_law,
        }
    }

    /// Create a simple A -> B reaction
    pub fn simple(id: &str, reactant: &str, product: &str, rate_constant: &str) -> Self {
        Self::new(
            id,
            vec![SpeciesReference::new(reactant, 1.0)],
            vec![SpeciesReference::new(product, 1.0)],
            KineticLaw::MassAction {
                rate_constant: rate_constant.to_string(),
            },
        )
    }

    /// Create a zeroth-order source reaction: -> product, at rate `expression`
    pub fn synthesis(id: &str, product: &str, expression: &str) -> Self {
        Self::new(
            id,
            Vec::new(),
            vec![SpeciesReference::new(product, 1.0)],
            KineticLaw::Custom(expression.to_string()),
        )
    }

    /// Create a first-order decay: species ->
    pub fn degradation(id: &str, species: &str, rate_constant: &str) -> Self {
        Self::new(
            id,
            vec![SpeciesReference::new(species, 1.0)],
            Vec::new(),
            KineticLaw::MassAction {
                rate_constant: rate_constant.to_string(),
            },
        )
    }

    /// Create an enzymatic reaction with Michaelis-Menten kinetics
    pub fn enzymatic(id: &str, substrate: &str, product: &str, vmax: &str, km: &str) -> Self {
        Self::new(
            id,
            vec![SpeciesReference::new(substrate, 1.0)],
            vec![SpeciesReference::new(product, 1.0)],
            KineticLaw::MichaelisMenten {
                vmax: vmax.to_string(),
                km: km.to_string(),
                substrate: substrate.to_string(),
            },
        )
    }

    /// Rate-law string of this reaction
    pub fn expression(&self) -> String {
        self.kinetic_law.to_expression(self)
    }
}

// =============================================================================
// SBML MODEL
// =============================================================================

/// Complete model description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SbmlModel {
    /// Identity of the formalism that runs this model
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Unit in which species values are stored
    #[serde(default)]
    pub units: UnitSystem,
    /// Identity of the module this model reads coupled values from
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub compartments: Vec<Compartment>,
    #[serde(default)]
    pub species: Vec<Species>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

impl SbmlModel {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            units: UnitSystem::default(),
            target: None,
            compartments: Vec::new(),
            species: Vec::new(),
            parameters: Vec::new(),
            reactions: Vec::new(),
        }
    }

    pub fn with_units(mut self, units: UnitSystem) -> Self {
        self.units = units;
        self
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    /// Add a compartment
    pub fn add_compartment(&mut self, compartment: Compartment) {
        self.compartments.push(compartment);
    }

    /// Add a species
    pub fn add_species(&mut self, species: Species) {
        self.species.push(species);
    }

    /// Add a parameter
    pub fn add_parameter(&mut self, parameter: Parameter) {
        self.parameters.push(parameter);
    }

    /// Add a reaction
    pub fn add_reaction(&mut self, reaction: Reaction) {
        self.reactions.push(reaction);
    }

    /// Get species by ID
    pub fn get_species(&self, id: &str) -> Option<&Species> {
        self.species.iter().find(|s| s.id == id)
    }

    /// Get parameter by ID
    pub fn get_parameter(&self, id: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.id == id)
    }

    /// Get compartment by ID
    pub fn get_compartment(&self, id: &str) -> Option<&Compartment> {
        self.compartments.iter().find(|c| c.id == id)
    }

    /// Build stoichiometry matrix (boundary species keep a zero row)
    pub fn stoichiometry_matrix(&self) -> Array2<f64> {
        let n_species = self.species.len();
        let n_reactions = self.reactions.len();
        let mut matrix = Array2::zeros((n_species, n_reactions));

        let species_index: HashMap<_, _> = self
            .species
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.boundary_condition)
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        for (j, reaction) in self.reactions.iter().enumerate() {
            // Reactants (negative stoichiometry)
            for sr in &reaction.reactants {
                if let Some(&i) = species_index.get(sr.species.as_str()) {
                    matrix[[i, j]] -= sr.stoichiometry;
                }
            }
            // Products (positive stoichiometry)
            for sr in &reaction.products {
                if let Some(&i) = species_index.get(sr.species.as_str()) {
                    matrix[[i, j]] += sr.stoichiometry;
                }
            }
        }

        matrix
    }

    /// Rate-law strings, one per reaction
    pub fn reaction_expressions(&self) -> Vec<String> {
        self.reactions.iter().map(Reaction::expression).collect()
    }

    /// Check identifiers and cross references
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CellError::ParseError("model id is empty".into()));
        }

        let mut seen = HashSet::new();
        for id in self
            .compartments
            .iter()
            .map(|c| &c.id)
            .chain(self.species.iter().map(|s| &s.id))
            .chain(self.parameters.iter().map(|p| &p.id))
        {
            if !seen.insert(id.as_str()) {
                // the same name as parameter and species is how models couple,
                // but only across models, never inside one
                return Err(CellError::ParseError(format!(
                    "model '{}': duplicate identifier '{}'",
                    self.id, id
                )));
            }
        }

        for species in &self.species {
            match self.get_compartment(&species.compartment) {
                Some(c) if c.size > 0.0 => {}
                Some(c) => {
                    return Err(CellError::ParseError(format!(
                        "model '{}': compartment '{}' has non-positive size {}",
                        self.id, c.id, c.size
                    )))
                }
                None => {
                    return Err(CellError::ParseError(format!(
                        "model '{}': species '{}' references unknown compartment '{}'",
                        self.id, species.id, species.compartment
                    )))
                }
            }
        }

        for reaction in &self.reactions {
            for sr in reaction.reactants.iter().chain(&reaction.products) {
                if self.get_species(&sr.species).is_none() {
                    return Err(CellError::ParseError(format!(
                        "model '{}': reaction '{}' references unknown species '{}'",
                        self.id, reaction.id, sr.species
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| CellError::ParseError(e.to_string()))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CellError::ParseError(e.to_string()))
    }

    /// Read a model file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CellError::ModelNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content).map_err(|e| match e {
            CellError::ParseError(msg) => {
                CellError::ParseError(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Write a model file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}

// =============================================================================
// HANDLER TRAITS
// =============================================================================

/// Kind of a named model entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Parameter,
    Species,
    Compartment,
}

/// Read access to named entities
pub trait EntityLookup {
    fn parameter_value(&self, id: &str) -> Option<f64>;

    fn species_value(&self, id: &str) -> Option<f64>;

    fn compartment_size(&self, id: &str) -> Option<f64>;

    /// First match in the order parameter -> species -> compartment
    fn resolve(&self, id: &str) -> Option<f64> {
        self.parameter_value(id)
            .or_else(|| self.species_value(id))
            .or_else(|| self.compartment_size(id))
    }
}

/// Everything a simulation module needs from a loaded model
pub trait ModelHandler: EntityLookup {
    /// Declared model identifier, used as module identity
    fn model_id(&self) -> &str;

    /// Target identity declared by the model itself, if any
    fn declared_target(&self) -> Option<&str>;

    fn units(&self) -> UnitSystem;

    fn species_ids(&self) -> Vec<String>;

    fn parameter_ids(&self) -> Vec<String>;

    /// Species values the model currently starts from (reflects overrides and `set_state`)
    fn initial_state(&self) -> Vec<f64>;

    /// Species x reactions
    fn stoichiometric_matrix(&self) -> Array2<f64>;

    /// One rate-law string per reaction, aligned with the matrix columns
    fn reaction_expressions(&self) -> Vec<String>;

    /// Compartment volume (litres) of every species
    fn species_volumes(&self) -> Vec<f64>;

    /// (id, value) of every parameter
    fn parameters(&self) -> Vec<(String, f64)>;

    /// (id, size) of every compartment
    fn compartments(&self) -> Vec<(String, f64)>;

    /// Set a parameter, species or compartment, tried in that order
    fn set_entity_value(&mut self, id: &str, value: f64) -> Result<EntityKind>;

    fn set_parameter(&mut self, id: &str, value: f64) -> Result<()>;

    /// Overwrite every species value at once
    fn set_state(&mut self, state: &[f64]) -> Result<()>;

    fn num_species(&self) -> usize {
        self.species_ids().len()
    }

    /// Compartment volume of one species
    fn species_volume(&self, id: &str) -> Option<f64> {
        let index = self.species_ids().iter().position(|s| s == id)?;
        self.species_volumes().get(index).copied()
    }
}

// =============================================================================
// SBML HANDLER
// =============================================================================

/// [`ModelHandler`] over an in-memory [`SbmlModel`]
#[derive(Debug, Clone)]
pub struct SbmlHandler {
    model: SbmlModel,
    /// Current species values in the model's unit
    state: Vec<f64>,
    species_index: HashMap<String, usize>,
}

impl SbmlHandler {
    /// Validate a model and take ownership of it
    pub fn new(model: SbmlModel) -> Result<Self> {
        model.validate()?;

        let state = model
            .species
            .iter()
            .map(|s| match (s.initial_concentration, s.initial_amount) {
                (Some(c), _) => c,
                (None, Some(amount)) => {
                    let volume = model
                        .get_compartment(&s.compartment)
                        .map(|c| c.size)
                        .unwrap_or(1.0);
                    model.units.from_molecules(amount, volume)
                }
                (None, None) => 0.0,
            })
            .collect();

        let species_index = model
            .species
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        Ok(Self {
            model,
            state,
            species_index,
        })
    }

    /// Load and validate a model file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(SbmlModel::load(path)?)
    }

    pub fn model(&self) -> &SbmlModel {
        &self.model
    }

    /// Species values keyed by id
    pub fn concentrations(&self) -> HashMap<String, f64> {
        self.model
            .species
            .iter()
            .zip(&self.state)
            .map(|(s, v)| (s.id.clone(), *v))
            .collect()
    }

    fn set_species(&mut self, id: &str, value: f64) -> bool {
        match self.species_index.get(id) {
            Some(&i) => {
                self.state[i] = value;
                true
            }
            None => false,
        }
    }
}

impl EntityLookup for SbmlHandler {
    fn parameter_value(&self, id: &str) -> Option<f64> {
        self.model.get_parameter(id).map(|p| p.value)
    }

    fn species_value(&self, id: &str) -> Option<f64> {
        self.species_index.get(id).map(|&i| self.state[i])
    }

    fn compartment_size(&self, id: &str) -> Option<f64> {
        self.model.get_compartment(id).map(|c| c.size)
    }
}

impl ModelHandler for SbmlHandler {
    fn model_id(&self) -> &str {
        &self.model.id
    }

    fn declared_target(&self) -> Option<&str> {
        self.model.target.as_deref()
    }

    fn units(&self) -> UnitSystem {
        self.model.units
    }

    fn species_ids(&self) -> Vec<String> {
        self.model.species.iter().map(|s| s.id.clone()).collect()
    }

    fn parameter_ids(&self) -> Vec<String> {
        self.model.parameters.iter().map(|p| p.id.clone()).collect()
    }

    fn initial_state(&self) -> Vec<f64> {
        self.state.clone()
    }

    fn stoichiometric_matrix(&self) -> Array2<f64> {
        self.model.stoichiometry_matrix()
    }

    fn reaction_expressions(&self) -> Vec<String> {
        self.model.reaction_expressions()
    }

    fn species_volumes(&self) -> Vec<f64> {
        self.model
            .species
            .iter()
            .map(|s| self.compartment_size(&s.compartment).unwrap_or(1.0))
            .collect()
    }

    fn parameters(&self) -> Vec<(String, f64)> {
        self.model
            .parameters
            .iter()
            .map(|p| (p.id.clone(), p.value))
            .collect()
    }

    fn compartments(&self) -> Vec<(String, f64)> {
        self.model
            .compartments
            .iter()
            .map(|c| (c.id.clone(), c.size))
            .collect()
    }

    fn set_entity_value(&mut self, id: &str, value: f64) -> Result<EntityKind> {
        if let Some(p) = self.model.parameters.iter_mut().find(|p| p.id == id) {
            p.value = value;
            return Ok(EntityKind::Parameter);
        }
        if self.set_species(id, value) {
            return Ok(EntityKind::Species);
        }
        if let Some(c) = self.model.compartments.iter_mut().find(|c| c.id == id) {
            c.size = value;
            return Ok(EntityKind::Compartment);
        }
        Err(CellError::EntityNotFound(format!(
            "'{}' is not a parameter, species or compartment of model '{}'",
            id, self.model.id
        )))
    }

    fn set_parameter(&mut self, id: &str, value: f64) -> Result<()> {
        match self.model.parameters.iter_mut().find(|p| p.id == id) {
            Some(p) => {
                p.value = value;
                Ok(())
            }
            None => Err(CellError::EntityNotFound(format!(
                "parameter '{}' in model '{}'",
                id, self.model.id
            ))),
        }
    }

    fn set_state(&mut self, state: &[f64]) -> Result<()> {
        if state.len() != self.state.len() {
            return Err(CellError::SimulationError(format!(
                "model '{}' has {} species, got a state of length {}",
                self.model.id,
                self.state.len(),
                state.len()
            )));
        }
        self.state.copy_from_slice(state);
        Ok(())
    }

    fn num_species(&self) -> usize {
        self.state.len()
    }
}

// =============================================================================
// STANDARD MODELS
// =============================================================================

pub mod models {
    use super::*;

    /// Reversible conversion A <-> B, rates k1*A and k2*B, counted in molecules
    pub fn conversion(id: &str, k1: f64, k2: f64, a0: f64, b0: f64) -> SbmlModel {
        let mut model = SbmlModel::new(id).with_units(UnitSystem::MoleculeCount);

        model.add_compartment(Compartment::new("cell", 1.0));
        model.add_species(Species::new("A", "cell", a0));
        model.add_species(Species::new("B", "cell", b0));

        model.add_parameter(Parameter::new("k1", k1));
        model.add_parameter(Parameter::new("k2", k2));

        model.add_reaction(Reaction::simple("forward", "A", "B", "k1"));
        model.add_reaction(Reaction::simple("backward", "B", "A", "k2"));

        model
    }

    /// Deterministic signalling model: TF drives nothing locally, protein is
    /// translated from the coupled `mRNA` parameter
    pub fn signaling() -> SbmlModel {
        let mut model = SbmlModel::new("Deterministic").with_units(UnitSystem::Nanomolar);
        model.name = Some("TF signalling and translation".into());

        model.add_compartment(Compartment::new("cytoplasm", 5.25e-12));
        model.add_species(Species::new("TF", "cytoplasm", 10.0));
        model.add_species(Species::new("Protein", "cytoplasm", 0.0));

        model.add_parameter(Parameter::new("mRNA", 0.0));
        model.add_parameter(Parameter::new("kdtf", 1e-3));
        model.add_parameter(Parameter::new("kTl", 0.5));
        model.add_parameter(Parameter::new("kdp", 1e-2));

        model.add_reaction(Reaction::degradation("tf_decay", "TF", "kdtf"));
        model.add_reaction(Reaction::synthesis("translation", "Protein", "kTl*mRNA"));
        model.add_reaction(Reaction::degradation("protein_decay", "Protein", "kdp"));

        model
    }

    /// Stochastic gene-expression model: transcription driven by the coupled
    /// `TF` parameter, first-order transcript decay
    pub fn transcription() -> SbmlModel {
        let mut model = SbmlModel::new("Stochastic").with_units(UnitSystem::MoleculeCount);
        model.name = Some("Stochastic transcription".into());

        model.add_compartment(Compartment::new("nucleus", 1.75e-12));
        model.add_species(Species::new("mRNA", "nucleus", 0.0));

        model.add_parameter(Parameter::new("TF", 0.0));
        model.add_parameter(Parameter::new("kTx", 1e-5));
        model.add_parameter(Parameter::new("kdm", 5e-3));

        model.add_reaction(Reaction::synthesis("transcription", "mRNA", "kTx*TF"));
        model.add_reaction(Reaction::degradation("mrna_decay", "mRNA", "kdm"));

        model
    }

    /// Michaelis-Menten enzyme kinetics
    pub fn michaelis_menten() -> SbmlModel {
        let mut model = SbmlModel::new("Deterministic");

        model.add_compartment(Compartment::new("cell", 1.0));
        model.add_species(Species::new("S", "cell", 10.0)); // Substrate
        model.add_species(Species::new("P", "cell", 0.0)); // Product

        model.add_parameter(Parameter::new("Vmax", 1.0));
        model.add_parameter(Parameter::new("Km", 0.5));

        model.add_reaction(Reaction::enzymatic("catalysis", "S", "P", "Vmax", "Km"));

        model
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_model() {
        let model = models::conversion("Stochastic", 0.1, 0.05, 100.0, 0.0);
        assert_eq!(model.species.len(), 2);
        assert_eq!(model.reactions.len(), 2);
        assert!(model.validate().is_ok());
    }

    #[test]
    fn test_stoichiometry_matrix() {
        let model = models::conversion("Stochastic", 0.1, 0.05, 100.0, 0.0);
        let stoich = model.stoichiometry_matrix();
        assert_eq!(stoich.nrows(), 2); // 2 species
        assert_eq!(stoich.ncols(), 2); // 2 reactions
        assert_eq!(stoich[[0, 0]], -1.0);
        assert_eq!(stoich[[1, 0]], 1.0);
        assert_eq!(stoich[[0, 1]], 1.0);
        assert_eq!(stoich[[1, 1]], -1.0);
    }

    #[test]
    fn test_boundary_species_row_is_zero() {
        let mut model = models::conversion("Stochastic", 0.1, 0.05, 100.0, 0.0);
        model.species[0] = model.species[0].clone().boundary();
        let stoich = model.stoichiometry_matrix();
        assert_eq!(stoich[[0, 0]], 0.0);
        assert_eq!(stoich[[0, 1]], 0.0);
        assert_eq!(stoich[[1, 0]], 1.0);
    }

    #[test]
    fn test_rate_law_rendering() {
        let model = models::conversion("Stochastic", 0.1, 0.05, 100.0, 0.0);
        assert_eq!(model.reaction_expressions(), vec!["k1*A", "k2*B"]);

        let mm = models::michaelis_menten();
        assert_eq!(mm.reaction_expressions(), vec!["Vmax*S/(Km+S)"]);

        let dimer = Reaction::new(
            "dimerisation",
            vec![SpeciesReference::new("M", 2.0)],
            vec![SpeciesReference::new("D", 1.0)],
            KineticLaw::MassAction {
                rate_constant: "kd".into(),
            },
        );
        assert_eq!(dimer.expression(), "kd*M^2");

        let hill = KineticLaw::Hill {
            vmax: "V".into(),
            k: "K".into(),
            substrate: "S".into(),
            n: 2.0,
        };
        assert_eq!(hill.to_expression(&dimer), "V*S^2/(K^2+S^2)");
    }

    #[test]
    fn test_reversible_mm_needs_both_sides() {
        let law = KineticLaw::ReversibleMM {
            vmax_f: "vf".into(),
            km_f: "kf".into(),
            vmax_r: "vr".into(),
            km_r: "kr".into(),
        };
        let r = Reaction::simple("iso", "S", "P", "k");
        assert_eq!(law.to_expression(&r), "(vf*S/kf-vr*P/kr)/(1+S/kf+P/kr)");

        let source = Reaction::synthesis("src", "P", "1");
        assert_eq!(law.to_expression(&source), "0");
    }

    #[test]
    fn test_validation_rejects_unknown_references() {
        let mut model = models::conversion("Stochastic", 0.1, 0.05, 100.0, 0.0);
        model.add_reaction(Reaction::simple("bad", "A", "Z", "k1"));
        assert!(matches!(model.validate(), Err(CellError::ParseError(_))));

        let mut orphan = SbmlModel::new("Deterministic");
        orphan.add_species(Species::new("X", "nowhere", 1.0));
        assert!(orphan.validate().is_err());

        let mut dup = models::conversion("Stochastic", 0.1, 0.05, 100.0, 0.0);
        dup.add_parameter(Parameter::new("A", 1.0));
        assert!(dup.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let model = models::signaling();
        let json = model.to_json_string().unwrap();
        let parsed = SbmlModel::from_json_str(&json).unwrap();
        assert_eq!(parsed.id, "Deterministic");
        assert_eq!(parsed.units, UnitSystem::Nanomolar);
        assert_eq!(parsed.reaction_expressions(), model.reaction_expressions());
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = r#"{
            "id": "Stochastic",
            "compartments": [{ "id": "cell", "size": 1.0 }],
            "species": [{ "id": "X", "compartment": "cell", "initial_concentration": 3.0 }],
            "parameters": [{ "id": "k", "value": 0.2 }],
            "reactions": [{
                "id": "decay",
                "reactants": [{ "species": "X" }],
                "kinetic_law": { "MassAction": { "rate_constant": "k" } }
            }]
        }"#;
        let model = SbmlModel::from_json_str(json).unwrap();
        assert_eq!(model.units, UnitSystem::Nanomolar);
        assert_eq!(model.reactions[0].reactants[0].stoichiometry, 1.0);
        assert_eq!(model.reaction_expressions(), vec!["k*X"]);
    }

    #[test]
    fn test_handler_resolution_order() {
        let mut model = SbmlModel::new("Stochastic");
        model.add_compartment(Compartment::new("cell", 2.0));
        model.add_species(Species::new("X", "cell", 5.0));
        model.add_parameter(Parameter::new("k", 0.3));
        let handler = SbmlHandler::new(model).unwrap();

        assert_eq!(handler.resolve("k"), Some(0.3));
        assert_eq!(handler.resolve("X"), Some(5.0));
        assert_eq!(handler.resolve("cell"), Some(2.0));
        assert_eq!(handler.resolve("missing"), None);
    }

    #[test]
    fn test_set_entity_value() {
        let model = models::conversion("Stochastic", 0.1, 0.05, 100.0, 0.0);
        let mut handler = SbmlHandler::new(model).unwrap();

        assert_eq!(handler.set_entity_value("k1", 0.7).unwrap(), EntityKind::Parameter);
        assert_eq!(handler.parameter_value("k1"), Some(0.7));

        assert_eq!(handler.set_entity_value("A", 50.0).unwrap(), EntityKind::Species);
        assert_eq!(handler.initial_state(), vec![50.0, 0.0]);

        assert_eq!(handler.set_entity_value("cell", 3.0).unwrap(), EntityKind::Compartment);
        assert_eq!(handler.species_volumes(), vec![3.0, 3.0]);

        assert!(matches!(
            handler.set_entity_value("nope", 1.0),
            Err(CellError::EntityNotFound(_))
        ));
    }

    #[test]
    fn test_set_state_checks_length() {
        let model = models::conversion("Stochastic", 0.1, 0.05, 100.0, 0.0);
        let mut handler = SbmlHandler::new(model).unwrap();
        assert!(handler.set_state(&[1.0, 2.0]).is_ok());
        assert_eq!(handler.concentrations()["B"], 2.0);
        assert!(handler.set_state(&[1.0]).is_err());
    }

    #[test]
    fn test_initial_amount_is_converted() {
        let mut model = SbmlModel::new("Deterministic");
        let volume = 1.0 / (hybridcell_core::AVOGADRO * 1e-9);
        model.add_compartment(Compartment::new("cell", volume));
        let mut x = Species::new("X", "cell", 0.0);
        x.initial_concentration = None;
        x.initial_amount = Some(40.0);
        model.add_species(x);

        let handler = SbmlHandler::new(model).unwrap();
        let value = handler.species_value("X").unwrap();
        assert!((value - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcription.json");
        models::transcription().save(&path).unwrap();

        let handler = SbmlHandler::from_path(&path).unwrap();
        assert_eq!(handler.model_id(), "Stochastic");
        assert_eq!(handler.units(), UnitSystem::MoleculeCount);
        assert_eq!(handler.reaction_expressions(), vec!["kTx*TF", "kdm*mRNA"]);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(SbmlModel::load(&path), Err(CellError::ParseError(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let err = SbmlModel::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, CellError::ModelNotFound(_)));
    }

    #[test]
    fn test_coupled_models_share_identifiers() {
        let det = models::signaling();
        let stoch = models::transcription();
        assert!(det.get_parameter("mRNA").is_some());
        assert!(stoch.get_species("mRNA").is_some());
        assert!(stoch.get_parameter("TF").is_some());
        assert!(det.get_species("TF").is_some());
    }
}
