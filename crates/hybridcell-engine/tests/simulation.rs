//! End-to-end runs through the orchestrator.

use hybridcell_core::{CellError, Result, SimulationSettings, UnitSystem};
use hybridcell_engine::{
    DeterministicModule, Module, ModuleHandle, Orchestrator, RateLawPolicy, RunConfig,
    SimulationResults, StochasticModule, TsvOptions,
};
use hybridcell_sbml::{
    models, Compartment, EntityKind, EntityLookup, KineticLaw, ModelHandler, Parameter, Reaction,
    SbmlHandler, SbmlModel, Species, SpeciesReference,
};
use ndarray::Array2;

fn run(models: Vec<SbmlModel>, config: RunConfig, overrides: &[(String, f64)], stop: f64, step: f64) -> (Orchestrator, SimulationResults) {
    let mut orchestrator = Orchestrator::new(config);
    for model in models {
        orchestrator.add_model(model).unwrap();
    }
    let results = orchestrator.simulate(overrides, 0.0, stop, step).unwrap();
    (orchestrator, results)
}

fn seeded(seed: u64) -> RunConfig {
    RunConfig::default().with_seed(seed)
}

#[test]
fn test_stochastic_conversion_conserves_total() {
    for bulk in [true, false] {
        let config = RunConfig {
            bulk_single_module: bulk,
            ..seeded(17)
        };
        let model = models::conversion("Stochastic", 0.1, 0.05, 100.0, 0.0);
        let (_, results) = run(vec![model], config, &[], 10.0, 1.0);

        assert_eq!(results.nrows(), 11);
        for row in results.matrix.rows() {
            assert!(row.iter().all(|&x| x >= 0.0));
            assert_eq!(row[0] + row[1], 100.0);
        }
    }
}

#[test]
fn test_deterministic_conversion_conserves_total() {
    let model = models::conversion("Deterministic", 0.1, 0.05, 100.0, 0.0);
    let (_, results) = run(vec![model], RunConfig::default(), &[], 10.0, 1.0);

    for row in results.matrix.rows() {
        assert!((row[0] + row[1] - 100.0).abs() < 1e-6);
    }
    // A(t) = 100/3 + 200/3 * exp(-0.15 t)
    let a10 = results.column("Deterministic", "A").unwrap()[10];
    let expected = 100.0 / 3.0 + 200.0 / 3.0 * (-1.5f64).exp();
    assert!((a10 - expected).abs() < 1e-3, "A(10) = {}", a10);
}

#[test]
fn test_single_module_bulk_equals_stepping() {
    let model = || models::conversion("Deterministic", 0.1, 0.05, 100.0, 0.0);

    let (_, bulk) = run(vec![model()], RunConfig::default(), &[], 10.0, 1.0);
    let stepped_config = RunConfig {
        bulk_single_module: false,
        ..RunConfig::default()
    };
    let (_, stepped) = run(vec![model()], stepped_config, &[], 10.0, 1.0);

    assert_eq!(bulk.matrix, stepped.matrix);
}

#[test]
fn test_override_shows_in_first_row() {
    let model = models::conversion("Stochastic", 0.1, 0.05, 100.0, 0.0);
    let overrides = vec![("A".to_string(), 50.0)];
    let (_, results) = run(vec![model], seeded(3), &overrides, 10.0, 1.0);

    assert_eq!(results.matrix[[0, 0]], 50.0);
    assert_eq!(results.matrix[[0, 1]], 0.0);
    for row in results.matrix.rows() {
        assert_eq!(row[0] + row[1], 50.0);
    }
}

#[test]
fn test_parameter_override_changes_dynamics() {
    let model = || models::conversion("Deterministic", 0.1, 0.05, 100.0, 0.0);
    let (_, base) = run(vec![model()], RunConfig::default(), &[], 10.0, 1.0);
    let overrides = vec![("k1".to_string(), 0.0)];
    let (_, frozen) = run(vec![model()], RunConfig::default(), &overrides, 10.0, 1.0);

    assert!(base.final_state().unwrap()[0] < 100.0);
    assert_eq!(frozen.final_state().unwrap(), vec![100.0, 0.0]);
}

#[test]
fn test_override_matching_nothing_aborts() {
    let mut orchestrator = Orchestrator::new(seeded(1));
    orchestrator.add_model(models::signaling()).unwrap();
    orchestrator.add_model(models::transcription()).unwrap();

    let overrides = vec![("TF".to_string(), 20.0), ("Nope".to_string(), 1.0)];
    let result = orchestrator.simulate(&overrides, 0.0, 60.0, 30.0);
    assert!(matches!(result, Err(CellError::EntityNotFound(_))));
}

#[test]
fn test_results_shape() {
    for (stop, step, n) in [(60.0, 30.0, 2), (10.0, 3.0, 4), (1.0, 1.0, 1), (600.0, 1.0, 600)] {
        let (orchestrator, results) = run(
            vec![models::signaling(), models::transcription()],
            seeded(5),
            &[],
            stop,
            step,
        );
        let columns: usize = orchestrator.modules().iter().map(Module::num_species).sum();

        assert_eq!(results.nrows(), n + 1);
        assert_eq!(results.ncols(), columns);
        assert_eq!(results.ncols(), 3);
        assert_eq!(results.timepoints.len(), n + 1);
        assert_eq!(results.species_ids, vec!["TF", "Protein", "mRNA"]);
        assert_eq!(
            results.module_ids,
            vec!["Deterministic", "Deterministic", "Stochastic"]
        );
    }
}

#[test]
fn test_overlap_values_match_after_exchange() {
    let overrides = vec![("mRNA".to_string(), 400.0)];
    let (orchestrator, results) = run(
        vec![models::signaling(), models::transcription()],
        seeded(8),
        &overrides,
        120.0,
        1.0,
    );
    let modules = orchestrator.modules();
    let det = modules[0].core();
    let sto = modules[1].core();

    // deterministic mRNA parameter = stochastic mRNA species, molecules -> nM
    let mrna_count = *results.column("Stochastic", "mRNA").unwrap().last().unwrap();
    let volume = sto.handler().species_volume("mRNA").unwrap();
    let expected = UnitSystem::Nanomolar.convert_from(mrna_count, UnitSystem::MoleculeCount, volume);
    let pulled = det.handler().parameter_value("mRNA").unwrap();
    assert!((pulled - expected).abs() <= 1e-12 * expected.abs().max(1.0));

    // stochastic TF parameter = deterministic TF species, nM -> molecules
    let tf = *results.column("Deterministic", "TF").unwrap().last().unwrap();
    let volume = det.handler().species_volume("TF").unwrap();
    let expected = UnitSystem::MoleculeCount.convert_from(tf, UnitSystem::Nanomolar, volume);
    let pulled = sto.handler().parameter_value("TF").unwrap();
    assert!((pulled - expected).abs() <= 1e-9 * expected.abs().max(1.0));

    // the coupling actually drove translation
    let protein = results.column("Deterministic", "Protein").unwrap();
    assert!(*protein.last().unwrap() > 0.0);
}

#[test]
fn test_one_sided_overlap() {
    // the stochastic side declares no coupled parameter, the deterministic side still pulls
    let mut transcription = models::transcription();
    transcription.parameters.retain(|p| p.id != "TF");
    transcription.reactions[0].kinetic_law = KineticLaw::Custom("kTx*100000".into());

    let (orchestrator, _) = run(
        vec![models::signaling(), transcription],
        seeded(9),
        &[],
        30.0,
        1.0,
    );
    let modules = orchestrator.modules();
    assert_eq!(modules[0].core().overlaps()[0].identifiers, vec!["mRNA"]);
    assert!(modules[1].core().overlaps()[0].identifiers.is_empty());
    assert!(modules[0].core().handler().parameter_value("mRNA").unwrap() > 0.0);
}

#[test]
fn test_seeded_runs_repeat() {
    let build = || vec![models::signaling(), models::transcription()];
    let (_, first) = run(build(), seeded(2024), &[], 300.0, 1.0);
    let (_, second) = run(build(), seeded(2024), &[], 300.0, 1.0);
    assert_eq!(first, second);

    let large = || vec![models::conversion("Stochastic", 0.1, 0.05, 10_000.0, 0.0)];
    let (_, a) = run(large(), seeded(1), &[], 10.0, 1.0);
    let (_, b) = run(large(), seeded(2), &[], 10.0, 1.0);
    assert_ne!(a.matrix, b.matrix);
}

#[test]
fn test_adversarial_dimerisation_stays_non_negative() {
    let mut model = SbmlModel::new("Stochastic").with_units(UnitSystem::MoleculeCount);
    model.add_compartment(Compartment::new("cell", 1.0));
    model.add_species(Species::new("A", "cell", 3.0));
    model.add_species(Species::new("B", "cell", 0.0));
    model.add_parameter(Parameter::new("kf", 1e6));
    model.add_parameter(Parameter::new("kr", 1e6));
    model.add_reaction(Reaction::new(
        "dimerise",
        vec![SpeciesReference::new("A", 2.0)],
        vec![SpeciesReference::new("B", 1.0)],
        KineticLaw::MassAction {
            rate_constant: "kf".into(),
        },
    ));
    model.add_reaction(Reaction::new(
        "split",
        vec![SpeciesReference::new("B", 1.0)],
        vec![SpeciesReference::new("A", 2.0)],
        KineticLaw::MassAction {
            rate_constant: "kr".into(),
        },
    ));
    model.add_reaction(Reaction::degradation("burn", "A", "kf"));

    let (_, results) = run(vec![model], seeded(66), &[], 50.0, 1.0);
    let mut previous_mass = f64::INFINITY;
    for row in results.matrix.rows() {
        assert!(row.iter().all(|&x| x >= 0.0 && x.fract() == 0.0));
        let mass = row[0] + 2.0 * row[1];
        assert!(mass <= previous_mass);
        previous_mass = mass;
    }
}

#[test]
fn test_strict_policy_rejects_bad_rate_law() {
    let mut model = models::conversion("Stochastic", 0.1, 0.05, 100.0, 0.0);
    model.reactions[1].kinetic_law = KineticLaw::Custom("k2*Bogus".into());

    let mut strict = Orchestrator::new(seeded(1).with_rate_laws(RateLawPolicy::Strict));
    strict.add_model(model.clone()).unwrap();
    assert!(matches!(
        strict.simulate(&[], 0.0, 10.0, 1.0),
        Err(CellError::ExpressionError { reaction: 1, .. })
    ));

    // degraded: the broken reaction never fires, A only drains into B
    let (_, results) = run(vec![model], seeded(1), &[], 10.0, 1.0);
    let a = results.column("Stochastic", "A").unwrap();
    assert!(a.windows(2).all(|w| w[1] <= w[0]));
}

#[test]
fn test_model_files_and_tsv_output() {
    let dir = tempfile::tempdir().unwrap();
    let det_path = dir.path().join("signaling.json");
    let sto_path = dir.path().join("transcription.json");
    models::signaling().save(&det_path).unwrap();
    models::transcription().save(&sto_path).unwrap();

    let mut orchestrator = Orchestrator::new(seeded(12));
    orchestrator.load_model(&det_path).unwrap();
    orchestrator.load_model(&sto_path).unwrap();
    assert_eq!(orchestrator.num_loaded(), 2);
    let results = orchestrator.simulate(&[], 0.0, 60.0, 30.0).unwrap();

    let out = dir.path().join("results.tsv");
    results
        .save_tsv(&out, TsvOptions { header: true, time_column: true })
        .unwrap();
    let content = std::fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = content.lines().collect();

    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "time\tTF\tProtein\tmRNA");
    assert!(lines[1].starts_with("0\t10\t0\t0"));
    assert!(lines[3].starts_with("60\t"));
    assert!(lines.iter().all(|l| l.split('\t').count() == 4));
}

#[test]
fn test_missing_model_file() {
    let mut orchestrator = Orchestrator::new(RunConfig::default());
    let result = orchestrator.load_model("does/not/exist.json");
    assert!(matches!(result, Err(CellError::ModelNotFound(_))));
}

#[test]
fn test_demo_models_load() {
    let demos = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos");
    let mut orchestrator = Orchestrator::new(seeded(21));
    for name in ["signaling.json", "transcription.json"] {
        orchestrator.load_model(demos.join(name)).unwrap();
    }
    let results = orchestrator.simulate(&[], 0.0, 60.0, 30.0).unwrap();
    assert_eq!(results.nrows(), 3);
    assert_eq!(results.ncols(), 3);
}

#[test]
fn test_nanomolar_stochastic_conversion_conserves_total() {
    for bulk in [true, false] {
        let config = RunConfig {
            bulk_single_module: bulk,
            ..seeded(23)
        };
        // 100 nM in 1 pL is about 60220 molecules
        let mut model = models::conversion("Stochastic", 0.1, 0.05, 100.0, 0.0)
            .with_units(UnitSystem::Nanomolar);
        model.compartments[0].size = 1e-12;

        let (_, results) = run(vec![model], config, &[], 10.0, 1.0);
        assert_eq!(results.nrows(), 11);
        for row in results.matrix.rows() {
            assert!(row.iter().all(|&x| x >= 0.0));
            assert!((row[0] + row[1] - 100.0).abs() < 1e-2, "A + B = {}", row[0] + row[1]);
        }

        let b = results.column("Stochastic", "B").unwrap();
        assert!(b[10] > 10.0, "B(10) = {}", b[10]);
        // stored values stay concentrations, not molecule counts
        assert!(b[10] < 100.0);
    }
}

/// Delegates to an [`SbmlHandler`] but refuses writes to some parameters and
/// cannot place some species in a compartment
struct PartialHandler {
    inner: SbmlHandler,
    read_only: Vec<&'static str>,
    unplaced: Vec<&'static str>,
}

impl PartialHandler {
    fn new(model: SbmlModel, read_only: &[&'static str], unplaced: &[&'static str]) -> Self {
        Self {
            inner: SbmlHandler::new(model).unwrap(),
            read_only: read_only.to_vec(),
            unplaced: unplaced.to_vec(),
        }
    }
}

impl EntityLookup for PartialHandler {
    fn parameter_value(&self, id: &str) -> Option<f64> {
        self.inner.parameter_value(id)
    }

    fn species_value(&self, id: &str) -> Option<f64> {
        self.inner.species_value(id)
    }

    fn compartment_size(&self, id: &str) -> Option<f64> {
        self.inner.compartment_size(id)
    }
}

impl ModelHandler for PartialHandler {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn declared_target(&self) -> Option<&str> {
        self.inner.declared_target()
    }

    fn units(&self) -> UnitSystem {
        self.inner.units()
    }

    fn species_ids(&self) -> Vec<String> {
        self.inner.species_ids()
    }

    fn parameter_ids(&self) -> Vec<String> {
        self.inner.parameter_ids()
    }

    fn initial_state(&self) -> Vec<f64> {
        self.inner.initial_state()
    }

    fn stoichiometric_matrix(&self) -> Array2<f64> {
        self.inner.stoichiometric_matrix()
    }

    fn reaction_expressions(&self) -> Vec<String> {
        self.inner.reaction_expressions()
    }

    fn species_volumes(&self) -> Vec<f64> {
        self.inner.species_volumes()
    }

    fn parameters(&self) -> Vec<(String, f64)> {
        self.inner.parameters()
    }

    fn compartments(&self) -> Vec<(String, f64)> {
        self.inner.compartments()
    }

    fn set_entity_value(&mut self, id: &str, value: f64) -> Result<EntityKind> {
        self.inner.set_entity_value(id, value)
    }

    fn set_parameter(&mut self, id: &str, value: f64) -> Result<()> {
        if self.read_only.contains(&id) {
            return Err(CellError::EntityNotFound(format!("'{}' is read-only", id)));
        }
        self.inner.set_parameter(id, value)
    }

    fn set_state(&mut self, state: &[f64]) -> Result<()> {
        self.inner.set_state(state)
    }

    fn species_volume(&self, id: &str) -> Option<f64> {
        if self.unplaced.contains(&id) {
            return None;
        }
        self.inner.species_volume(id)
    }
}

/// Transcription model that also reads the deterministic `Protein`
fn transcription_reading_protein() -> SbmlModel {
    let mut model = models::transcription();
    model.add_parameter(Parameter::new("Protein", 0.0));
    model
}

#[test]
fn test_exchange_skips_missing_identifiers() {
    let config = seeded(5);
    // signalling cannot take mRNA and cannot report where its TF lives
    let det = PartialHandler::new(models::signaling(), &["mRNA"], &["TF"]);
    let sto = PartialHandler::new(transcription_reading_protein(), &[], &[]);

    let mut modules: Vec<Module> = vec![
        DeterministicModule::new(Box::new(det), "Stochastic", &config)
            .unwrap()
            .into(),
        StochasticModule::new(Box::new(sto), "Deterministic", &config, Some(5))
            .unwrap()
            .into(),
    ];
    let siblings: Vec<(ModuleHandle, String)> = modules
        .iter()
        .enumerate()
        .map(|(i, m)| (ModuleHandle(i), m.module_id().to_string()))
        .collect();
    let species: Vec<(ModuleHandle, Vec<String>)> = modules
        .iter()
        .enumerate()
        .map(|(i, m)| (ModuleHandle(i), m.species_ids().to_vec()))
        .collect();
    let overrides = vec![("Protein".to_string(), 50.0)];
    let settings = SimulationSettings::new(0.0, 2.0, 1.0);
    for (i, module) in modules.iter_mut().enumerate() {
        module.assign_targets(ModuleHandle(i), &siblings).unwrap();
        module.resolve_overlaps(&species).unwrap();
        module.set_simulation_settings(&overrides, &settings).unwrap();
    }
    for module in modules.iter_mut() {
        module.step(1).unwrap();
    }

    let plans: Vec<_> = modules.iter().map(|m| m.pull_parameters(&modules)).collect();
    let mut reports = Vec::new();
    for (module, plan) in modules.iter_mut().zip(plans) {
        reports.push(module.update_parameters(plan).unwrap());
    }

    // deterministic side: write refused by its own handler
    assert!(reports[0].exchanged.is_empty());
    assert_eq!(reports[0].skipped, vec!["mRNA".to_string()]);

    // stochastic side: TF cannot be converted, Protein still arrives
    assert_eq!(reports[1].exchanged, vec!["Protein".to_string()]);
    assert_eq!(reports[1].skipped, vec!["TF".to_string()]);
    assert!(!reports[1].is_complete());

    let protein_nm = modules[0].results()[[1, 1]];
    let volume = modules[0].core().handler().species_volumes()[1];
    let expected = UnitSystem::MoleculeCount.convert_from(protein_nm, UnitSystem::Nanomolar, volume);
    let pulled = modules[1].core().handler().parameter_value("Protein").unwrap();
    assert!((pulled - expected).abs() <= 1e-9 * expected);
    assert_eq!(modules[1].core().handler().parameter_value("TF"), Some(0.0));
}

#[test]
fn test_run_continues_past_skipped_exchange() {
    let mut orchestrator = Orchestrator::new(seeded(6));
    orchestrator.add_handler(Box::new(PartialHandler::new(models::signaling(), &["mRNA"], &["TF"])));
    orchestrator.add_handler(Box::new(PartialHandler::new(transcription_reading_protein(), &[], &[])));

    let overrides = vec![("mRNA".to_string(), 400.0), ("Protein".to_string(), 50.0)];
    let results = orchestrator.simulate(&overrides, 0.0, 30.0, 1.0).unwrap();
    assert_eq!(results.nrows(), 31);

    let modules = orchestrator.modules();
    // mRNA never reached the deterministic side, so the override holds
    assert_eq!(modules[0].core().handler().parameter_value("mRNA"), Some(400.0));
    // TF never reached the stochastic side, so no transcription happened
    assert_eq!(modules[1].core().handler().parameter_value("TF"), Some(0.0));
    assert!(results.column("Stochastic", "mRNA").unwrap().iter().all(|&m| m <= 400.0));
    // Protein kept flowing
    let protein = modules[1].core().handler().parameter_value("Protein").unwrap();
    assert!(protein > 0.0 && protein.is_finite());
}
