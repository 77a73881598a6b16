//! End-to-end fits on synthetic data with seeded noise.

use approx::assert_relative_eq;
use curvefit_rs::models::{Gaussian, Linear};
use curvefit_rs::{
    Diagnostics, FitData, FitError, LeastSquaresCost, Levenberg, LmConfig, MinimizerStatus,
    ModelRegistry, ModelTree,
};
use ndarray::Array1;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

const NOISE_SIGMA: f64 = 0.05;

fn noisy_data(x: &Array1<f64>, truth: &ModelTree, seed: u64) -> FitData {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0.0, NOISE_SIGMA).unwrap();
    let clean = truth.eval(x.view()).unwrap();
    let y = clean.mapv(|v| v + normal.sample(&mut rng));
    let e = Array1::from_elem(y.len(), NOISE_SIGMA);
    let mut diag = Diagnostics::new();
    FitData::new(x.clone(), y, e, &mut diag).unwrap()
}

#[test]
fn recovers_peak_on_background_within_errors() {
    let x = Array1::linspace(0.0, 10.0, 201);
    let mut truth = ModelTree::composite();
    truth
        .add_child(truth.root(), Box::new(Gaussian::new(5.0, 4.0, 0.8)))
        .unwrap();
    truth
        .add_child(truth.root(), Box::new(Linear::new(1.0, 0.2)))
        .unwrap();
    let data = noisy_data(&x, &truth, 42);

    let mut tree = ModelTree::composite();
    tree.add_child(tree.root(), Box::new(Gaussian::new(3.0, 3.5, 1.2)))
        .unwrap();
    tree.add_child(tree.root(), Box::new(Linear::new(0.5, 0.1)))
        .unwrap();

    let mut cost = LeastSquaresCost::with_tree(data, tree);
    let report = Levenberg::default().minimize(&mut cost).unwrap();
    assert!(report.success(), "status was {}", report.status);
    assert!(
        report.reduced_chi2 > 0.5 && report.reduced_chi2 < 1.5,
        "reduced chi2 was {}",
        report.reduced_chi2
    );

    let tree = cost.tree().unwrap();
    let truth_values: [f64; 5] = [5.0, 4.0, 0.8, 1.0, 0.2];
    for (ordinal, &expected) in truth_values.iter().enumerate() {
        let value = tree.get_parameter(ordinal).unwrap();
        let stderr = tree.stderr(ordinal).unwrap();
        assert!(stderr > 0.0, "stderr missing for ordinal {}", ordinal);
        assert!(
            (value.abs() - expected.abs()).abs() < 5.0 * stderr,
            "ordinal {}: {} not within 5 sigma ({}) of {}",
            ordinal,
            value,
            stderr,
            expected
        );
    }
}

#[test]
fn tied_and_constrained_fit() {
    let x = Array1::linspace(0.0, 8.0, 161);
    let mut truth = ModelTree::composite();
    truth
        .add_child(truth.root(), Box::new(Gaussian::new(4.0, 2.0, 0.7)))
        .unwrap();
    truth
        .add_child(truth.root(), Box::new(Gaussian::new(2.0, 6.0, 0.7)))
        .unwrap();
    let data = noisy_data(&x, &truth, 7);

    let mut tree = ModelTree::composite();
    tree.add_child(tree.root(), Box::new(Gaussian::new(3.0, 2.2, 1.0)))
        .unwrap();
    tree.add_child(tree.root(), Box::new(Gaussian::new(1.5, 5.8, 1.0)))
        .unwrap();
    // Both peaks share a width; heights stay positive.
    tree.tie("f1.sigma", "f0.sigma").unwrap();
    tree.add_constraints("f0.height > 0, f1.height > 0").unwrap();

    let mut cost = LeastSquaresCost::with_tree(data, tree);
    let report = Levenberg::default().minimize(&mut cost).unwrap();
    assert!(report.success(), "status was {}", report.status);

    let tree = cost.tree().unwrap();
    let shared = tree.parameter_index("f0.sigma").unwrap();
    let tied = tree.parameter_index("f1.sigma").unwrap();
    assert_relative_eq!(
        tree.get_parameter(shared).unwrap(),
        tree.get_parameter(tied).unwrap(),
        epsilon = 1e-12
    );
    assert!(
        (tree.get_parameter(shared).unwrap().abs() - 0.7).abs() < 0.05,
        "shared width off: {}",
        tree.get_parameter(shared).unwrap()
    );

    // Tied parameters report no independent uncertainty.
    assert_eq!(tree.stderr(tied).unwrap(), 0.0);
    assert!(tree.stderr(shared).unwrap() > 0.0);

    // But the full covariance carries the tie through: the tied diagonal
    // equals the source's (identity tie).
    let cov = report.covariance.as_ref().unwrap();
    assert_relative_eq!(cov[[tied, tied]], cov[[shared, shared]], epsilon = 1e-6);
}

#[test]
fn covariance_is_symmetric_with_nonnegative_diagonal() {
    let x = Array1::linspace(0.0, 10.0, 101);
    let truth = ModelTree::leaf(Box::new(Gaussian::new(5.0, 4.0, 0.8)));
    let data = noisy_data(&x, &truth, 3);

    let tree = ModelTree::leaf(Box::new(Gaussian::new(4.0, 3.8, 1.0)));
    let mut cost = LeastSquaresCost::with_tree(data, tree);
    let report = Levenberg::default().minimize(&mut cost).unwrap();
    assert!(report.success());

    let cov = report.covariance.as_ref().unwrap();
    let n = cov.nrows();
    for i in 0..n {
        assert!(cov[[i, i]] >= 0.0, "negative variance at {}", i);
        for j in 0..n {
            assert_relative_eq!(cov[[i, j]], cov[[j, i]], epsilon = 1e-10);
        }
    }
}

#[test]
fn fit_from_registry_string() {
    let x = Array1::linspace(0.0, 5.0, 51);
    let truth = ModelTree::leaf(Box::new(Linear::new(1.5, 0.7)));
    let data = noisy_data(&x, &truth, 11);

    let registry = ModelRegistry::with_builtins();
    let tree = registry
        .tree_from_string("name=Linear,intercept=0,slope=0")
        .unwrap();

    let mut cost = LeastSquaresCost::with_tree(data, tree);
    let report = Levenberg::default().minimize(&mut cost).unwrap();
    assert!(report.success());

    let tree = cost.tree().unwrap();
    assert!((tree.get_parameter(0).unwrap() - 1.5).abs() < 0.1);
    assert!((tree.get_parameter(1).unwrap() - 0.7).abs() < 0.05);
}

#[test]
fn rejected_tie_leaves_tree_fittable() {
    let x = Array1::linspace(0.0, 5.0, 51);
    let truth = ModelTree::leaf(Box::new(Linear::new(1.0, 0.5)));
    let data = noisy_data(&x, &truth, 5);

    let mut tree = ModelTree::leaf(Box::new(Linear::new(0.0, 0.0)));
    let err = tree.tie("slope", "slope * 2").unwrap_err();
    assert!(matches!(err, FitError::SelfReferentialTie(_)));

    // The failed attach changed nothing; the fit proceeds normally.
    let mut cost = LeastSquaresCost::with_tree(data, tree);
    let report = Levenberg::default().minimize(&mut cost).unwrap();
    assert!(report.success());
    assert_eq!(report.params.len(), 2);
    assert!(report.params.iter().all(|p| p.active));
}

#[test]
fn best_parameters_survive_early_stop() {
    let x = Array1::linspace(0.0, 5.0, 51);
    let truth = ModelTree::leaf(Box::new(Linear::new(1.0, 0.5)));
    let data = noisy_data(&x, &truth, 9);

    let tree = ModelTree::leaf(Box::new(Linear::new(-20.0, 20.0)));
    let mut cost = LeastSquaresCost::with_tree(data.clone(), tree);
    let start_cost = cost.cost().unwrap();

    let config = LmConfig {
        max_iterations: 2,
        ..LmConfig::default()
    };
    let report = Levenberg::new(config).minimize(&mut cost).unwrap();
    assert_eq!(report.status, MinimizerStatus::MaxIterationsExceeded);
    assert!(report.covariance.is_none());
    assert!(
        report.chi2 < start_cost,
        "best-found parameters were not restored"
    );
}
