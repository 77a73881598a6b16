//! # curvefit-rs
//!
//! `curvefit-rs` is a nonlinear least-squares curve-fitting engine built
//! around a composite model tree with a damped Gauss-Newton
//! (Levenberg-Marquardt) minimizer.
//!
//! The library provides:
//! - A model tree combining leaf models under pluggable policies, with
//!   stable `f0.f1.name` parameter addressing
//! - Parameter ties driven by an arithmetic expression evaluator, and soft
//!   boundary constraints with linear ramp penalties
//! - A weighted least-squares cost that exposes only the active parameters
//! - Covariance and standard errors propagated through ties
//!
//! ## Basic Usage
//!
//! ```
//! use curvefit_rs::{FitData, LeastSquaresCost, Levenberg, ModelTree};
//! use curvefit_rs::models::Linear;
//! use ndarray::Array1;
//!
//! let x = Array1::linspace(0.0, 5.0, 20);
//! let y = x.mapv(|xi| 1.5 + 0.7 * xi);
//! let data = FitData::unweighted(x, y).unwrap();
//!
//! let tree = ModelTree::leaf(Box::new(Linear::new(0.0, 0.0)));
//! let mut cost = LeastSquaresCost::with_tree(data, tree);
//! let report = Levenberg::default().minimize(&mut cost).unwrap();
//! assert!(report.success());
//! ```

pub mod error;

pub mod diagnostics;
pub mod expr;

// Model system
pub mod model;
pub mod models;
pub mod registry;

// Fitting machinery
pub mod cost;
pub mod covariance;
pub mod data;
pub mod minimizer;

mod utils;

// Re-exports for convenience
pub use error::{FitError, Result};

pub use cost::LeastSquaresCost;
pub use data::FitData;
pub use diagnostics::{Diagnostics, Warning, WarningKind};
pub use expr::Expr;
pub use minimizer::{FitReport, Levenberg, LmConfig, MinimizerStatus};
pub use model::{
    BoundaryConstraint, CombinePolicy, Model, ModelTree, NodeId, ParamRecord, ProductPolicy,
    SumPolicy,
};
pub use registry::{model_to_string, ModelRegistry};
pub use utils::finite_difference::DiffMethod;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
