//! Numeric utilities shared by the cost function and the minimizer.

pub mod finite_difference;
pub mod linalg;
