//! Built-in leaf models.

mod exponential;
mod gaussian;
mod linear;

pub use exponential::ExpDecay;
pub use gaussian::Gaussian;
pub use linear::Linear;
