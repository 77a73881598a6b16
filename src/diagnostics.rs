//! Non-fatal diagnostics reporting.
//!
//! Long-running operations take a `&mut Diagnostics` instead of writing to a
//! process-wide logger. Callers that don't care can pass a throwaway value;
//! the minimizer folds its channel into the final fit report.

use std::fmt;

/// Category of a non-fatal warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// A tie or constraint was dropped because a tree edit removed something
    /// it pointed at.
    DroppedBinding,
    /// A constraint was attached or queried in a degenerate configuration
    /// (no bounds set, non-positive penalty factor).
    ConstraintUsage,
    /// A covariance column was near-linearly-dependent and its uncertainty
    /// is undefined.
    DegenerateCovariance,
    /// A data point carried a non-positive error and was given zero weight.
    ZeroWeight,
}

/// A single warning entry.
#[derive(Debug, Clone)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

/// An ordered collection of non-fatal warnings produced by one operation.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, kind: WarningKind, message: impl Into<String>) {
        self.warnings.push(Warning {
            kind,
            message: message.into(),
        });
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.warnings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_in_order() {
        let mut diag = Diagnostics::new();
        assert!(diag.is_empty());

        diag.warn(WarningKind::ZeroWeight, "point 3 has e <= 0");
        diag.warn(WarningKind::DroppedBinding, "tie on f1.a dropped");

        assert_eq!(diag.len(), 2);
        assert_eq!(diag.warnings()[0].kind, WarningKind::ZeroWeight);
        assert!(format!("{}", diag.warnings()[1]).contains("f1.a"));
    }
}
