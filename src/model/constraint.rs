//! Boundary constraints: soft one-sided linear penalties keeping a parameter
//! inside an interval.
//!
//! The penalty is a linear ramp scaled by a per-constraint factor, not a
//! quadratic well, so its gradient contribution is a constant-magnitude sign.

use crate::diagnostics::{Diagnostics, WarningKind};
use crate::error::{FitError, Result};

/// Default penalty factor applied when a parameter leaves its interval.
pub const DEFAULT_PENALTY_FACTOR: f64 = 1000.0;

/// A soft interval restriction on one parameter. At least one bound is set.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryConstraint {
    lower: Option<f64>,
    upper: Option<f64>,
    penalty_factor: f64,
}

impl BoundaryConstraint {
    /// Create a constraint with the default penalty factor.
    pub fn new(lower: Option<f64>, upper: Option<f64>) -> Result<Self> {
        let mut diag = Diagnostics::new();
        Self::with_penalty_factor(lower, upper, DEFAULT_PENALTY_FACTOR, &mut diag)
    }

    /// Create a constraint with an explicit penalty factor. A non-positive
    /// factor is reset to 1 with a warning rather than rejected.
    pub fn with_penalty_factor(
        lower: Option<f64>,
        upper: Option<f64>,
        penalty_factor: f64,
        diagnostics: &mut Diagnostics,
    ) -> Result<Self> {
        if lower.is_none() && upper.is_none() {
            return Err(FitError::InvalidInput(
                "boundary constraint needs at least one bound".to_string(),
            ));
        }
        if let (Some(lo), Some(hi)) = (lower, upper) {
            if lo > hi {
                return Err(FitError::InvalidInput(format!(
                    "lower bound {} exceeds upper bound {}",
                    lo, hi
                )));
            }
        }

        let penalty_factor = if penalty_factor <= 0.0 {
            diagnostics.warn(
                WarningKind::ConstraintUsage,
                format!("penalty factor {} is not positive; reset to 1", penalty_factor),
            );
            1.0
        } else {
            penalty_factor
        };

        Ok(Self {
            lower,
            upper,
            penalty_factor,
        })
    }

    pub fn lower(&self) -> Option<f64> {
        self.lower
    }

    pub fn upper(&self) -> Option<f64> {
        self.upper
    }

    pub fn penalty_factor(&self) -> f64 {
        self.penalty_factor
    }

    /// Penalty at `value`: zero inside the interval, a linear ramp outside.
    pub fn check(&self, value: f64) -> f64 {
        if let Some(lo) = self.lower {
            if value < lo {
                return self.penalty_factor * (lo - value);
            }
        }
        if let Some(hi) = self.upper {
            if value > hi {
                return self.penalty_factor * (value - hi);
            }
        }
        0.0
    }

    /// Sub-gradient of the penalty at `value`: `-factor`, `0` or `+factor`.
    pub fn check_derivative(&self, value: f64) -> f64 {
        if let Some(lo) = self.lower {
            if value < lo {
                return -self.penalty_factor;
            }
        }
        if let Some(hi) = self.upper {
            if value > hi {
                return self.penalty_factor;
            }
        }
        0.0
    }

    /// Clamp `value` into the interval. Used to repair a starting guess
    /// before the first iteration; does not touch optimizer state.
    pub fn enforce(&self, value: f64) -> f64 {
        let mut v = value;
        if let Some(lo) = self.lower {
            v = v.max(lo);
        }
        if let Some(hi) = self.upper {
            v = v.min(hi);
        }
        v
    }
}

/// One parsed comparator clause: the constrained parameter name and its
/// constraint.
pub type ParsedConstraint = (String, BoundaryConstraint);

/// Parse a comma-separated list of constraint clauses. Supported forms,
/// with numeric literal bounds only:
///
/// - `"0.1 < sigma < 5"` — two-sided
/// - `"sigma > 0.1"` — lower bound
/// - `"sigma < 5"` — upper bound
pub fn parse_constraints(text: &str) -> Result<Vec<ParsedConstraint>> {
    let mut out = Vec::new();
    for clause in text.split(',') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        out.push(parse_clause(clause)?);
    }
    if out.is_empty() {
        return Err(FitError::ParseError(format!(
            "no constraint clauses in '{}'",
            text
        )));
    }
    Ok(out)
}

fn parse_clause(clause: &str) -> Result<ParsedConstraint> {
    let parts: Vec<&str> = clause.split(['<', '>']).map(str::trim).collect();
    let ops: Vec<char> = clause.chars().filter(|c| *c == '<' || *c == '>').collect();

    match (parts.as_slice(), ops.as_slice()) {
        // lo < name < hi
        ([lo, name, hi], ['<', '<']) => {
            let lo = parse_bound(lo, clause)?;
            let hi = parse_bound(hi, clause)?;
            Ok((
                (*name).to_string(),
                BoundaryConstraint::new(Some(lo), Some(hi))?,
            ))
        }
        // hi > name > lo
        ([hi, name, lo], ['>', '>']) => {
            let lo = parse_bound(lo, clause)?;
            let hi = parse_bound(hi, clause)?;
            Ok((
                (*name).to_string(),
                BoundaryConstraint::new(Some(lo), Some(hi))?,
            ))
        }
        // name > lo
        ([name, lo], ['>']) => {
            let lo = parse_bound(lo, clause)?;
            Ok(((*name).to_string(), BoundaryConstraint::new(Some(lo), None)?))
        }
        // name < hi
        ([name, hi], ['<']) => {
            let hi = parse_bound(hi, clause)?;
            Ok(((*name).to_string(), BoundaryConstraint::new(None, Some(hi))?))
        }
        _ => Err(FitError::ParseError(format!(
            "cannot parse constraint clause '{}'",
            clause
        ))),
    }
}

fn parse_bound(text: &str, clause: &str) -> Result<f64> {
    text.parse::<f64>().map_err(|_| {
        FitError::ParseError(format!(
            "constraint bound '{}' in '{}' is not a numeric literal",
            text, clause
        ))
    })
}
