use thiserror::Error;

/// Error types for the curvefit-rs library.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    /// Malformed tie or constraint expression text. Raised at attach time,
    /// never deferred to fit time.
    #[error("Failed to parse expression: {0}")]
    ParseError(String),

    /// Expression evaluated with a name that has no binding.
    #[error("Undefined variable: {0}")]
    UndefinedVariable(String),

    /// Expression called a function this evaluator does not define.
    #[error("Undefined function: {0}")]
    UndefinedFunction(String),

    /// Expression called a known function with the wrong number of arguments.
    #[error("{name}() expects {expected} argument(s), got {got}")]
    InvalidArity {
        name: String,
        expected: String,
        got: usize,
    },

    /// Unknown parameter name or out-of-range ordinal.
    #[error("Parameter not found: {0}")]
    ParameterNotFound(String),

    /// A tie expression references a name that resolves to no parameter.
    #[error("Tie '{tie}' references unknown parameter '{name}'")]
    UnknownParameterInTie { tie: String, name: String },

    /// A tie's target appears among its own dependencies.
    #[error("Tie for '{0}' refers to itself")]
    SelfReferentialTie(String),

    /// Ties form a dependency cycle.
    #[error("Cyclic tie dependency involving '{0}'")]
    CyclicTieDependency(String),

    /// A cost-function accessor was used before a model tree was attached.
    #[error("No fitting function set")]
    NoFittingFunction,

    /// The model tree has no active parameters to optimize.
    #[error("Nothing to fit: no active parameters")]
    NothingToFit,

    /// Non-finite residual or Jacobian entry. Rejects the current minimizer
    /// step, not the whole fit.
    #[error("Numeric failure: {0}")]
    NumericFailure(String),

    /// Mismatch in array or matrix dimensions.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Error from the linear algebra backend.
    #[error("Linear algebra error: {0}")]
    LinearAlgebraError(String),

    /// Invalid input data (lengths, ranges, bound ordering).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic error for cases that don't fit the other categories.
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for curvefit-rs operations.
pub type Result<T> = std::result::Result<T, FitError>;

impl From<String> for FitError {
    fn from(s: String) -> Self {
        FitError::Other(s)
    }
}

impl From<&str> for FitError {
    fn from(s: &str) -> Self {
        FitError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FitError::ParameterNotFound("f0.sigma".to_string());
        assert!(format!("{}", err).contains("f0.sigma"));

        let err = FitError::InvalidArity {
            name: "sin".to_string(),
            expected: "1".to_string(),
            got: 2,
        };
        assert!(format!("{}", err).contains("sin()"));
    }

    #[test]
    fn test_error_conversion() {
        let err: FitError = "test error".into();
        match err {
            FitError::Other(s) => assert_eq!(s, "test error"),
            _ => panic!("Expected Other variant"),
        }
    }
}
