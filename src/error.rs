use thiserror::Error;

/// Terminal state of an iterative solver run.
///
/// Only `Converged` means the first-order conditions were met to the
/// requested tolerance. The other variants are returned as data, not
/// errors, so a driver can inspect the run and decide whether to retry
/// with different options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// KKT error below tolerance at the final barrier parameter.
    Converged,
    /// Iteration limit reached; the best point found is still returned.
    MaxIterReached,
    /// Backtracking line search could not make progress.
    LineSearchFailed,
    /// The starting point violates a strict inequality and could not be
    /// shifted inside.
    InfeasibleStart,
}

impl std::fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SolveStatus::Converged => "converged",
            SolveStatus::MaxIterReached => "iteration limit reached",
            SolveStatus::LineSearchFailed => "line search failed",
            SolveStatus::InfeasibleStart => "infeasible starting point",
        };
        f.write_str(s)
    }
}

/// All failure modes of the engine.
///
/// Usage errors (`InitializeCalledTwice`, `SizeMismatch`,
/// `PatternMismatch`, `EqualityConstraintBounds`) indicate a broken
/// calling protocol and have no recovery path. Numerical errors
/// (`NotPositiveDefinite`, the solver failures) are fatal for the
/// evaluation that raised them but the engine remains usable.
#[derive(Error, Debug)]
pub enum MixedError {
    #[error("initialize was called twice on the same engine")]
    InitializeCalledTwice,

    #[error("initialize must be called before {0}")]
    NotInitialized(&'static str),

    #[error("{what}: expected length {expected}, got {got}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error(
        "sparsity pattern supplied by caller does not match the pattern computed at the first call"
    )]
    PatternMismatch,

    #[error("matrix is not positive definite: pivot {pivot:.6e} at column {column}")]
    NotPositiveDefinite { pivot: f64, column: usize },

    #[error("constraint bounds with lower == upper are not supported (row {row})")]
    EqualityConstraintBounds { row: usize },

    #[error("random effects optimization failed: {0}")]
    RandomSolveFailed(SolveStatus),

    #[error("fixed effects optimization failed: {0}")]
    FixedSolveFailed(SolveStatus),

    #[error("quasi-Newton optimization failed: {0}")]
    QuasiNewtonFailed(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("failed to parse options: {0}")]
    OptionsParse(#[from] toml::de::Error),
}
