//! Laplace-approximation marginalization for nonlinear mixed-effects
//! models.
//!
//! A model supplies its negative log densities once, generic over the
//! scalar type; the engine records them onto tapes, extracts sparse
//! second derivatives with cached patterns, folds a sparse LDLᵀ
//! factorization into the recorded Laplace objective, and optimizes
//! the random and fixed effects with a strictly feasible interior-point
//! method (absolute-value density terms are reformulated as epigraph
//! constraints so every subproblem stays smooth).

pub mod bounds;
pub mod engine;
pub mod error;
pub mod extract;
pub mod ipm;
pub mod ldl;
pub mod options;
pub mod pack;
pub mod scalar;
pub mod sparsity;
pub mod tape;

pub use engine::{Accuracy, FixedSolution, InitReport, MixedEngine, MixedModel};
pub use error::{MixedError, SolveStatus};
pub use options::{FixedOptions, IpmOptions, RandomOptions};
pub use scalar::{Dual, Scalar};
pub use tape::{Ad, Recorder, Tape};
