//! Solver configuration.
//!
//! All knobs live in plain structs with serde support so a driver can
//! keep them in a TOML file next to its model definition. Every field
//! has a default; a partial file only overrides what it names.

use serde::Deserialize;

use crate::error::MixedError;

/// Interior-point solver knobs, shared by the inner (random effects)
/// and outer (fixed effects) problems.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpmOptions {
    /// First-order (KKT) tolerance at the final barrier parameter.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Initial barrier parameter μ.
    pub mu_initial: f64,
    /// Multiplicative μ reduction per barrier stage.
    pub mu_shrink: f64,
    /// Fraction-to-boundary coefficient keeping iterates strictly
    /// feasible.
    pub fraction_to_boundary: f64,
    /// Armijo sufficient-decrease slope.
    pub armijo_slope: f64,
    pub max_line_search: usize,
    /// Per-iteration detail through `log::debug!` when true.
    pub trace: bool,
}

impl Default for IpmOptions {
    fn default() -> Self {
        IpmOptions {
            tolerance: 1e-9,
            max_iterations: 200,
            mu_initial: 1e-1,
            mu_shrink: 0.2,
            fraction_to_boundary: 0.995,
            armijo_slope: 1e-4,
            max_line_search: 40,
            trace: false,
        }
    }
}

impl IpmOptions {
    pub fn validate(&self) -> Result<(), MixedError> {
        if !(self.tolerance > 0.0) {
            return Err(MixedError::InvalidOptions(
                "tolerance must be positive".into(),
            ));
        }
        if !(0.0 < self.mu_shrink && self.mu_shrink < 1.0) {
            return Err(MixedError::InvalidOptions(
                "mu_shrink must lie in (0, 1)".into(),
            ));
        }
        if !(0.0 < self.fraction_to_boundary && self.fraction_to_boundary < 1.0) {
            return Err(MixedError::InvalidOptions(
                "fraction_to_boundary must lie in (0, 1)".into(),
            ));
        }
        Ok(())
    }
}

/// Options for the inner optimization over the random effects.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RandomOptions {
    pub ipm: IpmOptions,
}

impl RandomOptions {
    pub fn from_toml_str(s: &str) -> Result<Self, MixedError> {
        let opts: RandomOptions = toml::from_str(s)?;
        opts.ipm.validate()?;
        Ok(opts)
    }
}

/// Options for the outer optimization over the fixed effects.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FixedOptions {
    pub ipm: IpmOptions,
    /// Use the quasi-Newton backend instead of the interior-point path.
    /// Only valid when the problem has no constraints, no non-smooth
    /// prior terms and no finite bounds.
    pub quasi_fixed: bool,
    pub bfgs_tolerance: f64,
    pub bfgs_max_iterations: usize,
}

impl Default for FixedOptions {
    fn default() -> Self {
        FixedOptions {
            ipm: IpmOptions::default(),
            quasi_fixed: false,
            bfgs_tolerance: 1e-7,
            bfgs_max_iterations: 100,
        }
    }
}

impl FixedOptions {
    pub fn from_toml_str(s: &str) -> Result<Self, MixedError> {
        let opts: FixedOptions = toml::from_str(s)?;
        opts.ipm.validate()?;
        Ok(opts)
    }
}
