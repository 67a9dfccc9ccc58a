//! Packing of effect vectors into the combined argument order used by
//! every tape: fixed effects first, then random effects; the three-way
//! layout prepends the free copy β used when differentiating the Laplace
//! objective.

use crate::error::MixedError;
use crate::scalar::Scalar;

#[derive(Debug, Clone, Copy)]
pub struct Packer {
    pub n_fixed: usize,
    pub n_random: usize,
}

impl Packer {
    pub fn new(n_fixed: usize, n_random: usize) -> Self {
        Packer { n_fixed, n_random }
    }

    pub fn n_both(&self) -> usize {
        self.n_fixed + self.n_random
    }

    pub fn n_three(&self) -> usize {
        2 * self.n_fixed + self.n_random
    }

    fn check(&self, what: &'static str, expected: usize, got: usize) -> Result<(), MixedError> {
        if expected == got {
            Ok(())
        } else {
            Err(MixedError::SizeMismatch {
                what,
                expected,
                got,
            })
        }
    }

    /// (θ, u) -> combined.
    pub fn pack<T: Scalar>(&self, fixed: &[T], random: &[T]) -> Result<Vec<T>, MixedError> {
        self.check("fixed effects", self.n_fixed, fixed.len())?;
        self.check("random effects", self.n_random, random.len())?;
        let mut both = Vec::with_capacity(self.n_both());
        both.extend_from_slice(fixed);
        both.extend_from_slice(random);
        Ok(both)
    }

    /// combined -> (θ, u).
    pub fn unpack<T: Scalar>(&self, both: &[T]) -> Result<(Vec<T>, Vec<T>), MixedError> {
        self.check("combined vector", self.n_both(), both.len())?;
        let (fixed, random) = both.split_at(self.n_fixed);
        Ok((fixed.to_vec(), random.to_vec()))
    }

    /// (β, θ, u) -> combined.
    pub fn pack3<T: Scalar>(
        &self,
        beta: &[T],
        fixed: &[T],
        random: &[T],
    ) -> Result<Vec<T>, MixedError> {
        self.check("beta", self.n_fixed, beta.len())?;
        self.check("fixed effects", self.n_fixed, fixed.len())?;
        self.check("random effects", self.n_random, random.len())?;
        let mut all = Vec::with_capacity(self.n_three());
        all.extend_from_slice(beta);
        all.extend_from_slice(fixed);
        all.extend_from_slice(random);
        Ok(all)
    }

    /// combined -> (β, θ, u).
    #[allow(clippy::type_complexity)]
    pub fn unpack3<T: Scalar>(&self, all: &[T]) -> Result<(Vec<T>, Vec<T>, Vec<T>), MixedError> {
        self.check("combined three-way vector", self.n_three(), all.len())?;
        let (beta, rest) = all.split_at(self.n_fixed);
        let (fixed, random) = rest.split_at(self.n_fixed);
        Ok((beta.to_vec(), fixed.to_vec(), random.to_vec()))
    }
}
