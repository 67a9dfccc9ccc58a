//! Scalar capability trait shared by every numeric kernel in the crate.
//!
//! All derivative machinery (tape replay, reverse sweeps, the sparse
//! LDLᵀ factorization, the Laplace kernel) is written once, generic over
//! [`Scalar`], and instantiated three ways:
//!
//! - `f64` for plain evaluation,
//! - [`crate::tape::Ad`] to record a computation onto a tape,
//! - [`Dual<T>`] to carry a directional derivative through either of the
//!   above (forward-over-reverse for Hessians).

use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};

pub trait Scalar:
    Copy
    + Clone
    + Debug
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
{
    fn from_f64(c: f64) -> Self;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }

    /// Nominal (point) value. For recording scalars this is the value at
    /// the recording point; control flow in generic kernels (pivot
    /// checks, sign tests) is resolved against it.
    fn value(&self) -> f64;

    /// True when the scalar is identically zero, derivative information
    /// included. Used to prune reverse sweeps.
    fn is_zero(&self) -> bool;

    fn ln(self) -> Self;
    fn exp(self) -> Self;
    fn sqrt(self) -> Self;
    fn abs(self) -> Self;

    /// Sign function with `sign(0) = 0`. Its derivative is zero almost
    /// everywhere, which is how |x| terms stay once-differentiable on a
    /// recorded tape.
    fn sign(self) -> Self;
}

impl Scalar for f64 {
    #[inline]
    fn from_f64(c: f64) -> Self {
        c
    }

    #[inline]
    fn value(&self) -> f64 {
        *self
    }

    #[inline]
    fn is_zero(&self) -> bool {
        *self == 0.0
    }

    #[inline]
    fn ln(self) -> Self {
        f64::ln(self)
    }

    #[inline]
    fn exp(self) -> Self {
        f64::exp(self)
    }

    #[inline]
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    #[inline]
    fn abs(self) -> Self {
        f64::abs(self)
    }

    #[inline]
    fn sign(self) -> Self {
        if self == 0.0 { 0.0 } else { self.signum() }
    }
}

/// Forward-mode dual number: value plus one directional derivative.
#[derive(Debug, Clone, Copy)]
pub struct Dual<T> {
    pub re: T,
    pub eps: T,
}

impl<T: Scalar> Dual<T> {
    #[inline]
    pub fn new(re: T, eps: T) -> Self {
        Dual { re, eps }
    }

    /// Lift a value with zero tangent.
    #[inline]
    pub fn constant(re: T) -> Self {
        Dual {
            re,
            eps: T::zero(),
        }
    }
}

impl<T: Scalar> Add for Dual<T> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Dual::new(self.re + rhs.re, self.eps + rhs.eps)
    }
}

impl<T: Scalar> Sub for Dual<T> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Dual::new(self.re - rhs.re, self.eps - rhs.eps)
    }
}

impl<T: Scalar> Mul for Dual<T> {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        Dual::new(
            self.re * rhs.re,
            self.re * rhs.eps + self.eps * rhs.re,
        )
    }
}

impl<T: Scalar> Div for Dual<T> {
    type Output = Self;
    #[inline]
    fn div(self, rhs: Self) -> Self {
        let re = self.re / rhs.re;
        Dual::new(re, (self.eps - re * rhs.eps) / rhs.re)
    }
}

impl<T: Scalar> Neg for Dual<T> {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        Dual::new(-self.re, -self.eps)
    }
}

impl<T: Scalar> AddAssign for Dual<T> {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<T: Scalar> SubAssign for Dual<T> {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl<T: Scalar> MulAssign for Dual<T> {
    #[inline]
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}

impl<T: Scalar> Scalar for Dual<T> {
    #[inline]
    fn from_f64(c: f64) -> Self {
        Dual::constant(T::from_f64(c))
    }

    #[inline]
    fn value(&self) -> f64 {
        self.re.value()
    }

    #[inline]
    fn is_zero(&self) -> bool {
        self.re.is_zero() && self.eps.is_zero()
    }

    #[inline]
    fn ln(self) -> Self {
        Dual::new(self.re.ln(), self.eps / self.re)
    }

    #[inline]
    fn exp(self) -> Self {
        let e = self.re.exp();
        Dual::new(e, self.eps * e)
    }

    #[inline]
    fn sqrt(self) -> Self {
        let s = self.re.sqrt();
        Dual::new(s, self.eps / (s + s))
    }

    #[inline]
    fn abs(self) -> Self {
        let s = self.re.sign();
        Dual::new(self.re.abs(), self.eps * s)
    }

    #[inline]
    fn sign(self) -> Self {
        Dual::new(self.re.sign(), T::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn d(re: f64, eps: f64) -> Dual<f64> {
        Dual::new(re, eps)
    }

    #[test]
    fn dual_product_rule() {
        // f(x) = x^2 * ln(x) at x = 2
        let x = d(2.0, 1.0);
        let f = x * x * x.ln();
        assert_relative_eq!(f.re, 4.0 * 2.0f64.ln(), max_relative = 1e-14);
        // f' = 2x ln x + x
        assert_relative_eq!(f.eps, 4.0 * 2.0f64.ln() + 2.0, max_relative = 1e-14);
    }

    #[test]
    fn dual_quotient_and_exp() {
        // f(x) = exp(x) / x at x = 1.5
        let x = d(1.5, 1.0);
        let f = x.exp() / x;
        let e = 1.5f64.exp();
        assert_relative_eq!(f.re, e / 1.5, max_relative = 1e-14);
        assert_relative_eq!(f.eps, e / 1.5 - e / (1.5 * 1.5), max_relative = 1e-14);
    }

    #[test]
    fn dual_abs_tracks_sign() {
        let x = d(-3.0, 1.0);
        let f = x.abs();
        assert_relative_eq!(f.re, 3.0);
        assert_relative_eq!(f.eps, -1.0);
        assert_relative_eq!(x.sign().re, -1.0);
        assert_relative_eq!(x.sign().eps, 0.0);
    }

    #[test]
    fn nested_dual_second_derivative() {
        // d²/dx² [x³] = 6x at x = 2 via Dual<Dual<f64>>
        let x: Dual<Dual<f64>> = Dual::new(d(2.0, 1.0), d(1.0, 0.0));
        let f = x * x * x;
        assert_relative_eq!(f.eps.eps, 12.0, max_relative = 1e-14);
    }
}
