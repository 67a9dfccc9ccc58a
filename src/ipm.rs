//! Primal log-barrier interior-point solver.
//!
//! Solves
//!
//! ```text
//! min f(x)   s.t.  xl <= x <= xu,   gl <= g(x) <= gu
//! ```
//!
//! by Newton steps on the barrier function over a monotone decreasing
//! barrier-parameter schedule, with fraction-to-boundary step clipping,
//! Armijo backtracking and Levenberg regularization of the Newton
//! system. The problem interface mirrors the callback set of an NLP
//! solver (objective, gradient, constraints, constraint Jacobian,
//! Lagrangian Hessian) so the two optimization levels of the engine can
//! share it.
//!
//! Two-sided constraint rows need a strict interior; rows with
//! `gl == gu` are rejected as a usage error.

use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::Solve;

use crate::error::{MixedError, SolveStatus};
use crate::options::IpmOptions;

/// Bound magnitude treated as "no bound".
pub const INFINITY: f64 = 1e19;

/// Callback interface for one nonlinear program.
pub trait NlpProblem {
    fn n_vars(&self) -> usize;
    fn n_constraints(&self) -> usize;
    /// (xl, xu, gl, gu); use +/-[`INFINITY`] for absent bounds.
    fn bounds(&self) -> (Array1<f64>, Array1<f64>, Array1<f64>, Array1<f64>);
    fn starting_point(&self) -> Array1<f64>;
    fn eval_f(&self, x: &Array1<f64>) -> Result<f64, MixedError>;
    fn eval_grad_f(&self, x: &Array1<f64>) -> Result<Array1<f64>, MixedError>;
    fn eval_g(&self, x: &Array1<f64>) -> Result<Array1<f64>, MixedError>;
    /// Dense Jacobian, one row per constraint.
    fn eval_jac_g(&self, x: &Array1<f64>) -> Result<Array2<f64>, MixedError>;
    /// Dense Hessian of `obj_factor * f + lambda . g`, full symmetric.
    fn eval_h(
        &self,
        x: &Array1<f64>,
        obj_factor: f64,
        lambda: ArrayView1<f64>,
    ) -> Result<Array2<f64>, MixedError>;
    /// Notification that the solver accepted a new iterate.
    fn on_new_point(&self, _x: &Array1<f64>) {}
}

#[derive(Debug)]
pub struct NlpSolution {
    pub x: Array1<f64>,
    pub objective: f64,
    pub status: SolveStatus,
    pub iterations: usize,
}

/// One-sided inequality `sign * (g[row] - bound) >= 0` derived from the
/// caller's two-sided constraint bounds.
struct Ineq {
    row: usize,
    sign: f64,
    bound: f64,
}

struct Barrier {
    ineqs: Vec<Ineq>,
    lower: Vec<(usize, f64)>,
    upper: Vec<(usize, f64)>,
}

impl Barrier {
    fn build(
        xl: &Array1<f64>,
        xu: &Array1<f64>,
        gl: &Array1<f64>,
        gu: &Array1<f64>,
    ) -> Result<Self, MixedError> {
        let mut ineqs = Vec::new();
        for j in 0..gl.len() {
            if gl[j] == gu[j] {
                return Err(MixedError::EqualityConstraintBounds { row: j });
            }
            if gl[j] > -INFINITY {
                ineqs.push(Ineq {
                    row: j,
                    sign: 1.0,
                    bound: gl[j],
                });
            }
            if gu[j] < INFINITY {
                ineqs.push(Ineq {
                    row: j,
                    sign: -1.0,
                    bound: gu[j],
                });
            }
        }
        let lower = xl
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b > -INFINITY)
            .map(|(i, &b)| (i, b))
            .collect();
        let upper = xu
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b < INFINITY)
            .map(|(i, &b)| (i, b))
            .collect();
        Ok(Barrier {
            ineqs,
            lower,
            upper,
        })
    }

    fn is_trivial(&self) -> bool {
        self.ineqs.is_empty() && self.lower.is_empty() && self.upper.is_empty()
    }

    /// Slack of every barrier term at `x`; `None` when any is
    /// non-positive.
    fn slacks(&self, x: &Array1<f64>, g: &Array1<f64>) -> Option<Vec<f64>> {
        let mut s = Vec::with_capacity(self.ineqs.len() + self.lower.len() + self.upper.len());
        for iq in &self.ineqs {
            s.push(iq.sign * (g[iq.row] - iq.bound));
        }
        for &(i, b) in &self.lower {
            s.push(x[i] - b);
        }
        for &(i, b) in &self.upper {
            s.push(b - x[i]);
        }
        if s.iter().all(|&v| v > 0.0) { Some(s) } else { None }
    }
}

fn phi(f: f64, slacks: &[f64], mu: f64) -> f64 {
    f - mu * slacks.iter().map(|s| s.ln()).sum::<f64>()
}

/// Solve the program. A hard failure of a callback or broken constraint
/// bounds is an `Err`; solver quality (convergence, iteration limit,
/// stalled line search) is reported in `NlpSolution::status`.
pub fn solve_barrier<P: NlpProblem>(
    problem: &P,
    opts: &IpmOptions,
) -> Result<NlpSolution, MixedError> {
    opts.validate()?;
    let n = problem.n_vars();
    let m = problem.n_constraints();
    let (xl, xu, gl, gu) = problem.bounds();
    let barrier = Barrier::build(&xl, &xu, &gl, &gu)?;

    let mut x = problem.starting_point();
    // pull the start strictly inside the box
    for i in 0..n {
        let lo = xl[i];
        let hi = xu[i];
        let pad = 1e-8 * (1.0 + lo.abs().min(hi.abs()));
        if x[i] <= lo {
            x[i] = lo + pad.min((hi - lo) * 0.49);
        }
        if x[i] >= hi {
            x[i] = hi - pad.min((hi - lo) * 0.49);
        }
    }

    let g0 = if m > 0 {
        problem.eval_g(&x)?
    } else {
        Array1::zeros(0)
    };
    if barrier.slacks(&x, &g0).is_none() {
        return Ok(NlpSolution {
            objective: problem.eval_f(&x)?,
            x,
            status: SolveStatus::InfeasibleStart,
            iterations: 0,
        });
    }

    let mut mu = if barrier.is_trivial() {
        0.0
    } else {
        opts.mu_initial
    };
    let mut iterations = 0usize;

    loop {
        let stage_tol = mu.max(opts.tolerance);
        // Newton iterations at fixed mu
        loop {
            let f = problem.eval_f(&x)?;
            let g = if m > 0 {
                problem.eval_g(&x)?
            } else {
                Array1::zeros(0)
            };
            let jac = if m > 0 {
                problem.eval_jac_g(&x)?
            } else {
                Array2::zeros((0, n))
            };

            // barrier gradient
            let mut grad = problem.eval_grad_f(&x)?;
            let mut lambda = Array1::<f64>::zeros(m);
            for iq in &barrier.ineqs {
                let a = iq.sign * (g[iq.row] - iq.bound);
                let coef = mu / a * iq.sign;
                lambda[iq.row] -= coef;
                for i in 0..n {
                    grad[i] -= coef * jac[[iq.row, i]];
                }
            }
            for &(i, b) in &barrier.lower {
                grad[i] -= mu / (x[i] - b);
            }
            for &(i, b) in &barrier.upper {
                grad[i] += mu / (b - x[i]);
            }

            let kkt = grad.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
            if opts.trace {
                log::debug!(
                    "ipm: iter {iterations} mu {mu:.3e} f {f:.8e} kkt {kkt:.3e}"
                );
            }
            if kkt <= stage_tol {
                break;
            }
            if iterations >= opts.max_iterations {
                return Ok(NlpSolution {
                    objective: f,
                    x,
                    status: SolveStatus::MaxIterReached,
                    iterations,
                });
            }

            // barrier Hessian
            let mut h = problem.eval_h(&x, 1.0, lambda.view())?;
            for iq in &barrier.ineqs {
                let a = iq.sign * (g[iq.row] - iq.bound);
                let w = mu / (a * a);
                for i in 0..n {
                    let ji = jac[[iq.row, i]];
                    if ji == 0.0 {
                        continue;
                    }
                    for j in 0..n {
                        h[[i, j]] += w * ji * jac[[iq.row, j]];
                    }
                }
            }
            for &(i, b) in &barrier.lower {
                let s = x[i] - b;
                h[[i, i]] += mu / (s * s);
            }
            for &(i, b) in &barrier.upper {
                let s = b - x[i];
                h[[i, i]] += mu / (s * s);
            }

            // Newton direction with Levenberg fallback
            let diag_scale = (0..n).fold(1.0_f64, |acc, i| acc.max(h[[i, i]].abs()));
            let mut reg = 0.0;
            let mut step: Option<Array1<f64>> = None;
            for _ in 0..25 {
                let mut h_reg = h.clone();
                for i in 0..n {
                    h_reg[[i, i]] += reg;
                }
                match h_reg.solve(&(-&grad)) {
                    Ok(d) => {
                        let slope = grad.dot(&d);
                        if slope < 0.0 && d.iter().all(|v| v.is_finite()) {
                            step = Some(d);
                            break;
                        }
                    }
                    Err(_) => {}
                }
                reg = if reg == 0.0 {
                    1e-8 * diag_scale
                } else {
                    reg * 10.0
                };
            }
            let Some(step) = step else {
                log::warn!("ipm: could not produce a descent direction");
                return Ok(NlpSolution {
                    objective: f,
                    x,
                    status: SolveStatus::LineSearchFailed,
                    iterations,
                });
            };
            let slope = grad.dot(&step);

            // fraction-to-boundary on the box
            let mut alpha: f64 = 1.0;
            let tau = opts.fraction_to_boundary;
            for &(i, b) in &barrier.lower {
                if step[i] < 0.0 {
                    alpha = alpha.min(tau * (x[i] - b) / (-step[i]));
                }
            }
            for &(i, b) in &barrier.upper {
                if step[i] > 0.0 {
                    alpha = alpha.min(tau * (b - x[i]) / step[i]);
                }
            }

            // backtrack into the interior of the nonlinear constraints,
            // then Armijo on the barrier function
            let slacks = barrier
                .slacks(&x, &g)
                .expect("iterate left the interior");
            let phi0 = phi(f, &slacks, mu);
            let mut accepted = false;
            for _ in 0..opts.max_line_search {
                let x_trial = &x + &(alpha * &step);
                let g_trial = if m > 0 {
                    problem.eval_g(&x_trial)?
                } else {
                    Array1::zeros(0)
                };
                if let Some(s_trial) = barrier.slacks(&x_trial, &g_trial) {
                    let f_trial = problem.eval_f(&x_trial)?;
                    let phi_trial = phi(f_trial, &s_trial, mu);
                    if phi_trial <= phi0 + opts.armijo_slope * alpha * slope {
                        x = x_trial;
                        accepted = true;
                        break;
                    }
                }
                alpha *= 0.5;
            }
            if !accepted {
                return Ok(NlpSolution {
                    objective: f,
                    x,
                    status: SolveStatus::LineSearchFailed,
                    iterations,
                });
            }
            problem.on_new_point(&x);
            iterations += 1;
        }

        if mu <= opts.tolerance {
            let objective = problem.eval_f(&x)?;
            return Ok(NlpSolution {
                x,
                objective,
                status: SolveStatus::Converged,
                iterations,
            });
        }
        mu = (mu * opts.mu_shrink).max(opts.tolerance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Quadratic {
        with_bound: bool,
    }

    impl NlpProblem for Quadratic {
        fn n_vars(&self) -> usize {
            1
        }
        fn n_constraints(&self) -> usize {
            0
        }
        fn bounds(&self) -> (Array1<f64>, Array1<f64>, Array1<f64>, Array1<f64>) {
            let hi = if self.with_bound { 1.0 } else { INFINITY };
            (
                Array1::from(vec![-INFINITY]),
                Array1::from(vec![hi]),
                Array1::zeros(0),
                Array1::zeros(0),
            )
        }
        fn starting_point(&self) -> Array1<f64> {
            Array1::from(vec![0.0])
        }
        fn eval_f(&self, x: &Array1<f64>) -> Result<f64, MixedError> {
            Ok((x[0] - 3.0).powi(2))
        }
        fn eval_grad_f(&self, x: &Array1<f64>) -> Result<Array1<f64>, MixedError> {
            Ok(Array1::from(vec![2.0 * (x[0] - 3.0)]))
        }
        fn eval_g(&self, _x: &Array1<f64>) -> Result<Array1<f64>, MixedError> {
            Ok(Array1::zeros(0))
        }
        fn eval_jac_g(&self, _x: &Array1<f64>) -> Result<Array2<f64>, MixedError> {
            Ok(Array2::zeros((0, 1)))
        }
        fn eval_h(
            &self,
            _x: &Array1<f64>,
            obj_factor: f64,
            _lambda: ArrayView1<f64>,
        ) -> Result<Array2<f64>, MixedError> {
            Ok(Array2::from_elem((1, 1), 2.0 * obj_factor))
        }
    }

    #[test]
    fn unconstrained_quadratic_hits_minimum() {
        let sol = solve_barrier(&Quadratic { with_bound: false }, &IpmOptions::default()).unwrap();
        assert_eq!(sol.status, SolveStatus::Converged);
        assert_relative_eq!(sol.x[0], 3.0, epsilon = 1e-8);
    }

    #[test]
    fn upper_bound_becomes_active() {
        let sol = solve_barrier(&Quadratic { with_bound: true }, &IpmOptions::default()).unwrap();
        assert_eq!(sol.status, SolveStatus::Converged);
        assert_relative_eq!(sol.x[0], 1.0, epsilon = 1e-6);
        assert!(sol.x[0] < 1.0, "iterate stays strictly feasible");
    }

    struct HalfSpace;

    impl NlpProblem for HalfSpace {
        fn n_vars(&self) -> usize {
            2
        }
        fn n_constraints(&self) -> usize {
            1
        }
        fn bounds(&self) -> (Array1<f64>, Array1<f64>, Array1<f64>, Array1<f64>) {
            (
                Array1::from(vec![-INFINITY; 2]),
                Array1::from(vec![INFINITY; 2]),
                Array1::from(vec![1.0]),
                Array1::from(vec![INFINITY]),
            )
        }
        fn starting_point(&self) -> Array1<f64> {
            Array1::from(vec![2.0, 2.0])
        }
        fn eval_f(&self, x: &Array1<f64>) -> Result<f64, MixedError> {
            Ok(x[0] * x[0] + x[1] * x[1])
        }
        fn eval_grad_f(&self, x: &Array1<f64>) -> Result<Array1<f64>, MixedError> {
            Ok(2.0 * x)
        }
        fn eval_g(&self, x: &Array1<f64>) -> Result<Array1<f64>, MixedError> {
            Ok(Array1::from(vec![x[0] + x[1]]))
        }
        fn eval_jac_g(&self, _x: &Array1<f64>) -> Result<Array2<f64>, MixedError> {
            Ok(Array2::from_shape_vec((1, 2), vec![1.0, 1.0]).unwrap())
        }
        fn eval_h(
            &self,
            _x: &Array1<f64>,
            obj_factor: f64,
            _lambda: ArrayView1<f64>,
        ) -> Result<Array2<f64>, MixedError> {
            Ok(Array2::eye(2) * (2.0 * obj_factor))
        }
    }

    #[test]
    fn inequality_constrained_minimum_is_projected() {
        let sol = solve_barrier(&HalfSpace, &IpmOptions::default()).unwrap();
        assert_eq!(sol.status, SolveStatus::Converged);
        assert_relative_eq!(sol.x[0], 0.5, epsilon = 1e-6);
        assert_relative_eq!(sol.x[1], 0.5, epsilon = 1e-6);
    }

    struct DegenerateBounds;

    impl NlpProblem for DegenerateBounds {
        fn n_vars(&self) -> usize {
            1
        }
        fn n_constraints(&self) -> usize {
            1
        }
        fn bounds(&self) -> (Array1<f64>, Array1<f64>, Array1<f64>, Array1<f64>) {
            (
                Array1::from(vec![-INFINITY]),
                Array1::from(vec![INFINITY]),
                Array1::from(vec![2.0]),
                Array1::from(vec![2.0]),
            )
        }
        fn starting_point(&self) -> Array1<f64> {
            Array1::zeros(1)
        }
        fn eval_f(&self, _x: &Array1<f64>) -> Result<f64, MixedError> {
            Ok(0.0)
        }
        fn eval_grad_f(&self, _x: &Array1<f64>) -> Result<Array1<f64>, MixedError> {
            Ok(Array1::zeros(1))
        }
        fn eval_g(&self, x: &Array1<f64>) -> Result<Array1<f64>, MixedError> {
            Ok(x.clone())
        }
        fn eval_jac_g(&self, _x: &Array1<f64>) -> Result<Array2<f64>, MixedError> {
            Ok(Array2::from_elem((1, 1), 1.0))
        }
        fn eval_h(
            &self,
            _x: &Array1<f64>,
            _obj_factor: f64,
            _lambda: ArrayView1<f64>,
        ) -> Result<Array2<f64>, MixedError> {
            Ok(Array2::zeros((1, 1)))
        }
    }

    #[test]
    fn equality_rows_are_rejected() {
        let err = solve_barrier(&DegenerateBounds, &IpmOptions::default()).unwrap_err();
        assert!(matches!(err, MixedError::EqualityConstraintBounds { row: 0 }));
    }
}
