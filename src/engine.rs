//! The marginalization engine.
//!
//! A [`MixedEngine`] owns every derivative artifact for one model: the
//! joint-density tape, its gradient and sparse-Hessian tapes over the
//! random effects, the recorded Laplace objectives at three accuracy
//! levels, the prior and constraint tapes, and the sparse LDLᵀ
//! workspace. All of it is created exactly once by
//! [`MixedEngine::initialize`] and then only read (the LDLᵀ numeric
//! buffers are refactorized in place under a `RefCell`, single writer,
//! never borrowed across a public call boundary).
//!
//! The marginal negative log likelihood of the fixed effects is
//!
//! ```text
//! G(θ) = 0.5 logdet f_uu(θ, û) + f(θ, û) − 0.5 n_random ln 2π
//! ```
//!
//! recorded over the three-way argument (β, θ, u) where β is a free
//! copy of θ: differentiating the recording with respect to β at
//! β = θ, u = û gives the exact total derivative of G without
//! differentiating the inner optimization itself.

use std::cell::RefCell;

use itertools::izip;
use ndarray::{Array1, Array2, ArrayView1};
use wolfe_bfgs::Bfgs;

use crate::bounds::BoundCompaction;
use crate::error::{MixedError, SolveStatus};
use crate::extract::{HessianExtractor, JacobianExtractor, check_or_fill_pattern};
use crate::ipm::{self, INFINITY, NlpProblem};
use crate::ldl::{LdlFactor, LdlSymbolic};
use crate::options::{FixedOptions, RandomOptions};
use crate::pack::Packer;
use crate::scalar::Scalar;
use crate::tape::{Recorder, Tape};

const LN_2PI: f64 = 1.837877066409345483560659472811;

/// A mixed-effects model: negative log densities, written once, generic
/// over the scalar type so the engine can both evaluate and record them.
///
/// Each density is a vector `v` whose total is `v[0] + Σ |v[i]|`,
/// `i >= 1`; the number and order of the absolute-value terms must not
/// depend on the argument values.
pub trait MixedModel {
    /// Negative log of the joint density of data and random effects,
    /// p(y, u | θ). Must be non-empty whenever the model has random
    /// effects.
    fn joint_density<S: Scalar>(&self, fixed: &[S], random: &[S]) -> Vec<S>;

    /// Negative log of the fixed-effects prior p(θ). Empty means no
    /// prior terms.
    fn prior_density<S: Scalar>(&self, fixed: &[S]) -> Vec<S> {
        let _ = fixed;
        Vec::new()
    }

    /// General constraint function c(θ) bounded in
    /// [`MixedEngine::optimize_fixed`]. Empty means unconstrained.
    fn constraint<S: Scalar>(&self, fixed: &[S]) -> Vec<S> {
        let _ = fixed;
        Vec::new()
    }

    /// Sink for model-structure violations. Diverges.
    fn fatal_error(&self, msg: &str) -> ! {
        log::error!("fatal model error: {msg}");
        panic!("fatal model error: {msg}");
    }

    /// Sink for recoverable conditions (non-convergence and the like).
    fn warning(&self, msg: &str) {
        log::warn!("{msg}");
    }
}

/// Accuracy level of the Laplace approximation: the number of Newton
/// corrections of the random effects folded into the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accuracy {
    Value,
    FirstOrder,
    SecondOrder,
}

impl Accuracy {
    fn corrections(self) -> usize {
        match self {
            Accuracy::Value => 0,
            Accuracy::FirstOrder => 1,
            Accuracy::SecondOrder => 2,
        }
    }
}

/// Tape and pattern sizes produced by [`MixedEngine::initialize`].
#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub n_ran_abs: usize,
    pub n_fix_abs: usize,
    pub n_constraint: usize,
    pub ran_like_nodes: usize,
    pub grad_ran_nodes: usize,
    pub hes_ran_nnz: usize,
    /// Colors of the f_uu pattern: tangent sweeps per Hessian evaluation.
    pub hes_ran_colors: u32,
    pub hes_cross_nnz: usize,
    pub laplace_nodes: [usize; 3],
    pub fix_like_nodes: usize,
}

/// Result of the outer optimization.
#[derive(Debug, Clone)]
pub struct FixedSolution {
    pub fixed: Array1<f64>,
    pub random: Array1<f64>,
    pub objective: f64,
    pub status: SolveStatus,
}

/// Derivative artifacts over the random effects; absent when the model
/// has none.
struct RanCache {
    /// v(θ, u) over the combined argument.
    ran_like: Tape,
    n_ran_abs: usize,
    /// ∇_u of the total, over the combined argument.
    grad_ran: Tape,
    /// Lower triangle of f_uu as a recorded tape plus its extractor
    /// (pattern, coloring) over `ran_like`.
    hes_ran_ex: HessianExtractor,
    hes_ran: Tape,
    /// f_uθ cross block.
    hes_cross_ex: HessianExtractor,
    hes_cross: Tape,
    /// Laplace objective over (β, θ, u) per accuracy level.
    laplace: [Tape; 3],
    /// H_ββ of the second-order Laplace recording.
    hes_fix_ex: HessianExtractor,
    ldl_sym: LdlSymbolic,
    ldl: RefCell<LdlFactor<f64>>,
}

/// Prior and constraint artifacts over the fixed effects.
struct FixCache {
    fix_like: Option<Tape>,
    n_fix_abs: usize,
    fix_jac: Option<JacobianExtractor>,
    fix_hes: Option<HessianExtractor>,
    constraint: Option<Tape>,
    con_jac: Option<JacobianExtractor>,
    con_hes: Option<HessianExtractor>,
}

struct Initialized {
    ran: Option<RanCache>,
    fix: FixCache,
    report: InitReport,
}

pub struct MixedEngine<M: MixedModel> {
    packer: Packer,
    model: M,
    init: Option<Initialized>,
}

/// Weights turning the density vector into the gradient seed of its
/// total: 1 for the smooth part, sign(vᵢ) for each |vᵢ| term.
fn total_weights<T: Scalar>(v: &[T]) -> Vec<T> {
    let mut w = Vec::with_capacity(v.len());
    w.push(T::one());
    for vi in &v[1..] {
        w.push(vi.sign());
    }
    w
}

fn total_value<T: Scalar>(v: &[T]) -> T {
    let mut t = v[0];
    for vi in &v[1..] {
        t += vi.abs();
    }
    t
}

impl<M: MixedModel> MixedEngine<M> {
    pub fn new(n_fixed: usize, n_random: usize, model: M) -> Self {
        MixedEngine {
            packer: Packer::new(n_fixed, n_random),
            model,
            init: None,
        }
    }

    pub fn n_fixed(&self) -> usize {
        self.packer.n_fixed
    }

    pub fn n_random(&self) -> usize {
        self.packer.n_random
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Sizes recorded by [`MixedEngine::initialize`], if it has run.
    pub fn init_report(&self) -> Option<&InitReport> {
        self.init.as_ref().map(|i| &i.report)
    }

    fn initialized(&self, op: &'static str) -> Result<&Initialized, MixedError> {
        self.init.as_ref().ok_or(MixedError::NotInitialized(op))
    }

    /// One-time construction of every tape, pattern and work cache, at
    /// the recording point (θ₀, u₀). A second call is a usage error and
    /// leaves the existing artifacts untouched.
    pub fn initialize(&mut self, fixed: &[f64], random: &[f64]) -> Result<InitReport, MixedError> {
        if self.init.is_some() {
            return Err(MixedError::InitializeCalledTwice);
        }
        let packer = self.packer;
        let both0 = packer.pack(fixed, random)?;

        let mut report = InitReport::default();
        let ran = if packer.n_random > 0 {
            Some(self.record_ran_cache(&both0, fixed, random, &mut report)?)
        } else {
            None
        };
        let fix = self.record_fix_cache(fixed, &mut report);

        log::info!(
            "mixed engine initialized: n_fixed {} n_random {} ran_abs {} fix_abs {} \
             constraints {} hes_ran nnz {} colors {} hes_cross nnz {}",
            packer.n_fixed,
            packer.n_random,
            report.n_ran_abs,
            report.n_fix_abs,
            report.n_constraint,
            report.hes_ran_nnz,
            report.hes_ran_colors,
            report.hes_cross_nnz,
        );
        self.init = Some(Initialized {
            ran,
            fix,
            report: report.clone(),
        });
        Ok(report)
    }

    fn record_ran_cache(
        &self,
        both0: &[f64],
        fixed0: &[f64],
        random0: &[f64],
        report: &mut InitReport,
    ) -> Result<RanCache, MixedError> {
        let packer = self.packer;
        let n_fixed = packer.n_fixed;
        let n_both = packer.n_both();

        // order 0: the density itself
        let mut ran_like = {
            let rec = Recorder::new();
            let x = rec.inputs(both0);
            let v = self
                .model
                .joint_density(&x[..n_fixed], &x[n_fixed..]);
            if v.is_empty() {
                self.model
                    .fatal_error("joint_density returned an empty vector but n_random > 0");
            }
            rec.finish(&v)
        };
        ran_like.optimize();
        let n_ran_abs = ran_like.n_outputs() - 1;

        // order 1: gradient of the total with respect to u, recorded by
        // replaying order 0 and taping its reverse sweep
        let mut grad_ran = {
            let rec = Recorder::new();
            let x = rec.inputs(both0);
            let nodes = ran_like.forward_nodes(&x);
            let v: Vec<_> = ran_like
                .output_nodes()
                .iter()
                .map(|&o| nodes[o as usize])
                .collect();
            let adj = ran_like.reverse(&nodes, &total_weights(&v));
            rec.finish(&adj[n_fixed..])
        };
        grad_ran.optimize();

        // order 2: sparse lower triangle of f_uu, and the f_uθ cross
        // block, recorded from colored tangent-over-reverse sweeps
        let hes_ran_ex = HessianExtractor::new_symmetric(&ran_like, n_fixed..n_both);
        let mut hes_ran = {
            let rec = Recorder::new();
            let x = rec.inputs(both0);
            let v = ran_like.forward(&x);
            let vals = hes_ran_ex.eval(&ran_like, &x, &total_weights(&v));
            rec.finish(&vals)
        };
        hes_ran.optimize();

        let hes_cross_ex = HessianExtractor::new_rect(&ran_like, n_fixed..n_both, 0..n_fixed);
        let mut hes_cross = {
            let rec = Recorder::new();
            let x = rec.inputs(both0);
            let v = ran_like.forward(&x);
            let vals = hes_cross_ex.eval(&ran_like, &x, &total_weights(&v));
            rec.finish(&vals)
        };
        hes_cross.optimize();

        let ldl_sym = LdlSymbolic::new(packer.n_random, hes_ran_ex.rows(), hes_ran_ex.cols());

        // order 3: the Laplace objective per accuracy level, recorded by
        // running the generic kernel over recording scalars
        let three0 = packer.pack3(fixed0, fixed0, random0)?;
        let mut laplace: Vec<Tape> = Vec::with_capacity(3);
        for level in [Accuracy::Value, Accuracy::FirstOrder, Accuracy::SecondOrder] {
            let rec = Recorder::new();
            let x = rec.inputs(&three0);
            let (beta, theta, u) = {
                let (b, rest) = x.split_at(n_fixed);
                let (t, u) = rest.split_at(n_fixed);
                (b, t, u)
            };
            let mut factor = LdlFactor::new(&ldl_sym);
            let g = laplace_kernel(
                packer, &ran_like, &grad_ran, &hes_ran, &ldl_sym, &mut factor, level, beta,
                theta, u,
            )?;
            let mut t = rec.finish(&[g]);
            t.optimize();
            laplace.push(t);
        }
        let laplace: [Tape; 3] = laplace.try_into().expect("three accuracy levels");

        let hes_fix_ex = HessianExtractor::new_symmetric(&laplace[2], 0..n_fixed);

        report.n_ran_abs = n_ran_abs;
        report.ran_like_nodes = ran_like.n_nodes();
        report.grad_ran_nodes = grad_ran.n_nodes();
        report.hes_ran_nnz = hes_ran_ex.nnz();
        report.hes_ran_colors = hes_ran_ex.n_colors();
        report.hes_cross_nnz = hes_cross_ex.nnz();
        report.laplace_nodes = [
            laplace[0].n_nodes(),
            laplace[1].n_nodes(),
            laplace[2].n_nodes(),
        ];

        let ldl = RefCell::new(LdlFactor::new(&ldl_sym));
        Ok(RanCache {
            ran_like,
            n_ran_abs,
            grad_ran,
            hes_ran_ex,
            hes_ran,
            hes_cross_ex,
            hes_cross,
            laplace,
            hes_fix_ex,
            ldl_sym,
            ldl,
        })
    }

    fn record_fix_cache(&self, fixed0: &[f64], report: &mut InitReport) -> FixCache {
        let n_fixed = self.packer.n_fixed;

        let probe: Vec<f64> = fixed0.to_vec();
        let fix_like = {
            let rec = Recorder::new();
            let x = rec.inputs(&probe);
            let v = self.model.prior_density(&x);
            if v.is_empty() {
                None
            } else {
                let mut t = rec.finish(&v);
                t.optimize();
                Some(t)
            }
        };
        let n_fix_abs = fix_like.as_ref().map_or(0, |t| t.n_outputs() - 1);
        let fix_jac = fix_like.as_ref().map(JacobianExtractor::new);
        let fix_hes = fix_like
            .as_ref()
            .map(|t| HessianExtractor::new_symmetric(t, 0..n_fixed));

        let constraint = {
            let rec = Recorder::new();
            let x = rec.inputs(&probe);
            let c = self.model.constraint(&x);
            if c.is_empty() {
                None
            } else {
                let mut t = rec.finish(&c);
                t.optimize();
                Some(t)
            }
        };
        let con_jac = constraint.as_ref().map(JacobianExtractor::new);
        let con_hes = constraint
            .as_ref()
            .map(|t| HessianExtractor::new_symmetric(t, 0..n_fixed));

        report.n_fix_abs = n_fix_abs;
        report.n_constraint = constraint.as_ref().map_or(0, Tape::n_outputs);
        report.fix_like_nodes = fix_like.as_ref().map_or(0, Tape::n_nodes);

        FixCache {
            fix_like,
            n_fix_abs,
            fix_jac,
            fix_hes,
            constraint,
            con_jac,
            con_hes,
        }
    }

    // ----------------------------------------------------------------
    // Laplace approximation
    // ----------------------------------------------------------------

    /// Evaluate the Laplace objective G at the given accuracy, with
    /// β = θ. Zero when the model has no random effects.
    pub fn laplace_approx(
        &self,
        accuracy: Accuracy,
        fixed: &[f64],
        random: &[f64],
    ) -> Result<f64, MixedError> {
        let init = self.initialized("laplace_approx")?;
        let Some(ran) = init.ran.as_ref() else {
            return Ok(0.0);
        };
        let mut factor = ran.ldl.borrow_mut();
        laplace_kernel(
            self.packer,
            &ran.ran_like,
            &ran.grad_ran,
            &ran.hes_ran,
            &ran.ldl_sym,
            &mut *factor,
            accuracy,
            fixed,
            fixed,
            random,
        )
    }

    /// Second-order Laplace objective; the callable the outer
    /// optimization minimizes (plus prior and constraints).
    pub fn ranobj_eval(&self, fixed: &[f64], random: &[f64]) -> Result<f64, MixedError> {
        self.laplace_approx(Accuracy::SecondOrder, fixed, random)
    }

    /// Gradient of the second-order Laplace objective with respect to
    /// the free copy β, evaluated at β = θ. At u = û(θ) this is the
    /// exact total derivative dG/dθ.
    pub fn ranobj_beta(&self, fixed: &[f64], random: &[f64]) -> Result<Array1<f64>, MixedError> {
        let init = self.initialized("ranobj_beta")?;
        let Some(ran) = init.ran.as_ref() else {
            return Ok(Array1::zeros(self.packer.n_fixed));
        };
        let x = self.packer.pack3(fixed, fixed, random)?;
        let grad = ran.laplace[2].gradient(&x, &[1.0]);
        Ok(Array1::from_iter(grad[..self.packer.n_fixed].iter().copied()))
    }

    // ----------------------------------------------------------------
    // Sparse Hessian operations
    // ----------------------------------------------------------------

    /// Lower triangle of f_uu(θ, u), row/col in random-effects indices.
    /// Empty row/col on input receive the pattern; otherwise they must
    /// match it.
    pub fn hessian_random(
        &self,
        fixed: &[f64],
        random: &[f64],
        rows: &mut Vec<usize>,
        cols: &mut Vec<usize>,
    ) -> Result<Vec<f64>, MixedError> {
        let init = self.initialized("hessian_random")?;
        let Some(ran) = init.ran.as_ref() else {
            return Ok(Vec::new());
        };
        check_or_fill_pattern(rows, cols, ran.hes_ran_ex.rows(), ran.hes_ran_ex.cols())?;
        let x = self.packer.pack(fixed, random)?;
        Ok(ran.hes_ran.forward(&x))
    }

    /// Cross second derivative f_uθ: rows in random-effects indices,
    /// cols in fixed-effects indices.
    pub fn hessian_cross(
        &self,
        fixed: &[f64],
        random: &[f64],
        rows: &mut Vec<usize>,
        cols: &mut Vec<usize>,
    ) -> Result<Vec<f64>, MixedError> {
        let init = self.initialized("hessian_cross")?;
        let Some(ran) = init.ran.as_ref() else {
            return Ok(Vec::new());
        };
        check_or_fill_pattern(rows, cols, ran.hes_cross_ex.rows(), ran.hes_cross_ex.cols())?;
        let x = self.packer.pack(fixed, random)?;
        Ok(ran.hes_cross.forward(&x))
    }

    /// Lower triangle of the β-Hessian of the second-order Laplace
    /// objective at β = θ, row/col in fixed-effects indices.
    pub fn hessian_fixed(
        &self,
        fixed: &[f64],
        random: &[f64],
        rows: &mut Vec<usize>,
        cols: &mut Vec<usize>,
    ) -> Result<Vec<f64>, MixedError> {
        let init = self.initialized("hessian_fixed")?;
        let Some(ran) = init.ran.as_ref() else {
            return Ok(Vec::new());
        };
        check_or_fill_pattern(rows, cols, ran.hes_fix_ex.rows(), ran.hes_fix_ex.cols())?;
        let x = self.packer.pack3(fixed, fixed, random)?;
        Ok(ran.hes_fix_ex.eval(&ran.laplace[2], &x, &[1.0]))
    }

    /// Sparse Jacobian of the prior density vector: rows index the
    /// density components (0 = smooth part), cols the fixed effects.
    pub fn prior_jacobian(
        &self,
        fixed: &[f64],
        rows: &mut Vec<usize>,
        cols: &mut Vec<usize>,
    ) -> Result<Vec<f64>, MixedError> {
        let init = self.initialized("prior_jacobian")?;
        let (Some(tape), Some(ex)) = (init.fix.fix_like.as_ref(), init.fix.fix_jac.as_ref())
        else {
            return Ok(Vec::new());
        };
        check_or_fill_pattern(rows, cols, ex.rows(), ex.cols())?;
        if fixed.len() != self.packer.n_fixed {
            return Err(MixedError::SizeMismatch {
                what: "fixed effects",
                expected: self.packer.n_fixed,
                got: fixed.len(),
            });
        }
        let x: Vec<f64> = fixed.to_vec();
        Ok(ex.eval(tape, &x))
    }

    // ----------------------------------------------------------------
    // Inner optimization
    // ----------------------------------------------------------------

    /// Maximize the joint density over the random effects at fixed θ.
    /// |v| terms are reformulated as epigraph constraints so the solver
    /// only ever sees a smooth problem.
    pub fn optimize_random(
        &self,
        options: &RandomOptions,
        fixed: &[f64],
        random_start: &[f64],
    ) -> Result<Array1<f64>, MixedError> {
        let init = self.initialized("optimize_random")?;
        let Some(ran) = init.ran.as_ref() else {
            return Ok(Array1::zeros(0));
        };
        let n_random = self.packer.n_random;
        let both = self.packer.pack(fixed, random_start)?;
        let v0 = ran.ran_like.forward(&both);

        let problem = RandomProblem {
            ran,
            packer: self.packer,
            fixed: fixed.to_vec(),
            random_start: random_start.to_vec(),
            abs_start: v0[1..].iter().map(|v| seed_slack(v.abs())).collect(),
        };
        let sol = ipm::solve_barrier(&problem, &options.ipm)?;
        match sol.status {
            SolveStatus::Converged => {}
            SolveStatus::MaxIterReached => {
                self.model
                    .warning("optimize_random: iteration limit reached before convergence");
            }
            status => return Err(MixedError::RandomSolveFailed(status)),
        }
        Ok(sol.x.slice(ndarray::s![..n_random]).to_owned())
    }

    // ----------------------------------------------------------------
    // Outer optimization
    // ----------------------------------------------------------------

    /// Minimize prior + marginal Laplace objective over θ, subject to
    /// box bounds on θ and bounds on the model constraint function.
    /// Components with equal lower and upper bound are removed from the
    /// solver's view and restored in the result.
    #[allow(clippy::too_many_arguments)]
    pub fn optimize_fixed(
        &self,
        fixed_options: &FixedOptions,
        random_options: &RandomOptions,
        fixed_lower: &[f64],
        fixed_upper: &[f64],
        constraint_lower: &[f64],
        constraint_upper: &[f64],
        fixed_start: &[f64],
        random_start: &[f64],
    ) -> Result<FixedSolution, MixedError> {
        let init = self.initialized("optimize_fixed")?;
        let n_fixed = self.packer.n_fixed;
        for (what, len) in [
            ("fixed_lower", fixed_lower.len()),
            ("fixed_upper", fixed_upper.len()),
            ("fixed_start", fixed_start.len()),
        ] {
            if len != n_fixed {
                return Err(MixedError::SizeMismatch {
                    what,
                    expected: n_fixed,
                    got: len,
                });
            }
        }
        let m_con = init.fix.constraint.as_ref().map_or(0, Tape::n_outputs);
        if constraint_lower.len() != m_con || constraint_upper.len() != m_con {
            return Err(MixedError::SizeMismatch {
                what: "constraint bounds",
                expected: m_con,
                got: constraint_lower.len().max(constraint_upper.len()),
            });
        }

        let compaction = BoundCompaction::new(fixed_lower, fixed_upper);
        let unbounded = compaction.n_free() == n_fixed
            && fixed_lower.iter().all(|&b| b <= -INFINITY)
            && fixed_upper.iter().all(|&b| b >= INFINITY);

        let best = RefCell::new(BestPoint {
            fixed: fixed_start.to_vec(),
            random: Array1::from(random_start.to_vec()),
            objective: f64::INFINITY,
        });

        if fixed_options.quasi_fixed {
            if !unbounded || m_con > 0 || init.fix.n_fix_abs > 0 {
                return Err(MixedError::InvalidOptions(
                    "quasi_fixed requires an unbounded, unconstrained, smooth-prior problem"
                        .into(),
                ));
            }
            return self.optimize_fixed_quasi(
                fixed_options,
                random_options,
                fixed_start,
                &best,
            );
        }

        let problem = FixedProblem {
            engine: self,
            init,
            compaction: &compaction,
            random_options,
            fixed_lower: fixed_lower.to_vec(),
            fixed_upper: fixed_upper.to_vec(),
            constraint_lower: constraint_lower.to_vec(),
            constraint_upper: constraint_upper.to_vec(),
            fixed_start: fixed_start.to_vec(),
            best: &best,
            u_cache: RefCell::new(None),
        };
        let sol = ipm::solve_barrier(&problem, &fixed_options.ipm)?;
        match sol.status {
            SolveStatus::Converged => {}
            SolveStatus::InfeasibleStart => {
                return Err(MixedError::FixedSolveFailed(sol.status));
            }
            status => {
                self.model
                    .warning(&format!("optimize_fixed: solver stopped early: {status}"));
            }
        }

        let fixed_hat = compaction.restore(
            sol.x
                .slice(ndarray::s![..compaction.n_free()])
                .as_slice()
                .expect("contiguous solver iterate"),
        );
        let random_hat = if self.packer.n_random > 0 {
            self.optimize_random(
                random_options,
                fixed_hat.as_slice().expect("contiguous fixed effects"),
                best.borrow().random.to_vec().as_slice(),
            )?
        } else {
            Array1::zeros(0)
        };
        let objective = self.outer_objective(
            init,
            fixed_hat.as_slice().expect("contiguous fixed effects"),
            &random_hat,
        )?;
        // an early stop can leave the final iterate worse than the best
        // point seen along the way
        let b = best.borrow();
        if b.objective < objective {
            return Ok(FixedSolution {
                fixed: Array1::from(b.fixed.clone()),
                random: b.random.clone(),
                objective: b.objective,
                status: sol.status,
            });
        }
        Ok(FixedSolution {
            fixed: fixed_hat,
            random: random_hat,
            objective,
            status: sol.status,
        })
    }

    fn optimize_fixed_quasi(
        &self,
        fixed_options: &FixedOptions,
        random_options: &RandomOptions,
        fixed_start: &[f64],
        best: &RefCell<BestPoint>,
    ) -> Result<FixedSolution, MixedError> {
        let init = self.initialized("optimize_fixed")?;
        let cost_and_grad = |theta: &Array1<f64>| -> (f64, Array1<f64>) {
            let t = theta.as_slice().expect("contiguous iterate");
            match self.quasi_cost_grad(init, random_options, best, t) {
                Ok(pair) => pair,
                Err(err) => {
                    self.model
                        .warning(&format!("optimize_fixed: evaluation failed: {err}"));
                    (f64::INFINITY, Array1::zeros(theta.len()))
                }
            }
        };
        let solution = Bfgs::new(Array1::from(fixed_start.to_vec()), cost_and_grad)
            .with_tolerance(fixed_options.bfgs_tolerance)
            .with_max_iterations(fixed_options.bfgs_max_iterations)
            .run()
            .map_err(|e| MixedError::QuasiNewtonFailed(format!("{e:?}")))?;

        let fixed_hat = solution.final_point;
        let random_hat = if self.packer.n_random > 0 {
            self.optimize_random(
                random_options,
                fixed_hat.as_slice().expect("contiguous fixed effects"),
                best.borrow().random.to_vec().as_slice(),
            )?
        } else {
            Array1::zeros(0)
        };
        Ok(FixedSolution {
            objective: solution.final_value,
            fixed: fixed_hat,
            random: random_hat,
            status: SolveStatus::Converged,
        })
    }

    fn quasi_cost_grad(
        &self,
        init: &Initialized,
        random_options: &RandomOptions,
        best: &RefCell<BestPoint>,
        theta: &[f64],
    ) -> Result<(f64, Array1<f64>), MixedError> {
        let u_hat = if self.packer.n_random > 0 {
            let warm = best.borrow().random.clone();
            self.optimize_random(random_options, theta, warm.to_vec().as_slice())?
        } else {
            Array1::zeros(0)
        };
        let f = self.outer_objective(init, theta, &u_hat)?;
        let mut grad = self.ranobj_beta(theta, u_hat.to_vec().as_slice())?;
        if let (Some(tape), Some(_)) = (init.fix.fix_like.as_ref(), init.fix.fix_jac.as_ref()) {
            let mut w = vec![0.0; tape.n_outputs()];
            w[0] = 1.0;
            let g0 = tape.gradient(theta, &w);
            for i in 0..grad.len() {
                grad[i] += g0[i];
            }
        }
        let mut b = best.borrow_mut();
        if f < b.objective {
            b.objective = f;
            b.fixed = theta.to_vec();
            b.random = u_hat;
        }
        Ok((f, grad))
    }

    /// Smooth prior part + Σ|prior abs| + Laplace objective at (θ, û).
    fn outer_objective(
        &self,
        init: &Initialized,
        theta: &[f64],
        u_hat: &Array1<f64>,
    ) -> Result<f64, MixedError> {
        let mut f = 0.0;
        if let Some(tape) = init.fix.fix_like.as_ref() {
            let v = tape.forward(theta);
            f += total_value(&v);
        }
        if init.ran.is_some() {
            f += self.ranobj_eval(theta, u_hat.to_vec().as_slice())?;
        }
        Ok(f)
    }
}

/// Best feasible point seen by the outer solve; also the warm start for
/// the inner optimizer.
struct BestPoint {
    fixed: Vec<f64>,
    random: Array1<f64>,
    objective: f64,
}

/// Strictly feasible seed for an epigraph auxiliary above |v|.
fn seed_slack(abs_v: f64) -> f64 {
    abs_v * 1.01 + 1e-3
}

/// One generic implementation of the Laplace objective serves plain
/// evaluation (T = f64, cached workspace) and recording (T = Ad).
#[allow(clippy::too_many_arguments)]
fn laplace_kernel<T: Scalar>(
    packer: Packer,
    ran_like: &Tape,
    grad_ran: &Tape,
    hes_ran: &Tape,
    ldl_sym: &LdlSymbolic,
    factor: &mut LdlFactor<T>,
    accuracy: Accuracy,
    beta: &[T],
    theta: &[T],
    u: &[T],
) -> Result<T, MixedError> {
    let n_random = packer.n_random;
    let mut u_cur: Vec<T> = u.to_vec();

    for step in 0..accuracy.corrections() {
        // first correction solves with H(θ, u), later ones with H(β, ·),
        // so the β dependence of the recording carries the exact total
        // derivative at the optimum
        let h_at = if step == 0 {
            packer.pack(theta, &u_cur)?
        } else {
            packer.pack(beta, &u_cur)?
        };
        let hvals = hes_ran.forward(&h_at);
        factor.factorize(ldl_sym, &hvals)?;
        let g_at = packer.pack(beta, &u_cur)?;
        let mut g = grad_ran.forward(&g_at);
        factor.solve(ldl_sym, &mut g);
        for i in 0..n_random {
            u_cur[i] -= g[i];
        }
    }

    let at = packer.pack(beta, &u_cur)?;
    let hvals = hes_ran.forward(&at);
    factor.factorize(ldl_sym, &hvals)?;
    let v = ran_like.forward(&at);
    let half_logdet = T::from_f64(0.5) * factor.logdet();
    let constant = T::from_f64(0.5 * n_random as f64 * LN_2PI);
    Ok(half_logdet + total_value(&v) - constant)
}

// --------------------------------------------------------------------
// Inner problem: maximize the joint density over (u, a)
// --------------------------------------------------------------------

struct RandomProblem<'a> {
    ran: &'a RanCache,
    packer: Packer,
    fixed: Vec<f64>,
    random_start: Vec<f64>,
    abs_start: Vec<f64>,
}

impl RandomProblem<'_> {
    fn both(&self, x: &Array1<f64>) -> Vec<f64> {
        let mut both = self.fixed.clone();
        both.extend(x.iter().take(self.packer.n_random));
        both
    }
}

impl NlpProblem for RandomProblem<'_> {
    fn n_vars(&self) -> usize {
        self.packer.n_random + self.ran.n_ran_abs
    }

    fn n_constraints(&self) -> usize {
        2 * self.ran.n_ran_abs
    }

    fn bounds(&self) -> (Array1<f64>, Array1<f64>, Array1<f64>, Array1<f64>) {
        let n = self.n_vars();
        let m = self.n_constraints();
        (
            Array1::from_elem(n, -INFINITY),
            Array1::from_elem(n, INFINITY),
            Array1::zeros(m),
            Array1::from_elem(m, INFINITY),
        )
    }

    fn starting_point(&self) -> Array1<f64> {
        let mut x = self.random_start.clone();
        x.extend_from_slice(&self.abs_start);
        Array1::from(x)
    }

    fn eval_f(&self, x: &Array1<f64>) -> Result<f64, MixedError> {
        let v = self.ran.ran_like.forward(&self.both(x));
        let aux: f64 = x.iter().skip(self.packer.n_random).sum();
        Ok(v[0] + aux)
    }

    fn eval_grad_f(&self, x: &Array1<f64>) -> Result<Array1<f64>, MixedError> {
        let n_random = self.packer.n_random;
        let mut w = vec![0.0; self.ran.ran_like.n_outputs()];
        w[0] = 1.0;
        let g = self.ran.ran_like.gradient(&self.both(x), &w);
        let mut grad = Array1::from_elem(self.n_vars(), 1.0);
        for i in 0..n_random {
            grad[i] = g[self.packer.n_fixed + i];
        }
        Ok(grad)
    }

    fn eval_g(&self, x: &Array1<f64>) -> Result<Array1<f64>, MixedError> {
        let n_random = self.packer.n_random;
        let v = self.ran.ran_like.forward(&self.both(x));
        let mut g = Array1::zeros(self.n_constraints());
        for j in 0..self.ran.n_ran_abs {
            let a = x[n_random + j];
            g[2 * j] = a - v[1 + j];
            g[2 * j + 1] = a + v[1 + j];
        }
        Ok(g)
    }

    fn eval_jac_g(&self, x: &Array1<f64>) -> Result<Array2<f64>, MixedError> {
        let n_random = self.packer.n_random;
        let n_fixed = self.packer.n_fixed;
        let both = self.both(x);
        let nodes = self.ran.ran_like.forward_nodes(&both);
        let mut jac = Array2::zeros((self.n_constraints(), self.n_vars()));
        let mut w = vec![0.0; self.ran.ran_like.n_outputs()];
        for j in 0..self.ran.n_ran_abs {
            w[1 + j] = 1.0;
            let dv = self.ran.ran_like.reverse(&nodes, &w);
            w[1 + j] = 0.0;
            for i in 0..n_random {
                jac[[2 * j, i]] = -dv[n_fixed + i];
                jac[[2 * j + 1, i]] = dv[n_fixed + i];
            }
            jac[[2 * j, n_random + j]] = 1.0;
            jac[[2 * j + 1, n_random + j]] = 1.0;
        }
        Ok(jac)
    }

    fn eval_h(
        &self,
        x: &Array1<f64>,
        obj_factor: f64,
        lambda: ArrayView1<f64>,
    ) -> Result<Array2<f64>, MixedError> {
        let mut w = vec![0.0; self.ran.ran_like.n_outputs()];
        w[0] = obj_factor;
        for j in 0..self.ran.n_ran_abs {
            w[1 + j] = lambda[2 * j + 1] - lambda[2 * j];
        }
        let both = self.both(x);
        let vals = self.ran.hes_ran_ex.eval(&self.ran.ran_like, &both, &w);
        let mut h = Array2::zeros((self.n_vars(), self.n_vars()));
        for (&r, &c, v) in izip!(self.ran.hes_ran_ex.rows(), self.ran.hes_ran_ex.cols(), vals) {
            h[[r, c]] += v;
            if r != c {
                h[[c, r]] += v;
            }
        }
        Ok(h)
    }
}

// --------------------------------------------------------------------
// Outer problem: minimize prior + Laplace objective over (θ_free, a)
// --------------------------------------------------------------------

struct FixedProblem<'a, M: MixedModel> {
    engine: &'a MixedEngine<M>,
    init: &'a Initialized,
    compaction: &'a BoundCompaction,
    random_options: &'a RandomOptions,
    fixed_lower: Vec<f64>,
    fixed_upper: Vec<f64>,
    constraint_lower: Vec<f64>,
    constraint_upper: Vec<f64>,
    fixed_start: Vec<f64>,
    best: &'a RefCell<BestPoint>,
    /// (θ bits, û) of the most recent inner solve.
    u_cache: RefCell<Option<(Vec<u64>, Array1<f64>)>>,
}

impl<M: MixedModel> FixedProblem<'_, M> {
    fn theta_full(&self, x: &Array1<f64>) -> Vec<f64> {
        let reduced = &x.as_slice().expect("contiguous solver iterate")
            [..self.compaction.n_free()];
        self.compaction.restore(reduced).to_vec()
    }

    /// Inner solve at θ, warm-started from the best random effects seen
    /// so far and memoized on the exact bit pattern of θ.
    fn u_hat(&self, theta: &[f64]) -> Result<Array1<f64>, MixedError> {
        if self.engine.packer.n_random == 0 {
            return Ok(Array1::zeros(0));
        }
        let key: Vec<u64> = theta.iter().map(|v| v.to_bits()).collect();
        if let Some((cached_key, cached_u)) = self.u_cache.borrow().as_ref() {
            if *cached_key == key {
                return Ok(cached_u.clone());
            }
        }
        let warm = self.best.borrow().random.clone();
        let u = self
            .engine
            .optimize_random(self.random_options, theta, warm.to_vec().as_slice())?;
        *self.u_cache.borrow_mut() = Some((key, u.clone()));
        Ok(u)
    }

    fn n_theta(&self) -> usize {
        self.compaction.n_free()
    }

    fn n_abs(&self) -> usize {
        self.init.fix.n_fix_abs
    }

    fn m_con(&self) -> usize {
        self.init.fix.constraint.as_ref().map_or(0, Tape::n_outputs)
    }
}

impl<M: MixedModel> NlpProblem for FixedProblem<'_, M> {
    fn n_vars(&self) -> usize {
        self.n_theta() + self.n_abs()
    }

    fn n_constraints(&self) -> usize {
        self.m_con() + 2 * self.n_abs()
    }

    fn bounds(&self) -> (Array1<f64>, Array1<f64>, Array1<f64>, Array1<f64>) {
        let mut xl = self.compaction.compress(&self.fixed_lower).to_vec();
        let mut xu = self.compaction.compress(&self.fixed_upper).to_vec();
        xl.extend(std::iter::repeat_n(-INFINITY, self.n_abs()));
        xu.extend(std::iter::repeat_n(INFINITY, self.n_abs()));

        let mut gl = self.constraint_lower.clone();
        let mut gu = self.constraint_upper.clone();
        gl.extend(std::iter::repeat_n(0.0, 2 * self.n_abs()));
        gu.extend(std::iter::repeat_n(INFINITY, 2 * self.n_abs()));
        (
            Array1::from(xl),
            Array1::from(xu),
            Array1::from(gl),
            Array1::from(gu),
        )
    }

    fn starting_point(&self) -> Array1<f64> {
        let mut x = self.compaction.compress(&self.fixed_start).to_vec();
        if let Some(tape) = self.init.fix.fix_like.as_ref() {
            let v = tape.forward(&self.fixed_start);
            x.extend(v[1..].iter().map(|vi| seed_slack(vi.abs())));
        }
        Array1::from(x)
    }

    fn eval_f(&self, x: &Array1<f64>) -> Result<f64, MixedError> {
        let theta = self.theta_full(x);
        let u_hat = self.u_hat(&theta)?;
        let mut f = 0.0;
        if let Some(tape) = self.init.fix.fix_like.as_ref() {
            let v = tape.forward(&theta);
            f += v[0];
            f += x.iter().skip(self.n_theta()).sum::<f64>();
        }
        if self.init.ran.is_some() {
            match self.engine.ranobj_eval(&theta, u_hat.to_vec().as_slice()) {
                Ok(g) => f += g,
                // an indefinite curvature at a trial point rejects the
                // step instead of aborting the whole solve
                Err(MixedError::NotPositiveDefinite { .. }) => return Ok(f64::INFINITY),
                Err(e) => return Err(e),
            }
        }
        if f.is_finite() {
            let mut b = self.best.borrow_mut();
            if f < b.objective {
                b.objective = f;
                b.fixed = theta;
                b.random = u_hat;
            }
        }
        Ok(f)
    }

    fn eval_grad_f(&self, x: &Array1<f64>) -> Result<Array1<f64>, MixedError> {
        let theta = self.theta_full(x);
        let u_hat = self.u_hat(&theta)?;
        let mut full = Array1::zeros(self.engine.packer.n_fixed);
        if self.init.ran.is_some() {
            full = self.engine.ranobj_beta(&theta, u_hat.to_vec().as_slice())?;
        }
        if let Some(tape) = self.init.fix.fix_like.as_ref() {
            let mut w = vec![0.0; tape.n_outputs()];
            w[0] = 1.0;
            let g0 = tape.gradient(&theta, &w);
            for i in 0..full.len() {
                full[i] += g0[i];
            }
        }
        let mut grad = self
            .compaction
            .compress(full.as_slice().expect("contiguous gradient"))
            .to_vec();
        grad.extend(std::iter::repeat_n(1.0, self.n_abs()));
        Ok(Array1::from(grad))
    }

    fn eval_g(&self, x: &Array1<f64>) -> Result<Array1<f64>, MixedError> {
        let theta = self.theta_full(x);
        let mut g = Vec::with_capacity(self.n_constraints());
        if let Some(tape) = self.init.fix.constraint.as_ref() {
            g.extend(tape.forward(&theta));
        }
        if let Some(tape) = self.init.fix.fix_like.as_ref() {
            let v = tape.forward(&theta);
            for (j, vi) in v[1..].iter().enumerate() {
                let a = x[self.n_theta() + j];
                g.push(a - vi);
                g.push(a + vi);
            }
        }
        Ok(Array1::from(g))
    }

    fn eval_jac_g(&self, x: &Array1<f64>) -> Result<Array2<f64>, MixedError> {
        let theta = self.theta_full(x);
        let free = self.compaction.free_indices();
        let mut jac = Array2::zeros((self.n_constraints(), self.n_vars()));

        if let (Some(tape), Some(ex)) =
            (self.init.fix.constraint.as_ref(), self.init.fix.con_jac.as_ref())
        {
            let vals = ex.eval(tape, &theta);
            for (&r, &c, v) in izip!(ex.rows(), ex.cols(), vals) {
                if let Some(rc) = free.iter().position(|&fi| fi == c) {
                    jac[[r, rc]] = v;
                }
            }
        }
        if let Some(tape) = self.init.fix.fix_like.as_ref() {
            let nodes = tape.forward_nodes(&theta);
            let mut w = vec![0.0; tape.n_outputs()];
            for j in 0..self.n_abs() {
                w[1 + j] = 1.0;
                let dv = tape.reverse(&nodes, &w);
                w[1 + j] = 0.0;
                let r0 = self.m_con() + 2 * j;
                for (rc, &fi) in free.iter().enumerate() {
                    jac[[r0, rc]] = -dv[fi];
                    jac[[r0 + 1, rc]] = dv[fi];
                }
                jac[[r0, self.n_theta() + j]] = 1.0;
                jac[[r0 + 1, self.n_theta() + j]] = 1.0;
            }
        }
        Ok(jac)
    }

    fn eval_h(
        &self,
        x: &Array1<f64>,
        obj_factor: f64,
        lambda: ArrayView1<f64>,
    ) -> Result<Array2<f64>, MixedError> {
        let theta = self.theta_full(x);
        let u_hat = self.u_hat(&theta)?;
        let free = self.compaction.free_indices();
        let reduced_of: Vec<Option<usize>> = {
            let mut map = vec![None; self.engine.packer.n_fixed];
            for (rc, &fi) in free.iter().enumerate() {
                map[fi] = Some(rc);
            }
            map
        };
        let mut h = Array2::zeros((self.n_vars(), self.n_vars()));
        let mut add = |r: usize, c: usize, v: f64| {
            if let (Some(rr), Some(cc)) = (reduced_of[r], reduced_of[c]) {
                h[[rr, cc]] += v;
                if rr != cc {
                    h[[cc, rr]] += v;
                }
            }
        };

        // Laplace objective block
        if let Some(ran) = self.init.ran.as_ref() {
            let x3 = self.engine.packer.pack3(&theta, &theta, u_hat.to_vec().as_slice())?;
            let vals = ran.hes_fix_ex.eval(&ran.laplace[2], &x3, &[obj_factor]);
            for (&r, &c, v) in izip!(ran.hes_fix_ex.rows(), ran.hes_fix_ex.cols(), vals) {
                add(r, c, v);
            }
        }
        // prior block: smooth part weighted by the objective factor,
        // abs terms by their constraint multipliers
        if let (Some(tape), Some(ex)) =
            (self.init.fix.fix_like.as_ref(), self.init.fix.fix_hes.as_ref())
        {
            let mut w = vec![0.0; tape.n_outputs()];
            w[0] = obj_factor;
            for j in 0..self.n_abs() {
                let r0 = self.m_con() + 2 * j;
                w[1 + j] = lambda[r0 + 1] - lambda[r0];
            }
            let vals = ex.eval(tape, &theta, &w);
            for (&r, &c, v) in izip!(ex.rows(), ex.cols(), vals) {
                add(r, c, v);
            }
        }
        // constraint block
        if let (Some(tape), Some(ex)) =
            (self.init.fix.constraint.as_ref(), self.init.fix.con_hes.as_ref())
        {
            let w: Vec<f64> = (0..self.m_con()).map(|r| lambda[r]).collect();
            let vals = ex.eval(tape, &theta, &w);
            for (&r, &c, v) in izip!(ex.rows(), ex.cols(), vals) {
                add(r, c, v);
            }
        }
        Ok(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// One Gaussian observation y = θ + u + ε, ε ~ N(0, 1), u ~ N(0, 1).
    /// The Laplace approximation is exact: the marginal is N(θ, 2).
    struct GaussOne {
        y: f64,
    }

    impl MixedModel for GaussOne {
        fn joint_density<S: Scalar>(&self, fixed: &[S], random: &[S]) -> Vec<S> {
            let half = S::from_f64(0.5);
            let r = S::from_f64(self.y) - fixed[0] - random[0];
            vec![half * r * r + half * random[0] * random[0]]
        }
    }

    /// 0.5 (u - 3)^2 + |u|, minimized at u = 2.
    struct LassoOne;

    impl MixedModel for LassoOne {
        fn joint_density<S: Scalar>(&self, _fixed: &[S], random: &[S]) -> Vec<S> {
            let half = S::from_f64(0.5);
            let r = random[0] - S::from_f64(3.0);
            vec![half * r * r, random[0]]
        }
    }

    #[test]
    fn gaussian_laplace_is_exact_at_every_accuracy() {
        let mut engine = MixedEngine::new(1, 1, GaussOne { y: 2.0 });
        engine.initialize(&[0.5], &[0.3]).unwrap();

        let theta = [0.25];
        let resid = 2.0 - 0.25;
        let u_hat = resid / 2.0;
        let exact = 0.5 * 2.0f64.ln() + resid * resid / 4.0 - 0.5 * LN_2PI;

        // plain evaluation is exact only at the optimum
        let g0 = engine
            .laplace_approx(Accuracy::Value, &theta, &[u_hat])
            .unwrap();
        assert_relative_eq!(g0, exact, epsilon = 1e-12);
        // one Newton correction of a quadratic lands on the optimum from
        // any starting point, so first and second order are exact too
        let g1 = engine
            .laplace_approx(Accuracy::FirstOrder, &theta, &[0.0])
            .unwrap();
        assert_relative_eq!(g1, exact, epsilon = 1e-12);
        let g2 = engine
            .laplace_approx(Accuracy::SecondOrder, &theta, &[-3.0])
            .unwrap();
        assert_relative_eq!(g2, exact, epsilon = 1e-12);
    }

    #[test]
    fn beta_gradient_matches_marginal_derivative() {
        let mut engine = MixedEngine::new(1, 1, GaussOne { y: 2.0 });
        engine.initialize(&[0.0], &[0.0]).unwrap();

        let theta = [0.25];
        let u_hat = (2.0 - 0.25) / 2.0;
        let grad = engine.ranobj_beta(&theta, &[u_hat]).unwrap();
        // d/dθ of (y - θ)² / 4
        assert_relative_eq!(grad[0], -(2.0 - 0.25) / 2.0, epsilon = 1e-10);
    }

    #[test]
    fn optimize_random_solves_the_smooth_problem() {
        let mut engine = MixedEngine::new(1, 1, GaussOne { y: 2.0 });
        engine.initialize(&[0.0], &[0.0]).unwrap();

        let theta = [0.25];
        let u = engine
            .optimize_random(&RandomOptions::default(), &theta, &[5.0])
            .unwrap();
        assert_relative_eq!(u[0], (2.0 - 0.25) / 2.0, epsilon = 1e-6);
    }

    #[test]
    fn optimize_random_handles_absolute_value_terms() {
        let mut engine = MixedEngine::new(1, 1, LassoOne);
        engine.initialize(&[0.0], &[0.5]).unwrap();

        let u = engine
            .optimize_random(&RandomOptions::default(), &[0.0], &[0.5])
            .unwrap();
        assert_relative_eq!(u[0], 2.0, epsilon = 1e-5);
    }

    #[test]
    fn hessian_random_pattern_contract() {
        let mut engine = MixedEngine::new(1, 1, GaussOne { y: 2.0 });
        engine.initialize(&[0.0], &[0.0]).unwrap();

        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let vals = engine
            .hessian_random(&[0.25], &[0.0], &mut rows, &mut cols)
            .unwrap();
        assert_eq!(rows, vec![0]);
        assert_eq!(cols, vec![0]);
        assert_relative_eq!(vals[0], 2.0, epsilon = 1e-12);

        let mut bad_rows = vec![0];
        let mut bad_cols = vec![1];
        assert!(matches!(
            engine.hessian_random(&[0.25], &[0.0], &mut bad_rows, &mut bad_cols),
            Err(MixedError::PatternMismatch)
        ));
    }

    #[test]
    fn initialize_twice_is_rejected() {
        let mut engine = MixedEngine::new(1, 1, GaussOne { y: 1.0 });
        engine.initialize(&[0.0], &[0.0]).unwrap();
        assert!(matches!(
            engine.initialize(&[0.0], &[0.0]),
            Err(MixedError::InitializeCalledTwice)
        ));
        // the first recording still works afterwards
        assert!(engine.laplace_approx(Accuracy::Value, &[0.0], &[0.0]).is_ok());
    }

    #[test]
    fn operations_require_initialize() {
        let engine = MixedEngine::new(1, 1, GaussOne { y: 1.0 });
        assert!(matches!(
            engine.laplace_approx(Accuracy::Value, &[0.0], &[0.0]),
            Err(MixedError::NotInitialized(_))
        ));
        assert!(matches!(
            engine.ranobj_beta(&[0.0], &[0.0]),
            Err(MixedError::NotInitialized(_))
        ));
    }
}
