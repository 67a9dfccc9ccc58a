//! A random-intercept Gaussian model where the Laplace approximation is
//! exact, so every quantity the engine produces can be checked against
//! closed forms: the marginal is y_i ~ N(theta0, 1 + theta1^2).

use approx::assert_relative_eq;
use laplace_mixed::{
    Accuracy, FixedOptions, MixedEngine, MixedModel, RandomOptions, Scalar, SolveStatus,
    ipm::INFINITY,
};

/// y_i = theta0 + u_i + eps_i, eps_i ~ N(0, theta1^2), u_i ~ N(0, 1).
struct RandomIntercept {
    y: Vec<f64>,
}

impl MixedModel for RandomIntercept {
    fn joint_density<S: Scalar>(&self, fixed: &[S], random: &[S]) -> Vec<S> {
        let half = S::from_f64(0.5);
        let mean = fixed[0];
        let sigma = fixed[1];
        let mut f = S::zero();
        for (yi, ui) in self.y.iter().zip(random) {
            let r = (S::from_f64(*yi) - mean - *ui) / sigma;
            f += half * r * r + sigma.ln();
            f += half * *ui * *ui;
        }
        vec![f]
    }
}

/// Same model with sigma = exp(theta1), for the unbounded quasi-Newton
/// path.
struct RandomInterceptLog {
    y: Vec<f64>,
}

impl MixedModel for RandomInterceptLog {
    fn joint_density<S: Scalar>(&self, fixed: &[S], random: &[S]) -> Vec<S> {
        let half = S::from_f64(0.5);
        let mean = fixed[0];
        let sigma = fixed[1].exp();
        let mut f = S::zero();
        for (yi, ui) in self.y.iter().zip(random) {
            let r = (S::from_f64(*yi) - mean - *ui) / sigma;
            f += half * r * r + fixed[1];
            f += half * *ui * *ui;
        }
        vec![f]
    }
}

fn data() -> Vec<f64> {
    (1..=10).map(f64::from).collect()
}

/// Exact negative log marginal likelihood, with the same additive
/// constants the model carries.
fn exact_marginal(theta: &[f64], y: &[f64]) -> f64 {
    let n = y.len() as f64;
    let delta2 = 1.0 + theta[1] * theta[1];
    let s2: f64 = y.iter().map(|yi| (yi - theta[0]).powi(2)).sum();
    0.5 * s2 / delta2 + 0.5 * n * delta2.ln() - 0.5 * n * (2.0 * std::f64::consts::PI).ln()
}

fn exact_u_hat(theta: &[f64], y: &[f64]) -> Vec<f64> {
    let delta2 = 1.0 + theta[1] * theta[1];
    y.iter().map(|yi| (yi - theta[0]) / delta2).collect()
}

fn engine() -> MixedEngine<RandomIntercept> {
    let _ = env_logger::builder().is_test(true).try_init();
    let y = data();
    let n = y.len();
    let mut engine = MixedEngine::new(2, n, RandomIntercept { y });
    engine
        .initialize(&[1.0, 1.0], &vec![0.1; n])
        .expect("initialize");
    engine
}

#[test]
fn laplace_matches_exact_marginal_at_every_accuracy() {
    let engine = engine();
    let y = data();
    let theta = [4.0, 1.5];
    let u_hat = exact_u_hat(&theta, &y);
    let exact = exact_marginal(&theta, &y);

    let g0 = engine
        .laplace_approx(Accuracy::Value, &theta, &u_hat)
        .expect("level 0");
    assert_relative_eq!(g0, exact, epsilon = 1e-10);

    // the joint density is quadratic in u, so one Newton correction
    // reaches the conditional optimum from any starting point
    let far = vec![-2.0; y.len()];
    let g1 = engine
        .laplace_approx(Accuracy::FirstOrder, &theta, &far)
        .expect("level 1");
    assert_relative_eq!(g1, exact, epsilon = 1e-10);
    let g2 = engine
        .laplace_approx(Accuracy::SecondOrder, &theta, &far)
        .expect("level 2");
    assert_relative_eq!(g2, exact, epsilon = 1e-10);
}

#[test]
fn optimize_random_matches_analytic_conditional_mode() {
    let engine = engine();
    let y = data();
    let theta = [4.0, 1.5];
    let u = engine
        .optimize_random(&RandomOptions::default(), &theta, &vec![0.0; y.len()])
        .expect("inner solve");
    for (ui, exact) in u.iter().zip(exact_u_hat(&theta, &y)) {
        assert_relative_eq!(*ui, exact, epsilon = 1e-6);
    }
}

#[test]
fn beta_gradient_matches_marginal_gradient() {
    let engine = engine();
    let y = data();
    let theta = [4.0, 1.5];
    let u_hat = exact_u_hat(&theta, &y);

    let n = y.len() as f64;
    let delta2 = 1.0 + theta[1] * theta[1];
    let s1: f64 = y.iter().map(|yi| yi - theta[0]).sum();
    let s2: f64 = y.iter().map(|yi| (yi - theta[0]).powi(2)).sum();

    let grad = engine.ranobj_beta(&theta, &u_hat).expect("beta gradient");
    assert_relative_eq!(grad[0], -s1 / delta2, epsilon = 1e-8);
    assert_relative_eq!(
        grad[1],
        n * theta[1] / delta2 - s2 * theta[1] / delta2.powi(2),
        epsilon = 1e-8
    );
}

#[test]
fn hessian_fixed_matches_marginal_hessian() {
    let engine = engine();
    let y = data();
    let theta = [4.0, 1.5];
    let u_hat = exact_u_hat(&theta, &y);

    let mut rows = Vec::new();
    let mut cols = Vec::new();
    let vals = engine
        .hessian_fixed(&theta, &u_hat, &mut rows, &mut cols)
        .expect("fixed hessian");

    let mut dense = [[0.0; 2]; 2];
    for (k, (&r, &c)) in rows.iter().zip(&cols).enumerate() {
        assert!(r >= c, "pattern must be lower triangular");
        dense[r][c] = vals[k];
        dense[c][r] = vals[k];
    }

    let n = y.len() as f64;
    let t1 = theta[1];
    let delta2 = 1.0 + t1 * t1;
    let s1: f64 = y.iter().map(|yi| yi - theta[0]).sum();
    let s2: f64 = y.iter().map(|yi| (yi - theta[0]).powi(2)).sum();

    let h00 = n / delta2;
    let h10 = 2.0 * t1 * s1 / delta2.powi(2);
    let h11 = n * (delta2 - 2.0 * t1 * t1) / delta2.powi(2)
        - s2 * (delta2 - 4.0 * t1 * t1) / delta2.powi(3);

    assert_relative_eq!(dense[0][0], h00, epsilon = 1e-8);
    assert_relative_eq!(dense[1][0], h10, epsilon = 1e-8);
    assert_relative_eq!(dense[1][1], h11, epsilon = 1e-8);
}

#[test]
fn hessian_random_is_diagonal_for_independent_intercepts() {
    let engine = engine();
    let y = data();
    let theta = [4.0, 1.5];

    let mut rows = Vec::new();
    let mut cols = Vec::new();
    let vals = engine
        .hessian_random(&theta, &vec![0.0; y.len()], &mut rows, &mut cols)
        .expect("random hessian");

    assert_eq!(rows.len(), y.len());
    // a diagonal pattern needs a single tangent sweep
    assert_eq!(engine.init_report().expect("initialized").hes_ran_colors, 1);
    let expect = 1.0 + 1.0 / (theta[1] * theta[1]);
    for (k, (&r, &c)) in rows.iter().zip(&cols).enumerate() {
        assert_eq!(r, c);
        assert_relative_eq!(vals[k], expect, epsilon = 1e-10);
    }
}

#[test]
fn optimize_fixed_recovers_the_mle() {
    let engine = engine();
    let y = data();
    let n = y.len();

    let sol = engine
        .optimize_fixed(
            &FixedOptions::default(),
            &RandomOptions::default(),
            &[-100.0, 0.1],
            &[100.0, 10.0],
            &[],
            &[],
            &[0.0, 1.0],
            &vec![0.0; n],
        )
        .expect("outer solve");
    assert_eq!(sol.status, SolveStatus::Converged);

    // mean 5.5, variance 8.25, so sigma^2 = 8.25 - 1
    let theta1 = (8.25_f64 - 1.0).sqrt();
    assert_relative_eq!(sol.fixed[0], 5.5, epsilon = 1e-5);
    assert_relative_eq!(sol.fixed[1], theta1, epsilon = 1e-5);
    assert_relative_eq!(
        sol.objective,
        exact_marginal(&[5.5, theta1], &y),
        epsilon = 1e-8
    );
    for (ui, exact) in sol.random.iter().zip(exact_u_hat(&[5.5, theta1], &y)) {
        assert_relative_eq!(*ui, exact, epsilon = 1e-5);
    }
}

#[test]
fn pinned_bound_component_is_held_and_restored() {
    let engine = engine();
    let n = data().len();

    let sol = engine
        .optimize_fixed(
            &FixedOptions::default(),
            &RandomOptions::default(),
            &[-100.0, 2.0],
            &[100.0, 2.0],
            &[],
            &[],
            &[0.0, 2.0],
            &vec![0.0; n],
        )
        .expect("outer solve");
    // theta0 minimizes the residual sum regardless of the pinned scale
    assert_relative_eq!(sol.fixed[0], 5.5, epsilon = 1e-5);
    assert_eq!(sol.fixed[1], 2.0);
}

#[test]
fn quasi_newton_path_recovers_the_mle() {
    let y = data();
    let n = y.len();
    let mut engine = MixedEngine::new(2, n, RandomInterceptLog { y: y.clone() });
    engine
        .initialize(&[1.0, 0.5], &vec![0.1; n])
        .expect("initialize");

    let opts = FixedOptions {
        quasi_fixed: true,
        ..FixedOptions::default()
    };
    let sol = engine
        .optimize_fixed(
            &opts,
            &RandomOptions::default(),
            &[-INFINITY, -INFINITY],
            &[INFINITY, INFINITY],
            &[],
            &[],
            &[3.0, 0.0],
            &vec![0.0; n],
        )
        .expect("quasi-Newton solve");

    assert_relative_eq!(sol.fixed[0], 5.5, epsilon = 1e-4);
    assert_relative_eq!(sol.fixed[1], 0.5 * (8.25_f64 - 1.0).ln(), epsilon = 1e-4);
}
