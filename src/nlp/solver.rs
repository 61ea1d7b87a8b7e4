//! Primal-dual interior-point solver.
//!
//! Inequality rows get slack variables; all bounds (variables and slacks)
//! are handled with a log barrier whose parameter is driven to zero with the
//! monotone Fiacco-McCormick strategy. Newton steps are taken on the
//! primal-dual KKT system, assembled sparsely from per-block forward-mode
//! derivatives and factorized densely with a regularization fallback.

use crate::imports::*;
use crate::nlp::{
    dual_vec, dual_vec_seeded, hyper_vec, KktSensitivities, Nlp, NlpBounds, NlpSolution,
    SolveStatus, WarmStart, INF_BOUND,
};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CooMatrix;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SolverOptions {
    /// 0 is silent; 3 and up logs one line per iteration; 5 and up logs step
    /// diagnostics
    pub print_level: i32,
    pub tol: f64,
    pub constr_viol_tol: f64,
    pub acceptable_tol: f64,
    pub max_iter: usize,
    pub mu_init: f64,
    pub compute_sensitivity: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            print_level: 0,
            tol: 1e-10,
            constr_viol_tol: 1e-10,
            acceptable_tol: 1e-8,
            max_iter: 500,
            mu_init: 0.1,
            compute_sensitivity: false,
        }
    }
}

fn finite_lower(b: f64) -> bool {
    b > -INF_BOUND
}

fn finite_upper(b: f64) -> bool {
    b < INF_BOUND
}

/// Push a starting value strictly inside its bounds (bound_push rule);
/// warm starts use a much smaller push so active bounds stay active.
fn project_inside(v: f64, lb: f64, ub: f64, push: f64) -> f64 {
    let push_l = if finite_lower(lb) {
        if finite_upper(ub) {
            (push * lb.abs().max(1.0)).min(push * (ub - lb))
        } else {
            push * lb.abs().max(1.0)
        }
    } else {
        0.0
    };
    let push_u = if finite_upper(ub) {
        if finite_lower(lb) {
            (push * ub.abs().max(1.0)).min(push * (ub - lb))
        } else {
            push * ub.abs().max(1.0)
        }
    } else {
        0.0
    };
    v.max(lb + push_l).min(ub - push_u)
}

struct Problem<'a, N: Nlp> {
    nlp: &'a N,
    parameters: Vec<f64>,
    n: usize,
    m: usize,
    /// augmented variable count: decision variables then inequality slacks
    nx: usize,
    /// slack index per constraint row (inequality rows only)
    slack_of_row: Vec<Option<usize>>,
    row_of_slack: Vec<usize>,
    x_lower: Vec<f64>,
    x_upper: Vec<f64>,
    g_lower: Vec<f64>,
}

impl<'a, N: Nlp> Problem<'a, N> {
    fn new(nlp: &'a N, bounds: &NlpBounds) -> anyhow::Result<Self> {
        let n = nlp.n_variables();
        let m = nlp.n_constraints();
        ensure!(
            bounds.x_lower.len() == n && bounds.x_upper.len() == n,
            Error::InputValidation("variable bound arrays do not match n_variables".into())
        );
        ensure!(
            bounds.g_lower.len() == m && bounds.g_upper.len() == m,
            Error::InputValidation("constraint bound arrays do not match n_constraints".into())
        );
        // fixed variables would defeat the log barrier; callers keep them
        // out of the free set instead
        ensure!(
            bounds
                .x_lower
                .iter()
                .zip(bounds.x_upper.iter())
                .all(|(lb, ub)| ub - lb > 1e-10),
            Error::InputValidation(
                "variable bounds must leave room between lower and upper; \
                 remove fixed variables from the free set"
                    .into()
            )
        );
        let mut slack_of_row = vec![None; m];
        let mut row_of_slack = Vec::new();
        let mut x_lower = bounds.x_lower.clone();
        let mut x_upper = bounds.x_upper.clone();
        for r in 0..m {
            if bounds.g_upper[r] - bounds.g_lower[r] > 1e-12 {
                slack_of_row[r] = Some(n + row_of_slack.len());
                row_of_slack.push(r);
                x_lower.push(bounds.g_lower[r]);
                x_upper.push(bounds.g_upper[r]);
            }
        }
        let nx = n + row_of_slack.len();
        Ok(Self {
            nlp,
            parameters: nlp.parameter_values(),
            n,
            m,
            nx,
            slack_of_row,
            row_of_slack,
            x_lower,
            x_upper,
            g_lower: bounds.g_lower.clone(),
        })
    }

    /// Objective and raw constraint values at `x` (decision variables only).
    fn eval_fg(&self, x: &[f64]) -> (f64, Vec<f64>) {
        let mut f = 0.0;
        let mut g = vec![0.0; self.m];
        let mut local = Vec::new();
        for b in 0..self.nlp.n_blocks() {
            let vars = self.nlp.block_variables(b);
            let rows = self.nlp.block_constraints(b);
            local.clear();
            local.extend(vars.iter().map(|&v| x[v]));
            let mut gb = vec![0.0; rows.len()];
            f += self.nlp.eval_block(b, &local, &self.parameters, &mut gb);
            for (value, row) in gb.iter().zip(rows.iter()) {
                g[*row] += value;
            }
        }
        (f, g)
    }

    /// Objective, constraints, objective gradient, and Jacobian triplets.
    #[allow(clippy::type_complexity)]
    fn eval_derivatives(
        &self,
        x: &[f64],
    ) -> (f64, Vec<f64>, Vec<f64>, Vec<(usize, usize, f64)>) {
        let mut f = 0.0;
        let mut g = vec![0.0; self.m];
        let mut grad = vec![0.0; self.n];
        let mut jac = Vec::new();
        let p_dual = dual_vec(&self.parameters);
        for b in 0..self.nlp.n_blocks() {
            let vars = self.nlp.block_variables(b);
            let rows = self.nlp.block_constraints(b);
            let local: Vec<f64> = vars.iter().map(|&v| x[v]).collect();
            for (j, &var) in vars.iter().enumerate() {
                let xs = dual_vec_seeded(&local, j);
                let mut gb = vec![Dual64::from(0.0); rows.len()];
                let fb = self.nlp.eval_block(b, &xs, &p_dual, &mut gb);
                grad[var] += fb.eps;
                for (value, row) in gb.iter().zip(rows.iter()) {
                    if value.eps != 0.0 {
                        jac.push((*row, var, value.eps));
                    }
                }
                if j == 0 {
                    f += fb.re;
                    for (value, row) in gb.iter().zip(rows.iter()) {
                        g[*row] += value.re;
                    }
                }
            }
            if vars.is_empty() {
                let mut gb = vec![0.0; rows.len()];
                f += self.nlp.eval_block(b, &[], &self.parameters, &mut gb);
                for (value, row) in gb.iter().zip(rows.iter()) {
                    g[*row] += value;
                }
            }
        }
        (f, g, grad, jac)
    }

    /// Triplets of the Lagrangian Hessian `sigma * f + lambda' g`, decision
    /// variables only (slack rows are linear).
    fn eval_hessian(&self, x: &[f64], sigma: f64, lambda: &[f64]) -> Vec<(usize, usize, f64)> {
        let mut triplets = Vec::new();
        let p_hyper = hyper_vec(&self.parameters);
        for b in 0..self.nlp.n_blocks() {
            let vars = self.nlp.block_variables(b);
            let rows = self.nlp.block_constraints(b);
            let local: Vec<f64> = vars.iter().map(|&v| x[v]).collect();
            let base = hyper_vec(&local);
            for j in 0..vars.len() {
                for k in 0..=j {
                    let mut xs = base.clone();
                    xs[j].eps1 = 1.0;
                    xs[k].eps2 = 1.0;
                    let mut gb = vec![HyperDual64::from(0.0); rows.len()];
                    let fb = self.nlp.eval_block(b, &xs, &p_hyper, &mut gb);
                    let mut w = sigma * fb.eps1eps2;
                    for (value, row) in gb.iter().zip(rows.iter()) {
                        w += lambda[*row] * value.eps1eps2;
                    }
                    if w != 0.0 {
                        triplets.push((vars[j], vars[k], w));
                        if j != k {
                            triplets.push((vars[k], vars[j], w));
                        }
                    }
                }
            }
        }
        triplets
    }

    /// Constraint residual `c(X) = g(x) - rhs` over the augmented variables.
    fn residual(&self, g: &[f64], x_aug: &[f64]) -> Vec<f64> {
        (0..self.m)
            .map(|r| match self.slack_of_row[r] {
                Some(k) => g[r] - x_aug[k],
                None => g[r] - self.g_lower[r],
            })
            .collect()
    }
}

pub struct InteriorPointSolver {
    pub options: SolverOptions,
}

impl InteriorPointSolver {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }

    /// Solves the problem starting from `x0`; `warm` optionally provides
    /// multipliers from a structurally identical previous solve.
    pub fn solve<N: Nlp>(
        &self,
        nlp: &N,
        x0: &[f64],
        bounds: &NlpBounds,
        warm: Option<&WarmStart>,
    ) -> anyhow::Result<NlpSolution> {
        let opts = &self.options;
        let problem = Problem::new(nlp, bounds)?;
        let (n, m, nx) = (problem.n, problem.m, problem.nx);
        ensure!(
            x0.len() == n,
            Error::InputValidation("initial point does not match n_variables".into())
        );

        // primal initialization strictly inside the bounds
        let push = if warm.is_some() { 1e-9 } else { 1e-2 };
        let mut x_aug = vec![0.0; nx];
        for i in 0..n {
            x_aug[i] = project_inside(x0[i], problem.x_lower[i], problem.x_upper[i], push);
        }
        let (_, g0) = problem.eval_fg(&x_aug[..n]);
        for (k, &r) in problem.row_of_slack.iter().enumerate() {
            x_aug[n + k] =
                project_inside(g0[r], problem.x_lower[n + k], problem.x_upper[n + k], push);
        }

        let mut mu = if warm.is_some() {
            opts.mu_init.min(1e-9)
        } else {
            opts.mu_init
        };
        let mut tau = 0.99_f64.max(1.0 - mu);

        // dual initialization
        let mut lambda = vec![0.0; m];
        let mut z_lower = vec![0.0; nx];
        let mut z_upper = vec![0.0; nx];
        for i in 0..nx {
            if finite_lower(problem.x_lower[i]) {
                z_lower[i] = (mu / (x_aug[i] - problem.x_lower[i])).clamp(1e-8, 1e8);
            }
            if finite_upper(problem.x_upper[i]) {
                z_upper[i] = (mu / (problem.x_upper[i] - x_aug[i])).clamp(1e-8, 1e8);
            }
        }
        if let Some(ws) = warm {
            ensure!(
                ws.lambda.len() == m && ws.z_lower.len() == nx && ws.z_upper.len() == nx,
                Error::InputValidation("warm-start data does not match problem structure".into())
            );
            lambda.copy_from_slice(&ws.lambda);
            for i in 0..nx {
                if finite_lower(problem.x_lower[i]) {
                    z_lower[i] = ws.z_lower[i].max(1e-12);
                }
                if finite_upper(problem.x_upper[i]) {
                    z_upper[i] = ws.z_upper[i].max(1e-12);
                }
            }
        }

        let mut delta_w = 0.0_f64;
        let mut nu = 1.0_f64; // merit penalty weight
        let mut best_error = f64::INFINITY;
        let mut status = None;
        let mut iterations = 0;
        let mut last = Diagnostics::default();

        for iter in 0..opts.max_iter {
            iterations = iter;
            let (f, g, grad, jac) = problem.eval_derivatives(&x_aug[..n]);
            let c = problem.residual(&g, &x_aug);

            // dual residual over augmented variables
            let mut r_dual = vec![0.0; nx];
            r_dual[..n].copy_from_slice(&grad);
            for &(row, col, value) in &jac {
                r_dual[col] += lambda[row] * value;
            }
            for (k, &r) in problem.row_of_slack.iter().enumerate() {
                r_dual[n + k] -= lambda[r];
            }
            for i in 0..nx {
                r_dual[i] += z_upper[i] - z_lower[i];
            }

            let theta = c.iter().fold(0.0_f64, |a, v| a.max(v.abs()));
            let dual_inf = r_dual.iter().fold(0.0_f64, |a, v| a.max(v.abs()));
            let mut compl_0 = 0.0_f64;
            let mut compl_mu = 0.0_f64;
            for i in 0..nx {
                if finite_lower(problem.x_lower[i]) {
                    let prod = (x_aug[i] - problem.x_lower[i]) * z_lower[i];
                    compl_0 = compl_0.max(prod.abs());
                    compl_mu = compl_mu.max((prod - mu).abs());
                }
                if finite_upper(problem.x_upper[i]) {
                    let prod = (problem.x_upper[i] - x_aug[i]) * z_upper[i];
                    compl_0 = compl_0.max(prod.abs());
                    compl_mu = compl_mu.max((prod - mu).abs());
                }
            }
            // scaling guards against exploding multipliers (Waechter-Biegler)
            let z_sum: f64 = z_lower.iter().sum::<f64>() + z_upper.iter().sum::<f64>();
            let lambda_sum: f64 = lambda.iter().map(|v| v.abs()).sum();
            let s_d = ((lambda_sum + z_sum) / ((m + 2 * nx).max(1) as f64)).max(100.0) / 100.0;
            let s_c = (z_sum / ((2 * nx).max(1) as f64)).max(100.0) / 100.0;

            let error_0 = (dual_inf / s_d).max(theta).max(compl_0 / s_c);
            let error_mu = (dual_inf / s_d).max(theta).max(compl_mu / s_c);
            best_error = best_error.min(error_0);
            last = Diagnostics {
                objective: f,
                theta,
                dual_inf,
            };

            if opts.print_level >= 3 {
                log::info!(
                    "ip iter {iter:4}  f {f:14.7e}  viol {theta:9.2e}  dual {dual_inf:9.2e}  mu {mu:9.2e}"
                );
            }

            if error_0 <= opts.tol && theta <= opts.constr_viol_tol {
                status = Some(SolveStatus::Solved);
                break;
            }

            // barrier subproblem converged: tighten mu
            if error_mu <= 10.0 * mu && mu > opts.tol / 10.0 {
                mu = (opts.tol / 10.0).max((0.2 * mu).min(mu.powf(1.5)));
                tau = 0.99_f64.max(1.0 - mu);
            }

            let hess = problem.eval_hessian(&x_aug[..n], 1.0, &lambda);

            // assemble and solve the KKT system, with regularization retries
            let mut rhs = DVector::zeros(nx + m);
            for i in 0..nx {
                // -(grad f + A' lambda - mu/d_L + mu/d_U)
                let mut v = -r_dual[i] - z_lower[i] + z_upper[i];
                if finite_lower(problem.x_lower[i]) {
                    v += mu / (x_aug[i] - problem.x_lower[i]);
                }
                if finite_upper(problem.x_upper[i]) {
                    v -= mu / (problem.x_upper[i] - x_aug[i]);
                }
                rhs[i] = v;
            }
            for r in 0..m {
                rhs[nx + r] = -c[r];
            }

            let mut step = None;
            let mut attempts = 0;
            while attempts < 14 {
                let kkt = assemble_kkt(&problem, &x_aug, &hess, &jac, &z_lower, &z_upper, delta_w);
                match kkt.lu().solve(&rhs) {
                    Some(d) if d.iter().all(|v| v.is_finite()) => {
                        step = Some(d);
                        break;
                    }
                    _ => {
                        delta_w = if delta_w == 0.0 { 1e-8 } else { delta_w * 10.0 };
                        attempts += 1;
                    }
                }
            }
            let step = step.ok_or_else(|| {
                anyhow!(Error::NumericFailure(
                    "KKT system could not be factorized".into()
                ))
            })?;

            let dx: Vec<f64> = (0..nx).map(|i| step[i]).collect();
            let dlambda: Vec<f64> = (0..m).map(|r| step[nx + r]).collect();

            let mut dz_lower = vec![0.0; nx];
            let mut dz_upper = vec![0.0; nx];
            for i in 0..nx {
                if finite_lower(problem.x_lower[i]) {
                    let d = x_aug[i] - problem.x_lower[i];
                    dz_lower[i] = (mu - z_lower[i] * d - z_lower[i] * dx[i]) / d;
                }
                if finite_upper(problem.x_upper[i]) {
                    let d = problem.x_upper[i] - x_aug[i];
                    dz_upper[i] = (mu - z_upper[i] * d + z_upper[i] * dx[i]) / d;
                }
            }

            // fraction-to-boundary step limits
            let mut alpha_max: f64 = 1.0;
            for i in 0..nx {
                if finite_lower(problem.x_lower[i]) && dx[i] < 0.0 {
                    alpha_max =
                        alpha_max.min(-tau * (x_aug[i] - problem.x_lower[i]) / dx[i]);
                }
                if finite_upper(problem.x_upper[i]) && dx[i] > 0.0 {
                    alpha_max = alpha_max.min(tau * (problem.x_upper[i] - x_aug[i]) / dx[i]);
                }
            }
            let mut alpha_z: f64 = 1.0;
            for i in 0..nx {
                if z_lower[i] > 0.0 && dz_lower[i] < 0.0 {
                    alpha_z = alpha_z.min(-tau * z_lower[i] / dz_lower[i]);
                }
                if z_upper[i] > 0.0 && dz_upper[i] < 0.0 {
                    alpha_z = alpha_z.min(-tau * z_upper[i] / dz_upper[i]);
                }
            }

            // backtracking line search on the barrier merit function
            let lambda_trial_inf = lambda
                .iter()
                .zip(dlambda.iter())
                .fold(0.0_f64, |a, (l, d)| a.max((l + d).abs()));
            nu = nu.max(2.0 * lambda_trial_inf).min(1e8);
            let merit_0 = barrier_merit(&problem, f, &c, &x_aug, mu, nu);
            let theta_0: f64 = c.iter().map(|v| v.abs()).sum();

            let mut alpha = alpha_max;
            let mut accepted = false;
            for _ in 0..25 {
                let mut x_trial = x_aug.clone();
                for i in 0..nx {
                    x_trial[i] += alpha * dx[i];
                }
                let (f_t, g_t) = problem.eval_fg(&x_trial[..n]);
                let c_t = problem.residual(&g_t, &x_trial);
                let merit_t = barrier_merit(&problem, f_t, &c_t, &x_trial, mu, nu);
                let theta_t: f64 = c_t.iter().map(|v| v.abs()).sum();
                if merit_t.is_finite() && (merit_t < merit_0 || theta_t < 0.99 * theta_0) {
                    x_aug = x_trial;
                    accepted = true;
                    break;
                }
                alpha *= 0.5;
            }
            if !accepted {
                // take the smallest step anyway and stiffen the system
                for i in 0..nx {
                    x_aug[i] += alpha * dx[i];
                }
                delta_w = if delta_w == 0.0 { 1e-8 } else { delta_w * 10.0 };
                if opts.print_level >= 5 {
                    log::debug!("line search exhausted at iter {iter}, delta_w = {delta_w:e}");
                }
            } else if delta_w > 0.0 {
                delta_w = (delta_w / 3.0).max(1e-14);
                if delta_w < 1e-13 {
                    delta_w = 0.0;
                }
            }

            for r in 0..m {
                lambda[r] += alpha * dlambda[r];
            }
            for i in 0..nx {
                z_lower[i] = (z_lower[i] + alpha_z * dz_lower[i]).max(0.0);
                z_upper[i] = (z_upper[i] + alpha_z * dz_upper[i]).max(0.0);
            }
        }

        let status = match status {
            Some(s) => s,
            None => {
                if best_error <= opts.acceptable_tol {
                    SolveStatus::SolvedToAcceptable
                } else {
                    bail!(Error::NumericFailure(format!(
                        "interior-point solver did not converge in {} iterations \
                         (best KKT error {best_error:e}, last violation {:e})",
                        opts.max_iter, last.theta
                    )));
                }
            }
        };

        let (f, g) = problem.eval_fg(&x_aug[..n]);
        let sensitivities = if opts.compute_sensitivity && nlp.n_parameters() > 0 {
            Some(compute_sensitivities(
                &problem, &x_aug, &lambda, &z_lower, &z_upper,
            )?)
        } else {
            None
        };

        Ok(NlpSolution {
            x: x_aug[..n].to_vec(),
            objective: f,
            constraints: g,
            lambda,
            z_lower,
            z_upper,
            iterations: iterations + 1,
            status,
            constraint_violation: last.theta,
            dual_infeasibility: last.dual_inf,
            sensitivities,
        })
    }
}

#[derive(Default)]
struct Diagnostics {
    #[allow(dead_code)]
    objective: f64,
    theta: f64,
    dual_inf: f64,
}

fn barrier_merit<N: Nlp>(
    problem: &Problem<N>,
    f: f64,
    c: &[f64],
    x_aug: &[f64],
    mu: f64,
    nu: f64,
) -> f64 {
    let mut phi = f;
    for i in 0..problem.nx {
        if finite_lower(problem.x_lower[i]) {
            let d = x_aug[i] - problem.x_lower[i];
            if d <= 0.0 {
                return f64::INFINITY;
            }
            phi -= mu * d.ln();
        }
        if finite_upper(problem.x_upper[i]) {
            let d = problem.x_upper[i] - x_aug[i];
            if d <= 0.0 {
                return f64::INFINITY;
            }
            phi -= mu * d.ln();
        }
    }
    phi + nu * c.iter().map(|v| v.abs()).sum::<f64>()
}

/// Builds the symmetric KKT matrix
/// `[[W + Sigma + delta_w I, A'], [A, -delta_c I]]` densely from triplets.
fn assemble_kkt<N: Nlp>(
    problem: &Problem<N>,
    x_aug: &[f64],
    hess: &[(usize, usize, f64)],
    jac: &[(usize, usize, f64)],
    z_lower: &[f64],
    z_upper: &[f64],
    delta_w: f64,
) -> DMatrix<f64> {
    let (n, m, nx) = (problem.n, problem.m, problem.nx);
    let mut coo = CooMatrix::new(nx + m, nx + m);
    for &(i, j, v) in hess {
        coo.push(i, j, v);
    }
    for i in 0..nx {
        let mut sigma = delta_w;
        if finite_lower(problem.x_lower[i]) {
            sigma += z_lower[i] / (x_aug[i] - problem.x_lower[i]);
        }
        if finite_upper(problem.x_upper[i]) {
            sigma += z_upper[i] / (problem.x_upper[i] - x_aug[i]);
        }
        coo.push(i, i, sigma);
    }
    for &(row, col, v) in jac {
        coo.push(nx + row, col, v);
        coo.push(col, nx + row, v);
    }
    for (k, &r) in problem.row_of_slack.iter().enumerate() {
        coo.push(nx + r, n + k, -1.0);
        coo.push(n + k, nx + r, -1.0);
    }
    for r in 0..m {
        coo.push(nx + r, nx + r, -1e-10);
    }
    let mut dense = DMatrix::zeros(nx + m, nx + m);
    for (i, j, v) in coo.triplet_iter() {
        dense[(i, j)] += v;
    }
    dense
}

/// Implicit differentiation of the KKT conditions at the solution: solves
/// `K [dx; dlambda] = -[d(grad_x L)/dp; dc/dp]` per parameter and applies
/// the envelope theorem for the objective sensitivity.
fn compute_sensitivities<N: Nlp>(
    problem: &Problem<N>,
    x_aug: &[f64],
    lambda: &[f64],
    z_lower: &[f64],
    z_upper: &[f64],
) -> anyhow::Result<KktSensitivities> {
    let (n, m, nx) = (problem.n, problem.m, problem.nx);
    let np = problem.nlp.n_parameters();
    let x = &x_aug[..n];

    let (_, _, _, jac) = problem.eval_derivatives(x);
    let hess = problem.eval_hessian(x, 1.0, lambda);
    let kkt = assemble_kkt(problem, x_aug, &hess, &jac, z_lower, z_upper, 0.0);
    let lu = kkt.lu();

    let mut dx_dp = Vec::with_capacity(np);
    let mut dobjective_dp = Vec::with_capacity(np);
    for k in 0..np {
        // cross derivatives d(grad_x L)/dp_k and first derivatives dg/dp_k
        let mut rhs = DVector::zeros(nx + m);
        let mut dobj = 0.0;
        for b in 0..problem.nlp.n_blocks() {
            let vars = problem.nlp.block_variables(b);
            let rows = problem.nlp.block_constraints(b);
            let local: Vec<f64> = vars.iter().map(|&v| x[v]).collect();

            // dg/dp_k and df/dp_k from a single dual pass on the parameter
            let mut p_dual = dual_vec(&problem.parameters);
            p_dual[k].eps = 1.0;
            let xs = dual_vec(&local);
            let mut gb = vec![Dual64::from(0.0); rows.len()];
            let fb = problem.nlp.eval_block(b, &xs, &p_dual, &mut gb);
            dobj += fb.eps;
            for (value, row) in gb.iter().zip(rows.iter()) {
                dobj += lambda[*row] * value.eps;
                rhs[nx + row] -= value.eps;
            }

            // d2L/dx dp_k via hyper-duals seeded on (x_j, p_k)
            let mut p_hyper = hyper_vec(&problem.parameters);
            p_hyper[k].eps2 = 1.0;
            let base = hyper_vec(&local);
            for (j, &var) in vars.iter().enumerate() {
                let mut xs = base.clone();
                xs[j].eps1 = 1.0;
                let mut gb = vec![HyperDual64::from(0.0); rows.len()];
                let fb = problem.nlp.eval_block(b, &xs, &p_hyper, &mut gb);
                let mut w = fb.eps1eps2;
                for (value, row) in gb.iter().zip(rows.iter()) {
                    w += lambda[*row] * value.eps1eps2;
                }
                rhs[var] -= w;
            }
        }
        let step = lu.solve(&rhs).ok_or_else(|| {
            anyhow!(Error::NumericFailure(
                "sensitivity KKT system is singular".into()
            ))
        })?;
        dx_dp.push((0..n).map(|i| step[i]).collect());
        dobjective_dp.push(dobj);
    }
    Ok(KktSensitivities {
        dx_dp,
        dobjective_dp,
    })
}
