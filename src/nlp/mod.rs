//! Nonlinear programming over block-separable, AD-evaluated problems.
//!
//! A problem is described as a set of blocks, each touching a small subset of
//! the decision variables and contributing to the objective and to a small
//! set of constraint rows. The solver extracts sparse first and second
//! derivatives block by block with forward-mode dual numbers, so problems
//! never provide analytic derivatives.

use crate::imports::*;

pub mod solver;

pub use solver::{InteriorPointSolver, SolverOptions};

/// Bound magnitude at or above which a bound is treated as absent.
pub const INF_BOUND: f64 = 1.0e19;

/// A nonlinear program in block-separable form.
///
/// Constraint rows may receive contributions from several blocks; the solver
/// sums them. Objective contributions are likewise summed over blocks.
pub trait Nlp {
    fn n_variables(&self) -> usize;
    fn n_constraints(&self) -> usize;
    fn n_blocks(&self) -> usize;

    /// Decision-variable indices read by `block`, in the order the block's
    /// local slice is laid out.
    fn block_variables(&self, block: usize) -> Vec<usize>;

    /// Constraint rows written by `block`, in the order of the local
    /// constraint slice passed to [`Nlp::eval_block`].
    fn block_constraints(&self, block: usize) -> Vec<usize>;

    /// Evaluate one block: add constraint contributions into `g` (ordered as
    /// [`Nlp::block_constraints`]) and return the objective contribution.
    fn eval_block<T: DualNum<f64> + Copy>(&self, block: usize, x: &[T], p: &[T], g: &mut [T])
        -> T;

    /// Number of sensitivity parameters the problem exposes.
    fn n_parameters(&self) -> usize {
        0
    }

    /// Nominal values of the sensitivity parameters.
    fn parameter_values(&self) -> Vec<f64> {
        Vec::new()
    }
}

/// Variable and constraint-row bounds. Equality rows have
/// `g_lower == g_upper`.
#[derive(Clone, Debug)]
pub struct NlpBounds {
    pub x_lower: Vec<f64>,
    pub x_upper: Vec<f64>,
    pub g_lower: Vec<f64>,
    pub g_upper: Vec<f64>,
}

impl NlpBounds {
    pub fn unbounded(n_variables: usize, n_constraints: usize) -> Self {
        Self {
            x_lower: vec![-INF_BOUND; n_variables],
            x_upper: vec![INF_BOUND; n_variables],
            g_lower: vec![0.0; n_constraints],
            g_upper: vec![0.0; n_constraints],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum SolveStatus {
    /// Converged to the requested tolerance
    Solved,
    /// Ran out of iterations but met the acceptable tolerance
    SolvedToAcceptable,
}

/// Parameter sensitivities of the optimum, from implicit differentiation of
/// the KKT conditions at the solution.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct KktSensitivities {
    /// `dx/dp`, one inner vector of length `n_variables` per parameter
    pub dx_dp: Vec<Vec<f64>>,
    /// `dobjective/dp`, one entry per parameter
    pub dobjective_dp: Vec<f64>,
}

/// Primal-dual solution of an [`Nlp`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NlpSolution {
    pub x: Vec<f64>,
    pub objective: f64,
    pub constraints: Vec<f64>,
    /// Equality/inequality multipliers, one per constraint row
    pub lambda: Vec<f64>,
    /// Lower/upper bound multipliers over the solver's augmented variable
    /// vector (decision variables followed by inequality slacks); reusable
    /// verbatim for a warm start of a structurally identical problem.
    pub z_lower: Vec<f64>,
    pub z_upper: Vec<f64>,
    pub iterations: usize,
    pub status: SolveStatus,
    pub constraint_violation: f64,
    pub dual_infeasibility: f64,
    pub sensitivities: Option<KktSensitivities>,
}

/// Primal-dual warm-start data, shaped like the corresponding
/// [`NlpSolution`] fields.
#[derive(Clone, Debug)]
pub struct WarmStart {
    pub lambda: Vec<f64>,
    pub z_lower: Vec<f64>,
    pub z_upper: Vec<f64>,
}

pub(crate) fn dual_vec(x: &[f64]) -> Vec<Dual64> {
    x.iter().map(|&v| Dual64::from(v)).collect()
}

pub(crate) fn dual_vec_seeded(x: &[f64], j: usize) -> Vec<Dual64> {
    let mut out = dual_vec(x);
    out[j].eps = 1.0;
    out
}

pub(crate) fn hyper_vec(x: &[f64]) -> Vec<HyperDual64> {
    x.iter().map(|&v| HyperDual64::from(v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nlp::solver::InteriorPointSolver;

    /// min (x0 - 1)^2 + (x1 - 2.5)^2
    /// s.t. x0 - 2 x1 + 2 >= 0, -x0 - 2 x1 + 6 >= 0, -x0 + 2 x1 + 2 >= 0,
    ///      x >= 0
    /// (a standard QP with solution (1.4, 1.7))
    struct Hs21ish;

    impl Nlp for Hs21ish {
        fn n_variables(&self) -> usize {
            2
        }
        fn n_constraints(&self) -> usize {
            3
        }
        fn n_blocks(&self) -> usize {
            1
        }
        fn block_variables(&self, _block: usize) -> Vec<usize> {
            vec![0, 1]
        }
        fn block_constraints(&self, _block: usize) -> Vec<usize> {
            vec![0, 1, 2]
        }
        fn eval_block<T: DualNum<f64> + Copy>(
            &self,
            _block: usize,
            x: &[T],
            _p: &[T],
            g: &mut [T],
        ) -> T {
            g[0] = x[0] - x[1] * 2.0 + 2.0;
            g[1] = -x[0] - x[1] * 2.0 + 6.0;
            g[2] = -x[0] + x[1] * 2.0 + 2.0;
            (x[0] - 1.0).powi(2) + (x[1] - 2.5).powi(2)
        }
    }

    #[test]
    fn test_qp_with_inequalities() {
        let nlp = Hs21ish;
        let mut bounds = NlpBounds::unbounded(2, 3);
        bounds.x_lower = vec![0.0, 0.0];
        bounds.g_lower = vec![0.0, 0.0, 0.0];
        bounds.g_upper = vec![INF_BOUND, INF_BOUND, INF_BOUND];
        let solution = InteriorPointSolver::new(SolverOptions::default())
            .solve(&nlp, &[2.0, 0.0], &bounds, None)
            .unwrap();
        assert!(almost_eq(solution.x[0], 1.4, Some(1e-6)));
        assert!(almost_eq(solution.x[1], 1.7, Some(1e-6)));
        assert_eq!(solution.status, SolveStatus::Solved);
    }

    /// min x0 * x3 * (x0 + x1 + x2) + x2
    /// s.t. x0 x1 x2 x3 >= 25, x0^2 + ... = 40, 1 <= x <= 5  (HS071)
    struct Hs071;

    impl Nlp for Hs071 {
        fn n_variables(&self) -> usize {
            4
        }
        fn n_constraints(&self) -> usize {
            2
        }
        fn n_blocks(&self) -> usize {
            1
        }
        fn block_variables(&self, _block: usize) -> Vec<usize> {
            vec![0, 1, 2, 3]
        }
        fn block_constraints(&self, _block: usize) -> Vec<usize> {
            vec![0, 1]
        }
        fn eval_block<T: DualNum<f64> + Copy>(
            &self,
            _block: usize,
            x: &[T],
            _p: &[T],
            g: &mut [T],
        ) -> T {
            g[0] = x[0] * x[1] * x[2] * x[3];
            g[1] = x[0] * x[0] + x[1] * x[1] + x[2] * x[2] + x[3] * x[3];
            x[0] * x[3] * (x[0] + x[1] + x[2]) + x[2]
        }
    }

    #[test]
    fn test_hs071() {
        let nlp = Hs071;
        let bounds = NlpBounds {
            x_lower: vec![1.0; 4],
            x_upper: vec![5.0; 4],
            g_lower: vec![25.0, 40.0],
            g_upper: vec![INF_BOUND, 40.0],
        };
        let solution = InteriorPointSolver::new(SolverOptions::default())
            .solve(&nlp, &[1.0, 5.0, 5.0, 1.0], &bounds, None)
            .unwrap();
        // known optimum
        assert!(almost_eq(solution.objective, 17.014017, Some(1e-5)));
        assert!(almost_eq(solution.x[0], 1.0, Some(1e-5)));
        assert!(almost_eq(solution.x[3], 1.3794083, Some(1e-4)));
    }

    /// Rosenbrock in block form: one block per term pair, testing that
    /// additive block contributions assemble correctly.
    struct RosenbrockChain {
        n: usize,
    }

    impl Nlp for RosenbrockChain {
        fn n_variables(&self) -> usize {
            self.n
        }
        fn n_constraints(&self) -> usize {
            0
        }
        fn n_blocks(&self) -> usize {
            self.n - 1
        }
        fn block_variables(&self, block: usize) -> Vec<usize> {
            vec![block, block + 1]
        }
        fn block_constraints(&self, _block: usize) -> Vec<usize> {
            vec![]
        }
        fn eval_block<T: DualNum<f64> + Copy>(
            &self,
            _block: usize,
            x: &[T],
            _p: &[T],
            _g: &mut [T],
        ) -> T {
            (x[1] - x[0] * x[0]).powi(2) * 100.0 + (-x[0] + 1.0).powi(2)
        }
    }

    #[test]
    fn test_unconstrained_block_chain() {
        let nlp = RosenbrockChain { n: 6 };
        let bounds = NlpBounds::unbounded(6, 0);
        let solution = InteriorPointSolver::new(SolverOptions::default())
            .solve(&nlp, &[-1.2, 1.0, -1.2, 1.0, -1.2, 1.0], &bounds, None)
            .unwrap();
        for xi in &solution.x {
            assert!(almost_eq(*xi, 1.0, Some(1e-6)));
        }
    }

    /// Parameterized equality-constrained problem for the KKT sensitivity
    /// path: min (x - p)^2 with x free gives x* = p, dx/dp = 1.
    struct Shifted;

    impl Nlp for Shifted {
        fn n_variables(&self) -> usize {
            1
        }
        fn n_constraints(&self) -> usize {
            0
        }
        fn n_blocks(&self) -> usize {
            1
        }
        fn block_variables(&self, _block: usize) -> Vec<usize> {
            vec![0]
        }
        fn block_constraints(&self, _block: usize) -> Vec<usize> {
            vec![]
        }
        fn eval_block<T: DualNum<f64> + Copy>(
            &self,
            _block: usize,
            x: &[T],
            p: &[T],
            _g: &mut [T],
        ) -> T {
            (x[0] - p[0]).powi(2)
        }
        fn n_parameters(&self) -> usize {
            1
        }
        fn parameter_values(&self) -> Vec<f64> {
            vec![3.0]
        }
    }

    #[test]
    fn test_kkt_sensitivity_of_unconstrained_minimum() {
        let nlp = Shifted;
        let bounds = NlpBounds::unbounded(1, 0);
        let mut options = SolverOptions::default();
        options.compute_sensitivity = true;
        let solution = InteriorPointSolver::new(options)
            .solve(&nlp, &[0.0], &bounds, None)
            .unwrap();
        assert!(almost_eq(solution.x[0], 3.0, Some(1e-7)));
        let sens = solution.sensitivities.unwrap();
        assert!(almost_eq(sens.dx_dp[0][0], 1.0, Some(1e-6)));
    }
}
