//! Steady-state cornering solutions and the gg diagram.
//!
//! The plain equilibrium solve is a damped Newton iteration on the model's
//! residuals with AD Jacobians; the acceleration envelope is found by
//! maximizing the free acceleration under the same equilibrium equations and
//! the tire-health inequalities, reusing the interior-point solver.

use crate::imports::*;
use crate::nlp::{InteriorPointSolver, Nlp, NlpBounds, SolverOptions};
use crate::traits::Linspace;
use crate::vehicle::VehicleModel;
use nalgebra::{DMatrix, DVector};

/// One converged equilibrium.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SteadyStatePoint {
    pub v: f64,
    pub ax: f64,
    pub ay: f64,
    pub q: Vec<f64>,
    pub qa: Vec<f64>,
    pub u: Vec<f64>,
    /// Raw unknown vector, reusable to seed a neighboring solve
    pub unknowns: Vec<f64>,
}

/// Acceleration envelope at fixed speed.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GgDiagram {
    pub v: f64,
    pub ay: Array1<f64>,
    pub ax_max: Array1<f64>,
    pub ax_min: Array1<f64>,
}

pub struct SteadyState<'a, M: VehicleModel> {
    car: &'a M,
    pub max_iter: usize,
    pub tol: f64,
}

impl<'a, M: VehicleModel> SteadyState<'a, M> {
    pub fn new(car: &'a M) -> Self {
        Self {
            car,
            max_iter: 60,
            tol: 1e-10,
        }
    }

    /// Solves the equilibrium at forward speed `v` under imposed body-frame
    /// accelerations `(ax, ay)`.
    pub fn solve(&self, v: f64, ax: f64, ay: f64) -> anyhow::Result<SteadyStatePoint> {
        let guess = self.car.steady_state_guess(v);
        self.solve_from(v, ax, ay, guess)
    }

    fn solve_from(
        &self,
        v: f64,
        ax: f64,
        ay: f64,
        mut x: Vec<f64>,
    ) -> anyhow::Result<SteadyStatePoint> {
        let n = x.len();
        let mut r = vec![0.0; n];
        for _ in 0..self.max_iter {
            self.car.steady_state_residuals(v, ax, ay, &x, &mut r)?;
            let norm = r.iter().fold(0.0_f64, |a, v| a.max(v.abs()));
            if norm <= self.tol {
                let (q, qa, u) = self.car.steady_state_unpack(v, &x);
                return Ok(SteadyStatePoint {
                    v,
                    ax,
                    ay,
                    q,
                    qa,
                    u,
                    unknowns: x,
                });
            }

            // Jacobian column by column through the dual scalar
            let mut jac = DMatrix::zeros(n, n);
            for j in 0..n {
                let mut xd: Vec<Dual64> = x.iter().map(|&v| Dual64::from(v)).collect();
                xd[j].eps = 1.0;
                let mut rd = vec![Dual64::from(0.0); n];
                self.car
                    .steady_state_residuals(v, Dual64::from(ax), Dual64::from(ay), &xd, &mut rd)?;
                for i in 0..n {
                    jac[(i, j)] = rd[i].eps;
                }
            }
            let rhs = DVector::from_iterator(n, r.iter().map(|v| -v));
            let step = jac.lu().solve(&rhs).ok_or_else(|| {
                anyhow!(Error::NumericFailure(
                    "singular Jacobian in steady-state solve".into()
                ))
            })?;

            // damped update
            let mut alpha = 1.0;
            let mut accepted = false;
            for _ in 0..30 {
                let x_trial: Vec<f64> =
                    x.iter().zip(step.iter()).map(|(xi, di)| xi + alpha * di).collect();
                self.car.steady_state_residuals(v, ax, ay, &x_trial, &mut r)?;
                let trial_norm = r.iter().fold(0.0_f64, |a, v| a.max(v.abs()));
                if trial_norm < norm * (1.0 - 1e-4 * alpha) {
                    x = x_trial;
                    accepted = true;
                    break;
                }
                alpha *= 0.5;
            }
            if !accepted {
                bail!(Error::NumericFailure(
                    "steady-state line search stalled".into()
                ));
            }
        }
        bail!(Error::NumericFailure(format!(
            "steady state did not converge at v = {v}, ax = {ax}, ay = {ay}"
        )))
    }

    /// Sweeps lateral acceleration at fixed speed and reports the attainable
    /// longitudinal envelope at `n_points` samples.
    pub fn gg_diagram(&self, v: f64, n_points: usize) -> anyhow::Result<GgDiagram> {
        ensure!(
            n_points >= 2,
            Error::InputValidation("gg diagram needs at least two samples".into())
        );
        // lateral capacity first, then the ax range across the sweep
        let ay_peak = self.extremal(v, GgMode::MaxAy, 0.0, None)?;
        let ay_samples = Vec::linspace(-0.98 * ay_peak.1, 0.98 * ay_peak.1, n_points);

        let mut ax_max = Vec::with_capacity(n_points);
        let mut ax_min = Vec::with_capacity(n_points);
        let mut seed_max: Option<Vec<f64>> = None;
        let mut seed_min: Option<Vec<f64>> = None;
        for &ay in &ay_samples {
            let (x_max, a_max) = self.extremal(v, GgMode::MaxAx, ay, seed_max.take())?;
            let (x_min, a_min) = self.extremal(v, GgMode::MinAx, ay, seed_min.take())?;
            ax_max.push(a_max);
            ax_min.push(a_min);
            seed_max = Some(x_max);
            seed_min = Some(x_min);
        }
        Ok(GgDiagram {
            v,
            ay: Array1::from_vec(ay_samples),
            ax_max: Array1::from_vec(ax_max),
            ax_min: Array1::from_vec(ax_min),
        })
    }

    /// Maximizes the free acceleration under equilibrium and tire-health
    /// constraints; returns the unknown vector and the attained value.
    fn extremal(
        &self,
        v: f64,
        mode: GgMode,
        ay_fixed: f64,
        seed: Option<Vec<f64>>,
    ) -> anyhow::Result<(Vec<f64>, f64)> {
        let nlp = SteadyStateNlp {
            car: self.car,
            v,
            mode,
            ay_fixed,
            n_unknowns: self.car.steady_state_guess(v).len(),
            n_extras: self.car.layout().n_extra_constraints,
        };
        let (mut x_lower, mut x_upper) = self.car.steady_state_bounds();
        x_lower.push(-100.0);
        x_upper.push(100.0);
        let (extra_lower, extra_upper) = self.car.optimal_laptime_extra_constraints_bounds();
        let mut g_lower = vec![0.0; nlp.n_unknowns];
        let mut g_upper = vec![0.0; nlp.n_unknowns];
        g_lower.extend_from_slice(&extra_lower);
        g_upper.extend_from_slice(&extra_upper);
        let bounds = NlpBounds {
            x_lower,
            x_upper,
            g_lower,
            g_upper,
        };

        let mut x0 = seed.unwrap_or_else(|| {
            let mut guess = self.car.steady_state_guess(v);
            guess.push(0.0);
            guess
        });
        if x0.len() == nlp.n_unknowns {
            x0.push(0.0);
        }

        let options = SolverOptions {
            tol: 1e-8,
            acceptable_tol: 1e-6,
            max_iter: 200,
            ..Default::default()
        };
        let solution = InteriorPointSolver::new(options).solve(&nlp, &x0, &bounds, None)?;
        let value = solution.x[nlp.n_unknowns];
        Ok((solution.x, value))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GgMode {
    MaxAx,
    MinAx,
    MaxAy,
}

struct SteadyStateNlp<'a, M: VehicleModel> {
    car: &'a M,
    v: f64,
    mode: GgMode,
    ay_fixed: f64,
    n_unknowns: usize,
    n_extras: usize,
}

impl<M: VehicleModel> Nlp for SteadyStateNlp<'_, M> {
    fn n_variables(&self) -> usize {
        self.n_unknowns + 1
    }

    fn n_constraints(&self) -> usize {
        self.n_unknowns + self.n_extras
    }

    fn n_blocks(&self) -> usize {
        1
    }

    fn block_variables(&self, _block: usize) -> Vec<usize> {
        (0..self.n_variables()).collect()
    }

    fn block_constraints(&self, _block: usize) -> Vec<usize> {
        (0..self.n_constraints()).collect()
    }

    fn eval_block<T: DualNum<f64> + Copy>(
        &self,
        _block: usize,
        x: &[T],
        _p: &[T],
        g: &mut [T],
    ) -> T {
        let accel = x[self.n_unknowns];
        let (ax, ay) = match self.mode {
            GgMode::MaxAx | GgMode::MinAx => (accel, T::from(self.ay_fixed)),
            GgMode::MaxAy => (T::from(0.0), accel),
        };
        let unknowns = &x[..self.n_unknowns];
        let (residuals, extras) = {
            let mut r = vec![T::from(0.0); self.n_unknowns];
            self.car
                .steady_state_residuals(self.v, ax, ay, unknowns, &mut r)
                .expect("steady-state residual evaluation failed");
            let extras = self
                .car
                .steady_state_extra_constraints(self.v, ax, ay, unknowns)
                .expect("steady-state extras evaluation failed");
            (r, extras)
        };
        g[..self.n_unknowns].copy_from_slice(&residuals);
        g[self.n_unknowns..].copy_from_slice(&extras);
        match self.mode {
            GgMode::MinAx => accel,
            _ => -accel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle::f1_3dof::F1Car;
    use crate::vehicle::kart_6dof::KartCar;

    #[test]
    fn test_straight_running_equilibrium_f1() {
        let car = F1Car::default();
        let ss = SteadyState::new(&car);
        let point = ss.solve(40.0, 0.0, 0.0).unwrap();
        // symmetric straight running: no sideslip, no yaw rate, no steering
        assert!(point.unknowns[0].abs() < 1e-7);
        assert!(point.unknowns[1].abs() < 1e-7);
        assert!(point.unknowns[2].abs() < 1e-7);
        // loads sum to weight plus downforce
        let downforce =
            0.5 * car.rho * car.lift_coefficient * car.frontal_area * 40.0_f64.powi(2);
        let total: f64 = point.qa.iter().sum::<f64>() * car.mass * crate::vehicle::G;
        assert!(almost_eq(total, car.mass * crate::vehicle::G + downforce, Some(1e-6)));
    }

    #[test]
    fn test_cornering_equilibrium_steers_into_turn() {
        let car = F1Car::default();
        let ss = SteadyState::new(&car);
        let point = ss.solve(35.0, 0.0, 8.0).unwrap();
        // leftward acceleration requires positive yaw rate and steer
        assert!(point.q[2] > 0.0);
        assert!(point.u[0] > 0.0);
        assert!(almost_eq(point.q[2], 8.0 / 35.0, Some(1e-8)));
    }

    #[test]
    fn test_straight_running_equilibrium_kart() {
        let car = KartCar::default();
        let ss = SteadyState::new(&car);
        let point = ss.solve(10.0, 0.0, 0.0).unwrap();
        assert!(point.unknowns[0].abs() < 1e-7);
        // pitch trims slightly against drive torque and drag
        assert!(point.q[5].abs() < 0.01);
    }

    #[test]
    fn test_gg_diagram_envelope_shape() {
        let car = F1Car::default();
        let ss = SteadyState::new(&car);
        let gg = ss.gg_diagram(30.0, 7).unwrap();
        assert_eq!(gg.ay.len(), 7);
        // braking stronger than nothing, traction positive, envelope closes
        // toward the lateral extremes
        let mid = 3;
        assert!(gg.ax_max[mid] > 0.0);
        assert!(gg.ax_min[mid] < 0.0);
        let range_mid = gg.ax_max[mid] - gg.ax_min[mid];
        let range_edge = gg.ax_max[0] - gg.ax_min[0];
        assert!(range_edge < range_mid);
        // symmetric sweep
        assert!(almost_eq(gg.ay[0], -gg.ay[6], Some(1e-9)));
    }
}
