//! Single-track F1 model with a 3-DOF chassis in the small-pitch/small-roll
//! approximation. The four vertical tire loads are algebraic states closed
//! by vertical, roll, and pitch equilibrium plus the roll-balance
//! distribution.

use crate::imports::*;
use crate::track::TrackSurface;
use crate::utils::{smooth_neg, smooth_pos};
use crate::vehicle::{
    curvilinear_rates, road_point, tire::PacejkaTire, tire::TireState, DeclaredParameters,
    ModelOutputs, ParameterSet, StateLayout, VehicleModel, G,
};

pub const IU: usize = 0;
pub const IV: usize = 1;
pub const IOMEGA: usize = 2;
pub const ITIME: usize = 3;
pub const IN: usize = 4;
pub const IALPHA: usize = 5;
pub const NSTATE: usize = 6;
pub const NALGEBRAIC: usize = 4;
pub const NCONTROL: usize = 3;

const LAYOUT: StateLayout = StateLayout {
    n_states: NSTATE,
    n_algebraic: NALGEBRAIC,
    n_controls: NCONTROL,
    n_extra_constraints: 6,
    i_u: IU,
    i_v: IV,
    i_omega: IOMEGA,
    i_time: ITIME,
    i_n: IN,
    i_alpha: IALPHA,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct F1Car {
    pub mass: f64,
    pub inertia_z: f64,
    /// Front/rear axle longitudinal positions from the center of mass
    /// (both positive)
    pub front_axle_x: f64,
    pub rear_axle_x: f64,
    pub com_height: f64,
    pub front_track: f64,
    pub rear_track: f64,
    pub rho: f64,
    pub drag_coefficient: f64,
    pub lift_coefficient: f64,
    pub frontal_area: f64,
    /// Longitudinal position of the aerodynamic pressure center
    pub pressure_center_x: f64,
    pub maximum_power: f64,
    pub maximum_brake_force: f64,
    pub brake_bias_default: f64,
    /// Fraction of the lateral load transfer carried by the front axle
    pub roll_balance_coefficient: f64,
    /// Load floor keeping the slip-ratio inversion smooth near zero load
    pub fz_ref: f64,
    pub front_tire: PacejkaTire,
    pub rear_tire: PacejkaTire,
    pub kappa_max: f64,
    pub lambda_max: f64,
    pub declared: DeclaredParameters,
    #[serde(skip)]
    track: Option<Arc<TrackSurface>>,
}

impl Default for F1Car {
    fn default() -> Self {
        Self::from_parameters(&ParameterSet::default()).unwrap()
    }
}

/// Chassis-level force balance shared by the curvilinear evaluation and the
/// cartesian steady-state solve.
struct ChassisForces<T> {
    sum_fx: T,
    sum_fy: T,
    yaw_moment: T,
    downforce: T,
    residual: [T; 4],
    tires: [TireState<T>; 4],
    extras: [T; 6],
}

impl F1Car {
    pub fn from_parameters(params: &ParameterSet) -> anyhow::Result<Self> {
        let car = Self {
            mass: params.get_or("chassis/mass", 660.0),
            inertia_z: params.get_or("chassis/inertia", 450.0),
            front_axle_x: params.get_or("front-axle/x", 1.8),
            rear_axle_x: params.get_or("rear-axle/x", 1.6),
            com_height: params.get_or("chassis/com/h", 0.3),
            front_track: params.get_or("front-axle/track", 1.46),
            rear_track: params.get_or("rear-axle/track", 1.46),
            rho: params.get_or("chassis/aerodynamics/rho", 1.2),
            drag_coefficient: params.get_or("chassis/aerodynamics/cd", 0.9),
            lift_coefficient: params.get_or("chassis/aerodynamics/cl", 3.0),
            frontal_area: params.get_or("chassis/aerodynamics/area", 1.5),
            pressure_center_x: params.get_or("chassis/pressure_center/x", -0.1),
            maximum_power: params.get_or("engine/maximum-power", 560.0e3),
            maximum_brake_force: params.get_or("brakes/maximum-force", 26.0e3),
            brake_bias_default: params.get_or("chassis/brake_bias", 0.6),
            roll_balance_coefficient: params.get_or("chassis/roll_balance_coefficient", 0.5),
            fz_ref: params.get_or("tires/fz-ref", 50.0),
            front_tire: PacejkaTire {
                b_y: params.get_or("front-tire/b-y", 12.0),
                c_y: params.get_or("front-tire/c-y", 1.4),
                mu_y: params.get_or("front-tire/mu-y", 1.7),
                b_x: params.get_or("front-tire/b-x", 14.0),
                c_x: params.get_or("front-tire/c-x", 1.6),
                mu_x: params.get_or("front-tire/mu-x", 1.6),
            },
            rear_tire: PacejkaTire {
                b_y: params.get_or("rear-tire/b-y", 12.0),
                c_y: params.get_or("rear-tire/c-y", 1.4),
                mu_y: params.get_or("rear-tire/mu-y", 1.7),
                b_x: params.get_or("rear-tire/b-x", 14.0),
                c_x: params.get_or("rear-tire/c-x", 1.6),
                mu_x: params.get_or("rear-tire/mu-x", 1.6),
            },
            kappa_max: params.get_or("tires/kappa-max", 0.11),
            lambda_max: params.get_or("tires/lambda-max", 0.11),
            declared: DeclaredParameters::default(),
            track: None,
        };
        car.layout().validate()?;
        Ok(car)
    }

    /// Declared-parameter override with fallback to the built value.
    fn coef<T: DualNum<f64> + Copy>(&self, path: &str, base: f64, s: f64, p: &[T]) -> T {
        self.declared
            .lookup(path, s, p)
            .unwrap_or_else(|| T::from(base))
    }

    #[allow(clippy::too_many_arguments)]
    fn chassis_forces<T: DualNum<f64> + Copy>(
        &self,
        u: T,
        v: T,
        omega: T,
        fz: [T; 4],
        delta: T,
        throttle: T,
        brake_bias: T,
        s: f64,
        p: &[T],
    ) -> ChassisForces<T> {
        let mass = self.coef("chassis/mass", self.mass, s, p);
        let h = self.coef("chassis/com/h", self.com_height, s, p);
        let a = self.coef("front-axle/x", self.front_axle_x, s, p);
        let b = self.coef("rear-axle/x", self.rear_axle_x, s, p);
        let cd = self.coef("chassis/aerodynamics/cd", self.drag_coefficient, s, p);
        let cl = self.coef("chassis/aerodynamics/cl", self.lift_coefficient, s, p);
        let x_aero = self.coef("chassis/pressure_center/x", self.pressure_center_x, s, p);
        let power = self.coef("engine/maximum-power", self.maximum_power, s, p);
        let brake_force = self.coef("brakes/maximum-force", self.maximum_brake_force, s, p);
        let balance = self.coef(
            "chassis/roll_balance_coefficient",
            self.roll_balance_coefficient,
            s,
            p,
        );

        let q_dyn = 0.5 * self.rho * self.frontal_area;
        let drag = u * u * cd * q_dyn;
        let downforce = u * u * cl * q_dyn;

        // tire layout fl, fr, rl, rr; y positive to the left
        let x_t = [a, a, -b, -b];
        let y_t = [
            T::from(0.5 * self.front_track),
            T::from(-0.5 * self.front_track),
            T::from(0.5 * self.rear_track),
            T::from(-0.5 * self.rear_track),
        ];

        let throttle_pos = smooth_pos(throttle, 1e-3);
        let throttle_neg = smooth_neg(throttle, 1e-3);
        let engine_per_wheel = throttle_pos * power / u * 0.5;
        let front_brake_per_wheel = throttle_neg * brake_force * brake_bias * 0.5;
        let rear_brake_per_wheel =
            throttle_neg * brake_force * (-brake_bias + 1.0) * 0.5;

        let mut tires = [TireState::<T>::default(); 4];
        let mut sum_fx = -drag;
        let mut sum_fy = T::from(0.0);
        let mut yaw_moment = T::from(0.0);
        let mut roll_moment = T::from(0.0);
        let mut pitch_moment = x_aero * downforce;
        let (sin_d, cos_d) = delta.sin_cos();

        for i in 0..4 {
            let front = i < 2;
            let tire = if front { &self.front_tire } else { &self.rear_tire };
            let vx = u - omega * y_t[i];
            let vy = v + omega * x_t[i];
            let slip = (vy / vx).atan();
            let lambda = if front { delta - slip } else { -slip };
            let fy_tire = tire.lateral_force(lambda, fz[i]);
            let fx_tire = if front {
                front_brake_per_wheel
            } else {
                engine_per_wheel + rear_brake_per_wheel
            };
            let kappa = tire.slip_ratio_for_force(fx_tire, fz[i], self.fz_ref);

            // project wheel-frame forces into the body frame
            let (fx_body, fy_body) = if front {
                (
                    fx_tire * cos_d - fy_tire * sin_d,
                    fx_tire * sin_d + fy_tire * cos_d,
                )
            } else {
                (fx_tire, fy_tire)
            };

            sum_fx += fx_body;
            sum_fy += fy_body;
            yaw_moment += x_t[i] * fy_body - y_t[i] * fx_body;
            roll_moment += y_t[i] * fz[i];
            pitch_moment += -(fx_body * h) - x_t[i] * fz[i];

            tires[i] = TireState {
                x: T::from(0.0),
                y: T::from(0.0),
                kappa,
                lambda,
                fx: fx_tire,
                fy: fy_tire,
                fz: fz[i],
                dissipation: tire.dissipation(fx_tire, fy_tire, kappa, lambda, vx),
            };
        }
        roll_moment += sum_fy * h;

        let weight = mass * G;
        let residual = [
            (fz[0] + fz[1] + fz[2] + fz[3] - downforce - weight) / weight,
            roll_moment / weight,
            pitch_moment / weight,
            (fz[1] - fz[0] - (fz[1] + fz[3] - fz[0] - fz[2]) * balance) / weight,
        ];
        let extras = [
            tires[2].kappa,
            tires[3].kappa,
            tires[0].lambda,
            tires[1].lambda,
            tires[2].lambda,
            tires[3].lambda,
        ];

        ChassisForces {
            sum_fx,
            sum_fy,
            yaw_moment,
            downforce,
            residual,
            tires,
            extras,
        }
    }
}

impl VehicleModel for F1Car {
    fn kind(&self) -> &'static str {
        "f1-3dof"
    }

    fn layout(&self) -> &StateLayout {
        &LAYOUT
    }

    fn is_direct_default(&self) -> bool {
        true
    }

    fn track(&self) -> Option<&Arc<TrackSurface>> {
        self.track.as_ref()
    }

    fn change_track(&mut self, track: Arc<TrackSurface>) {
        self.track = Some(track);
    }

    fn declared(&self) -> &DeclaredParameters {
        &self.declared
    }

    fn declared_mut(&mut self) -> &mut DeclaredParameters {
        &mut self.declared
    }

    fn set_parameter(&mut self, path: &str, value: f64) -> anyhow::Result<()> {
        match path {
            "chassis/mass" => self.mass = value,
            "chassis/inertia" => self.inertia_z = value,
            "chassis/com/h" => self.com_height = value,
            "chassis/aerodynamics/cd" => self.drag_coefficient = value,
            "chassis/aerodynamics/cl" => self.lift_coefficient = value,
            "chassis/aerodynamics/area" => self.frontal_area = value,
            "chassis/aerodynamics/rho" => self.rho = value,
            "chassis/pressure_center/x" => self.pressure_center_x = value,
            "chassis/roll_balance_coefficient" => self.roll_balance_coefficient = value,
            "chassis/brake_bias" => self.brake_bias_default = value,
            "front-axle/x" => self.front_axle_x = value,
            "rear-axle/x" => self.rear_axle_x = value,
            "front-axle/track" => self.front_track = value,
            "rear-axle/track" => self.rear_track = value,
            "engine/maximum-power" => self.maximum_power = value,
            "brakes/maximum-force" => self.maximum_brake_force = value,
            "tires/kappa-max" => self.kappa_max = value,
            "tires/lambda-max" => self.lambda_max = value,
            "front-tire/b-y" => self.front_tire.b_y = value,
            "front-tire/c-y" => self.front_tire.c_y = value,
            "front-tire/mu-y" => self.front_tire.mu_y = value,
            "rear-tire/b-y" => self.rear_tire.b_y = value,
            "rear-tire/c-y" => self.rear_tire.c_y = value,
            "rear-tire/mu-y" => self.rear_tire.mu_y = value,
            _ => bail!(Error::LookupMiss(format!(
                "unknown parameter {path:?} on f1-3dof"
            ))),
        }
        Ok(())
    }

    fn evaluate<T: DualNum<f64> + Copy>(
        &self,
        q: &[T],
        qa: &[T],
        u_ctl: &[T],
        s: f64,
        p: &[T],
    ) -> anyhow::Result<ModelOutputs<T>> {
        ensure!(
            q.len() == NSTATE && qa.len() == NALGEBRAIC && u_ctl.len() == NCONTROL,
            Error::Internal("f1-3dof evaluation with mismatched vector sizes".into())
        );
        let track = self.track.as_ref().ok_or_else(|| {
            anyhow!(Error::InputValidation(
                "vehicle is not bound to a track".into()
            ))
        })?;
        let road = road_point(track, s)?;

        let (u, v, omega) = (q[IU], q[IV], q[IOMEGA]);
        let (n, alpha) = (q[IN], q[IALPHA]);
        let mass = self.coef("chassis/mass", self.mass, s, p);
        let inertia = self.coef("chassis/inertia", self.inertia_z, s, p);
        let weight = mass * G;
        let fz = [qa[0] * weight, qa[1] * weight, qa[2] * weight, qa[3] * weight];

        let forces = self.chassis_forces(
            u, v, omega, fz, u_ctl[0], u_ctl[1], u_ctl[2], s, p,
        );

        let dudt = forces.sum_fx / mass + v * omega;
        let dvdt = forces.sum_fy / mass - u * omega;
        let domegadt = forces.yaw_moment / inertia;

        let (dtds, dnds, dalphads) = curvilinear_rates(&road, u, v, omega, n, alpha);

        let mut dqds = vec![T::from(0.0); NSTATE];
        dqds[IU] = dudt * dtds;
        dqds[IV] = dvdt * dtds;
        dqds[IOMEGA] = domegadt * dtds;
        dqds[ITIME] = dtds;
        dqds[IN] = dnds;
        dqds[IALPHA] = dalphads;

        let psi = alpha + road.theta;
        let x = n * road.theta.sin() + road.xc;
        let y = -(n * road.theta.cos()) + road.yc;

        // contact patch positions in the road frame
        let mut tires = forces.tires;
        let a = self.coef("front-axle/x", self.front_axle_x, s, p);
        let b = self.coef("rear-axle/x", self.rear_axle_x, s, p);
        let x_t = [a, a, -b, -b];
        let y_t = [
            T::from(0.5 * self.front_track),
            T::from(-0.5 * self.front_track),
            T::from(0.5 * self.rear_track),
            T::from(-0.5 * self.rear_track),
        ];
        let (sin_psi, cos_psi) = psi.sin_cos();
        for i in 0..4 {
            tires[i].x = x + x_t[i] * cos_psi - y_t[i] * sin_psi;
            tires[i].y = y + x_t[i] * sin_psi + y_t[i] * cos_psi;
        }

        let dissipation = tires
            .iter()
            .fold(T::from(0.0), |acc, t| acc + t.dissipation);
        let wheelbase = self.front_axle_x + self.rear_axle_x;
        let understeer = u_ctl[0] - omega * wheelbase / u;

        Ok(ModelOutputs {
            dqds,
            residual: forces.residual.to_vec(),
            extra_constraints: forces.extras.to_vec(),
            tires,
            ax: forces.sum_fx / mass,
            ay: forces.sum_fy / mass,
            x,
            y,
            psi,
            understeer,
            dissipation,
        })
    }

    fn optimal_laptime_state_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        let mut lower = vec![0.0; NSTATE];
        let mut upper = vec![0.0; NSTATE];
        lower[IU] = 5.0;
        upper[IU] = 100.0;
        lower[IV] = -8.0;
        upper[IV] = 8.0;
        lower[IOMEGA] = -3.5;
        upper[IOMEGA] = 3.5;
        lower[ITIME] = 0.0;
        upper[ITIME] = 1.0e9;
        lower[IN] = -30.0;
        upper[IN] = 30.0;
        lower[IALPHA] = -0.8;
        upper[IALPHA] = 0.8;
        (lower, upper)
    }

    fn optimal_laptime_algebraic_state_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        (vec![0.0; NALGEBRAIC], vec![3.0; NALGEBRAIC])
    }

    fn optimal_laptime_control_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        (vec![-0.35, -1.0, 0.1], vec![0.35, 1.0, 0.9])
    }

    fn optimal_laptime_control_derivative_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        (vec![-2.0, -10.0, -1.0], vec![2.0, 10.0, 1.0])
    }

    fn optimal_laptime_extra_constraints_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        let lower = vec![
            -self.kappa_max,
            -self.kappa_max,
            -self.lambda_max,
            -self.lambda_max,
            -self.lambda_max,
            -self.lambda_max,
        ];
        let upper = lower.iter().map(|v| -v).collect();
        (lower, upper)
    }

    fn state_names(&self) -> Vec<String> {
        ["u", "v", "omega", "time", "n", "alpha"]
            .map(String::from)
            .to_vec()
    }

    fn algebraic_state_names(&self) -> Vec<String> {
        ["Fz_fl", "Fz_fr", "Fz_rl", "Fz_rr"].map(String::from).to_vec()
    }

    fn control_names(&self) -> Vec<String> {
        ["delta", "throttle", "brake-bias"].map(String::from).to_vec()
    }

    fn default_dissipations(&self) -> Vec<f64> {
        vec![50.0, 1.0, 10.0]
    }

    fn drag_coefficient(&self) -> f64 {
        self.drag_coefficient
    }

    fn steady_state_guess(&self, v: f64) -> Vec<f64> {
        let drag = 0.5 * self.rho * self.drag_coefficient * self.frontal_area * v * v;
        let throttle = (drag * v / self.maximum_power).clamp(0.0, 0.9);
        let downforce = 0.5 * self.rho * self.lift_coefficient * self.frontal_area * v * v;
        let total = 1.0 + downforce / (self.mass * G);
        let wheelbase = self.front_axle_x + self.rear_axle_x;
        let front = 0.5 * total * self.rear_axle_x / wheelbase;
        let rear = 0.5 * total * self.front_axle_x / wheelbase;
        vec![0.0, 0.0, 0.0, throttle, front, front, rear, rear]
    }

    fn steady_state_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        (
            vec![-8.0, -3.5, -0.35, -1.0, 0.0, 0.0, 0.0, 0.0],
            vec![8.0, 3.5, 0.35, 1.0, 3.0, 3.0, 3.0, 3.0],
        )
    }

    fn steady_state_residuals<T: DualNum<f64> + Copy>(
        &self,
        v: f64,
        ax: T,
        ay: T,
        unknowns: &[T],
        r: &mut [T],
    ) -> anyhow::Result<()> {
        ensure!(
            unknowns.len() == 8 && r.len() == 8,
            Error::Internal("f1-3dof steady state expects 8 unknowns".into())
        );
        let p: Vec<T> = self.declared.values().iter().map(|&x| T::from(x)).collect();
        let mass = self.coef("chassis/mass", self.mass, 0.0, &p);
        let weight = mass * G;
        let fz = [
            unknowns[4] * weight,
            unknowns[5] * weight,
            unknowns[6] * weight,
            unknowns[7] * weight,
        ];
        let forces = self.chassis_forces(
            T::from(v),
            unknowns[0],
            unknowns[1],
            fz,
            unknowns[2],
            unknowns[3],
            T::from(self.brake_bias_default),
            0.0,
            &p,
        );
        r[0] = forces.sum_fx / mass - ax;
        r[1] = forces.sum_fy / mass - ay;
        r[2] = forces.yaw_moment / (mass * (self.front_axle_x + self.rear_axle_x));
        r[3] = unknowns[1] - ay * (1.0 / v);
        r[4] = forces.residual[0];
        r[5] = forces.residual[1];
        r[6] = forces.residual[2];
        r[7] = forces.residual[3];
        Ok(())
    }

    fn steady_state_extra_constraints<T: DualNum<f64> + Copy>(
        &self,
        v: f64,
        _ax: T,
        _ay: T,
        unknowns: &[T],
    ) -> anyhow::Result<Vec<T>> {
        let p: Vec<T> = self.declared.values().iter().map(|&x| T::from(x)).collect();
        let mass = self.coef("chassis/mass", self.mass, 0.0, &p);
        let weight = mass * G;
        let fz = [
            unknowns[4] * weight,
            unknowns[5] * weight,
            unknowns[6] * weight,
            unknowns[7] * weight,
        ];
        let forces = self.chassis_forces(
            T::from(v),
            unknowns[0],
            unknowns[1],
            fz,
            unknowns[2],
            unknowns[3],
            T::from(self.brake_bias_default),
            0.0,
            &p,
        );
        Ok(forces.extras.to_vec())
    }

    fn steady_state_unpack(&self, v: f64, unknowns: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let mut q = vec![0.0; NSTATE];
        q[IU] = v;
        q[IV] = unknowns[0];
        q[IOMEGA] = unknowns[1];
        let qa = unknowns[4..8].to_vec();
        let u = vec![unknowns[2], unknowns[3], self.brake_bias_default];
        (q, qa, u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::tests::ring_track;
    use crate::track::TrackSurface;

    fn car_on_ring() -> F1Car {
        let mut car = F1Car::default();
        let surface = TrackSurface::new(ring_track(100.0, 6.0, 128)).unwrap();
        car.change_track(Arc::new(surface));
        car
    }

    /// Static straight running: algebraic residuals vanish for the static
    /// load distribution at low speed.
    #[test]
    fn test_static_load_distribution_closes_residuals() {
        let car = car_on_ring();
        let v = 1e-3;
        let guess = car.steady_state_guess(v);
        let mut r = vec![0.0; 8];
        car.steady_state_residuals(v, 0.0, 0.0, &guess, &mut r)
            .unwrap();
        // vertical, roll, and roll-balance equilibria hold exactly at the
        // static distribution; pitch holds because drag is negligible here
        for (i, ri) in r[4..].iter().enumerate() {
            assert!(ri.abs() < 1e-6, "residual {i} = {ri}");
        }
    }

    #[test]
    fn test_evaluate_requires_track() {
        let car = F1Car::default();
        let q = vec![50.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let qa = vec![0.4, 0.4, 0.4, 0.4];
        let u = vec![0.0, 0.2, 0.6];
        assert!(car.evaluate(&q, &qa, &u, 0.0, &[]).is_err());
    }

    #[test]
    fn test_dtime_ds_on_centerline_matches_speed() {
        let car = car_on_ring();
        let speed = 50.0;
        let q = vec![speed, 0.0, 0.0, 0.0, 0.0, 0.0];
        let qa = vec![0.4, 0.4, 0.4, 0.4];
        let u = vec![0.0, 0.2, 0.6];
        let out = car.evaluate(&q, &qa, &u, 0.0, &[]).unwrap();
        assert!(almost_eq(out.dqds[ITIME], 1.0 / speed, Some(1e-9)));
    }

    #[test]
    fn test_braking_shifts_load_forward() {
        let car = car_on_ring();
        let q = vec![60.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let u_brake = vec![0.0, -0.8, 0.6];
        // solve the algebraic loads roughly by Newton on the residuals via
        // the steady-state interface instead; here just check the pitch
        // residual sign pushes the fronts up under braking
        let qa_static = vec![0.3, 0.3, 0.32, 0.32];
        let out = car.evaluate(&q, &qa_static, &u_brake, 0.0, &[]).unwrap();
        // positive pitch residual means the assumed distribution carries too
        // little front load while braking
        assert!(out.residual[2] > 0.0);
    }

    #[test]
    fn test_understeer_indicator_zero_at_kinematic_steer() {
        let car = car_on_ring();
        let speed = 40.0;
        let omega = 0.5;
        let wheelbase = car.front_axle_x + car.rear_axle_x;
        let delta = omega * wheelbase / speed;
        let q = vec![speed, 0.0, omega, 0.0, 0.0, 0.0];
        let qa = vec![0.4, 0.4, 0.4, 0.4];
        let u = vec![delta, 0.0, 0.6];
        let out = car.evaluate(&q, &qa, &u, 0.0, &[]).unwrap();
        assert!(out.understeer.abs() < 1e-12);
    }

    #[test]
    fn test_declared_parameter_overrides_mass() {
        let mut car = car_on_ring();
        car.declare_new_constant_parameter("chassis/mass", "m", 700.0)
            .unwrap();
        let p = car.declared().values();
        let q = vec![50.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let qa = vec![0.4, 0.4, 0.4, 0.4];
        let u = vec![0.0, 0.5, 0.6];
        let heavy = car.evaluate(&q, &qa, &u, 0.0, &p).unwrap();
        let nominal = car.evaluate(&q, &qa, &u, 0.0, &[660.0]).unwrap();
        // same force, larger mass, smaller acceleration
        assert!(heavy.ax.abs() < nominal.ax.abs());
    }

    #[test]
    fn test_set_parameter_unknown_path_is_lookup_miss() {
        let mut car = F1Car::default();
        let err = car.set_parameter("chassis/does-not-exist", 1.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::LookupMiss(_))
        ));
    }
}
