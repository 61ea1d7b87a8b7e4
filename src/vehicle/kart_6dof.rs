//! Kart model with a full 6-DOF chassis: in-plane motion plus heave, roll,
//! and pitch carried as differential states against the frame compliance.
//! No algebraic states; the rear axle is driven by a single torque control.

use crate::imports::*;
use crate::track::TrackSurface;
use crate::utils::smooth_pos;
use crate::vehicle::{
    curvilinear_rates, road_point, tire::PacejkaTire, tire::TireState, DeclaredParameters,
    ModelOutputs, ParameterSet, StateLayout, VehicleModel, G,
};

pub const IU: usize = 0;
pub const IV: usize = 1;
pub const IOMEGA: usize = 2;
pub const IZ: usize = 3;
pub const IPHI: usize = 4;
pub const IMU: usize = 5;
pub const IDZ: usize = 6;
pub const IDPHI: usize = 7;
pub const IDMU: usize = 8;
pub const ITIME: usize = 9;
pub const IN: usize = 10;
pub const IALPHA: usize = 11;
pub const NSTATE: usize = 12;
pub const NCONTROL: usize = 2;

const LAYOUT: StateLayout = StateLayout {
    n_states: NSTATE,
    n_algebraic: 0,
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
pub struct KartCar {
    pub mass: f64,
    pub inertia_x: f64,
    pub inertia_y: f64,
    pub inertia_z: f64,
    pub front_axle_x: f64,
    pub rear_axle_x: f64,
    pub com_height: f64,
    pub front_track: f64,
    pub rear_track: f64,
    /// Frame vertical stiffness and damping per corner
    pub corner_stiffness: f64,
    pub corner_damping: f64,
    pub wheel_radius: f64,
    pub maximum_torque: f64,
    pub rho: f64,
    pub drag_coefficient: f64,
    pub frontal_area: f64,
    pub fz_ref: f64,
    pub front_tire: PacejkaTire,
    pub rear_tire: PacejkaTire,
    pub kappa_max: f64,
    pub lambda_max: f64,
    pub declared: DeclaredParameters,
    #[serde(skip)]
    track: Option<Arc<TrackSurface>>,
}

impl Default for KartCar {
    fn default() -> Self {
        Self::from_parameters(&ParameterSet::default()).unwrap()
    }
}

struct KartForces<T> {
    sum_fx: T,
    sum_fy: T,
    yaw_moment: T,
    vertical_force: T,
    roll_moment: T,
    pitch_moment: T,
    tires: [TireState<T>; 4],
    extras: [T; 6],
}

impl KartCar {
    pub fn from_parameters(params: &ParameterSet) -> anyhow::Result<Self> {
        let car = Self {
            mass: params.get_or("chassis/mass", 165.0),
            inertia_x: params.get_or("chassis/inertia/ixx", 15.0),
            inertia_y: params.get_or("chassis/inertia/iyy", 20.0),
            inertia_z: params.get_or("chassis/inertia/izz", 28.0),
            front_axle_x: params.get_or("front-axle/x", 0.6),
            rear_axle_x: params.get_or("rear-axle/x", 0.445),
            com_height: params.get_or("chassis/com/h", 0.25),
            front_track: params.get_or("front-axle/track", 1.0),
            rear_track: params.get_or("rear-axle/track", 1.2),
            corner_stiffness: params.get_or("chassis/stiffness", 30.0e3),
            corner_damping: params.get_or("chassis/damping", 900.0),
            wheel_radius: params.get_or("rear-axle/wheel-radius", 0.139),
            maximum_torque: params.get_or("rear-axle/maximum-torque", 180.0),
            rho: params.get_or("chassis/aerodynamics/rho", 1.2),
            drag_coefficient: params.get_or("chassis/aerodynamics/cd", 0.8),
            frontal_area: params.get_or("chassis/aerodynamics/area", 0.6),
            fz_ref: params.get_or("tires/fz-ref", 20.0),
            front_tire: PacejkaTire {
                b_y: params.get_or("front-tire/b-y", 9.0),
                c_y: params.get_or("front-tire/c-y", 1.3),
                mu_y: params.get_or("front-tire/mu-y", 1.1),
                b_x: params.get_or("front-tire/b-x", 11.0),
                c_x: params.get_or("front-tire/c-x", 1.4),
                mu_x: params.get_or("front-tire/mu-x", 1.1),
            },
            rear_tire: PacejkaTire {
                b_y: params.get_or("rear-tire/b-y", 9.0),
                c_y: params.get_or("rear-tire/c-y", 1.3),
                mu_y: params.get_or("rear-tire/mu-y", 1.1),
                b_x: params.get_or("rear-tire/b-x", 11.0),
                c_x: params.get_or("rear-tire/c-x", 1.4),
                mu_x: params.get_or("rear-tire/mu-x", 1.1),
            },
            kappa_max: params.get_or("tires/kappa-max", 0.15),
            lambda_max: params.get_or("tires/lambda-max", 0.15),
            declared: DeclaredParameters::default(),
            track: None,
        };
        car.layout().validate()?;
        Ok(car)
    }

    fn coef<T: DualNum<f64> + Copy>(&self, path: &str, base: f64, s: f64, p: &[T]) -> T {
        self.declared
            .lookup(path, s, p)
            .unwrap_or_else(|| T::from(base))
    }

    fn static_corner_load(&self, front: bool) -> f64 {
        let wheelbase = self.front_axle_x + self.rear_axle_x;
        let share = if front {
            self.rear_axle_x / wheelbase
        } else {
            self.front_axle_x / wheelbase
        };
        0.5 * share * self.mass * G
    }

    /// Force balance at one chassis configuration. `z, phi, mu` are heave
    /// (up), roll (left up), and pitch (nose down); their rates enter the
    /// corner damping.
    #[allow(clippy::too_many_arguments)]
    fn chassis_forces<T: DualNum<f64> + Copy>(
        &self,
        u: T,
        v: T,
        omega: T,
        z: T,
        phi: T,
        pitch: T,
        dz: T,
        dphi: T,
        dpitch: T,
        delta: T,
        torque: T,
        s: f64,
        p: &[T],
    ) -> KartForces<T> {
        let h = self.coef("chassis/com/h", self.com_height, s, p);
        let a = self.coef("front-axle/x", self.front_axle_x, s, p);
        let b = self.coef("rear-axle/x", self.rear_axle_x, s, p);
        let cd = self.coef("chassis/aerodynamics/cd", self.drag_coefficient, s, p);
        let stiffness = self.coef("chassis/stiffness", self.corner_stiffness, s, p);
        let damping = self.coef("chassis/damping", self.corner_damping, s, p);
        let radius = self.coef("rear-axle/wheel-radius", self.wheel_radius, s, p);

        let drag = u * u * cd * (0.5 * self.rho * self.frontal_area);

        let x_t = [a, a, -b, -b];
        let y_t = [
            T::from(0.5 * self.front_track),
            T::from(-0.5 * self.front_track),
            T::from(0.5 * self.rear_track),
            T::from(-0.5 * self.rear_track),
        ];

        let rear_drive_per_wheel = torque / radius * 0.5;

        let mut tires = [TireState::<T>::default(); 4];
        let mut sum_fx = -drag;
        let mut sum_fy = T::from(0.0);
        let mut yaw_moment = T::from(0.0);
        let mut vertical_force = T::from(-self.mass * G);
        let mut roll_moment = T::from(0.0);
        let mut pitch_moment = T::from(0.0);
        let (sin_d, cos_d) = delta.sin_cos();

        for i in 0..4 {
            let front = i < 2;
            let tire = if front { &self.front_tire } else { &self.rear_tire };

            // frame compliance sets the vertical load at each corner
            let displacement = z + phi * y_t[i] - pitch * x_t[i];
            let rate = dz + dphi * y_t[i] - dpitch * x_t[i];
            let fz = -displacement * stiffness - rate * damping
                + self.static_corner_load(front);
            let fz_eff = smooth_pos(fz, self.fz_ref);

            let vx = u - omega * y_t[i];
            let vy = v + omega * x_t[i];
            let slip = (vy / vx).atan();
            let lambda = if front { delta - slip } else { -slip };
            let fy_tire = tire.lateral_force(lambda, fz_eff);
            let fx_tire = if front {
                T::from(0.0)
            } else {
                rear_drive_per_wheel
            };
            let kappa = tire.slip_ratio_for_force(fx_tire, fz_eff, self.fz_ref);

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
            vertical_force += fz;
            roll_moment += y_t[i] * fz;
            pitch_moment += -(fx_body * h) - x_t[i] * fz;

            tires[i] = TireState {
                x: T::from(0.0),
                y: T::from(0.0),
                kappa,
                lambda,
                fx: fx_tire,
                fy: fy_tire,
                fz,
                dissipation: tire.dissipation(fx_tire, fy_tire, kappa, lambda, vx),
            };
        }
        roll_moment += sum_fy * h;

        let extras = [
            tires[2].kappa,
            tires[3].kappa,
            tires[0].lambda,
            tires[1].lambda,
            tires[2].lambda,
            tires[3].lambda,
        ];

        KartForces {
            sum_fx,
            sum_fy,
            yaw_moment,
            vertical_force,
            roll_moment,
            pitch_moment,
            tires,
            extras,
        }
    }
}

impl VehicleModel for KartCar {
    fn kind(&self) -> &'static str {
        "kart-6dof"
    }

    fn layout(&self) -> &StateLayout {
        &LAYOUT
    }

    fn is_direct_default(&self) -> bool {
        false
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
            "chassis/inertia/ixx" => self.inertia_x = value,
            "chassis/inertia/iyy" => self.inertia_y = value,
            "chassis/inertia/izz" => self.inertia_z = value,
            "chassis/com/h" => self.com_height = value,
            "chassis/stiffness" => self.corner_stiffness = value,
            "chassis/damping" => self.corner_damping = value,
            "chassis/aerodynamics/cd" => self.drag_coefficient = value,
            "chassis/aerodynamics/area" => self.frontal_area = value,
            "chassis/aerodynamics/rho" => self.rho = value,
            "front-axle/x" => self.front_axle_x = value,
            "rear-axle/x" => self.rear_axle_x = value,
            "front-axle/track" => self.front_track = value,
            "rear-axle/track" => self.rear_track = value,
            "rear-axle/wheel-radius" => self.wheel_radius = value,
            "rear-axle/maximum-torque" => self.maximum_torque = value,
            "tires/kappa-max" => self.kappa_max = value,
            "tires/lambda-max" => self.lambda_max = value,
            "front-tire/mu-y" => self.front_tire.mu_y = value,
            "rear-tire/mu-y" => self.rear_tire.mu_y = value,
            _ => bail!(Error::LookupMiss(format!(
                "unknown parameter {path:?} on kart-6dof"
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
            q.len() == NSTATE && qa.is_empty() && u_ctl.len() == NCONTROL,
            Error::Internal("kart-6dof evaluation with mismatched vector sizes".into())
        );
        let track = self.track.as_ref().ok_or_else(|| {
            anyhow!(Error::InputValidation(
                "vehicle is not bound to a track".into()
            ))
        })?;
        let road = road_point(track, s)?;

        let (u, v, omega) = (q[IU], q[IV], q[IOMEGA]);
        let (z, phi, pitch) = (q[IZ], q[IPHI], q[IMU]);
        let (dz, dphi, dpitch) = (q[IDZ], q[IDPHI], q[IDMU]);
        let (n, alpha) = (q[IN], q[IALPHA]);

        let mass = self.coef("chassis/mass", self.mass, s, p);
        let forces = self.chassis_forces(
            u, v, omega, z, phi, pitch, dz, dphi, dpitch, u_ctl[0], u_ctl[1], s, p,
        );

        let dudt = forces.sum_fx / mass + v * omega;
        let dvdt = forces.sum_fy / mass - u * omega;
        let domegadt = forces.yaw_moment / self.inertia_z;
        let ddzdt = forces.vertical_force / mass;
        let ddphidt = forces.roll_moment / self.inertia_x;
        let ddpitchdt = forces.pitch_moment / self.inertia_y;

        let (dtds, dnds, dalphads) = curvilinear_rates(&road, u, v, omega, n, alpha);

        let mut dqds = vec![T::from(0.0); NSTATE];
        dqds[IU] = dudt * dtds;
        dqds[IV] = dvdt * dtds;
        dqds[IOMEGA] = domegadt * dtds;
        dqds[IZ] = dz * dtds;
        dqds[IPHI] = dphi * dtds;
        dqds[IMU] = dpitch * dtds;
        dqds[IDZ] = ddzdt * dtds;
        dqds[IDPHI] = ddphidt * dtds;
        dqds[IDMU] = ddpitchdt * dtds;
        dqds[ITIME] = dtds;
        dqds[IN] = dnds;
        dqds[IALPHA] = dalphads;

        let psi = alpha + road.theta;
        let x = n * road.theta.sin() + road.xc;
        let y = -(n * road.theta.cos()) + road.yc;

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
            residual: vec![],
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
        lower[IU] = 3.0;
        upper[IU] = 40.0;
        lower[IV] = -5.0;
        upper[IV] = 5.0;
        lower[IOMEGA] = -3.5;
        upper[IOMEGA] = 3.5;
        lower[IZ] = -0.05;
        upper[IZ] = 0.05;
        lower[IPHI] = -0.12;
        upper[IPHI] = 0.12;
        lower[IMU] = -0.12;
        upper[IMU] = 0.12;
        lower[IDZ] = -2.0;
        upper[IDZ] = 2.0;
        lower[IDPHI] = -5.0;
        upper[IDPHI] = 5.0;
        lower[IDMU] = -5.0;
        upper[IDMU] = 5.0;
        lower[ITIME] = 0.0;
        upper[ITIME] = 1.0e9;
        lower[IN] = -30.0;
        upper[IN] = 30.0;
        lower[IALPHA] = -0.8;
        upper[IALPHA] = 0.8;
        (lower, upper)
    }

    fn optimal_laptime_algebraic_state_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        (vec![], vec![])
    }

    fn optimal_laptime_control_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        (
            vec![-0.45, -self.maximum_torque],
            vec![0.45, self.maximum_torque],
        )
    }

    fn optimal_laptime_control_derivative_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        (vec![-3.0, -2000.0], vec![3.0, 2000.0])
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
        [
            "u", "v", "omega", "z", "phi", "mu", "dz", "dphi", "dmu", "time", "n", "alpha",
        ]
        .map(String::from)
        .to_vec()
    }

    fn algebraic_state_names(&self) -> Vec<String> {
        vec![]
    }

    fn control_names(&self) -> Vec<String> {
        ["delta", "torque"].map(String::from).to_vec()
    }

    fn default_dissipations(&self) -> Vec<f64> {
        vec![5.0, 1.0e-4]
    }

    fn drag_coefficient(&self) -> f64 {
        self.drag_coefficient
    }

    fn steady_state_guess(&self, v: f64) -> Vec<f64> {
        let drag = 0.5 * self.rho * self.drag_coefficient * self.frontal_area * v * v;
        let torque = (drag * self.wheel_radius).clamp(0.0, 0.8 * self.maximum_torque);
        vec![0.0, 0.0, 0.0, torque, 0.0, 0.0, 0.0]
    }

    fn steady_state_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        (
            vec![
                -5.0,
                -3.5,
                -0.45,
                -self.maximum_torque,
                -0.05,
                -0.12,
                -0.12,
            ],
            vec![5.0, 3.5, 0.45, self.maximum_torque, 0.05, 0.12, 0.12],
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
            unknowns.len() == 7 && r.len() == 7,
            Error::Internal("kart-6dof steady state expects 7 unknowns".into())
        );
        let p: Vec<T> = self.declared.values().iter().map(|&x| T::from(x)).collect();
        let zero = T::from(0.0);
        let forces = self.chassis_forces(
            T::from(v),
            unknowns[0],
            unknowns[1],
            unknowns[4],
            unknowns[5],
            unknowns[6],
            zero,
            zero,
            zero,
            unknowns[2],
            unknowns[3],
            0.0,
            &p,
        );
        let weight = self.mass * G;
        r[0] = forces.sum_fx * (1.0 / self.mass) - ax;
        r[1] = forces.sum_fy * (1.0 / self.mass) - ay;
        r[2] = forces.yaw_moment * (1.0 / (weight * 0.5));
        r[3] = unknowns[1] - ay * (1.0 / v);
        r[4] = forces.vertical_force * (1.0 / weight);
        r[5] = forces.roll_moment * (1.0 / weight);
        r[6] = forces.pitch_moment * (1.0 / weight);
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
        let zero = T::from(0.0);
        let forces = self.chassis_forces(
            T::from(v),
            unknowns[0],
            unknowns[1],
            unknowns[4],
            unknowns[5],
            unknowns[6],
            zero,
            zero,
            zero,
            unknowns[2],
            unknowns[3],
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
        q[IZ] = unknowns[4];
        q[IPHI] = unknowns[5];
        q[IMU] = unknowns[6];
        let u = vec![unknowns[2], unknowns[3]];
        (q, vec![], u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::tests::ring_track;
    use crate::track::TrackSurface;

    fn kart_on_ring() -> KartCar {
        let mut car = KartCar::default();
        let surface = TrackSurface::new(ring_track(40.0, 4.0, 128)).unwrap();
        car.change_track(Arc::new(surface));
        car
    }

    #[test]
    fn test_rest_configuration_is_equilibrium() {
        let car = kart_on_ring();
        let guess = car.steady_state_guess(8.0);
        let mut r = vec![0.0; 7];
        car.steady_state_residuals(8.0, 0.0, 0.0, &guess, &mut r)
            .unwrap();
        // vertical, roll, and pitch close exactly; longitudinal closes to
        // within the drag/torque rounding of the guess
        assert!(r[4].abs() < 1e-9);
        assert!(r[5].abs() < 1e-9);
        assert!(r[6].abs() < 1e-2);
    }

    #[test]
    fn test_heave_restoring_force() {
        let car = kart_on_ring();
        let mut q = vec![0.0; NSTATE];
        q[IU] = 10.0;
        q[IZ] = 0.01; // chassis lifted; springs must pull it back down
        let u = vec![0.0, 0.0];
        let out = car.evaluate(&q, &[], &u, 0.0, &[]).unwrap();
        let dtds = out.dqds[ITIME];
        let ddz_dt = out.dqds[IDZ] / dtds;
        assert!(ddz_dt < 0.0);
        let expected = -4.0 * car.corner_stiffness * 0.01 / car.mass;
        assert!(almost_eq(ddz_dt, expected, Some(1e-6)));
    }

    #[test]
    fn test_rear_torque_drives_forward() {
        let car = kart_on_ring();
        let mut q = vec![0.0; NSTATE];
        q[IU] = 10.0;
        let out = car.evaluate(&q, &[], &vec![0.0, 100.0], 0.0, &[]).unwrap();
        assert!(out.ax > 0.0);
        // both rear tires loaded with half the torque over the radius
        let per_wheel = 0.5 * 100.0 / car.wheel_radius;
        assert!(almost_eq(out.tires[2].fx, per_wheel, Some(1e-3)));
        assert!(almost_eq(out.tires[3].fx, per_wheel, Some(1e-3)));
    }

    #[test]
    fn test_kart_has_no_algebraic_state() {
        let car = KartCar::default();
        assert_eq!(car.layout().n_algebraic, 0);
        assert!(!car.is_direct_default());
    }

    #[test]
    fn test_kart_layout_adjacency() {
        KartCar::default().layout().validate().unwrap();
        assert_eq!(ITIME + 1, IN);
    }
}
