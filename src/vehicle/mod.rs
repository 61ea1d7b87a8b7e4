//! Vehicle dynamics models: the differentiable model contract, the tagged
//! vehicle enum handled uniformly by the solvers, and the property catalog.

use crate::imports::*;
use crate::track::TrackSurface;

pub mod f1_3dof;
pub mod kart_6dof;
pub mod parameters;
pub mod tire;

pub use parameters::{DeclaredParameters, ParameterSet};
pub use tire::{PacejkaTire, TireState};

pub const G: f64 = 9.81;

/// Semantic indices into the state vector of a model. The optimal-laptime
/// transcription relies on the elapsed-time slot sitting immediately before
/// the lateral-offset slot.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct StateLayout {
    pub n_states: usize,
    pub n_algebraic: usize,
    pub n_controls: usize,
    pub n_extra_constraints: usize,
    pub i_u: usize,
    pub i_v: usize,
    pub i_omega: usize,
    pub i_time: usize,
    pub i_n: usize,
    pub i_alpha: usize,
}

impl StateLayout {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.i_time + 1 == self.i_n,
            Error::Internal(format!(
                "state layout breaks the time/lateral-offset adjacency: i_time = {}, i_n = {}",
                self.i_time, self.i_n
            ))
        );
        ensure!(
            self.i_n < self.n_states && self.i_alpha < self.n_states,
            Error::Internal("road state indices exceed the state vector".into())
        );
        Ok(())
    }
}

/// Everything one model evaluation produces: the state derivative with
/// respect to arclength, algebraic residuals, tire-health constraint values,
/// and the derived inspectables consistent with this evaluation.
#[derive(Clone, Debug)]
pub struct ModelOutputs<T> {
    pub dqds: Vec<T>,
    pub residual: Vec<T>,
    pub extra_constraints: Vec<T>,
    /// fl, fr, rl, rr
    pub tires: [TireState<T>; 4],
    /// Body-frame accelerations
    pub ax: T,
    pub ay: T,
    /// Road-frame pose
    pub x: T,
    pub y: T,
    pub psi: T,
    pub understeer: T,
    /// Total tire dissipation power
    pub dissipation: T,
}

/// Road kinematics frozen at one arclength, shared by the models.
pub(crate) struct RoadPoint {
    pub kappa: f64,
    pub theta: f64,
    pub xc: f64,
    pub yc: f64,
}

pub(crate) fn road_point(track: &TrackSurface, s: f64) -> anyhow::Result<RoadPoint> {
    let (xc, yc, theta) = track.position(s, 0.0)?;
    Ok(RoadPoint {
        kappa: track.kappa(s)?,
        theta,
        xc,
        yc,
    })
}

/// `d time/ds`, `d n/ds`, `d alpha/ds` of the curvilinear road frame, with
/// the lateral offset positive toward the right boundary.
pub(crate) fn curvilinear_rates<T: DualNum<f64> + Copy>(
    road: &RoadPoint,
    u: T,
    v: T,
    omega: T,
    n: T,
    alpha: T,
) -> (T, T, T) {
    let along = u * alpha.cos() - v * alpha.sin();
    let dtds = (n * road.kappa + 1.0) / along;
    let dnds = -(u * alpha.sin() + v * alpha.cos()) * dtds;
    let dalphads = omega * dtds - road.kappa;
    (dtds, dnds, dalphads)
}

/// The differentiable vehicle model contract.
///
/// `evaluate` must be pure: all caches of the original formulation are
/// returned in [`ModelOutputs`], consistent with the most recent call by
/// construction. `p` is the flat declared-parameter vector; pass
/// [`DeclaredParameters::values`] (promoted) outside sensitivity contexts.
pub trait VehicleModel {
    fn kind(&self) -> &'static str;
    fn layout(&self) -> &StateLayout;
    /// Whether the optimal-laptime transcription defaults to direct mode
    fn is_direct_default(&self) -> bool;

    fn track(&self) -> Option<&Arc<TrackSurface>>;
    /// Binds the vehicle to a track; valid to call repeatedly.
    fn change_track(&mut self, track: Arc<TrackSurface>);

    fn declared(&self) -> &DeclaredParameters;
    fn declared_mut(&mut self) -> &mut DeclaredParameters;

    /// Mutates a model parameter addressed by path. Unknown paths are a
    /// lookup error for every model kind.
    fn set_parameter(&mut self, path: &str, value: f64) -> anyhow::Result<()>;

    fn evaluate<T: DualNum<f64> + Copy>(
        &self,
        q: &[T],
        qa: &[T],
        u: &[T],
        s: f64,
        p: &[T],
    ) -> anyhow::Result<ModelOutputs<T>>;

    fn optimal_laptime_state_bounds(&self) -> (Vec<f64>, Vec<f64>);
    fn optimal_laptime_algebraic_state_bounds(&self) -> (Vec<f64>, Vec<f64>);
    fn optimal_laptime_control_bounds(&self) -> (Vec<f64>, Vec<f64>);
    fn optimal_laptime_control_derivative_bounds(&self) -> (Vec<f64>, Vec<f64>);
    fn optimal_laptime_extra_constraints_bounds(&self) -> (Vec<f64>, Vec<f64>);

    fn state_names(&self) -> Vec<String>;
    fn algebraic_state_names(&self) -> Vec<String>;
    fn control_names(&self) -> Vec<String>;

    /// Default per-control dissipations regularizing the laptime objective
    fn default_dissipations(&self) -> Vec<f64>;

    /// Drag coefficient, for the aerodynamics property output
    fn drag_coefficient(&self) -> f64;

    // --- steady-state interface ---------------------------------------

    /// Initial guess of the steady-state unknown vector at forward speed `v`
    fn steady_state_guess(&self, v: f64) -> Vec<f64>;
    /// Bounds on the steady-state unknowns, for the gg-diagram solves
    fn steady_state_bounds(&self) -> (Vec<f64>, Vec<f64>);
    /// Equilibrium residuals at forward speed `v` under imposed body-frame
    /// accelerations; `r.len()` equals the unknown count.
    fn steady_state_residuals<T: DualNum<f64> + Copy>(
        &self,
        v: f64,
        ax: T,
        ay: T,
        unknowns: &[T],
        r: &mut [T],
    ) -> anyhow::Result<()>;
    /// Tire-health constraint values at a steady-state unknown vector.
    fn steady_state_extra_constraints<T: DualNum<f64> + Copy>(
        &self,
        v: f64,
        ax: T,
        ay: T,
        unknowns: &[T],
    ) -> anyhow::Result<Vec<T>>;
    /// Expands a steady-state unknown vector into full `(q, qa, u)` vectors
    /// with zero road states.
    fn steady_state_unpack(&self, v: f64, unknowns: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>);

    /// Registers a constant parameter for the sensitivity facility.
    fn declare_new_constant_parameter(
        &mut self,
        path: &str,
        alias: &str,
        value: f64,
    ) -> anyhow::Result<()> {
        self.declared_mut().declare_constant(path, alias, value)
    }

    /// Registers a piecewise-constant-over-arclength parameter; `aliases`
    /// holds one alias per value, joined with `';'`.
    fn declare_new_variable_parameter(
        &mut self,
        path: &str,
        aliases: &str,
        values: Vec<f64>,
        mesh: Vec<(f64, usize)>,
    ) -> anyhow::Result<()> {
        self.declared_mut()
            .declare_variable(path, aliases, values, mesh)
    }
}

/// Inputs of a single-point property request.
pub struct PropertyContext<'a> {
    pub q: &'a [f64],
    pub qa: &'a [f64],
    pub u: &'a [f64],
    pub s: f64,
    pub outputs: &'a ModelOutputs<f64>,
    pub layout: &'a StateLayout,
    pub cd: f64,
}

type PropertyAccessor = Box<dyn Fn(&PropertyContext) -> f64 + Send + Sync>;

/// Name-keyed accessors replacing the original's string-comparison chains;
/// each model registers exactly the subset it supports.
pub struct PropertyTable {
    map: HashMap<String, PropertyAccessor>,
}

impl PropertyTable {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    fn with<F>(mut self, name: &str, accessor: F) -> Self
    where
        F: Fn(&PropertyContext) -> f64 + Send + Sync + 'static,
    {
        self.map.insert(name.to_string(), Box::new(accessor));
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropertyAccessor> {
        self.map.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.map.keys().map(|k| k.as_str()).collect()
    }
}

const TIRE_SCOPES: [&str; 4] = [
    "front_axle.left_tire",
    "front_axle.right_tire",
    "rear_axle.left_tire",
    "rear_axle.right_tire",
];

/// Properties every model kind supports.
fn common_property_table() -> PropertyTable {
    let mut table = PropertyTable::new()
        .with("x", |c| c.outputs.x)
        .with("y", |c| c.outputs.y)
        .with("psi", |c| c.outputs.psi)
        .with("ax", |c| c.outputs.ax)
        .with("ay", |c| c.outputs.ay)
        .with("s", |c| c.s)
        .with("n", |c| c.q[c.layout.i_n])
        .with("alpha", |c| c.q[c.layout.i_alpha])
        .with("u", |c| c.q[c.layout.i_u])
        .with("v", |c| c.q[c.layout.i_v])
        .with("omega", |c| c.q[c.layout.i_omega])
        .with("time", |c| c.q[c.layout.i_time])
        .with("delta", |c| c.u[0])
        .with("chassis.understeer_oversteer_indicator", |c| {
            c.outputs.understeer
        })
        .with("chassis.aerodynamics.cd", |c| c.cd);
    for (ti, scope) in TIRE_SCOPES.iter().enumerate() {
        table = table
            .with(&format!("{scope}.x"), move |c| c.outputs.tires[ti].x)
            .with(&format!("{scope}.y"), move |c| c.outputs.tires[ti].y)
            .with(&format!("{scope}.kappa"), move |c| c.outputs.tires[ti].kappa)
            .with(&format!("{scope}.lambda"), move |c| {
                c.outputs.tires[ti].lambda
            })
            .with(&format!("{scope}.Fx"), move |c| c.outputs.tires[ti].fx)
            .with(&format!("{scope}.Fy"), move |c| c.outputs.tires[ti].fy)
            .with(&format!("{scope}.dissipation"), move |c| {
                c.outputs.tires[ti].dissipation
            });
    }
    table
}

fn f1_property_table() -> PropertyTable {
    common_property_table()
        .with("throttle", |c| c.u[1])
        .with("brake-bias", |c| c.u[2])
        .with("Fz_fl", |c| c.outputs.tires[0].fz)
        .with("Fz_fr", |c| c.outputs.tires[1].fz)
        .with("Fz_rl", |c| c.outputs.tires[2].fz)
        .with("Fz_rr", |c| c.outputs.tires[3].fz)
}

fn kart_property_table() -> PropertyTable {
    common_property_table().with("torque", |c| c.u[1])
}

static F1_PROPERTIES: std::sync::OnceLock<PropertyTable> = std::sync::OnceLock::new();
static KART_PROPERTIES: std::sync::OnceLock<PropertyTable> = std::sync::OnceLock::new();

/// Tagged vehicle, so that the registry and the solvers can handle both
/// model kinds uniformly.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Vehicle {
    F1(f1_3dof::F1Car),
    Kart(kart_6dof::KartCar),
}

impl Vehicle {
    /// Builds a vehicle of the tagged kind from a parsed parameter map.
    pub fn from_kind(kind: &str, params: &ParameterSet) -> anyhow::Result<Self> {
        match kind {
            "f1-3dof" => Ok(Self::F1(f1_3dof::F1Car::from_parameters(params)?)),
            "kart-6dof" => Ok(Self::Kart(kart_6dof::KartCar::from_parameters(params)?)),
            other => bail!(Error::InputValidation(format!(
                "unknown vehicle type {other:?}"
            ))),
        }
    }

    fn properties(&self) -> &'static PropertyTable {
        match self {
            Self::F1(_) => F1_PROPERTIES.get_or_init(f1_property_table),
            Self::Kart(_) => KART_PROPERTIES.get_or_init(kart_property_table),
        }
    }

    /// Names of every property this vehicle kind supports.
    pub fn property_names(&self) -> Vec<String> {
        self.properties()
            .names()
            .into_iter()
            .map(String::from)
            .collect()
    }

    /// Extracts a named property from an already-evaluated context.
    pub fn property_from_context(
        &self,
        context: &PropertyContext,
        name: &str,
    ) -> anyhow::Result<f64> {
        let accessor = self.properties().get(name).ok_or_else(|| {
            anyhow!(Error::ModelMismatch(format!(
                "property {name:?} is not supported by {:?}",
                self.kind()
            )))
        })?;
        Ok(accessor(context))
    }

    /// Evaluates the model at one point and extracts the named property.
    pub fn property(
        &self,
        q: &[f64],
        qa: &[f64],
        u: &[f64],
        s: f64,
        name: &str,
    ) -> anyhow::Result<f64> {
        let p = self.declared().values();
        let outputs = self.evaluate(q, qa, u, s, &p)?;
        let context = PropertyContext {
            q,
            qa,
            u,
            s,
            outputs: &outputs,
            layout: self.layout(),
            cd: self.drag_coefficient(),
        };
        self.property_from_context(&context, name)
    }

    /// Dense Jacobians of `(dq/ds, r_a)` with respect to `(q, qa, u)`,
    /// extracted column by column through the AD scalar.
    #[allow(clippy::type_complexity)]
    pub fn equations(
        &self,
        q: &[f64],
        qa: &[f64],
        u: &[f64],
        s: f64,
    ) -> anyhow::Result<(Vec<f64>, Vec<f64>, Vec<Vec<f64>>, Vec<Vec<f64>>)> {
        let layout = *self.layout();
        let p: Vec<Dual64> = self.declared().values().iter().map(|&v| Dual64::from(v)).collect();
        let n_inputs = layout.n_states + layout.n_algebraic + layout.n_controls;
        let mut dqds = vec![0.0; layout.n_states];
        let mut residual = vec![0.0; layout.n_algebraic];
        let mut jac_dqds = vec![vec![0.0; n_inputs]; layout.n_states];
        let mut jac_residual = vec![vec![0.0; n_inputs]; layout.n_algebraic];
        for col in 0..n_inputs {
            let mut qd: Vec<Dual64> = q.iter().map(|&v| Dual64::from(v)).collect();
            let mut qad: Vec<Dual64> = qa.iter().map(|&v| Dual64::from(v)).collect();
            let mut ud: Vec<Dual64> = u.iter().map(|&v| Dual64::from(v)).collect();
            if col < layout.n_states {
                qd[col].eps = 1.0;
            } else if col < layout.n_states + layout.n_algebraic {
                qad[col - layout.n_states].eps = 1.0;
            } else {
                ud[col - layout.n_states - layout.n_algebraic].eps = 1.0;
            }
            let outputs = self.evaluate(&qd, &qad, &ud, s, &p)?;
            for (row, value) in outputs.dqds.iter().enumerate() {
                jac_dqds[row][col] = value.eps;
                if col == 0 {
                    dqds[row] = value.re;
                }
            }
            for (row, value) in outputs.residual.iter().enumerate() {
                jac_residual[row][col] = value.eps;
                if col == 0 {
                    residual[row] = value.re;
                }
            }
        }
        Ok((dqds, residual, jac_dqds, jac_residual))
    }
}

macro_rules! dispatch {
    ($self:expr, $car:ident => $body:expr) => {
        match $self {
            Vehicle::F1($car) => $body,
            Vehicle::Kart($car) => $body,
        }
    };
}

impl VehicleModel for Vehicle {
    fn kind(&self) -> &'static str {
        dispatch!(self, car => car.kind())
    }
    fn layout(&self) -> &StateLayout {
        dispatch!(self, car => car.layout())
    }
    fn is_direct_default(&self) -> bool {
        dispatch!(self, car => car.is_direct_default())
    }
    fn track(&self) -> Option<&Arc<TrackSurface>> {
        dispatch!(self, car => car.track())
    }
    fn change_track(&mut self, track: Arc<TrackSurface>) {
        dispatch!(self, car => car.change_track(track))
    }
    fn declared(&self) -> &DeclaredParameters {
        dispatch!(self, car => car.declared())
    }
    fn declared_mut(&mut self) -> &mut DeclaredParameters {
        dispatch!(self, car => car.declared_mut())
    }
    fn set_parameter(&mut self, path: &str, value: f64) -> anyhow::Result<()> {
        dispatch!(self, car => car.set_parameter(path, value))
    }
    fn evaluate<T: DualNum<f64> + Copy>(
        &self,
        q: &[T],
        qa: &[T],
        u: &[T],
        s: f64,
        p: &[T],
    ) -> anyhow::Result<ModelOutputs<T>> {
        dispatch!(self, car => car.evaluate(q, qa, u, s, p))
    }
    fn optimal_laptime_state_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        dispatch!(self, car => car.optimal_laptime_state_bounds())
    }
    fn optimal_laptime_algebraic_state_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        dispatch!(self, car => car.optimal_laptime_algebraic_state_bounds())
    }
    fn optimal_laptime_control_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        dispatch!(self, car => car.optimal_laptime_control_bounds())
    }
    fn optimal_laptime_control_derivative_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        dispatch!(self, car => car.optimal_laptime_control_derivative_bounds())
    }
    fn optimal_laptime_extra_constraints_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        dispatch!(self, car => car.optimal_laptime_extra_constraints_bounds())
    }
    fn state_names(&self) -> Vec<String> {
        dispatch!(self, car => car.state_names())
    }
    fn algebraic_state_names(&self) -> Vec<String> {
        dispatch!(self, car => car.algebraic_state_names())
    }
    fn control_names(&self) -> Vec<String> {
        dispatch!(self, car => car.control_names())
    }
    fn default_dissipations(&self) -> Vec<f64> {
        dispatch!(self, car => car.default_dissipations())
    }
    fn drag_coefficient(&self) -> f64 {
        dispatch!(self, car => car.drag_coefficient())
    }
    fn steady_state_guess(&self, v: f64) -> Vec<f64> {
        dispatch!(self, car => car.steady_state_guess(v))
    }
    fn steady_state_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        dispatch!(self, car => car.steady_state_bounds())
    }
    fn steady_state_residuals<T: DualNum<f64> + Copy>(
        &self,
        v: f64,
        ax: T,
        ay: T,
        unknowns: &[T],
        r: &mut [T],
    ) -> anyhow::Result<()> {
        dispatch!(self, car => car.steady_state_residuals(v, ax, ay, unknowns, r))
    }
    fn steady_state_extra_constraints<T: DualNum<f64> + Copy>(
        &self,
        v: f64,
        ax: T,
        ay: T,
        unknowns: &[T],
    ) -> anyhow::Result<Vec<T>> {
        dispatch!(self, car => car.steady_state_extra_constraints(v, ax, ay, unknowns))
    }
    fn steady_state_unpack(&self, v: f64, unknowns: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        dispatch!(self, car => car.steady_state_unpack(v, unknowns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_vehicle_kind_rejected() {
        let err = Vehicle::from_kind("go-kart-9dof", &ParameterSet::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InputValidation(_))
        ));
    }

    #[test]
    fn test_layout_adjacency_enforced() {
        let layout = StateLayout {
            n_states: 6,
            n_algebraic: 0,
            n_controls: 2,
            n_extra_constraints: 0,
            i_u: 0,
            i_v: 1,
            i_omega: 2,
            i_time: 3,
            i_n: 5,
            i_alpha: 4,
        };
        let err = layout.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Internal(_))
        ));
    }

    #[test]
    fn test_kart_lacks_f1_properties() {
        let car = Vehicle::from_kind("kart-6dof", &ParameterSet::default()).unwrap();
        assert!(car.properties().get("brake-bias").is_none());
        assert!(car.properties().get("Fz_fl").is_none());
        assert!(car.properties().get("torque").is_some());
    }

    #[test]
    fn test_equations_jacobian_matches_finite_difference() {
        use crate::track::tests::ring_track;

        let mut car = Vehicle::from_kind("f1-3dof", &ParameterSet::default()).unwrap();
        let surface = TrackSurface::new(ring_track(100.0, 5.0, 128)).unwrap();
        car.change_track(Arc::new(surface));
        let q = vec![45.0, 0.3, 0.2, 0.0, 0.5, 0.02];
        let qa = vec![0.35, 0.35, 0.4, 0.4];
        let u = vec![0.02, 0.4, 0.6];
        let (dqds, _residual, jac_dqds, _jac_residual) = car.equations(&q, &qa, &u, 12.0).unwrap();

        // finite-difference the dependence of dq/ds on the yaw rate
        let h = 1e-6;
        let mut q_hi = q.clone();
        q_hi[2] += h;
        let p = car.declared().values();
        let out_hi = car.evaluate(&q_hi, &qa, &u, 12.0, &p).unwrap();
        for row in 0..dqds.len() {
            let fd = (out_hi.dqds[row] - dqds[row]) / h;
            assert!(
                (fd - jac_dqds[row][2]).abs() <= 1e-5 * fd.abs().max(1.0),
                "row {row}: fd {fd} vs ad {}",
                jac_dqds[row][2]
            );
        }
    }
}
