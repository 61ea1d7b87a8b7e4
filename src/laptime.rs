//! Minimum-lap-time optimal control: trapezoidal transcription of the
//! vehicle dynamics along arclength, solved with the interior-point solver.
//!
//! Direct mode takes the controls themselves as decision variables;
//! derivative mode takes their time derivatives and recovers the controls by
//! integration. Elapsed time never enters the free set: it is recovered
//! after the solve by trapezoidal quadrature of `dtime/ds`.

use crate::imports::*;
use crate::nlp::{
    InteriorPointSolver, Nlp, NlpBounds, NlpSolution, SolverOptions, WarmStart,
};
use crate::steady_state::SteadyState;
use crate::traits::Linspace;
use crate::vehicle::VehicleModel;

/// How one control enters the free variable set.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum ControlMode {
    /// Removed from the free set; the seed value is held
    DontOptimize,
    /// Reserved
    Constant,
    /// Piecewise constant over the given arclength breakpoints, one
    /// decision variable per breakpoint
    Hypermesh(Vec<f64>),
    /// One decision variable per mesh node
    FullMesh,
}

/// A named quantity integrated along the lap and kept inside bounds.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IntegralConstraint {
    pub name: String,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IntegrandKind {
    /// Energy dissipated by the tires over the lap
    TireDissipation,
}

impl IntegrandKind {
    fn parse(name: &str) -> anyhow::Result<Self> {
        match name {
            "tire-dissipation" => Ok(Self::TireDissipation),
            other => bail!(Error::InputValidation(format!(
                "unknown integral quantity {other:?}"
            ))),
        }
    }
}

/// Start values pinning the first node of an open simulation.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct InitialCondition {
    pub q: Vec<f64>,
    pub qa: Vec<f64>,
    pub u: Vec<f64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LaptimeOptions {
    /// Transcription mode; defaults to the model's preference
    pub is_direct: Option<bool>,
    pub warm_start: bool,
    pub save_warm_start: bool,
    /// Speed of the steady-state seeding solution [m/s]
    pub steady_state_speed: f64,
    /// Per-control chatter penalties; defaults to the model's
    pub dissipations: Option<Vec<f64>>,
    /// Per-control variable modes; defaults to full mesh everywhere
    pub control_modes: Option<Vec<ControlMode>>,
    pub integral_constraints: Vec<IntegralConstraint>,
    pub compute_sensitivity: bool,
    /// Required for open simulations
    pub initial_condition: Option<InitialCondition>,
    pub print_level: i32,
    pub max_iter: usize,
    pub output_variables_prefix: String,
}

impl Default for LaptimeOptions {
    fn default() -> Self {
        Self {
            is_direct: None,
            warm_start: false,
            save_warm_start: false,
            steady_state_speed: 14.0,
            dissipations: None,
            control_modes: None,
            integral_constraints: vec![],
            compute_sensitivity: false,
            initial_condition: None,
            print_level: 0,
            max_iter: 500,
            output_variables_prefix: "run/".into(),
        }
    }
}

impl Init for LaptimeOptions {}
impl SerdeAPI for LaptimeOptions {}

/// Primal-dual data sufficient to reseed a future solve.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct OptimizationData {
    pub x: Vec<f64>,
    pub lambda: Vec<f64>,
    pub z_lower: Vec<f64>,
    pub z_upper: Vec<f64>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct LaptimeSensitivities {
    pub parameter_aliases: Vec<String>,
    /// `dq/dp`: per parameter, per node, per state
    pub dq_dp: Vec<Vec<Vec<f64>>>,
    pub dlaptime_dp: Vec<f64>,
}

/// A solved minimum-time trajectory.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct LaptimeSolution {
    pub vehicle_kind: String,
    pub is_closed: bool,
    pub is_direct: bool,
    pub s: Vec<f64>,
    pub q: Vec<Vec<f64>>,
    pub qa: Vec<Vec<f64>>,
    pub u: Vec<Vec<f64>>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub psi: Vec<f64>,
    pub laptime: f64,
    pub iterations: usize,
    pub integral_values: Vec<f64>,
    pub sensitivities: Option<LaptimeSensitivities>,
    pub optimization_data: OptimizationData,
}

impl Init for LaptimeSolution {}
impl SerdeAPI for LaptimeSolution {}

/// The optimal-laptime driver for one vehicle.
pub struct OptimalLaptime<'a, M: VehicleModel> {
    car: &'a M,
    pub options: LaptimeOptions,
}

struct Seed {
    q: Vec<Vec<f64>>,
    qa: Vec<Vec<f64>>,
    u: Vec<Vec<f64>>,
}

impl<'a, M: VehicleModel> OptimalLaptime<'a, M> {
    pub fn new(car: &'a M, options: LaptimeOptions) -> Self {
        Self { car, options }
    }

    fn track_length(&self) -> anyhow::Result<f64> {
        Ok(self
            .car
            .track()
            .ok_or_else(|| {
                anyhow!(Error::InputValidation(
                    "vehicle is not bound to a track".into()
                ))
            })?
            .track_length())
    }

    /// Closed-track solve on `n` equally sized elements (open tracks get
    /// `n + 1` nodes covering the full length).
    pub fn compute_uniform(&self, n: usize) -> anyhow::Result<LaptimeSolution> {
        ensure!(
            n >= 2,
            Error::InputValidation("at least two elements are required".into())
        );
        let length = self.track_length()?;
        let closed = self.is_closed()?;
        let s = if closed {
            (0..n).map(|i| length * i as f64 / n as f64).collect()
        } else {
            Vec::linspace(0.0, length, n + 1)
        };
        self.compute(s, closed, None)
    }

    /// Solve on a caller-provided arclength mesh.
    pub fn compute_with_mesh(&self, mut s: Vec<f64>) -> anyhow::Result<LaptimeSolution> {
        ensure!(
            s.len() >= 2,
            Error::InputValidation("provide at least two values of arclength".into())
        );
        let length = self.track_length()?;
        let closed = self.is_closed()?;
        if closed {
            ensure!(
                s[0].abs() <= 1e-12,
                Error::InputValidation("in closed simulations, s[0] must be 0".into())
            );
            ensure!(
                *s.last().unwrap() < length - 1e-10,
                Error::InputValidation(
                    "in closed simulations, s must end before the track length".into()
                )
            );
            s[0] = 0.0;
        } else {
            ensure!(
                s[0] >= -1e-12 && *s.last().unwrap() <= length + 1e-9,
                Error::InputValidation("mesh must lie within the track".into())
            );
        }
        self.compute(s, closed, None)
    }

    /// Open simulation over an arclength segment with `n` elements.
    pub fn compute_segment(
        &self,
        s_start: f64,
        s_finish: f64,
        n: usize,
    ) -> anyhow::Result<LaptimeSolution> {
        let length = self.track_length()?;
        ensure!(
            s_start >= -1e-12,
            Error::InputValidation("s_start must be nonnegative".into())
        );
        ensure!(
            s_finish <= length + 1e-9,
            Error::InputValidation("s_finish must not exceed the track length".into())
        );
        ensure!(
            s_finish > s_start,
            Error::InputValidation("s_finish must exceed s_start".into())
        );
        self.compute(Vec::linspace(s_start, s_finish, n + 1), false, None)
    }

    /// Re-solve from a previous solution's mesh and primal-dual data.
    pub fn compute_warm(&self, previous: &LaptimeSolution) -> anyhow::Result<LaptimeSolution> {
        self.compute(
            previous.s.clone(),
            previous.is_closed,
            Some(previous),
        )
    }

    fn is_closed(&self) -> anyhow::Result<bool> {
        let track_closed = self
            .car
            .track()
            .map(|t| t.is_closed())
            .unwrap_or(false);
        if self.options.initial_condition.is_some() {
            Ok(false)
        } else {
            ensure!(
                track_closed,
                Error::InputValidation(
                    "open simulations require an initial condition".into()
                )
            );
            Ok(true)
        }
    }

    fn seed(&self, n_points: usize) -> anyhow::Result<Seed> {
        let layout = self.car.layout();
        let (q0, qa0, u0) = match &self.options.initial_condition {
            Some(start) => {
                ensure!(
                    start.q.len() == layout.n_states
                        && start.qa.len() == layout.n_algebraic
                        && start.u.len() == layout.n_controls,
                    Error::InputValidation(
                        "initial condition does not match the model layout".into()
                    )
                );
                (start.q.clone(), start.qa.clone(), start.u.clone())
            }
            None => {
                let ss = SteadyState::new(self.car)
                    .solve(self.options.steady_state_speed, 0.0, 0.0)
                    .with_context(|| format_dbg!(self.options.steady_state_speed))?;
                (ss.q, ss.qa, ss.u)
            }
        };
        Ok(Seed {
            q: vec![q0; n_points],
            qa: vec![qa0; n_points],
            u: vec![u0; n_points],
        })
    }

    fn compute(
        &self,
        s: Vec<f64>,
        is_closed: bool,
        warm_from: Option<&LaptimeSolution>,
    ) -> anyhow::Result<LaptimeSolution> {
        let n_points = s.len();
        let seed = match warm_from {
            Some(previous) => Seed {
                q: previous.q.clone(),
                qa: previous.qa.clone(),
                u: previous.u.clone(),
            },
            None => self.seed(n_points)?,
        };
        let is_direct = self
            .options
            .is_direct
            .unwrap_or_else(|| self.car.is_direct_default());

        let nlp = LaptimeNlp::new(self.car, &self.options, s, is_closed, is_direct, &seed)?;
        let bounds = nlp.bounds()?;
        let x0 = match warm_from {
            Some(previous) => previous.optimization_data.x.clone(),
            None => nlp.initial_point(&seed),
        };
        let warm = warm_from.map(|previous| WarmStart {
            lambda: previous.optimization_data.lambda.clone(),
            z_lower: previous.optimization_data.z_lower.clone(),
            z_upper: previous.optimization_data.z_upper.clone(),
        });

        let solver_options = SolverOptions {
            print_level: self.options.print_level,
            max_iter: self.options.max_iter,
            compute_sensitivity: self.options.compute_sensitivity,
            mu_init: if warm.is_some() { 1e-9 } else { 0.1 },
            ..Default::default()
        };
        let solution = InteriorPointSolver::new(solver_options)
            .solve(&nlp, &x0, &bounds, warm.as_ref())
            .with_context(|| format_dbg!())?;

        nlp.post_process(&solution)
    }
}

/// One collocation element of the transcription.
struct ElementPlan {
    a: usize,
    b: usize,
    s_a: f64,
    s_b: f64,
    ds: f64,
    vars: Vec<usize>,
}

struct NodeVectors<T> {
    q: Vec<T>,
    qa: Vec<T>,
    u: Vec<T>,
    dudt: Vec<T>,
}

struct LaptimeNlp<'a, M: VehicleModel> {
    car: &'a M,
    s: Vec<f64>,
    track_length: f64,
    is_closed: bool,
    is_direct: bool,
    vehicle_kind: String,
    dissipations: Vec<f64>,
    control_modes: Vec<ControlMode>,
    integrands: Vec<(IntegrandKind, f64, f64)>,
    /// Pinned values for the first node of an open simulation
    q0: Vec<f64>,
    qa0: Vec<f64>,
    u0: Vec<f64>,
    /// Held values for controls excluded from the free set
    fixed_controls: Vec<Option<f64>>,
    /// Per-control hypermesh data: tail offset and breakpoints
    hypermesh: Vec<Option<(usize, Vec<f64>)>>,
    parameters: Vec<f64>,
    per_node: usize,
    n_vars: usize,
    n_cons: usize,
    rows_per_element: usize,
    elements: Vec<ElementPlan>,
}

impl<'a, M: VehicleModel> LaptimeNlp<'a, M> {
    fn new(
        car: &'a M,
        options: &LaptimeOptions,
        s: Vec<f64>,
        is_closed: bool,
        is_direct: bool,
        seed: &Seed,
    ) -> anyhow::Result<Self> {
        let layout = *car.layout();
        layout.validate()?;
        ensure!(
            utils::is_sorted(&s) && s.windows(2).all(|w| w[1] > w[0]),
            Error::InputValidation("arclength mesh must increase strictly".into())
        );
        let track_length = car
            .track()
            .ok_or_else(|| {
                anyhow!(Error::InputValidation(
                    "vehicle is not bound to a track".into()
                ))
            })?
            .track_length();

        let control_modes = options
            .control_modes
            .clone()
            .unwrap_or_else(|| vec![ControlMode::FullMesh; layout.n_controls]);
        ensure!(
            control_modes.len() == layout.n_controls,
            Error::InputValidation("one control mode is required per control".into())
        );
        let dissipations = options
            .dissipations
            .clone()
            .unwrap_or_else(|| car.default_dissipations());
        ensure!(
            dissipations.len() == layout.n_controls,
            Error::InputValidation("one dissipation is required per control".into())
        );
        for mode in &control_modes {
            match mode {
                ControlMode::Constant => bail!(Error::InputValidation(
                    "constant control mode is reserved and not yet supported".into()
                )),
                ControlMode::Hypermesh(breakpoints) => {
                    ensure!(
                        !breakpoints.is_empty() && utils::is_sorted(breakpoints),
                        Error::InputValidation(
                            "hypermesh breakpoints must be sorted and nonempty".into()
                        )
                    );
                    ensure!(
                        breakpoints[0] <= s[0] + 1e-9,
                        Error::InputValidation(
                            "hypermesh breakpoints must start at or before the mesh".into()
                        )
                    );
                    ensure!(
                        is_direct,
                        Error::InputValidation(
                            "hypermesh controls require the direct transcription".into()
                        )
                    );
                }
                ControlMode::DontOptimize | ControlMode::FullMesh => {}
            }
        }

        let integrands = options
            .integral_constraints
            .iter()
            .map(|c| Ok((IntegrandKind::parse(&c.name)?, c.lower, c.upper)))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let n_points = s.len();
        let n_fullmesh = control_modes
            .iter()
            .filter(|m| matches!(m, ControlMode::FullMesh))
            .count();
        let per_node = (layout.n_states - 1)
            + layout.n_algebraic
            + n_fullmesh
            + if is_direct { 0 } else { n_fullmesh };
        let free_nodes = if is_closed { n_points } else { n_points - 1 };
        let mut n_vars = free_nodes * per_node;

        let mut hypermesh = vec![None; layout.n_controls];
        for (c, mode) in control_modes.iter().enumerate() {
            if let ControlMode::Hypermesh(breakpoints) = mode {
                hypermesh[c] = Some((n_vars, breakpoints.clone()));
                n_vars += breakpoints.len();
            }
        }

        let fixed_controls = control_modes
            .iter()
            .enumerate()
            .map(|(c, mode)| match mode {
                ControlMode::DontOptimize => Some(seed.u[0][c]),
                _ => None,
            })
            .collect();

        let n_elements = if is_closed { n_points } else { n_points - 1 };
        let rows_per_element = (layout.n_states - 1)
            + layout.n_algebraic
            + layout.n_extra_constraints
            + if is_direct { 0 } else { n_fullmesh };
        let n_cons = n_elements * rows_per_element + integrands.len();

        let mut nlp = Self {
            car,
            s,
            track_length,
            is_closed,
            is_direct,
            vehicle_kind: car.kind().to_string(),
            dissipations,
            control_modes,
            integrands,
            q0: seed.q[0].clone(),
            qa0: seed.qa[0].clone(),
            u0: seed.u[0].clone(),
            fixed_controls,
            hypermesh,
            parameters: car.declared().values(),
            per_node,
            n_vars,
            n_cons,
            rows_per_element,
            elements: vec![],
        };
        nlp.elements = nlp.build_elements();
        Ok(nlp)
    }

    fn layout(&self) -> &crate::vehicle::StateLayout {
        self.car.layout()
    }

    /// Variable offset of a mesh node, `None` for the pinned first node of
    /// an open simulation.
    fn node_offset(&self, node: usize) -> Option<usize> {
        if self.is_closed {
            Some(node * self.per_node)
        } else if node == 0 {
            None
        } else {
            Some((node - 1) * self.per_node)
        }
    }

    /// Hypermesh segment variable for control `c` at arclength `s`.
    fn hypermesh_var(&self, c: usize, s: f64) -> Option<usize> {
        self.hypermesh[c].as_ref().map(|(offset, breakpoints)| {
            let mut idx = 0;
            for (k, bp) in breakpoints.iter().enumerate() {
                if *bp <= s + 1e-12 {
                    idx = k;
                }
            }
            offset + idx
        })
    }

    fn build_elements(&self) -> Vec<ElementPlan> {
        let n_points = self.s.len();
        let mut elements = Vec::new();
        let n_elements = if self.is_closed { n_points } else { n_points - 1 };
        for e in 0..n_elements {
            let (a, b, s_a, s_b, ds) = if e + 1 < n_points {
                (e, e + 1, self.s[e], self.s[e + 1], self.s[e + 1] - self.s[e])
            } else {
                // wrap-around element closing the lap
                (
                    n_points - 1,
                    0,
                    self.s[n_points - 1],
                    0.0,
                    self.track_length - self.s[n_points - 1],
                )
            };
            let mut vars = Vec::new();
            for node in [a, b] {
                if let Some(offset) = self.node_offset(node) {
                    vars.extend(offset..offset + self.per_node);
                }
            }
            for c in 0..self.layout().n_controls {
                for s_node in [s_a, s_b] {
                    if let Some(var) = self.hypermesh_var(c, s_node) {
                        if !vars.contains(&var) {
                            vars.push(var);
                        }
                    }
                }
            }
            elements.push(ElementPlan { a, b, s_a, s_b, ds, vars });
        }
        elements
    }

    /// Reads node vectors through an indexer from global variable index to
    /// value, covering pinned nodes, held controls, and hypermesh segments.
    fn unpack_node_with<T: DualNum<f64> + Copy, F: Fn(usize) -> T>(
        &self,
        node: usize,
        s_node: f64,
        get: &F,
    ) -> NodeVectors<T> {
        let layout = self.layout();
        let offset = match self.node_offset(node) {
            Some(offset) => offset,
            None => {
                return NodeVectors {
                    q: self.q0.iter().map(|&v| T::from(v)).collect(),
                    qa: self.qa0.iter().map(|&v| T::from(v)).collect(),
                    u: self.u0.iter().map(|&v| T::from(v)).collect(),
                    dudt: vec![T::from(0.0); layout.n_controls],
                };
            }
        };
        let mut cursor = offset;
        let mut next = || {
            let value = get(cursor);
            cursor += 1;
            value
        };
        let mut q = Vec::with_capacity(layout.n_states);
        for j in 0..layout.n_states {
            if j == layout.i_time {
                q.push(T::from(0.0));
            } else {
                q.push(next());
            }
        }
        let qa: Vec<T> = (0..layout.n_algebraic).map(|_| next()).collect();
        let mut u = Vec::with_capacity(layout.n_controls);
        for c in 0..layout.n_controls {
            match &self.control_modes[c] {
                ControlMode::FullMesh => u.push(next()),
                ControlMode::DontOptimize => {
                    u.push(T::from(self.fixed_controls[c].unwrap_or(0.0)))
                }
                ControlMode::Hypermesh(_) => {
                    let var = self
                        .hypermesh_var(c, s_node)
                        .expect("hypermesh mode without breakpoints");
                    u.push(get(var));
                }
                ControlMode::Constant => unreachable!("rejected at construction"),
            }
        }
        let mut dudt = vec![T::from(0.0); layout.n_controls];
        if !self.is_direct {
            for c in 0..layout.n_controls {
                if matches!(self.control_modes[c], ControlMode::FullMesh) {
                    dudt[c] = next();
                }
            }
        }
        NodeVectors { q, qa, u, dudt }
    }

    /// Per-node elapsed times and the laptime, as explicit functions of the
    /// decision variables (used for the time recovery and its
    /// sensitivities).
    fn times<T: DualNum<f64> + Copy>(&self, x: &[T], p: &[T]) -> anyhow::Result<(Vec<T>, T)> {
        let layout = *self.layout();
        let get = |g: usize| x[g];
        let mut dtds = Vec::with_capacity(self.s.len());
        for (i, &s_node) in self.s.iter().enumerate() {
            let node = self.unpack_node_with(i, s_node, &get);
            let out = self.car.evaluate(&node.q, &node.qa, &node.u, s_node, p)?;
            dtds.push(out.dqds[layout.i_time]);
        }
        let mut times = Vec::with_capacity(self.s.len());
        times.push(T::from(0.0));
        for i in 1..self.s.len() {
            let dt = (dtds[i - 1] + dtds[i]) * (0.5 * (self.s[i] - self.s[i - 1]));
            let prev = times[i - 1];
            times.push(prev + dt);
        }
        let mut laptime = *times.last().unwrap();
        if self.is_closed {
            let ds = self.track_length - *self.s.last().unwrap();
            laptime += (*dtds.last().unwrap() + dtds[0]) * (0.5 * ds);
        }
        Ok((times, laptime))
    }

    fn bounds(&self) -> anyhow::Result<NlpBounds> {
        let layout = *self.layout();
        let track = self.car.track().expect("checked at construction");
        let (q_lb, q_ub) = self.car.optimal_laptime_state_bounds();
        let (qa_lb, qa_ub) = self.car.optimal_laptime_algebraic_state_bounds();
        let (u_lb, u_ub) = self.car.optimal_laptime_control_bounds();
        let (du_lb, du_ub) = self.car.optimal_laptime_control_derivative_bounds();
        let (extra_lb, extra_ub) = self.car.optimal_laptime_extra_constraints_bounds();

        let mut x_lower = vec![0.0; self.n_vars];
        let mut x_upper = vec![0.0; self.n_vars];
        for (i, &s_node) in self.s.iter().enumerate() {
            let Some(offset) = self.node_offset(i) else {
                continue;
            };
            let mut k = offset;
            for j in 0..layout.n_states {
                if j == layout.i_time {
                    continue;
                }
                if j == layout.i_n {
                    x_lower[k] = -track.left_limit(s_node)?;
                    x_upper[k] = track.right_limit(s_node)?;
                } else {
                    x_lower[k] = q_lb[j];
                    x_upper[k] = q_ub[j];
                }
                k += 1;
            }
            for j in 0..layout.n_algebraic {
                x_lower[k] = qa_lb[j];
                x_upper[k] = qa_ub[j];
                k += 1;
            }
            for c in 0..layout.n_controls {
                if matches!(self.control_modes[c], ControlMode::FullMesh) {
                    x_lower[k] = u_lb[c];
                    x_upper[k] = u_ub[c];
                    k += 1;
                }
            }
            if !self.is_direct {
                for c in 0..layout.n_controls {
                    if matches!(self.control_modes[c], ControlMode::FullMesh) {
                        x_lower[k] = du_lb[c];
                        x_upper[k] = du_ub[c];
                        k += 1;
                    }
                }
            }
        }
        for (c, entry) in self.hypermesh.iter().enumerate() {
            if let Some((offset, breakpoints)) = entry {
                for k in 0..breakpoints.len() {
                    x_lower[offset + k] = u_lb[c];
                    x_upper[offset + k] = u_ub[c];
                }
            }
        }

        let mut g_lower = vec![0.0; self.n_cons];
        let mut g_upper = vec![0.0; self.n_cons];
        for e in 0..self.elements.len() {
            let base = e * self.rows_per_element
                + (layout.n_states - 1)
                + layout.n_algebraic;
            for j in 0..layout.n_extra_constraints {
                g_lower[base + j] = extra_lb[j];
                g_upper[base + j] = extra_ub[j];
            }
        }
        let integral_base = self.elements.len() * self.rows_per_element;
        for (k, (_, lower, upper)) in self.integrands.iter().enumerate() {
            g_lower[integral_base + k] = *lower;
            g_upper[integral_base + k] = *upper;
        }
        Ok(NlpBounds {
            x_lower,
            x_upper,
            g_lower,
            g_upper,
        })
    }

    fn initial_point(&self, seed: &Seed) -> Vec<f64> {
        let layout = *self.layout();
        let mut x0 = vec![0.0; self.n_vars];
        for i in 0..self.s.len() {
            let Some(offset) = self.node_offset(i) else {
                continue;
            };
            let mut k = offset;
            for j in 0..layout.n_states {
                if j == layout.i_time {
                    continue;
                }
                x0[k] = seed.q[i][j];
                k += 1;
            }
            for j in 0..layout.n_algebraic {
                x0[k] = seed.qa[i][j];
                k += 1;
            }
            for c in 0..layout.n_controls {
                if matches!(self.control_modes[c], ControlMode::FullMesh) {
                    x0[k] = seed.u[i][c];
                    k += 1;
                }
            }
            if !self.is_direct {
                for c in 0..layout.n_controls {
                    if matches!(self.control_modes[c], ControlMode::FullMesh) {
                        x0[k] = 0.0;
                        k += 1;
                    }
                }
            }
        }
        for (c, entry) in self.hypermesh.iter().enumerate() {
            if let Some((offset, breakpoints)) = entry {
                for k in 0..breakpoints.len() {
                    x0[offset + k] = seed.u[0][c];
                }
            }
        }
        x0
    }

    /// Builds the caller-facing solution from the converged NLP data.
    fn post_process(&self, solution: &NlpSolution) -> anyhow::Result<LaptimeSolution> {
        let layout = *self.layout();
        let n_points = self.s.len();
        let get = |g: usize| solution.x[g];

        let mut q = Vec::with_capacity(n_points);
        let mut qa = Vec::with_capacity(n_points);
        let mut u = Vec::with_capacity(n_points);
        let mut x_coord = Vec::with_capacity(n_points);
        let mut y_coord = Vec::with_capacity(n_points);
        let mut psi = Vec::with_capacity(n_points);

        let (times, laptime) = self.times(&solution.x, &self.parameters)?;
        for (i, &s_node) in self.s.iter().enumerate() {
            let node = self.unpack_node_with(i, s_node, &get);
            let mut qi = node.q;
            qi[layout.i_time] = times[i];
            let out = self.car.evaluate(&qi, &node.qa, &node.u, s_node, &self.parameters)?;
            x_coord.push(out.x);
            y_coord.push(out.y);
            psi.push(out.psi);
            q.push(qi);
            qa.push(node.qa);
            u.push(node.u);
        }

        let integral_base = self.elements.len() * self.rows_per_element;
        let integral_values = (0..self.integrands.len())
            .map(|k| solution.constraints[integral_base + k])
            .collect();

        let sensitivities = match &solution.sensitivities {
            Some(kkt) => Some(self.map_sensitivities(solution, kkt)?),
            None => None,
        };

        Ok(LaptimeSolution {
            vehicle_kind: self.vehicle_kind.clone(),
            is_closed: self.is_closed,
            is_direct: self.is_direct,
            s: self.s.clone(),
            q,
            qa,
            u,
            x: x_coord,
            y: y_coord,
            psi,
            laptime,
            iterations: solution.iterations,
            integral_values,
            sensitivities,
            optimization_data: OptimizationData {
                x: solution.x.clone(),
                lambda: solution.lambda.clone(),
                z_lower: solution.z_lower.clone(),
                z_upper: solution.z_upper.clone(),
            },
        })
    }

    /// Maps NLP-space sensitivities into per-node state sensitivities and
    /// the laptime derivative, recovering the elapsed-time rows through a
    /// dual pass seeded with both the parameter and the primal response.
    fn map_sensitivities(
        &self,
        solution: &NlpSolution,
        kkt: &crate::nlp::KktSensitivities,
    ) -> anyhow::Result<LaptimeSensitivities> {
        let layout = *self.layout();
        let n_points = self.s.len();
        let np = self.parameters.len();
        let mut dq_dp = vec![vec![vec![0.0; layout.n_states]; n_points]; np];
        let mut dlaptime_dp = vec![0.0; np];

        for k in 0..np {
            let dx = &kkt.dx_dp[k];
            for i in 0..n_points {
                let Some(offset) = self.node_offset(i) else {
                    continue;
                };
                let mut slot = offset;
                for j in 0..layout.n_states {
                    if j == layout.i_time {
                        continue;
                    }
                    dq_dp[k][i][j] = dx[slot];
                    slot += 1;
                }
            }
            // elapsed time responds through both the primal shift and the
            // parameter itself
            let x_dual: Vec<Dual64> = solution
                .x
                .iter()
                .zip(dx.iter())
                .map(|(&v, &d)| {
                    let mut value = Dual64::from(v);
                    value.eps = d;
                    value
                })
                .collect();
            let p_dual: Vec<Dual64> = self
                .parameters
                .iter()
                .enumerate()
                .map(|(j, &v)| {
                    let mut value = Dual64::from(v);
                    if j == k {
                        value.eps = 1.0;
                    }
                    value
                })
                .collect();
            let (times_dual, laptime_dual) = self.times(&x_dual, &p_dual)?;
            for i in 0..n_points {
                dq_dp[k][i][layout.i_time] = times_dual[i].eps;
            }
            dlaptime_dp[k] = laptime_dual.eps;
        }

        Ok(LaptimeSensitivities {
            parameter_aliases: self.car.declared().alias_names(),
            dq_dp,
            dlaptime_dp,
        })
    }
}

impl<M: VehicleModel> Nlp for LaptimeNlp<'_, M> {
    fn n_variables(&self) -> usize {
        self.n_vars
    }

    fn n_constraints(&self) -> usize {
        self.n_cons
    }

    fn n_blocks(&self) -> usize {
        self.elements.len()
    }

    fn block_variables(&self, block: usize) -> Vec<usize> {
        self.elements[block].vars.clone()
    }

    fn block_constraints(&self, block: usize) -> Vec<usize> {
        let mut rows: Vec<usize> =
            (block * self.rows_per_element..(block + 1) * self.rows_per_element).collect();
        let integral_base = self.elements.len() * self.rows_per_element;
        rows.extend(integral_base..integral_base + self.integrands.len());
        rows
    }

    fn n_parameters(&self) -> usize {
        self.parameters.len()
    }

    fn parameter_values(&self) -> Vec<f64> {
        self.parameters.clone()
    }

    fn eval_block<T: DualNum<f64> + Copy>(
        &self,
        block: usize,
        x: &[T],
        p: &[T],
        g: &mut [T],
    ) -> T {
        let layout = *self.layout();
        let plan = &self.elements[block];
        let get = |global: usize| -> T {
            let local = plan
                .vars
                .iter()
                .position(|&v| v == global)
                .expect("block variable missing from plan");
            x[local]
        };
        let node_a = self.unpack_node_with(plan.a, plan.s_a, &get);
        let node_b = self.unpack_node_with(plan.b, plan.s_b, &get);
        let out_a = self
            .car
            .evaluate(&node_a.q, &node_a.qa, &node_a.u, plan.s_a, p)
            .expect("model evaluation failed inside the transcription");
        let out_b = self
            .car
            .evaluate(&node_b.q, &node_b.qa, &node_b.u, plan.s_b, p)
            .expect("model evaluation failed inside the transcription");

        let ds = plan.ds;
        let mut row = 0;
        for j in 0..layout.n_states {
            if j == layout.i_time {
                continue;
            }
            g[row] = node_b.q[j] - node_a.q[j]
                - (out_a.dqds[j] + out_b.dqds[j]) * (0.5 * ds);
            row += 1;
        }
        for j in 0..layout.n_algebraic {
            g[row] = out_b.residual[j];
            row += 1;
        }
        for j in 0..layout.n_extra_constraints {
            g[row] = out_b.extra_constraints[j];
            row += 1;
        }
        let dtds_a = out_a.dqds[layout.i_time];
        let dtds_b = out_b.dqds[layout.i_time];
        if !self.is_direct {
            for c in 0..layout.n_controls {
                if matches!(self.control_modes[c], ControlMode::FullMesh) {
                    g[row] = node_b.u[c] - node_a.u[c]
                        - (node_a.dudt[c] * dtds_a + node_b.dudt[c] * dtds_b) * (0.5 * ds);
                    row += 1;
                }
            }
        }

        // objective: time integral plus the control-chatter penalty
        let mut objective = (dtds_a + dtds_b) * (0.5 * ds);
        for c in 0..layout.n_controls {
            if self.is_direct {
                let rate = (node_b.u[c] - node_a.u[c]) / ds;
                objective += rate * rate * (self.dissipations[c] * ds);
            } else {
                objective += node_b.dudt[c] * node_b.dudt[c] * (self.dissipations[c] * ds);
            }
        }

        // integral-quantity contributions accumulate across elements
        for (k, (kind, _, _)) in self.integrands.iter().enumerate() {
            let integrand = match kind {
                IntegrandKind::TireDissipation => {
                    out_a.dissipation * dtds_a + out_b.dissipation * dtds_b
                }
            };
            g[row + k] = integrand * (0.5 * ds);
        }

        objective
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::tests::ring_track;
    use crate::track::TrackSurface;
    use crate::vehicle::f1_3dof::F1Car;
    use crate::vehicle::kart_6dof::KartCar;
    use crate::vehicle::StateLayout;

    fn f1_on_ring(radius: f64, half_width: f64, nodes: usize) -> F1Car {
        let mut car = F1Car::default();
        let surface = TrackSurface::new(ring_track(radius, half_width, nodes)).unwrap();
        car.change_track(Arc::new(surface));
        car
    }

    fn kart_on_ring(radius: f64, half_width: f64, nodes: usize) -> KartCar {
        let mut car = KartCar::default();
        let surface = TrackSurface::new(ring_track(radius, half_width, nodes)).unwrap();
        car.change_track(Arc::new(surface));
        car
    }

    fn layout_of<M: VehicleModel>(car: &M) -> StateLayout {
        *car.layout()
    }

    #[test]
    fn test_variable_count_direct_closed() {
        let car = f1_on_ring(100.0, 5.0, 64);
        let options = LaptimeOptions::default();
        let seed = Seed {
            q: vec![vec![0.0; 6]; 8],
            qa: vec![vec![0.25; 4]; 8],
            u: vec![vec![0.0, 0.0, 0.6]; 8],
        };
        let s: Vec<f64> = (0..8).map(|i| i as f64 * 70.0).collect();
        let nlp = LaptimeNlp::new(&car, &options, s, true, true, &seed).unwrap();
        let layout = layout_of(&car);
        // per node: 5 states + 4 loads + 3 controls
        assert_eq!(nlp.per_node, 12);
        assert_eq!(nlp.n_variables(), 8 * 12);
        // per element: 5 collocation + 4 algebraic + 6 extras
        assert_eq!(nlp.rows_per_element, 15);
        assert_eq!(nlp.n_constraints(), 8 * 15);
        assert_eq!(layout.n_extra_constraints, 6);
    }

    #[test]
    fn test_variable_count_derivative_open() {
        let car = kart_on_ring(40.0, 4.0, 64);
        let mut options = LaptimeOptions::default();
        options.initial_condition = Some(InitialCondition {
            q: vec![0.0; 12],
            qa: vec![],
            u: vec![0.0, 0.0],
        });
        let opt = OptimalLaptime::new(&car, options.clone());
        let seed = opt.seed(5).unwrap();
        let s = Vec::linspace(0.0, 100.0, 5);
        let nlp = LaptimeNlp::new(&car, &options, s, false, false, &seed).unwrap();
        // per node: 11 states + 2 controls + 2 control derivatives
        assert_eq!(nlp.per_node, 15);
        // first node pinned
        assert_eq!(nlp.n_variables(), 4 * 15);
        // per element: 11 collocation + 6 extras + 2 control collocation
        assert_eq!(nlp.rows_per_element, 19);
    }

    #[test]
    fn test_constant_control_mode_rejected() {
        let car = f1_on_ring(100.0, 5.0, 64);
        let mut options = LaptimeOptions::default();
        options.control_modes = Some(vec![
            ControlMode::FullMesh,
            ControlMode::Constant,
            ControlMode::FullMesh,
        ]);
        let opt = OptimalLaptime::new(&car, options);
        let err = opt.compute_uniform(8).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InputValidation(_))
        ));
    }

    #[test]
    fn test_mesh_validation_closed() {
        let car = f1_on_ring(100.0, 5.0, 64);
        let opt = OptimalLaptime::new(&car, LaptimeOptions::default());
        // closed meshes must end strictly before the track length
        let length = 2.0 * PI * 100.0;
        let err = opt
            .compute_with_mesh(vec![0.0, 0.5 * length, length])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InputValidation(_))
        ));
    }

    #[test]
    fn test_segment_validates_finish() {
        let car = f1_on_ring(100.0, 5.0, 64);
        let mut options = LaptimeOptions::default();
        options.initial_condition = Some(InitialCondition {
            q: vec![30.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            qa: vec![0.25; 4],
            u: vec![0.0, 0.1, 0.6],
        });
        let opt = OptimalLaptime::new(&car, options);
        let err = opt.compute_segment(0.0, 1.0e6, 10).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InputValidation(_))
        ));
    }

    /// On a ring of constant radius and width, the minimum-time solution is
    /// steady-state cornering: every node sees the same speed and the lap
    /// time matches distance over speed along the driven radius.
    #[test]
    fn test_closed_ring_laptime_f1() {
        let radius = 120.0;
        let car = f1_on_ring(radius, 5.0, 96);
        let mut options = LaptimeOptions::default();
        options.steady_state_speed = 30.0;
        let opt = OptimalLaptime::new(&car, options);
        let solution = opt.compute_uniform(16).unwrap();
        assert!(solution.laptime > 0.0);

        let layout = layout_of(&car);
        // time increases monotonically
        for w in solution.q.windows(2) {
            assert!(w[1][layout.i_time] > w[0][layout.i_time]);
        }
        // time recovery is the trapezoid of dtime/ds by construction; check
        // consistency against total laptime
        let last = solution.q.last().unwrap()[layout.i_time];
        assert!(solution.laptime > last);

        // track-limit bounds hold at every node
        let track = car.track().unwrap();
        for (i, qi) in solution.q.iter().enumerate() {
            let n = qi[layout.i_n];
            assert!(n >= -track.left_limit(solution.s[i]).unwrap() - 1e-7);
            assert!(n <= track.right_limit(solution.s[i]).unwrap() + 1e-7);
        }

        // the optimizer should be near the lateral acceleration limit, so
        // well above the seeding speed
        let u_mid = solution.q[8][layout.i_u];
        assert!(u_mid > 30.0);

        // solving again from identical inputs reproduces the laptime
        let opt2 = OptimalLaptime::new(
            &car,
            LaptimeOptions {
                steady_state_speed: 30.0,
                ..Default::default()
            },
        );
        let solution2 = opt2.compute_uniform(16).unwrap();
        assert!(almost_eq(solution.laptime, solution2.laptime, Some(1e-6)));
    }

    #[test]
    fn test_warm_start_reuses_solution() {
        let car = f1_on_ring(120.0, 5.0, 96);
        let mut options = LaptimeOptions::default();
        options.steady_state_speed = 30.0;
        let opt = OptimalLaptime::new(&car, options);
        let cold = opt.compute_uniform(12).unwrap();
        let warm = opt.compute_warm(&cold).unwrap();
        assert!(almost_eq(cold.laptime, warm.laptime, Some(1e-8)));
        assert!(warm.iterations <= 3);
        assert!(warm.iterations < cold.iterations);
    }

    #[test]
    fn test_open_segment_pins_initial_state() {
        let car = f1_on_ring(150.0, 6.0, 96);
        let start = InitialCondition {
            q: vec![40.0, 0.0, 40.0 / 150.0, 0.0, 0.0, 0.0],
            qa: vec![0.3, 0.3, 0.3, 0.3],
            u: vec![0.0, 0.2, 0.6],
        };
        let mut options = LaptimeOptions::default();
        options.initial_condition = Some(start.clone());
        let opt = OptimalLaptime::new(&car, options);
        let solution = opt.compute_segment(0.0, 300.0, 12).unwrap();
        assert_eq!(solution.q[0], {
            let mut q0 = start.q.clone();
            q0[3] = 0.0; // elapsed time starts at zero
            q0
        });
        assert_eq!(solution.u[0], start.u);
        assert!(solution.laptime > 0.0);
        assert!(!solution.is_closed);
    }

    #[test]
    fn test_closed_ring_laptime_kart_derivative_mode() {
        let car = kart_on_ring(35.0, 3.5, 96);
        let mut options = LaptimeOptions::default();
        options.steady_state_speed = 12.0;
        let opt = OptimalLaptime::new(&car, options);
        let solution = opt.compute_uniform(14).unwrap();
        assert!(!solution.is_direct);
        assert!(solution.laptime > 0.0);
        let layout = layout_of(&car);
        for w in solution.q.windows(2) {
            assert!(w[1][layout.i_time] > w[0][layout.i_time]);
        }
    }

    #[test]
    fn test_dont_optimize_holds_seed_value() {
        let car = f1_on_ring(120.0, 5.0, 96);
        let mut options = LaptimeOptions::default();
        options.steady_state_speed = 30.0;
        // hold brake bias at its seed value
        options.control_modes = Some(vec![
            ControlMode::FullMesh,
            ControlMode::FullMesh,
            ControlMode::DontOptimize,
        ]);
        let opt = OptimalLaptime::new(&car, options);
        let solution = opt.compute_uniform(10).unwrap();
        let bias0 = solution.u[0][2];
        for ui in &solution.u {
            assert_eq!(ui[2], bias0);
        }
    }

    #[test]
    fn test_hypermesh_control_is_piecewise_constant() {
        let car = f1_on_ring(120.0, 5.0, 96);
        let length = 2.0 * PI * 120.0;
        let mut options = LaptimeOptions::default();
        options.steady_state_speed = 30.0;
        options.control_modes = Some(vec![
            ControlMode::FullMesh,
            ControlMode::FullMesh,
            ControlMode::Hypermesh(vec![0.0, 0.5 * length]),
        ]);
        let opt = OptimalLaptime::new(&car, options);
        let solution = opt.compute_uniform(12).unwrap();
        // two segments, so at most two distinct bias values
        let mut distinct: Vec<f64> = vec![];
        for ui in &solution.u {
            if !distinct.iter().any(|v| (v - ui[2]).abs() < 1e-12) {
                distinct.push(ui[2]);
            }
        }
        assert!(distinct.len() <= 2);
    }

    #[test]
    fn test_integral_constraint_limits_dissipation() {
        let car = f1_on_ring(120.0, 5.0, 96);
        // a loose budget reports the unconstrained dissipation
        let mut options = LaptimeOptions::default();
        options.steady_state_speed = 30.0;
        options.integral_constraints = vec![IntegralConstraint {
            name: "tire-dissipation".into(),
            lower: 0.0,
            upper: 1.0e12,
        }];
        let opt = OptimalLaptime::new(&car, options.clone());
        let free = opt.compute_uniform(10).unwrap();
        let unconstrained = free.integral_values[0];
        assert!(unconstrained > 0.0);

        // halve the budget: the constraint binds and the lap gets slower
        let budget = 0.5 * unconstrained;
        options.integral_constraints[0].upper = budget;
        let limited = OptimalLaptime::new(&car, options)
            .compute_uniform(10)
            .unwrap();
        assert!(limited.integral_values[0] <= budget * (1.0 + 1e-6));
        assert!(limited.laptime >= free.laptime - 1e-6);
    }

    #[test]
    fn test_sensitivity_matches_finite_difference() {
        let mut car = f1_on_ring(120.0, 5.0, 96);
        car.declare_new_constant_parameter("chassis/mass", "mass", 660.0)
            .unwrap();
        let mut options = LaptimeOptions::default();
        options.steady_state_speed = 30.0;
        options.compute_sensitivity = true;
        let opt = OptimalLaptime::new(&car, options);
        let solution = opt.compute_uniform(10).unwrap();
        let sens = solution.sensitivities.as_ref().unwrap();
        assert_eq!(sens.parameter_aliases, vec!["mass"]);

        // finite difference of the laptime with respect to the mass
        let h = 0.5;
        let mut car_hi = car.clone();
        car_hi.declared.entries[0].values[0] = 660.0 + h;
        let opt_hi = OptimalLaptime::new(
            &car_hi,
            LaptimeOptions {
                steady_state_speed: 30.0,
                ..Default::default()
            },
        );
        let hi = opt_hi.compute_uniform(10).unwrap();
        let mut car_lo = car.clone();
        car_lo.declared.entries[0].values[0] = 660.0 - h;
        let opt_lo = OptimalLaptime::new(
            &car_lo,
            LaptimeOptions {
                steady_state_speed: 30.0,
                ..Default::default()
            },
        );
        let lo = opt_lo.compute_uniform(10).unwrap();
        let fd = (hi.laptime - lo.laptime) / (2.0 * h);
        let reported = sens.dlaptime_dp[0];
        assert!(
            (fd - reported).abs() <= 1e-4 * fd.abs().max(1e-6),
            "fd {fd} vs reported {reported}"
        );
    }

    #[test]
    fn test_solution_serde_roundtrip_restores_trajectory() {
        let car = f1_on_ring(120.0, 5.0, 96);
        let mut options = LaptimeOptions::default();
        options.steady_state_speed = 30.0;
        let opt = OptimalLaptime::new(&car, options);
        let solution = opt.compute_uniform(8).unwrap();
        let json = solution.to_json().unwrap();
        let restored = LaptimeSolution::from_json(&json).unwrap();
        assert_eq!(solution.q, restored.q);
        assert_eq!(solution.qa, restored.qa);
        assert_eq!(solution.u, restored.u);
        assert_eq!(solution.laptime, restored.laptime);
    }
}
