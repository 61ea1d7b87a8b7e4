//! Track preprocessor: fits a smooth curvilinear reference (centerline,
//! curvature, half-widths) to measured geodetic boundary polylines by
//! constrained nonlinear least squares on the interior-point solver.

use crate::imports::*;
use crate::nlp::{InteriorPointSolver, Nlp, NlpBounds, SolverOptions, INF_BOUND};
use crate::track::{GeodeticProjection, Track, R_EARTH};
use crate::utils::interp::{Extrapolate, Interp1D};
use crate::utils::{dist2, point_polyline_distance};

const DEG: f64 = PI / 180.0;

/// Geodetic coordinate pair in degrees.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Coordinates {
    pub longitude: f64,
    pub latitude: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TrackPreprocessorOptions {
    /// Boundary-fidelity weight
    pub eps_d: f64,
    /// Curvature-smoothness weight
    pub eps_k: f64,
    /// Lateral-width-smoothness weight
    pub eps_n: f64,
    /// Centerline-anchor weight
    pub eps_c: f64,
    pub maximum_kappa: f64,
    pub maximum_dkappa: f64,
    pub maximum_dn: f64,
    pub maximum_distance_find: f64,
    pub adaption_aspect_ratio_max: f64,
    pub print_level: i32,
    pub max_iter: usize,
}

impl Default for TrackPreprocessorOptions {
    fn default() -> Self {
        Self {
            eps_d: 1.0e-1,
            eps_k: 5.0e4,
            eps_n: 1.0e-1,
            eps_c: 1.0e-1,
            maximum_kappa: 0.1,
            maximum_dkappa: 2.0e-2,
            maximum_dn: 1.0,
            maximum_distance_find: 50.0,
            adaption_aspect_ratio_max: 1.2,
            print_level: 0,
            max_iter: 300,
        }
    }
}

impl Init for TrackPreprocessorOptions {}
impl SerdeAPI for TrackPreprocessorOptions {}

/// Fits curvilinear track references from boundary polylines.
pub struct TrackPreprocessor {
    pub options: TrackPreprocessorOptions,
}

/// Planar boundary data after geodetic flattening and orientation.
struct Flattened {
    left: Vec<[f64; 2]>,
    right: Vec<[f64; 2]>,
    projection: GeodeticProjection,
}

/// Averaged centerline estimate and per-node boundary matches.
struct CenterlineEstimate {
    /// Nominal element sizes; uniform unless a distribution was given
    ds_targets: Vec<f64>,
    centers: Vec<[f64; 2]>,
    length_estimate: f64,
}

impl TrackPreprocessor {
    pub fn new(options: TrackPreprocessorOptions) -> Self {
        Self { options }
    }

    /// Closed circuit on `n_el` equally sized elements.
    pub fn closed(
        &self,
        coord_left: &[Coordinates],
        coord_right: &[Coordinates],
        clockwise: bool,
        n_el: usize,
    ) -> anyhow::Result<Track> {
        ensure!(
            n_el >= 8,
            Error::InputValidation("closed circuits need at least 8 elements".into())
        );
        let flattened = flatten(coord_left, coord_right, clockwise);
        let estimate = self.averaged_centerline(&flattened, true, MeshSpec::Uniform(n_el))?;
        self.refine(&flattened, estimate, true, false, None)
    }

    /// Closed circuit with element sizes following `ds_distribution(s)`.
    pub fn closed_refined(
        &self,
        coord_left: &[Coordinates],
        coord_right: &[Coordinates],
        clockwise: bool,
        s_distribution: &[f64],
        ds_distribution: &[f64],
    ) -> anyhow::Result<Track> {
        let flattened = flatten(coord_left, coord_right, clockwise);
        let estimate = self.averaged_centerline(
            &flattened,
            true,
            MeshSpec::Distribution(s_distribution, ds_distribution),
        )?;
        self.refine(&flattened, estimate, true, true, None)
    }

    /// Open track between `start` and `finish` on `n_el` elements.
    pub fn open(
        &self,
        coord_left: &[Coordinates],
        coord_right: &[Coordinates],
        clockwise: bool,
        start: Coordinates,
        finish: Coordinates,
        n_el: usize,
    ) -> anyhow::Result<Track> {
        ensure!(
            n_el >= 4,
            Error::InputValidation("open tracks need at least 4 elements".into())
        );
        let full = flatten(coord_left, coord_right, clockwise);
        let start_xy = project(&full.projection, start);
        let finish_xy = project(&full.projection, finish);
        let flattened = trim(full, start_xy, finish_xy)?;
        let estimate = self.averaged_centerline(&flattened, false, MeshSpec::Uniform(n_el))?;
        self.refine(&flattened, estimate, false, false, Some((start_xy, finish_xy)))
    }

    /// Open refined mode is not supported.
    pub fn open_refined(
        &self,
        _coord_left: &[Coordinates],
        _coord_right: &[Coordinates],
        _clockwise: bool,
        _start: Coordinates,
        _finish: Coordinates,
        _s_distribution: &[f64],
        _ds_distribution: &[f64],
    ) -> anyhow::Result<Track> {
        bail!(Error::InputValidation(
            "refined meshes are not supported on open tracks".into()
        ))
    }

    /// Stage 3: nearest left/right pairs averaged into a centerline
    /// estimate, resampled at the requested element sizes.
    fn averaged_centerline(
        &self,
        flattened: &Flattened,
        is_closed: bool,
        mesh: MeshSpec,
    ) -> anyhow::Result<CenterlineEstimate> {
        let opts = &self.options;
        // midpoints of each left sample against the right polyline
        let mut midpoints = Vec::with_capacity(flattened.left.len());
        for &p in &flattened.left {
            let (q, distance) = nearest_on_polyline(p, &flattened.right, is_closed);
            ensure!(
                distance <= opts.maximum_distance_find,
                Error::NumericFailure(format!(
                    "no opposite boundary sample within {} m",
                    opts.maximum_distance_find
                ))
            );
            midpoints.push([0.5 * (p[0] + q[0]), 0.5 * (p[1] + q[1])]);
        }
        let length_estimate = polyline_length(&midpoints, is_closed);

        // element sizes along the estimate
        let ds_targets: Vec<f64> = match mesh {
            MeshSpec::Uniform(n_el) => {
                let n_points = if is_closed { n_el } else { n_el + 1 };
                let ds = length_estimate / n_el as f64;
                let targets = vec![ds; n_el];
                let centers = resample(&midpoints, is_closed, &targets, n_points);
                return Ok(CenterlineEstimate {
                    ds_targets: targets,
                    centers,
                    length_estimate,
                });
            }
            MeshSpec::Distribution(s_dist, ds_dist) => {
                ensure!(
                    s_dist.len() == ds_dist.len() && s_dist.len() >= 2,
                    Error::InputValidation(
                        "element size distribution needs matching arrays".into()
                    )
                );
                let interp =
                    Interp1D::new(s_dist.to_vec(), ds_dist.to_vec(), Extrapolate::Clamp)?;
                let mut targets = Vec::new();
                let mut s = 0.0;
                while s < length_estimate {
                    let ds = interp.interpolate(s)?;
                    ensure!(
                        ds > 0.0,
                        Error::InputValidation("element sizes must be positive".into())
                    );
                    targets.push(ds);
                    s += ds;
                }
                // stretch the tail so the mesh closes exactly; merge a
                // sliver remainder into its neighbor
                let overshoot = s - length_estimate;
                if let Some(last) = targets.last_mut() {
                    *last -= overshoot;
                }
                if targets.len() >= 2
                    && targets[targets.len() - 1] < 0.5 * targets[targets.len() - 2]
                {
                    let sliver = targets.pop().unwrap();
                    *targets.last_mut().unwrap() += sliver;
                }
                targets
            }
        };
        let n_points = ds_targets.len();
        let centers = resample(&midpoints, is_closed, &ds_targets, n_points);
        Ok(CenterlineEstimate {
            ds_targets,
            centers,
            length_estimate,
        })
    }

    /// Stage 4 and 5: interior-point refinement and output materialization.
    fn refine(
        &self,
        flattened: &Flattened,
        estimate: CenterlineEstimate,
        is_closed: bool,
        per_element_sizes: bool,
        endpoints: Option<([f64; 2], [f64; 2])>,
    ) -> anyhow::Result<Track> {
        let opts = &self.options;
        let n_points = estimate.centers.len();
        let n_elements = if is_closed { n_points } else { n_points - 1 };
        ensure!(
            n_points >= 4,
            Error::Internal("centerline estimate degenerated".into())
        );

        // match each node to its nearest measured boundary samples
        let mut left_match = Vec::with_capacity(n_points);
        let mut right_match = Vec::with_capacity(n_points);
        for &c in &estimate.centers {
            left_match.push(nearest_on_polyline(c, &flattened.left, is_closed).0);
            right_match.push(nearest_on_polyline(c, &flattened.right, is_closed).0);
        }

        // initial heading from the estimate tangents, unwrapped
        let mut theta_est = Vec::with_capacity(n_points);
        for i in 0..n_points {
            let next = estimate.centers[(i + 1) % n_points];
            let here = estimate.centers[i];
            let (dx, dy) = if i + 1 < n_points || is_closed {
                (next[0] - here[0], next[1] - here[1])
            } else {
                let prev = estimate.centers[i - 1];
                (here[0] - prev[0], here[1] - prev[1])
            };
            let mut theta = dy.atan2(dx);
            if let Some(prev) = theta_est.last() {
                while theta - prev > PI {
                    theta -= 2.0 * PI;
                }
                while theta - prev < -PI {
                    theta += 2.0 * PI;
                }
            }
            theta_est.push(theta);
        }

        let tangent0 = [theta_est[0].cos(), theta_est[0].sin()];
        let nlp = PreprocessorNlp {
            options: opts.clone(),
            n_points,
            n_elements,
            is_closed,
            per_element_sizes,
            ds_targets: estimate.ds_targets.clone(),
            length_estimate: estimate.length_estimate,
            centers: estimate.centers.clone(),
            left_match: left_match.clone(),
            right_match: right_match.clone(),
            tangent0,
            endpoints,
        };

        let bounds = nlp.bounds(flattened);
        let x0 = nlp.initial_point(&theta_est);
        let solver_options = SolverOptions {
            print_level: opts.print_level,
            tol: 1e-8,
            constr_viol_tol: 1e-8,
            acceptable_tol: 1e-6,
            max_iter: opts.max_iter,
            ..Default::default()
        };
        let solution = InteriorPointSolver::new(solver_options)
            .solve(&nlp, &x0, &bounds, None)
            .with_context(|| format_dbg!())?;

        // materialize the track arrays
        let x = &solution.x;
        let element_sizes = nlp.element_sizes_from(x);
        let track_length: f64 = element_sizes.iter().sum();
        let mut arclength = vec![0.0; n_points];
        for i in 1..n_points {
            arclength[i] = arclength[i - 1] + element_sizes[i - 1];
        }

        let mut theta = Vec::with_capacity(n_points);
        let mut kappa = Vec::with_capacity(n_points);
        let mut nl = Vec::with_capacity(n_points);
        let mut nr = Vec::with_capacity(n_points);
        let mut centerline = Vec::with_capacity(n_points);
        let mut dkappa = Vec::with_capacity(n_points);
        let mut dnl = Vec::with_capacity(n_points);
        let mut dnr = Vec::with_capacity(n_points);
        for i in 0..n_points {
            let node = nlp.node_slice(x, i);
            centerline.push([node[IX], node[IY]]);
            theta.push(node[ITHETA]);
            kappa.push(node[IKAPPA]);
            nl.push(node[INL]);
            nr.push(node[INR]);
            dkappa.push(node[IDKAPPA]);
            dnl.push(node[IDNL]);
            dnr.push(node[IDNR]);
        }

        let mut track = Track::new(
            arclength,
            theta,
            kappa,
            nl,
            nr,
            centerline,
            track_length,
            is_closed,
        )?;
        track.dkappa = Some(dkappa);
        track.dnl = Some(dnl);
        track.dnr = Some(dnr);
        track.left_measured = flattened.left.clone();
        track.right_measured = flattened.right.clone();
        track.projection = Some(flattened.projection);

        // boundary reconstruction error statistics
        let (max_l, l2_l) = boundary_errors(&track.left, &flattened.left, is_closed);
        let (max_r, l2_r) = boundary_errors(&track.right, &flattened.right, is_closed);
        track.left_boundary_max_error = max_l;
        track.right_boundary_max_error = max_r;
        track.left_boundary_l2_error = l2_l;
        track.right_boundary_l2_error = l2_r;
        if opts.print_level >= 1 {
            log::info!(
                "track fitted: length {track_length:.2} m, boundary errors \
                 left {max_l:.3}/{l2_l:.3} m, right {max_r:.3}/{l2_r:.3} m"
            );
        }
        Ok(track)
    }
}

enum MeshSpec<'a> {
    Uniform(usize),
    Distribution(&'a [f64], &'a [f64]),
}

fn flatten(
    coord_left: &[Coordinates],
    coord_right: &[Coordinates],
    clockwise: bool,
) -> Flattened {
    let all = coord_left.iter().chain(coord_right.iter());
    let count = (coord_left.len() + coord_right.len()) as f64;
    let theta0 = all.clone().map(|c| c.longitude * DEG).sum::<f64>() / count;
    let phi0 = all.map(|c| c.latitude * DEG).sum::<f64>() / count;
    let projection = GeodeticProjection {
        x0: 0.0,
        y0: 0.0,
        phi0,
        theta0,
        phi_ref: phi0,
    };
    let mut left: Vec<[f64; 2]> = coord_left.iter().map(|&c| project(&projection, c)).collect();
    let mut right: Vec<[f64; 2]> = coord_right
        .iter()
        .map(|&c| project(&projection, c))
        .collect();
    if clockwise {
        left.reverse();
        right.reverse();
    }
    Flattened {
        left,
        right,
        projection,
    }
}

fn project(projection: &GeodeticProjection, c: Coordinates) -> [f64; 2] {
    [
        R_EARTH * projection.phi_ref.cos() * (c.longitude * DEG - projection.theta0),
        R_EARTH * (c.latitude * DEG - projection.phi0),
    ]
}

/// Cuts both boundaries to the stretch between `start` and `finish`.
fn trim(full: Flattened, start: [f64; 2], finish: [f64; 2]) -> anyhow::Result<Flattened> {
    let cut = |polyline: &[[f64; 2]]| -> anyhow::Result<Vec<[f64; 2]>> {
        let i0 = nearest_vertex(start, polyline);
        let i1 = nearest_vertex(finish, polyline);
        ensure!(
            i0 < i1,
            Error::InputValidation(
                "start must precede finish along the boundary orientation".into()
            )
        );
        Ok(polyline[i0..=i1].to_vec())
    };
    Ok(Flattened {
        left: cut(&full.left)?,
        right: cut(&full.right)?,
        projection: full.projection,
    })
}

fn nearest_vertex(p: [f64; 2], polyline: &[[f64; 2]]) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (i, &q) in polyline.iter().enumerate() {
        let d = dist2(p, q);
        if d < best_d {
            best_d = d;
            best = i;
        }
    }
    best
}

/// Nearest point on a polyline (projected onto its segments) and its
/// distance.
fn nearest_on_polyline(p: [f64; 2], polyline: &[[f64; 2]], closed: bool) -> ([f64; 2], f64) {
    let mut best = polyline[0];
    let mut best_d = f64::INFINITY;
    let n = polyline.len();
    let last = if closed { n } else { n - 1 };
    for i in 0..last {
        let a = polyline[i];
        let b = polyline[(i + 1) % n];
        let ab = [b[0] - a[0], b[1] - a[1]];
        let len2 = ab[0] * ab[0] + ab[1] * ab[1];
        let t = if len2 > 0.0 {
            (((p[0] - a[0]) * ab[0] + (p[1] - a[1]) * ab[1]) / len2).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let q = [a[0] + t * ab[0], a[1] + t * ab[1]];
        let d = dist2(p, q);
        if d < best_d {
            best_d = d;
            best = q;
        }
    }
    (best, best_d.sqrt())
}

fn polyline_length(polyline: &[[f64; 2]], closed: bool) -> f64 {
    let mut length = 0.0;
    for w in polyline.windows(2) {
        length += dist2(w[0], w[1]).sqrt();
    }
    if closed {
        length += dist2(polyline[polyline.len() - 1], polyline[0]).sqrt();
    }
    length
}

/// Walks the polyline emitting one point per requested element size.
fn resample(
    polyline: &[[f64; 2]],
    closed: bool,
    ds_targets: &[f64],
    n_points: usize,
) -> Vec<[f64; 2]> {
    let n = polyline.len();
    let segments = if closed { n } else { n - 1 };
    let mut points = Vec::with_capacity(n_points);
    points.push(polyline[0]);
    let mut seg = 0;
    let mut along = 0.0;
    for target in ds_targets.iter().take(n_points - 1) {
        let mut remaining = *target;
        loop {
            let a = polyline[seg % n];
            let b = polyline[(seg + 1) % n];
            let seg_len = dist2(a, b).sqrt();
            if along + remaining <= seg_len || seg + 1 >= segments {
                let t = ((along + remaining) / seg_len.max(1e-12)).min(1.0);
                points.push([a[0] + t * (b[0] - a[0]), a[1] + t * (b[1] - a[1])]);
                along += remaining;
                break;
            }
            remaining -= seg_len - along;
            along = 0.0;
            seg += 1;
        }
    }
    points
}

/// Max and root-mean-square distance from computed boundary nodes to the
/// measured polyline.
fn boundary_errors(computed: &[[f64; 2]], measured: &[[f64; 2]], closed: bool) -> (f64, f64) {
    let mut max = 0.0_f64;
    let mut sum2 = 0.0;
    for &p in computed {
        let d = point_polyline_distance(p, measured, closed);
        max = max.max(d);
        sum2 += d * d;
    }
    (max, (sum2 / computed.len() as f64).sqrt())
}

// node state/control layout
const IX: usize = 0;
const IY: usize = 1;
const ITHETA: usize = 2;
const IKAPPA: usize = 3;
const INL: usize = 4;
const INR: usize = 5;
const IDKAPPA: usize = 6;
const IDNL: usize = 7;
const IDNR: usize = 8;
const PER_NODE: usize = 9;
const NSTATE: usize = 6;

struct PreprocessorNlp {
    options: TrackPreprocessorOptions,
    n_points: usize,
    n_elements: usize,
    is_closed: bool,
    /// One size variable per element instead of a single track length
    per_element_sizes: bool,
    ds_targets: Vec<f64>,
    length_estimate: f64,
    centers: Vec<[f64; 2]>,
    left_match: Vec<[f64; 2]>,
    right_match: Vec<[f64; 2]>,
    tangent0: [f64; 2],
    /// Open-track start and finish points
    endpoints: Option<([f64; 2], [f64; 2])>,
}

impl PreprocessorNlp {
    fn tail_offset(&self) -> usize {
        self.n_points * PER_NODE
    }

    fn n_tail(&self) -> usize {
        if self.per_element_sizes {
            self.n_elements
        } else {
            1
        }
    }

    fn node_slice<'x>(&self, x: &'x [f64], node: usize) -> &'x [f64] {
        &x[node * PER_NODE..(node + 1) * PER_NODE]
    }

    fn element_sizes_from(&self, x: &[f64]) -> Vec<f64> {
        if self.per_element_sizes {
            (0..self.n_elements)
                .map(|e| x[self.tail_offset() + e])
                .collect()
        } else {
            vec![x[self.tail_offset()] / self.n_elements as f64; self.n_elements]
        }
    }

    /// Extra rows beyond the collocation block: the parameterization pin
    /// (closed) or the start/finish pins (open), then aspect-ratio rows.
    fn n_pin_rows(&self) -> usize {
        if self.is_closed {
            1
        } else {
            3
        }
    }

    fn n_aspect_rows(&self) -> usize {
        if self.per_element_sizes {
            if self.is_closed {
                self.n_elements
            } else {
                self.n_elements - 1
            }
        } else {
            0
        }
    }

    fn bounds(&self, flattened: &Flattened) -> NlpBounds {
        let opts = &self.options;
        let mut x_min = f64::INFINITY;
        let mut x_max = f64::NEG_INFINITY;
        let mut y_min = f64::INFINITY;
        let mut y_max = f64::NEG_INFINITY;
        for p in flattened.left.iter().chain(flattened.right.iter()) {
            x_min = x_min.min(p[0]);
            x_max = x_max.max(p[0]);
            y_min = y_min.min(p[1]);
            y_max = y_max.max(p[1]);
        }
        let margin = 0.1 * ((x_max - x_min) + (y_max - y_min)) + 50.0;

        let n_vars = self.tail_offset() + self.n_tail();
        let mut x_lower = vec![-INF_BOUND; n_vars];
        let mut x_upper = vec![INF_BOUND; n_vars];
        for i in 0..self.n_points {
            let k = i * PER_NODE;
            x_lower[k + IX] = x_min - margin;
            x_upper[k + IX] = x_max + margin;
            x_lower[k + IY] = y_min - margin;
            x_upper[k + IY] = y_max + margin;
            x_lower[k + ITHETA] = -8.0 * PI;
            x_upper[k + ITHETA] = 8.0 * PI;
            x_lower[k + IKAPPA] = -opts.maximum_kappa;
            x_upper[k + IKAPPA] = opts.maximum_kappa;
            x_lower[k + INL] = 0.25;
            x_upper[k + INL] = 100.0;
            x_lower[k + INR] = 0.25;
            x_upper[k + INR] = 100.0;
            x_lower[k + IDKAPPA] = -opts.maximum_dkappa;
            x_upper[k + IDKAPPA] = opts.maximum_dkappa;
            x_lower[k + IDNL] = -opts.maximum_dn;
            x_upper[k + IDNL] = opts.maximum_dn;
            x_lower[k + IDNR] = -opts.maximum_dn;
            x_upper[k + IDNR] = opts.maximum_dn;
        }
        if self.per_element_sizes {
            for e in 0..self.n_elements {
                x_lower[self.tail_offset() + e] = 0.3 * self.ds_targets[e];
                x_upper[self.tail_offset() + e] = 3.0 * self.ds_targets[e];
            }
        } else {
            x_lower[self.tail_offset()] = 0.5 * self.length_estimate;
            x_upper[self.tail_offset()] = 2.0 * self.length_estimate;
        }

        let n_cons = self.n_constraints();
        let mut g_lower = vec![0.0; n_cons];
        let mut g_upper = vec![0.0; n_cons];
        // aspect-ratio rows: neighbor size ratio within the allowed band
        let aspect_base = self.n_elements * NSTATE + self.n_pin_rows();
        for k in 0..self.n_aspect_rows() {
            g_lower[aspect_base + k] = 1.0 / self.options.adaption_aspect_ratio_max;
            g_upper[aspect_base + k] = self.options.adaption_aspect_ratio_max;
        }
        NlpBounds {
            x_lower,
            x_upper,
            g_lower,
            g_upper,
        }
    }

    fn initial_point(&self, theta_est: &[f64]) -> Vec<f64> {
        let mut x0 = vec![0.0; self.tail_offset() + self.n_tail()];
        for i in 0..self.n_points {
            let k = i * PER_NODE;
            x0[k + IX] = self.centers[i][0];
            x0[k + IY] = self.centers[i][1];
            x0[k + ITHETA] = theta_est[i];
            let next = (i + 1) % self.n_points;
            let dtheta = if next == 0 && !self.is_closed {
                0.0
            } else {
                let mut d = theta_est[next] - theta_est[i];
                if next == 0 {
                    d += 2.0 * PI;
                }
                d
            };
            x0[k + IKAPPA] =
                (dtheta / self.ds_targets[i.min(self.n_elements - 1)])
                    .clamp(-0.9 * self.options.maximum_kappa, 0.9 * self.options.maximum_kappa);
            x0[k + INL] = dist2(self.centers[i], self.left_match[i]).sqrt().max(0.5);
            x0[k + INR] = dist2(self.centers[i], self.right_match[i]).sqrt().max(0.5);
        }
        if self.per_element_sizes {
            for e in 0..self.n_elements {
                x0[self.tail_offset() + e] = self.ds_targets[e];
            }
        } else {
            x0[self.tail_offset()] = self.length_estimate;
        }
        x0
    }
}

impl Nlp for PreprocessorNlp {
    fn n_variables(&self) -> usize {
        self.tail_offset() + self.n_tail()
    }

    fn n_constraints(&self) -> usize {
        self.n_elements * NSTATE + self.n_pin_rows() + self.n_aspect_rows()
    }

    fn n_blocks(&self) -> usize {
        self.n_elements
    }

    fn block_variables(&self, block: usize) -> Vec<usize> {
        let a = block;
        let b = (block + 1) % self.n_points;
        let mut vars: Vec<usize> = (a * PER_NODE..(a + 1) * PER_NODE).collect();
        if b != a {
            vars.extend(b * PER_NODE..(b + 1) * PER_NODE);
        }
        if self.per_element_sizes {
            vars.push(self.tail_offset() + block);
            if self.n_aspect_rows() > 0 && block < self.n_aspect_rows() {
                let neighbor = self.tail_offset() + (block + 1) % self.n_elements;
                if !vars.contains(&neighbor) {
                    vars.push(neighbor);
                }
            }
        } else {
            vars.push(self.tail_offset());
        }
        vars
    }

    fn block_constraints(&self, block: usize) -> Vec<usize> {
        let mut rows: Vec<usize> = (block * NSTATE..(block + 1) * NSTATE).collect();
        let pin_base = self.n_elements * NSTATE;
        if block == 0 {
            if self.is_closed {
                rows.push(pin_base);
            } else {
                rows.push(pin_base);
                rows.push(pin_base + 1);
            }
        }
        if !self.is_closed && block == self.n_elements - 1 {
            rows.push(pin_base + 2);
        }
        if self.per_element_sizes && block < self.n_aspect_rows() {
            rows.push(pin_base + self.n_pin_rows() + block);
        }
        rows
    }

    fn eval_block<T: DualNum<f64> + Copy>(
        &self,
        block: usize,
        x: &[T],
        _p: &[T],
        g: &mut [T],
    ) -> T {
        let a = 0usize;
        let b_node = (block + 1) % self.n_points;
        let b = PER_NODE;

        let ds = if self.per_element_sizes {
            x[2 * PER_NODE]
        } else {
            x[2 * PER_NODE] / self.n_elements as f64
        };

        let wrap = self.is_closed && b_node == 0;
        let qa = &x[a..a + PER_NODE];
        let qb = &x[b..b + PER_NODE];
        let theta_b = if wrap { qb[ITHETA] + 2.0 * PI } else { qb[ITHETA] };

        // trapezoidal collocation of (x, y, theta, kappa, nl, nr)
        let fa = [
            qa[ITHETA].cos(),
            qa[ITHETA].sin(),
            qa[IKAPPA],
            qa[IDKAPPA],
            qa[IDNL],
            qa[IDNR],
        ];
        let fb = [
            qb[ITHETA].cos(),
            qb[ITHETA].sin(),
            qb[IKAPPA],
            qb[IDKAPPA],
            qb[IDNL],
            qb[IDNR],
        ];
        let qb_states = [qb[IX], qb[IY], theta_b, qb[IKAPPA], qb[INL], qb[INR]];
        let qa_states = [qa[IX], qa[IY], qa[ITHETA], qa[IKAPPA], qa[INL], qa[INR]];
        for j in 0..NSTATE {
            g[j] = qb_states[j] - qa_states[j] - (fa[j] + fb[j]) * ds * 0.5;
        }
        let mut row = NSTATE;

        if block == 0 {
            if self.is_closed {
                // pin the first node against sliding along the estimate
                g[row] = (qa[IX] - self.centers[0][0]) * self.tangent0[0]
                    + (qa[IY] - self.centers[0][1]) * self.tangent0[1];
                row += 1;
            } else {
                let (start, _) = self.endpoints.expect("open track without endpoints");
                g[row] = qa[IX] - start[0];
                g[row + 1] = qa[IY] - start[1];
                row += 2;
            }
        }
        if !self.is_closed && block == self.n_elements - 1 {
            let (_, finish) = self.endpoints.expect("open track without endpoints");
            let tangent = self.tangent_at_finish();
            g[row] = (qb[IX] - finish[0]) * tangent[0] + (qb[IY] - finish[1]) * tangent[1];
            row += 1;
        }
        if self.per_element_sizes && block < self.n_aspect_rows() {
            let ds_here = x[2 * PER_NODE];
            let ds_next = x[2 * PER_NODE + 1];
            g[row] = ds_here / ds_next;
        }

        // objective terms of the element's first node (open tracks add the
        // final node's terms on the last element)
        let mut objective = self.node_objective(qa, block);
        if !self.is_closed && block == self.n_elements - 1 {
            objective += self.node_objective(qb, b_node);
        }
        objective
    }
}

impl PreprocessorNlp {
    fn tangent_at_finish(&self) -> [f64; 2] {
        let n = self.centers.len();
        let d = [
            self.centers[n - 1][0] - self.centers[n - 2][0],
            self.centers[n - 1][1] - self.centers[n - 2][1],
        ];
        let norm = (d[0] * d[0] + d[1] * d[1]).sqrt().max(1e-12);
        [d[0] / norm, d[1] / norm]
    }

    fn node_objective<T: DualNum<f64> + Copy>(&self, q: &[T], node: usize) -> T {
        let opts = &self.options;
        let (sin_t, cos_t) = q[ITHETA].sin_cos();
        let left = [q[IX] - q[INL] * sin_t, q[IY] + q[INL] * cos_t];
        let right = [q[IX] + q[INR] * sin_t, q[IY] - q[INR] * cos_t];
        let d2 = |p: [T; 2], m: [f64; 2]| {
            let dx = p[0] - m[0];
            let dy = p[1] - m[1];
            dx * dx + dy * dy
        };
        let fit = d2(left, self.left_match[node]) + d2(right, self.right_match[node]);
        let anchor = d2([q[IX], q[IY]], self.centers[node]);
        fit * opts.eps_d
            + q[IKAPPA] * q[IKAPPA] * opts.eps_k
            + (q[IDNL] * q[IDNL] + q[IDNR] * q[IDNR]) * opts.eps_n
            + anchor * opts.eps_c
    }
}
