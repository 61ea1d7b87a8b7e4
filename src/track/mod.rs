//! Curvilinear track reference: discrete node data and the smooth surface
//! wrapped around it.

use crate::imports::*;
use crate::utils::interp::HermiteSegment;

pub mod preprocessor;

/// Equirectangular projection radius [m]
pub const R_EARTH: f64 = 6378388.0;

/// Metadata of the local-tangent-plane projection used to flatten geodetic
/// boundary coordinates.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct GeodeticProjection {
    pub x0: f64,
    pub y0: f64,
    pub phi0: f64,
    pub theta0: f64,
    pub phi_ref: f64,
}

fn default_format() -> String {
    "discrete".into()
}

/// Discrete curvilinear track reference, immutable after construction.
///
/// All per-node arrays have equal length `n_points`; `arclength` starts at
/// zero and increases strictly. For closed tracks the node at `s =
/// track_length` is identified with node 0 and not stored.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Track {
    #[serde(default = "default_format")]
    pub format: String,
    pub n_points: usize,
    pub is_closed: bool,
    pub track_length: f64,
    pub arclength: Vec<f64>,
    #[serde(rename = "heading-angle")]
    pub theta: Vec<f64>,
    pub curvature: Vec<f64>,
    /// Distance from the centerline to the left boundary, n_L >= 0
    #[serde(rename = "distance-left-boundary")]
    pub nl: Vec<f64>,
    /// Distance from the centerline to the right boundary, n_R >= 0
    #[serde(rename = "distance-right-boundary")]
    pub nr: Vec<f64>,
    pub centerline: Vec<[f64; 2]>,
    pub left: Vec<[f64; 2]>,
    pub right: Vec<[f64; 2]>,
    #[serde(default)]
    pub dkappa: Option<Vec<f64>>,
    #[serde(default)]
    pub dnl: Option<Vec<f64>>,
    #[serde(default)]
    pub dnr: Option<Vec<f64>>,
    /// Measured boundary polylines the reference was fitted to, if any.
    #[serde(default)]
    pub left_measured: Vec<[f64; 2]>,
    #[serde(default)]
    pub right_measured: Vec<[f64; 2]>,
    #[serde(default)]
    pub projection: Option<GeodeticProjection>,
    #[serde(default)]
    pub left_boundary_max_error: f64,
    #[serde(default)]
    pub right_boundary_max_error: f64,
    #[serde(default)]
    pub left_boundary_l2_error: f64,
    #[serde(default)]
    pub right_boundary_l2_error: f64,
}

impl Track {
    /// Assemble a track from per-node data. The left/right boundary points
    /// are reconstructed from the centerline, heading, and half-widths.
    pub fn new(
        arclength: Vec<f64>,
        theta: Vec<f64>,
        curvature: Vec<f64>,
        nl: Vec<f64>,
        nr: Vec<f64>,
        centerline: Vec<[f64; 2]>,
        track_length: f64,
        is_closed: bool,
    ) -> anyhow::Result<Self> {
        let left = centerline
            .iter()
            .zip(theta.iter().zip(nl.iter()))
            .map(|(r, (th, n))| [r[0] - n * th.sin(), r[1] + n * th.cos()])
            .collect();
        let right = centerline
            .iter()
            .zip(theta.iter().zip(nr.iter()))
            .map(|(r, (th, n))| [r[0] + n * th.sin(), r[1] - n * th.cos()])
            .collect();
        let mut track = Self {
            format: default_format(),
            n_points: arclength.len(),
            is_closed,
            track_length,
            arclength,
            theta,
            curvature,
            nl,
            nr,
            centerline,
            left,
            right,
            dkappa: None,
            dnl: None,
            dnr: None,
            left_measured: vec![],
            right_measured: vec![],
            projection: None,
            left_boundary_max_error: 0.0,
            right_boundary_max_error: 0.0,
            left_boundary_l2_error: 0.0,
            right_boundary_l2_error: 0.0,
        };
        track.init()?;
        Ok(track)
    }
}

impl Init for Track {
    fn init(&mut self) -> anyhow::Result<()> {
        ensure!(
            self.format == "discrete",
            Error::InputValidation(format!("unsupported track format {:?}", self.format))
        );
        ensure!(
            self.n_points >= 2,
            Error::InputValidation("track requires at least two nodes".into())
        );
        for (name, len) in [
            ("arclength", self.arclength.len()),
            ("heading-angle", self.theta.len()),
            ("curvature", self.curvature.len()),
            ("distance-left-boundary", self.nl.len()),
            ("distance-right-boundary", self.nr.len()),
            ("centerline", self.centerline.len()),
            ("left", self.left.len()),
            ("right", self.right.len()),
        ] {
            ensure!(
                len == self.n_points,
                Error::InputValidation(format!(
                    "track array {name:?} has {len} entries, expected {}",
                    self.n_points
                ))
            );
        }
        ensure!(
            self.arclength[0].abs() < 1e-12,
            Error::InputValidation("arclength must start at zero".into())
        );
        ensure!(
            self.arclength.windows(2).all(|w| w[0] < w[1]),
            Error::InputValidation("arclength must increase strictly".into())
        );
        let s_back = *self.arclength.last().unwrap();
        if self.is_closed {
            ensure!(
                s_back < self.track_length,
                Error::InputValidation(
                    "closed track: last node must lie before s = track_length".into()
                )
            );
        } else {
            ensure!(
                almost_eq(s_back, self.track_length, Some(1e-9)),
                Error::InputValidation("open track: last node must lie at s = track_length".into())
            );
        }
        ensure!(
            self.nl.iter().chain(self.nr.iter()).all(|n| *n > 0.0),
            Error::InputValidation("boundary distances must be positive".into())
        );
        Ok(())
    }
}

impl SerdeAPI for Track {}

/// Smooth curvilinear surface over a [`Track`]: cubic Hermite interpolation
/// of curvature, heading, half-widths, and centerline position per element.
#[derive(Clone, Debug)]
pub struct TrackSurface {
    track: Track,
    /// Net heading change over one lap, `2*pi*direction`, for closed tracks.
    theta_wrap: f64,
}

impl TrackSurface {
    pub fn new(mut track: Track) -> anyhow::Result<Self> {
        track.init()?;
        let theta_wrap = if track.is_closed {
            let n = track.n_points;
            // estimate of theta at s = L, integrating the wrap element
            let ds = track.track_length - track.arclength[n - 1];
            let theta_end = track.theta[n - 1]
                + 0.5 * ds * (track.curvature[n - 1] + track.curvature[0]);
            let winding = ((theta_end - track.theta[0]) / (2.0 * PI)).round();
            ensure!(
                winding.abs() >= 1.0,
                Error::InputValidation("closed track does not wind around".into())
            );
            2.0 * PI * winding
        } else {
            0.0
        };
        Ok(Self { track, theta_wrap })
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn track_length(&self) -> f64 {
        self.track.track_length
    }

    pub fn is_closed(&self) -> bool {
        self.track.is_closed
    }

    /// Maps `s` into `[0, L)` for closed tracks; validates range for open.
    fn locate(&self, s: f64) -> anyhow::Result<(usize, f64)> {
        let l = self.track.track_length;
        let s = if self.track.is_closed {
            s.rem_euclid(l)
        } else {
            ensure!(
                (-1e-9..=l + 1e-9).contains(&s),
                Error::InputValidation(format!("arclength {s} outside open track [0, {l}]"))
            );
            s.clamp(0.0, l)
        };
        let grid = &self.track.arclength;
        let n = grid.len();
        if self.track.is_closed && s >= grid[n - 1] {
            // wrap element from the last node back to node 0
            return Ok((n - 1, s - grid[n - 1]));
        }
        let i = find_nearest_index(grid, s)?;
        Ok((i, s - grid[i]))
    }

    /// Node index pair and element length for element `i` (wrap-aware).
    fn element(&self, i: usize) -> (usize, usize, f64) {
        let n = self.track.n_points;
        if i == n - 1 {
            (n - 1, 0, self.track.track_length - self.track.arclength[n - 1])
        } else {
            (i, i + 1, self.track.arclength[i + 1] - self.track.arclength[i])
        }
    }

    fn hermite(&self, values: &[f64], derivs: Option<&Vec<f64>>, i: usize, ds: f64) -> HermiteSegment {
        let (i0, i1, _) = self.element(i);
        let (d0, d1) = match derivs {
            Some(d) => (d[i0], d[i1]),
            // fall back to secant slopes when stored derivatives are absent
            None => {
                let slope = (values[i1] - values[i0]) / ds;
                (slope, slope)
            }
        };
        HermiteSegment {
            f0: values[i0],
            f1: values[i1],
            d0,
            d1,
            ds,
        }
    }

    /// Signed curvature at arclength `s`.
    pub fn kappa(&self, s: f64) -> anyhow::Result<f64> {
        let (i, xi) = self.locate(s)?;
        let (_, _, ds) = self.element(i);
        Ok(self
            .hermite(&self.track.curvature, self.track.dkappa.as_ref(), i, ds)
            .eval(xi))
    }

    /// Centerline heading at arclength `s`.
    pub fn theta(&self, s: f64) -> anyhow::Result<f64> {
        let (i, xi) = self.locate(s)?;
        let (i0, i1, ds) = self.element(i);
        // heading slopes are the nodal curvatures; unwrap across the closure
        let th1 = if i1 == 0 && i != 0 {
            self.track.theta[0] + self.theta_wrap
        } else {
            self.track.theta[i1]
        };
        let seg = HermiteSegment {
            f0: self.track.theta[i0],
            f1: th1,
            d0: self.track.curvature[i0],
            d1: self.track.curvature[i1],
            ds,
        };
        Ok(seg.eval(xi))
    }

    /// Distance from the centerline to the left boundary at `s`.
    pub fn left_limit(&self, s: f64) -> anyhow::Result<f64> {
        let (i, xi) = self.locate(s)?;
        let (_, _, ds) = self.element(i);
        Ok(self
            .hermite(&self.track.nl, self.track.dnl.as_ref(), i, ds)
            .eval(xi))
    }

    /// Distance from the centerline to the right boundary at `s`.
    pub fn right_limit(&self, s: f64) -> anyhow::Result<f64> {
        let (i, xi) = self.locate(s)?;
        let (_, _, ds) = self.element(i);
        Ok(self
            .hermite(&self.track.nr, self.track.dnr.as_ref(), i, ds)
            .eval(xi))
    }

    /// Cartesian position and heading of the point at arclength `s`, offset
    /// `n` laterally from the centerline (`n > 0` toward the right
    /// boundary, so the track-limit bounds read `-n_L <= n <= n_R`).
    pub fn position(&self, s: f64, n: f64) -> anyhow::Result<(f64, f64, f64)> {
        let (i, xi) = self.locate(s)?;
        let (i0, i1, ds) = self.element(i);
        let theta = self.theta(s)?;
        let (x0, y0) = (self.track.centerline[i0][0], self.track.centerline[i0][1]);
        let (x1, y1) = (self.track.centerline[i1][0], self.track.centerline[i1][1]);
        let seg_x = HermiteSegment {
            f0: x0,
            f1: x1,
            d0: self.track.theta[i0].cos(),
            d1: self.track.theta[i1].cos(),
            ds,
        };
        let seg_y = HermiteSegment {
            f0: y0,
            f1: y1,
            d0: self.track.theta[i0].sin(),
            d1: self.track.theta[i1].sin(),
            ds,
        };
        let x = seg_x.eval(xi) + n * theta.sin();
        let y = seg_y.eval(xi) - n * theta.cos();
        Ok((x, y, theta))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::traits::Linspace;

    /// Closed circular track of radius `r`, total width `2 * half_width`.
    pub(crate) fn ring_track(r: f64, half_width: f64, n: usize) -> Track {
        let l = 2.0 * PI * r;
        let s: Vec<f64> = (0..n).map(|i| l * i as f64 / n as f64).collect();
        let theta: Vec<f64> = s.iter().map(|si| si / r + 0.5 * PI).collect();
        let kappa = vec![1.0 / r; n];
        let centerline: Vec<[f64; 2]> = s
            .iter()
            .map(|si| {
                let a = si / r;
                [r * a.cos(), r * a.sin()]
            })
            .collect();
        Track::new(
            s,
            theta,
            kappa,
            vec![half_width; n],
            vec![half_width; n],
            centerline,
            l,
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_track_format_is_validated() {
        let mut track = ring_track(20.0, 4.0, 32);
        track.format = "analytic".into();
        assert!(track.init().is_err());
    }

    #[test]
    fn test_ring_surface_curvature_and_heading() {
        let r = 50.0;
        let surf = TrackSurface::new(ring_track(r, 5.0, 128)).unwrap();
        let l = surf.track_length();
        for s in Vec::linspace(0.0, 2.0 * l, 23) {
            assert!(almost_eq(surf.kappa(s).unwrap(), 1.0 / r, Some(1e-4)));
        }
        // heading advances by 2 pi over one lap
        let th0 = surf.theta(0.0).unwrap();
        let th1 = surf.theta(l - 1e-9).unwrap();
        assert!((th1 - th0 - 2.0 * PI).abs() < 1e-3);
    }

    #[test]
    fn test_ring_surface_position_offsets() {
        let r = 50.0;
        let surf = TrackSurface::new(ring_track(r, 5.0, 256)).unwrap();
        // n > 0 is toward the right boundary, which on a counterclockwise
        // ring is the outside (larger radius)
        let (x, y, _psi) = surf.position(0.0, 2.0).unwrap();
        assert!(almost_eq((x * x + y * y).sqrt(), r + 2.0, Some(1e-6)));
        let (x, y, _psi) = surf.position(20.0, -3.0).unwrap();
        assert!(almost_eq((x * x + y * y).sqrt(), r - 3.0, Some(1e-4)));
    }

    #[test]
    fn test_closed_track_wraps_arclength() {
        let surf = TrackSurface::new(ring_track(20.0, 4.0, 64)).unwrap();
        let l = surf.track_length();
        let a = surf.kappa(0.25 * l).unwrap();
        let b = surf.kappa(0.25 * l + l).unwrap();
        assert!(almost_eq(a, b, None));
    }

    #[test]
    fn test_open_track_rejects_out_of_range() {
        let mut track = ring_track(20.0, 4.0, 64);
        // convert to an open track covering the full perimeter
        track.is_closed = false;
        track.track_length = *track.arclength.last().unwrap();
        let surf = TrackSurface::new(track).unwrap();
        assert!(surf.kappa(surf.track_length() + 5.0).is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let track = ring_track(30.0, 4.0, 16);
        let yaml = track.to_yaml().unwrap();
        let back = Track::from_yaml(&yaml).unwrap();
        assert_eq!(track, back);
    }
}
