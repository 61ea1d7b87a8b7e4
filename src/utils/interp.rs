//! 1-dimensional interpolation

use crate::imports::*;

/// Extrapolation behavior beyond the grid ends.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub enum Extrapolate {
    /// Evaluate the end segment outside the grid
    Extrapolate,
    /// Clip the query to the grid range
    Clamp,
    /// Return an error for queries outside the grid
    Error,
}

/// Piecewise-linear interpolant on a sorted grid.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Interp1D {
    pub x: Vec<f64>,
    pub f_x: Vec<f64>,
    pub extrapolate: Extrapolate,
}

impl Interp1D {
    /// Create and validate 1-D interpolator
    pub fn new(x: Vec<f64>, f_x: Vec<f64>, extrapolate: Extrapolate) -> anyhow::Result<Self> {
        let interp = Self { x, f_x, extrapolate };
        interp.validate()?;
        Ok(interp)
    }

    fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.x.len() >= 2, "at least 2 grid points are required");
        ensure!(
            self.x.windows(2).all(|w| w[0] < w[1]),
            "supplied x-coordinates must be sorted and non-repeating"
        );
        ensure!(
            self.x.len() == self.f_x.len(),
            "supplied grid and values are not compatible shapes"
        );
        Ok(())
    }

    pub fn interpolate(&self, point: f64) -> anyhow::Result<f64> {
        let point = match self.extrapolate {
            Extrapolate::Extrapolate => point,
            Extrapolate::Clamp => point.clamp(self.x[0], *self.x.last().unwrap()),
            Extrapolate::Error => {
                ensure!(
                    point >= self.x[0] && point <= *self.x.last().unwrap(),
                    "query {point} is outside grid [{}, {}]",
                    self.x[0],
                    self.x.last().unwrap()
                );
                point
            }
        };
        let i = find_nearest_index(&self.x, point)?;
        let frac = (point - self.x[i]) / (self.x[i + 1] - self.x[i]);
        Ok(self.f_x[i] * (1.0 - frac) + self.f_x[i + 1] * frac)
    }
}

/// One cubic Hermite segment on `[0, ds]` defined by endpoint values and
/// endpoint derivatives with respect to arclength.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct HermiteSegment {
    pub f0: f64,
    pub f1: f64,
    pub d0: f64,
    pub d1: f64,
    pub ds: f64,
}

impl HermiteSegment {
    /// Evaluate at local coordinate `xi` in `[0, ds]`.
    pub fn eval(&self, xi: f64) -> f64 {
        let t = xi / self.ds;
        let t2 = t * t;
        let t3 = t2 * t;
        self.f0 * (2.0 * t3 - 3.0 * t2 + 1.0)
            + self.d0 * self.ds * (t3 - 2.0 * t2 + t)
            + self.f1 * (-2.0 * t3 + 3.0 * t2)
            + self.d1 * self.ds * (t3 - t2)
    }

    /// Evaluate the derivative with respect to arclength at `xi`.
    pub fn eval_deriv(&self, xi: f64) -> f64 {
        let t = xi / self.ds;
        let t2 = t * t;
        ((self.f0 * (6.0 * t2 - 6.0 * t) + self.f1 * (6.0 * t - 6.0 * t2)) / self.ds)
            + self.d0 * (3.0 * t2 - 4.0 * t + 1.0)
            + self.d1 * (3.0 * t2 - 2.0 * t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear() {
        let interp = Interp1D::new(
            vec![0., 1., 2., 3., 4.],
            vec![0.2, 0.4, 0.6, 0.8, 1.0],
            Extrapolate::Error,
        )
        .unwrap();
        assert_eq!(interp.interpolate(3.00).unwrap(), 0.8);
        assert_eq!(interp.interpolate(3.75).unwrap(), 0.95);
        assert_eq!(interp.interpolate(4.00).unwrap(), 1.0);
    }

    #[test]
    fn test_extrapolate_inputs() {
        let interp = Interp1D::new(
            vec![0., 1., 2., 3., 4.],
            vec![0.2, 0.4, 0.6, 0.8, 1.0],
            Extrapolate::Error,
        )
        .unwrap();
        assert!(interp.interpolate(-1.).is_err());
        assert!(interp.interpolate(5.).is_err());
    }

    #[test]
    fn test_extrapolate_clamp() {
        let interp = Interp1D::new(
            vec![0., 1., 2., 3., 4.],
            vec![0.2, 0.4, 0.6, 0.8, 1.0],
            Extrapolate::Clamp,
        )
        .unwrap();
        assert_eq!(interp.interpolate(-1.).unwrap(), 0.2);
        assert_eq!(interp.interpolate(5.).unwrap(), 1.0);
    }

    #[test]
    fn test_invalid_args() {
        assert!(Interp1D::new(vec![0., 1., 1.], vec![0., 1., 2.], Extrapolate::Error).is_err());
        assert!(Interp1D::new(vec![0., 1.], vec![0., 1., 2.], Extrapolate::Error).is_err());
    }

    #[test]
    fn test_hermite_endpoint_interpolation() {
        let seg = HermiteSegment {
            f0: 1.0,
            f1: 2.0,
            d0: 0.5,
            d1: -0.5,
            ds: 4.0,
        };
        assert!(almost_eq(seg.eval(0.0), 1.0, None));
        assert!(almost_eq(seg.eval(4.0), 2.0, None));
        assert!(almost_eq(seg.eval_deriv(0.0), 0.5, None));
        assert!(almost_eq(seg.eval_deriv(4.0), -0.5, None));
    }

    #[test]
    fn test_hermite_reproduces_cubic() {
        // f(x) = x^3 - x on [0, 2]
        let f = |x: f64| x.powi(3) - x;
        let d = |x: f64| 3.0 * x * x - 1.0;
        let seg = HermiteSegment {
            f0: f(0.),
            f1: f(2.),
            d0: d(0.),
            d1: d(2.),
            ds: 2.0,
        };
        for i in 0..=10 {
            let x = 0.2 * i as f64;
            assert!(almost_eq(seg.eval(x), f(x), Some(1e-9)));
        }
    }
}
