//! Bias windowing and ordinary least-squares regression of `1/C²` on `V`.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::transform::DerivedSample;
use crate::CvError;

/// Below this many points the fit is still produced but flagged.
pub const MIN_RECOMMENDED_POINTS: usize = 5;

/// A line is defined by two points.
pub const MIN_FIT_POINTS: usize = 2;

/// Relative size below which the fitted line is considered flat: the change
/// of the line across the window compared to the largest `|y|` in it.
const DEGENERATE_SLOPE_REL: f64 = 1e-12;

/// Closed bias interval `[min_v, max_v]` in volts.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnalysisWindow {
    pub min_v: f64,
    pub max_v: f64,
}

impl Default for AnalysisWindow {
    fn default() -> Self {
        Self {
            min_v: -5.0,
            max_v: -1.0,
        }
    }
}

impl AnalysisWindow {
    pub fn new(min_v: f64, max_v: f64) -> Result<Self, CvError> {
        let window = Self { min_v, max_v };
        window.validate()?;
        Ok(window)
    }

    pub fn validate(&self) -> Result<(), CvError> {
        if !self.min_v.is_finite() || !self.max_v.is_finite() {
            return Err(CvError::InvalidParameter(format!(
                "window bounds must be finite, got [{}, {}]",
                self.min_v, self.max_v
            )));
        }
        if self.min_v > self.max_v {
            return Err(CvError::InvalidParameter(format!(
                "window min_v ({}) exceeds max_v ({})",
                self.min_v, self.max_v
            )));
        }
        Ok(())
    }

    /// Inclusive on both ends.
    pub fn contains(&self, bias_voltage: f64) -> bool {
        self.min_v <= bias_voltage && bias_voltage <= self.max_v
    }
}

/// Filter (not sort) the samples that fall inside `window`.
pub fn select_window<'a>(
    samples: &'a [DerivedSample],
    window: &AnalysisWindow,
) -> Vec<&'a DerivedSample> {
    samples
        .iter()
        .filter(|s| window.contains(s.bias_voltage()))
        .collect()
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct FitResult {
    /// F⁻²/V
    pub slope: f64,
    /// F⁻²
    pub intercept: f64,
    /// Pearson correlation coefficient.
    pub r: f64,
    /// Number of points the line was fitted to.
    pub n: usize,
}

impl FitResult {
    pub fn r_squared(&self) -> f64 {
        (self.r * self.r).clamp(0.0, 1.0)
    }

    pub fn predict(&self, bias_voltage: f64) -> f64 {
        self.slope * bias_voltage + self.intercept
    }
}

/// Fit `y = slope * x + intercept`.
///
/// Sums are taken about the means (two passes), which keeps the `1e24`-scale
/// `1/C²` values from cancelling in `Σxy - n·x̄·ȳ`.
pub fn linear_regression(xs: &[f64], ys: &[f64]) -> Result<FitResult, CvError> {
    if xs.len() != ys.len() {
        return Err(CvError::InvalidParameter(format!(
            "x/y length mismatch ({} vs {})",
            xs.len(),
            ys.len()
        )));
    }
    if let Some(v) = xs.iter().chain(ys).find(|v| !v.is_finite()) {
        return Err(CvError::InvalidParameter(format!(
            "non-finite value {} in regression input",
            v
        )));
    }
    let n = xs.len();
    if n < MIN_FIT_POINTS {
        return Err(CvError::InsufficientData {
            found: n,
            required: MIN_FIT_POINTS,
        });
    }

    let x = Array1::from_vec(xs.to_vec());
    let y = Array1::from_vec(ys.to_vec());
    let x_mean = x.mean().ok_or(CvError::InsufficientData {
        found: 0,
        required: MIN_FIT_POINTS,
    })?;
    let y_mean = y.mean().ok_or(CvError::InsufficientData {
        found: 0,
        required: MIN_FIT_POINTS,
    })?;

    let dx = &x - x_mean;
    let dy = &y - y_mean;
    let sxx = dx.dot(&dx);
    let sxy = dx.dot(&dy);
    let syy = dy.dot(&dy);

    let x_span = x.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v))
        - x.fold(f64::INFINITY, |acc, &v| acc.min(v));
    let has_spread = sxx > 0.0 && x_span > 0.0;
    if !has_spread {
        return Err(CvError::DegenerateFit(format!(
            "all {} points share the same bias voltage",
            n
        )));
    }

    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;
    let y_scale = y.fold(0.0_f64, |acc, &v| acc.max(v.abs()));
    if !slope.is_finite() || slope.abs() * x_span <= DEGENERATE_SLOPE_REL * y_scale {
        return Err(CvError::DegenerateFit(format!(
            "slope {:e} is numerically zero over a {} V span",
            slope, x_span
        )));
    }

    let r = if syy > 0.0 {
        (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0)
    } else {
        0.0
    };

    Ok(FitResult {
        slope,
        intercept,
        r,
        n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Sample;
    use approx::assert_relative_eq;

    fn derived(points: &[(f64, f64)]) -> Vec<DerivedSample> {
        points
            .iter()
            .enumerate()
            .map(|(i, &(v, c))| DerivedSample::from_sample(i, Sample::new(v, c, 0.0)).unwrap())
            .collect()
    }

    #[test]
    fn test_window_bounds_inclusive() {
        let samples = derived(&[(-6.0, 1e-12), (-5.0, 1e-12), (-3.0, 1e-12), (-1.0, 1e-12), (0.0, 1e-12)]);
        let window = AnalysisWindow::default();
        let picked: Vec<f64> = select_window(&samples, &window)
            .iter()
            .map(|s| s.bias_voltage())
            .collect();
        assert_eq!(picked, vec![-5.0, -3.0, -1.0]);
    }

    #[test]
    fn test_window_preserves_acquisition_order() {
        let samples = derived(&[(-1.0, 1e-12), (-4.0, 1e-12), (-2.0, 1e-12)]);
        let picked: Vec<f64> = select_window(&samples, &AnalysisWindow::default())
            .iter()
            .map(|s| s.bias_voltage())
            .collect();
        assert_eq!(picked, vec![-1.0, -4.0, -2.0]);
    }

    #[test]
    fn test_window_rejects_inverted_bounds() {
        assert!(AnalysisWindow::new(1.0, -1.0).is_err());
        assert!(AnalysisWindow::new(f64::NAN, 1.0).is_err());
        assert!(AnalysisWindow::new(-1.0, -1.0).is_ok());
    }

    #[test]
    fn test_exact_line_recovered() {
        let xs = [-5.0, -4.0, -3.0, -2.0, -1.0];
        let ys: Vec<f64> = xs.iter().map(|x| -2.0e23 * x + 4.0e23).collect();
        let fit = linear_regression(&xs, &ys).unwrap();
        assert_relative_eq!(fit.slope, -2.0e23, max_relative = 1e-12);
        assert_relative_eq!(fit.intercept, 4.0e23, max_relative = 1e-12);
        assert_relative_eq!(fit.r_squared(), 1.0, epsilon = 1e-12);
        assert!(fit.r < 0.0);
        assert_eq!(fit.n, 5);
    }

    #[test]
    fn test_regression_is_order_independent() {
        let xs = [-5.0, -4.0, -3.0, -2.0, -1.0];
        let ys = [1.0e24, 9.07e23, 7.97e23, 6.72e23, 5.49e23];
        let a = linear_regression(&xs, &ys).unwrap();
        let xr: Vec<f64> = xs.iter().rev().copied().collect();
        let yr: Vec<f64> = ys.iter().rev().copied().collect();
        let b = linear_regression(&xr, &yr).unwrap();
        assert_relative_eq!(a.slope, b.slope, max_relative = 1e-12);
        assert_relative_eq!(a.intercept, b.intercept, max_relative = 1e-12);
    }

    #[test]
    fn test_single_point_is_insufficient() {
        let err = linear_regression(&[1.0], &[2.0]).unwrap_err();
        assert_eq!(
            err,
            CvError::InsufficientData {
                found: 1,
                required: 2
            }
        );
    }

    #[test]
    fn test_identical_voltages_are_degenerate() {
        let err = linear_regression(&[-2.0, -2.0], &[1e24, 2e24]).unwrap_err();
        assert!(matches!(err, CvError::DegenerateFit(_)));
    }

    #[test]
    fn test_non_finite_input_rejected() {
        for (xs, ys) in [
            ([-2.0, f64::NAN, -1.0], [1e24, 2e24, 3e24]),
            ([-3.0, -2.0, f64::INFINITY], [1e24, 2e24, 3e24]),
            ([-3.0, -2.0, -1.0], [1e24, f64::NAN, 3e24]),
        ] {
            let err = linear_regression(&xs, &ys).unwrap_err();
            assert!(matches!(err, CvError::InvalidParameter(_)), "{err:?}");
        }
    }

    #[test]
    fn test_flat_line_is_degenerate() {
        let err = linear_regression(&[-3.0, -2.0, -1.0], &[5e23, 5e23, 5e23]).unwrap_err();
        assert!(matches!(err, CvError::DegenerateFit(_)));
    }

    #[test]
    fn test_predict_on_line() {
        let fit = FitResult {
            slope: 2.0,
            intercept: 1.0,
            r: 1.0,
            n: 2,
        };
        assert_eq!(fit.predict(3.0), 7.0);
    }
}
