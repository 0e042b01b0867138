use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::CvError;

/// One measurement row: bias (V), capacitance (F), conductance (S).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub bias_voltage: f64,
    pub capacitance: f64,
    pub conductance: f64,
}

impl Sample {
    pub fn new(bias_voltage: f64, capacitance: f64, conductance: f64) -> Self {
        Self {
            bias_voltage,
            capacitance,
            conductance,
        }
    }
}

/// A sample together with its `1/C²` value (F⁻²).
///
/// Only constructible through [`DerivedSample::from_sample`], so the
/// transformed value can never drift from the capacitance it came from.
#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
pub struct DerivedSample {
    index: usize,
    sample: Sample,
    inv_c_squared: f64,
}

impl DerivedSample {
    pub fn from_sample(index: usize, sample: Sample) -> Result<Self, CvError> {
        let c = sample.capacitance;
        if !c.is_finite() {
            return Err(CvError::InvalidSample {
                index,
                reason: format!("capacitance is not finite ({})", c),
            });
        }
        if c <= 0.0 {
            return Err(CvError::InvalidSample {
                index,
                reason: format!("capacitance must be positive, got {:e}", c),
            });
        }
        if !sample.bias_voltage.is_finite() {
            return Err(CvError::InvalidSample {
                index,
                reason: format!("bias voltage is not finite ({})", sample.bias_voltage),
            });
        }
        let inv_c_squared = 1.0 / (c * c);
        if !inv_c_squared.is_finite() {
            return Err(CvError::InvalidSample {
                index,
                reason: format!("capacitance {:e} too small to square", c),
            });
        }
        Ok(Self {
            index,
            sample,
            inv_c_squared,
        })
    }

    /// Position of the source row in acquisition order.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn sample(&self) -> &Sample {
        &self.sample
    }

    pub fn bias_voltage(&self) -> f64 {
        self.sample.bias_voltage
    }

    pub fn capacitance(&self) -> f64 {
        self.sample.capacitance
    }

    pub fn conductance(&self) -> f64 {
        self.sample.conductance
    }

    pub fn inv_c_squared(&self) -> f64 {
        self.inv_c_squared
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvalidSamplePolicy {
    /// Fail the whole batch on the first unusable sample.
    RejectAll,
    /// Skip unusable samples and report them as diagnostics.
    #[default]
    DropInvalid,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DroppedSample {
    /// Position in acquisition order.
    pub index: usize,
    pub capacitance: f64,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct Transformed {
    pub samples: Vec<DerivedSample>,
    pub dropped: Vec<DroppedSample>,
}

impl Transformed {
    pub fn dropped_count(&self) -> usize {
        self.dropped.len()
    }
}

/// Map samples to derived samples one-to-one, preserving order.
pub fn transform(samples: &[Sample], policy: InvalidSamplePolicy) -> Result<Transformed, CvError> {
    let mut out = Vec::with_capacity(samples.len());
    let mut dropped = Vec::new();
    for (index, sample) in samples.iter().enumerate() {
        match DerivedSample::from_sample(index, *sample) {
            Ok(derived) => out.push(derived),
            Err(err) => match policy {
                InvalidSamplePolicy::RejectAll => return Err(err),
                InvalidSamplePolicy::DropInvalid => {
                    let reason = match &err {
                        CvError::InvalidSample { reason, .. } => reason.clone(),
                        other => other.to_string(),
                    };
                    debug!("dropping sample {}: {}", index, reason);
                    dropped.push(DroppedSample {
                        index,
                        capacitance: sample.capacitance,
                        reason,
                    });
                }
            },
        }
    }
    Ok(Transformed {
        samples: out,
        dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rows() -> Vec<Sample> {
        vec![
            Sample::new(-2.0, 2e-12, 1e-6),
            Sample::new(-1.0, 0.0, 1e-6),
            Sample::new(0.0, f64::NAN, 1e-6),
            Sample::new(1.0, 4e-12, 2e-6),
        ]
    }

    #[test]
    fn test_inverse_square() {
        let derived = DerivedSample::from_sample(0, Sample::new(-1.0, 1.25e-12, 0.0)).unwrap();
        assert_relative_eq!(derived.inv_c_squared(), 6.4e23, max_relative = 1e-12);
    }

    #[test]
    fn test_drop_invalid_keeps_order_and_reports() {
        let out = transform(&rows(), InvalidSamplePolicy::DropInvalid).unwrap();
        assert_eq!(out.samples.len(), 2);
        assert_eq!(out.samples[0].bias_voltage(), -2.0);
        assert_eq!(out.samples[1].bias_voltage(), 1.0);
        assert_eq!(out.samples[1].index(), 3);
        assert_eq!(out.dropped_count(), 2);
        assert_eq!(out.dropped[0].index, 1);
        assert_eq!(out.dropped[1].index, 2);
    }

    #[test]
    fn test_reject_all_stops_at_first_invalid() {
        let err = transform(&rows(), InvalidSamplePolicy::RejectAll).unwrap_err();
        match err {
            CvError::InvalidSample { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_negative_and_infinite_capacitance_rejected() {
        assert!(DerivedSample::from_sample(0, Sample::new(0.0, -1e-12, 0.0)).is_err());
        assert!(DerivedSample::from_sample(0, Sample::new(0.0, f64::INFINITY, 0.0)).is_err());
        assert!(DerivedSample::from_sample(0, Sample::new(0.0, 1e-200, 0.0)).is_err());
        assert!(DerivedSample::from_sample(0, Sample::new(f64::NAN, 1e-12, 0.0)).is_err());
    }

    #[test]
    fn test_conductance_is_not_validated() {
        let derived = DerivedSample::from_sample(0, Sample::new(0.0, 1e-12, f64::NAN)).unwrap();
        assert!(derived.conductance().is_nan());
    }
}
