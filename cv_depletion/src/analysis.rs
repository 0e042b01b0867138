use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::fit::{linear_regression, select_window, AnalysisWindow, FitResult, MIN_RECOMMENDED_POINTS};
use crate::physics::{derive_parameters, BiasPolarity, DerivedParameters, PhysicalConstants};
use crate::transform::{transform, DroppedSample, InvalidSamplePolicy, Sample, Transformed};
use crate::CvError;

/// Extrapolated V_bi beyond this multiple of the largest sampled |V| is flagged.
pub const V_BI_RANGE_FACTOR: f64 = 2.0;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnalysisConfig {
    pub window: AnalysisWindow,
    pub constants: PhysicalConstants,
    #[serde(default)]
    pub invalid_sample_policy: InvalidSamplePolicy,
    #[serde(default)]
    pub polarity: BiasPolarity,
}

impl AnalysisConfig {
    pub fn new(window: AnalysisWindow, constants: PhysicalConstants) -> Self {
        Self {
            window,
            constants,
            invalid_sample_policy: InvalidSamplePolicy::default(),
            polarity: BiasPolarity::default(),
        }
    }

    pub fn with_policy(mut self, policy: InvalidSamplePolicy) -> Self {
        self.invalid_sample_policy = policy;
        self
    }

    pub fn with_polarity(mut self, polarity: BiasPolarity) -> Self {
        self.polarity = polarity;
        self
    }

    pub fn validate(&self) -> Result<(), CvError> {
        self.window.validate()?;
        self.constants.validate()
    }

    /// SHA-256 of the JSON form, identifying which settings produced a report.
    pub fn hash_sha256(&self) -> Result<String, CvError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| CvError::InvalidParameter(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityFlag {
    /// Fewer points in the window than are needed for a confident fit.
    LowSampleCount { used: usize, recommended: usize },
    /// The intercept lies far outside the measured bias range.
    ExtrapolatedBuiltInPotential { v_bi: f64, limit: f64 },
}

impl QualityFlag {
    pub fn describe(&self) -> String {
        match self {
            QualityFlag::LowSampleCount { used, recommended } => format!(
                "only {} point(s) in the fit window ({} or more recommended)",
                used, recommended
            ),
            QualityFlag::ExtrapolatedBuiltInPotential { v_bi, limit } => format!(
                "V_bi = {:.4} V lies outside +/-{:.2} V; potentially unreliable",
                v_bi, limit
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct VoltageRange {
    pub min_v: f64,
    pub max_v: f64,
}

impl VoltageRange {
    pub fn max_abs(&self) -> f64 {
        self.min_v.abs().max(self.max_v.abs())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Diagnostics {
    /// Rows handed to the engine, before any were dropped.
    pub total_samples: usize,
    pub dropped_samples: Vec<DroppedSample>,
    pub points_used: usize,
    /// Acquisition indices of the fitted points, in acquisition order.
    pub used_indices: Vec<usize>,
    /// Bias span of all usable samples, not just the window.
    pub sampled_voltage_range: VoltageRange,
    pub quality_flags: Vec<QualityFlag>,
}

impl Diagnostics {
    pub fn dropped_count(&self) -> usize {
        self.dropped_samples.len()
    }
}

/// Immutable record of one analysis run; everything a report needs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnalysisReport {
    pub window: AnalysisWindow,
    pub constants: PhysicalConstants,
    pub polarity: BiasPolarity,
    pub fit: FitResult,
    pub parameters: DerivedParameters,
    pub diagnostics: Diagnostics,
    pub config_hash: String,
}

impl AnalysisReport {
    pub fn r_squared(&self) -> f64 {
        self.fit.r_squared()
    }

    pub fn is_flagged(&self) -> bool {
        !self.diagnostics.quality_flags.is_empty()
    }
}

/// What a run established before derivation came out non-physical. There is
/// no depletion width; V_bi and N_A are kept as computed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NonPhysicalReport {
    pub window: AnalysisWindow,
    pub constants: PhysicalConstants,
    pub polarity: BiasPolarity,
    pub fit: FitResult,
    pub built_in_potential: f64,
    pub built_in_potential_mag: f64,
    pub carrier_concentration: f64,
    pub diagnostics: Diagnostics,
    pub config_hash: String,
}

/// Run transform, windowing, regression and derivation over one table.
///
/// A non-physical derivation is returned as [`CvError::NonPhysicalResult`]
/// with its [`NonPhysicalReport`] attached.
pub fn analyze(samples: &[Sample], config: &AnalysisConfig) -> Result<AnalysisReport, CvError> {
    config.validate()?;
    let transformed = transform(samples, config.invalid_sample_policy)?;
    analyze_transformed(&transformed, samples.len(), config)
}

/// Same as [`analyze`] for callers that already hold the transformed table
/// (for plotting or export) and must not transform it twice.
pub fn analyze_transformed(
    transformed: &Transformed,
    total_samples: usize,
    config: &AnalysisConfig,
) -> Result<AnalysisReport, CvError> {
    config.validate()?;
    debug!(
        "transform: {} of {} samples usable, {} dropped",
        transformed.samples.len(),
        total_samples,
        transformed.dropped_count()
    );

    let selected = select_window(&transformed.samples, &config.window);
    let used_indices: Vec<usize> = selected.iter().map(|s| s.index()).collect();
    debug!(
        "window [{}, {}] V selected {} point(s)",
        config.window.min_v,
        config.window.max_v,
        selected.len()
    );

    let xs: Vec<f64> = selected.iter().map(|s| s.bias_voltage()).collect();
    let ys: Vec<f64> = selected.iter().map(|s| s.inv_c_squared()).collect();
    let fit = linear_regression(&xs, &ys)?;
    debug!(
        "fit: 1/C^2 = {:e} * V + {:e} (R^2 = {:.6}, n = {})",
        fit.slope,
        fit.intercept,
        fit.r_squared(),
        fit.n
    );

    let sampled_voltage_range = transformed.samples.iter().fold(
        VoltageRange {
            min_v: f64::INFINITY,
            max_v: f64::NEG_INFINITY,
        },
        |acc, s| VoltageRange {
            min_v: acc.min_v.min(s.bias_voltage()),
            max_v: acc.max_v.max(s.bias_voltage()),
        },
    );

    // Regression guarantees a finite non-zero slope.
    let v_bi = -fit.intercept / fit.slope;
    let mut quality_flags = Vec::new();
    if fit.n < MIN_RECOMMENDED_POINTS {
        quality_flags.push(QualityFlag::LowSampleCount {
            used: fit.n,
            recommended: MIN_RECOMMENDED_POINTS,
        });
    }
    let limit = V_BI_RANGE_FACTOR * sampled_voltage_range.max_abs();
    if v_bi.abs() >= limit {
        quality_flags.push(QualityFlag::ExtrapolatedBuiltInPotential { v_bi, limit });
    }
    for flag in &quality_flags {
        warn!("quality: {}", flag.describe());
    }

    let diagnostics = Diagnostics {
        total_samples,
        dropped_samples: transformed.dropped.clone(),
        points_used: fit.n,
        used_indices,
        sampled_voltage_range,
        quality_flags,
    };
    let config_hash = config.hash_sha256()?;

    let parameters = match derive_parameters(&fit, &config.constants, config.polarity) {
        Ok(parameters) => parameters,
        Err(CvError::NonPhysicalResult {
            carrier_concentration,
            fit,
            ..
        }) => {
            let report = NonPhysicalReport {
                window: config.window,
                constants: config.constants,
                polarity: config.polarity,
                fit,
                built_in_potential: v_bi,
                built_in_potential_mag: v_bi.abs(),
                carrier_concentration,
                diagnostics,
                config_hash,
            };
            return Err(CvError::NonPhysicalResult {
                carrier_concentration,
                fit,
                report: Some(Box::new(report)),
            });
        }
        Err(err) => return Err(err),
    };

    Ok(AnalysisReport {
        window: config.window,
        constants: config.constants,
        polarity: config.polarity,
        fit,
        parameters,
        diagnostics,
        config_hash,
    })
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
