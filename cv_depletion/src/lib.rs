//! Core capacitance-voltage junction analysis library implemented in Rust.
//!
//! Raw `(V, C, G)` samples are transformed to `1/C²`, a single ordinary
//! least-squares line is fitted over one bias window, and the built-in
//! potential, carrier concentration and depletion width are derived from
//! the fit coefficients.

use thiserror::Error;

pub mod analysis;
pub mod config;
pub mod fit;
pub mod ingest;
pub mod physics;
pub mod report;
pub mod transform;

pub use analysis::{
    analyze, analyze_transformed, AnalysisConfig, AnalysisReport, Diagnostics, NonPhysicalReport,
    QualityFlag, VoltageRange,
};
pub use fit::{linear_regression, select_window, AnalysisWindow, FitResult, MIN_RECOMMENDED_POINTS};
pub use ingest::{parse_csv, DeviceProperties, MeasurementTable};
pub use physics::{
    derive_parameters, BiasPolarity, DerivedParameters, Material, PhysicalConstants,
    ELEMENTARY_CHARGE, VACUUM_PERMITTIVITY,
};
pub use transform::{
    transform, DerivedSample, DroppedSample, InvalidSamplePolicy, Sample, Transformed,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CvError {
    #[error("invalid sample at index {index}: {reason}")]
    InvalidSample { index: usize, reason: String },
    #[error("insufficient data: {found} sample(s) in window, at least {required} required")]
    InsufficientData { found: usize, required: usize },
    #[error("degenerate fit: {0}")]
    DegenerateFit(String),
    #[error("non-physical result: carrier concentration {carrier_concentration:e} m^-3 is not positive")]
    NonPhysicalResult {
        carrier_concentration: f64,
        fit: FitResult,
        /// Run context attached by [`analyze`]; `None` when raised by
        /// [`derive_parameters`] on its own.
        report: Option<Box<NonPhysicalReport>>,
    },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("missing required column(s): {}", .0.join(", "))]
    MissingField(Vec<String>),
    #[error("row {row}: column '{column}' has non-numeric value '{value}'")]
    InvalidNumber {
        row: usize,
        column: String,
        value: String,
    },
    #[error("failed to parse CSV: {0}")]
    CsvParse(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CvError {
    /// True for outcomes where the regression itself succeeded and only the
    /// derived physics is suspect.
    pub fn is_warning_class(&self) -> bool {
        matches!(self, CvError::NonPhysicalResult { .. })
    }

    /// Diagnostics and derived values of a non-physical run, when available.
    pub fn non_physical_report(&self) -> Option<&NonPhysicalReport> {
        match self {
            CvError::NonPhysicalResult {
                report: Some(report),
                ..
            } => Some(report.as_ref()),
            _ => None,
        }
    }
}
