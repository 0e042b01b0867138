//! TOML form of [`AnalysisConfig`].
//!
//! ```toml
//! invalid_sample_policy = "drop_invalid"
//! polarity = "reverse_negative"
//!
//! [window]
//! min_v = -5.0
//! max_v = -1.0
//!
//! [constants]
//! material = "silicon"          # or relative_permittivity = 11.7
//! junction_area_m2 = 1e-6
//! ```

use serde::Deserialize;

use crate::analysis::AnalysisConfig;
use crate::fit::AnalysisWindow;
use crate::physics::{BiasPolarity, Material, PhysicalConstants};
use crate::transform::InvalidSamplePolicy;
use crate::CvError;

/// Partially specified settings, as read from a file or assembled from flags.
/// Layers are combined with [`ConfigFile::merge`] and resolved once.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub invalid_sample_policy: Option<InvalidSamplePolicy>,
    pub polarity: Option<BiasPolarity>,
    pub window: WindowSection,
    pub constants: ConstantsSection,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WindowSection {
    pub min_v: Option<f64>,
    pub max_v: Option<f64>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConstantsSection {
    pub material: Option<Material>,
    pub relative_permittivity: Option<f64>,
    pub junction_area_m2: Option<f64>,
    pub elementary_charge: Option<f64>,
    pub vacuum_permittivity: Option<f64>,
}

impl ConfigFile {
    pub fn from_toml_str(text: &str) -> Result<Self, CvError> {
        toml::from_str(text).map_err(|e| CvError::Config(e.to_string()))
    }

    /// Overlay `other` on `self`; values set in `other` win.
    pub fn merge(mut self, other: ConfigFile) -> Self {
        self.invalid_sample_policy = other.invalid_sample_policy.or(self.invalid_sample_policy);
        self.polarity = other.polarity.or(self.polarity);
        self.window.min_v = other.window.min_v.or(self.window.min_v);
        self.window.max_v = other.window.max_v.or(self.window.max_v);
        let (mine, theirs) = (&mut self.constants, other.constants);
        // An explicit permittivity in the upper layer overrides a lower material and vice versa.
        if theirs.material.is_some() || theirs.relative_permittivity.is_some() {
            mine.material = theirs.material;
            mine.relative_permittivity = theirs.relative_permittivity;
        }
        mine.junction_area_m2 = theirs.junction_area_m2.or(mine.junction_area_m2);
        mine.elementary_charge = theirs.elementary_charge.or(mine.elementary_charge);
        mine.vacuum_permittivity = theirs.vacuum_permittivity.or(mine.vacuum_permittivity);
        self
    }

    /// The configured window, or [`AnalysisWindow::default`] for unset bounds.
    pub fn resolve_window(&self) -> Result<AnalysisWindow, CvError> {
        let defaults = AnalysisWindow::default();
        AnalysisWindow::new(
            self.window.min_v.unwrap_or(defaults.min_v),
            self.window.max_v.unwrap_or(defaults.max_v),
        )
    }

    /// Resolve to a complete, validated [`AnalysisConfig`].
    ///
    /// The window falls back to [`AnalysisWindow::default`]; permittivity and
    /// junction area have no fallback.
    pub fn resolve(&self) -> Result<AnalysisConfig, CvError> {
        let window = self.resolve_window()?;

        let c = &self.constants;
        let eps_r = match (c.material, c.relative_permittivity) {
            (Some(_), Some(_)) => {
                return Err(CvError::Config(
                    "set either constants.material or constants.relative_permittivity, not both"
                        .into(),
                ))
            }
            (Some(material), None) => material.relative_permittivity(),
            (None, Some(eps_r)) => eps_r,
            (None, None) => {
                return Err(CvError::Config(
                    "constants.material or constants.relative_permittivity is required".into(),
                ))
            }
        };
        let area = c.junction_area_m2.ok_or_else(|| {
            CvError::Config("constants.junction_area_m2 is required".into())
        })?;

        let mut constants = PhysicalConstants::new(eps_r, area);
        if let Some(q) = c.elementary_charge {
            constants = constants.with_elementary_charge(q);
        }
        if let Some(eps_0) = c.vacuum_permittivity {
            constants = constants.with_vacuum_permittivity(eps_0);
        }

        let config = AnalysisConfig::new(window, constants)
            .with_policy(self.invalid_sample_policy.unwrap_or_default())
            .with_polarity(self.polarity.unwrap_or_default());
        config.validate()?;
        Ok(config)
    }
}

impl AnalysisConfig {
    /// Parse and resolve a complete configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, CvError> {
        ConfigFile::from_toml_str(text)?.resolve()
    }
}
