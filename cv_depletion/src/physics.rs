//! Physical constants and the depletion-approximation parameter extraction.
//!
//! In the abrupt-junction depletion approximation
//!
//! ```text
//! 1/C² = 2 (V_bi - V) / (q · ε_s · N · A²)
//! ```
//!
//! so a straight line through `1/C²` versus `V` gives `V_bi` from the
//! intercept and `N` from the slope.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::fit::FitResult;
use crate::CvError;

/// Elementary charge, C (CODATA 2018, exact).
pub const ELEMENTARY_CHARGE: f64 = 1.602176634e-19;
/// Vacuum permittivity, F/m (CODATA 2018).
pub const VACUUM_PERMITTIVITY: f64 = 8.8541878128e-12;

pub const METERS_TO_NANOMETERS: f64 = 1e9;
pub const PER_M3_TO_PER_CM3: f64 = 1e-6;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Material {
    Silicon,
    Germanium,
    GalliumArsenide,
    SiliconCarbide,
    GalliumNitride,
}

impl Material {
    pub fn relative_permittivity(&self) -> f64 {
        match self {
            Material::Silicon => 11.7,
            Material::Germanium => 16.0,
            Material::GalliumArsenide => 12.9,
            Material::SiliconCarbide => 9.7,
            Material::GalliumNitride => 8.9,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Material::Silicon => "silicon",
            Material::Germanium => "germanium",
            Material::GalliumArsenide => "gallium_arsenide",
            Material::SiliconCarbide => "silicon_carbide",
            Material::GalliumNitride => "gallium_nitride",
        }
    }
}

impl fmt::Display for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Material {
    type Err = CvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "si" | "silicon" => Ok(Material::Silicon),
            "ge" | "germanium" => Ok(Material::Germanium),
            "gaas" | "gallium_arsenide" => Ok(Material::GalliumArsenide),
            "sic" | "silicon_carbide" => Ok(Material::SiliconCarbide),
            "gan" | "gallium_nitride" => Ok(Material::GalliumNitride),
            other => Err(CvError::InvalidParameter(format!("unknown material '{}'", other))),
        }
    }
}

/// Constants the derivation depends on. No `Default`: permittivity and area
/// must be stated for every analysis.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct PhysicalConstants {
    /// q, C
    pub elementary_charge: f64,
    /// ε₀, F/m
    pub vacuum_permittivity: f64,
    /// ε_r, dimensionless
    pub relative_permittivity: f64,
    /// A, m²
    pub junction_area_m2: f64,
}

impl PhysicalConstants {
    pub fn new(relative_permittivity: f64, junction_area_m2: f64) -> Self {
        Self {
            elementary_charge: ELEMENTARY_CHARGE,
            vacuum_permittivity: VACUUM_PERMITTIVITY,
            relative_permittivity,
            junction_area_m2,
        }
    }

    pub fn for_material(material: Material, junction_area_m2: f64) -> Self {
        Self::new(material.relative_permittivity(), junction_area_m2)
    }

    pub fn with_elementary_charge(mut self, q: f64) -> Self {
        self.elementary_charge = q;
        self
    }

    pub fn with_vacuum_permittivity(mut self, eps_0: f64) -> Self {
        self.vacuum_permittivity = eps_0;
        self
    }

    /// ε_s = ε_r · ε₀
    pub fn semiconductor_permittivity(&self) -> f64 {
        self.relative_permittivity * self.vacuum_permittivity
    }

    pub fn validate(&self) -> Result<(), CvError> {
        let fields = [
            ("elementary_charge", self.elementary_charge),
            ("vacuum_permittivity", self.vacuum_permittivity),
            ("relative_permittivity", self.relative_permittivity),
            ("junction_area_m2", self.junction_area_m2),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value <= 0.0 {
                return Err(CvError::InvalidParameter(format!(
                    "{} must be positive and finite, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Which sign of bias depletes the junction.
///
/// With reverse bias applied as negative voltage the depletion relation has
/// a negative `d(1/C²)/dV`, so the doping is `-2 / (q ε_s A² slope)`.
/// With reverse bias applied as positive voltage the slope is positive and
/// the doping is `2 / (q ε_s A² slope)`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BiasPolarity {
    #[default]
    ReverseNegative,
    ReversePositive,
}

impl BiasPolarity {
    fn slope_sign(&self) -> f64 {
        match self {
            BiasPolarity::ReverseNegative => -1.0,
            BiasPolarity::ReversePositive => 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct DerivedParameters {
    /// V_bi = -intercept / slope, V (signed)
    pub built_in_potential: f64,
    /// |V_bi|, V
    pub built_in_potential_mag: f64,
    /// N_A, m⁻³
    pub carrier_concentration: f64,
    /// W, nm
    pub depletion_width_nm: f64,
}

impl DerivedParameters {
    pub fn carrier_concentration_cm3(&self) -> f64 {
        self.carrier_concentration * PER_M3_TO_PER_CM3
    }
}

pub fn derive_parameters(
    fit: &FitResult,
    constants: &PhysicalConstants,
    polarity: BiasPolarity,
) -> Result<DerivedParameters, CvError> {
    constants.validate()?;
    if fit.slope == 0.0 || !fit.slope.is_finite() {
        return Err(CvError::DegenerateFit(format!(
            "cannot derive parameters from slope {}",
            fit.slope
        )));
    }

    let q = constants.elementary_charge;
    let eps_s = constants.semiconductor_permittivity();
    let area = constants.junction_area_m2;

    let v_bi = -fit.intercept / fit.slope;
    let v_bi_mag = v_bi.abs();
    let n_a = 2.0 / (q * eps_s * area * area * fit.slope * polarity.slope_sign());

    if !n_a.is_finite() || n_a <= 0.0 || !v_bi.is_finite() {
        return Err(CvError::NonPhysicalResult {
            carrier_concentration: n_a,
            fit: *fit,
            report: None,
        });
    }

    let w_nm = (2.0 * eps_s * v_bi_mag / (q * n_a)).sqrt() * METERS_TO_NANOMETERS;
    if !w_nm.is_finite() {
        return Err(CvError::NonPhysicalResult {
            carrier_concentration: n_a,
            fit: *fit,
            report: None,
        });
    }

    Ok(DerivedParameters {
        built_in_potential: v_bi,
        built_in_potential_mag: v_bi_mag,
        carrier_concentration: n_a,
        depletion_width_nm: w_nm,
    })
}
