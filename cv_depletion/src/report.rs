//! Text renderings of an [`AnalysisReport`]. Every number printed here is
//! read back from the record; nothing is recomputed from raw data.

use std::fmt::Write;

use crate::analysis::{AnalysisReport, NonPhysicalReport};
use crate::physics::BiasPolarity;

impl AnalysisReport {
    /// Results view: one line per reported quantity.
    pub fn summary_lines(&self) -> Vec<String> {
        let p = &self.parameters;
        vec![
            format!("Built-in Potential (V_bi): {:.4} V", p.built_in_potential),
            format!("|V_bi|: {:.4} V", p.built_in_potential_mag),
            format!(
                "Carrier Concentration (N_A): {:.4e} m^-3 = {:.4e} cm^-3",
                p.carrier_concentration,
                p.carrier_concentration_cm3()
            ),
            format!("Depletion Width (W): {:.4} nm", p.depletion_width_nm),
            format!("R^2 Value: {:.4}", self.r_squared()),
        ]
    }

    /// Step-by-step derivation narrative.
    pub fn calculation_steps(&self) -> String {
        let fit = &self.fit;
        let p = &self.parameters;
        let c = &self.constants;
        let eps_s = c.semiconductor_permittivity();
        let area_sq = c.junction_area_m2 * c.junction_area_m2;
        let (na_formula, na_sign) = match self.polarity {
            BiasPolarity::ReverseNegative => ("-2/(q x eps_s x A^2 x slope)", "-2"),
            BiasPolarity::ReversePositive => ("2/(q x eps_s x A^2 x slope)", "2"),
        };

        let mut out = String::new();
        let _ = writeln!(out, "1. Plotting C-V Characteristics:");
        let _ = writeln!(out, "   - Generated 1/C^2 vs. V data");
        let _ = writeln!(
            out,
            "   - Selected voltage range: {} V to {} V",
            self.window.min_v, self.window.max_v
        );
        let _ = writeln!(
            out,
            "   - Linear regression performed on {} point(s)",
            self.diagnostics.points_used
        );
        let _ = writeln!(
            out,
            "   - Found linear relationship: 1/C^2 = {:.4e} x V + {:.4e}",
            fit.slope, fit.intercept
        );
        let _ = writeln!(out, "   - R^2 value: {:.4}", self.r_squared());
        let _ = writeln!(out);
        let _ = writeln!(out, "2. Extracting Key Parameters:");
        let _ = writeln!(
            out,
            "   - Built-in Potential (V_bi): -intercept/slope = -({:.4e})/({:.4e}) = {:.4} V",
            fit.intercept, fit.slope, p.built_in_potential
        );
        let _ = writeln!(out, "   - Carrier Concentration (N_A): {}", na_formula);
        let _ = writeln!(
            out,
            "     = {}/({:e} x {:e} x {:e} x {:e})",
            na_sign, c.elementary_charge, eps_s, area_sq, fit.slope
        );
        let _ = writeln!(out, "     = {:.4e} m^-3", p.carrier_concentration);
        let _ = writeln!(out);
        let _ = writeln!(out, "3. Calculating Depletion Width:");
        let _ = writeln!(out, "   - Using formula: W = sqrt(2 x eps_s x |V_bi| / (q x N_A))");
        let _ = writeln!(
            out,
            "   - W = sqrt(2 x {:e} x {:.4} / ({:e} x {:.4e}))",
            eps_s, p.built_in_potential_mag, c.elementary_charge, p.carrier_concentration
        );
        let _ = writeln!(out, "   - W = {:.4} nm (with V_ext = 0)", p.depletion_width_nm);

        if self.diagnostics.dropped_count() > 0 || self.is_flagged() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Diagnostics:");
            if self.diagnostics.dropped_count() > 0 {
                let _ = writeln!(
                    out,
                    "   - {} sample(s) dropped for unusable capacitance",
                    self.diagnostics.dropped_count()
                );
            }
            for flag in &self.diagnostics.quality_flags {
                let _ = writeln!(out, "   - {}", flag.describe());
            }
        }
        out
    }
}

impl NonPhysicalReport {
    /// Results view of a run whose N_A came out non-positive.
    pub fn summary_lines(&self) -> Vec<String> {
        vec![
            format!("Built-in Potential (V_bi): {:.4} V", self.built_in_potential),
            format!("|V_bi|: {:.4} V", self.built_in_potential_mag),
            format!(
                "Carrier Concentration (N_A): {:.4e} m^-3 (not positive)",
                self.carrier_concentration
            ),
            "Depletion Width (W): undefined".to_string(),
            format!("R^2 Value: {:.4}", self.fit.r_squared()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use crate::analysis::{analyze, AnalysisConfig};
    use crate::fit::AnalysisWindow;
    use crate::physics::{Material, PhysicalConstants};
    use crate::transform::Sample;

    fn report() -> crate::AnalysisReport {
        let samples: Vec<Sample> = [-5.0, -4.0, -3.0, -2.0, -1.0, 0.0]
            .iter()
            .map(|&v: &f64| Sample::new(v, 1.0 / (-1e23 * v + 1e23_f64).sqrt(), 0.0))
            .collect();
        let cfg = AnalysisConfig::new(
            AnalysisWindow::default(),
            PhysicalConstants::for_material(Material::Silicon, 1e-6),
        );
        analyze(&samples, &cfg).unwrap()
    }

    #[test]
    fn test_steps_quote_recorded_numbers() {
        let r = report();
        let steps = r.calculation_steps();
        assert!(steps.contains("Selected voltage range: -5 V to -1 V"));
        assert!(steps.contains("performed on 5 point(s)"));
        assert!(steps.contains(&format!("= {:.4} V", r.parameters.built_in_potential)));
        assert!(steps.contains(&format!("W = {:.4} nm", r.parameters.depletion_width_nm)));
        assert!(steps.contains("-2/(q x eps_s x A^2 x slope)"));
        assert!(!steps.contains("Diagnostics:"));
    }

    #[test]
    fn test_steps_are_reproducible_from_record() {
        let r = report();
        let copy: crate::AnalysisReport =
            serde_json::from_str(&serde_json::to_string(&r).unwrap()).unwrap();
        assert_eq!(r.calculation_steps(), copy.calculation_steps());
        assert_eq!(r.summary_lines(), copy.summary_lines());
    }

    #[test]
    fn test_summary_has_both_concentration_units() {
        let lines = report().summary_lines();
        assert_eq!(lines.len(), 5);
        assert!(lines[2].contains("m^-3") && lines[2].contains("cm^-3"));
    }

    #[test]
    fn test_non_physical_summary_marks_width_undefined() {
        let samples: Vec<Sample> = [-5.0, -4.0, -3.0, -2.0, -1.0]
            .iter()
            .map(|&v: &f64| Sample::new(v, 1.0 / (1e23 * v + 8e23_f64).sqrt(), 0.0))
            .collect();
        let cfg = AnalysisConfig::new(
            AnalysisWindow::default(),
            PhysicalConstants::for_material(Material::Silicon, 1e-6),
        );
        let err = analyze(&samples, &cfg).unwrap_err();
        let lines = err.non_physical_report().unwrap().summary_lines();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "Built-in Potential (V_bi): -8.0000 V");
        assert!(lines[2].contains("not positive"));
        assert_eq!(lines[3], "Depletion Width (W): undefined");
    }
}
