use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use cv_depletion::config::{ConfigFile, ConstantsSection, WindowSection};
use cv_depletion::{
    analyze_transformed, parse_csv, select_window, transform, AnalysisConfig, AnalysisReport,
    AnalysisWindow, BiasPolarity, CvError, DeviceProperties, Diagnostics, FitResult,
    InvalidSamplePolicy, Material, MeasurementTable, NonPhysicalReport, QualityFlag, Transformed,
};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod plot;

use plot::{render_chart_guard, ChartKind, GraphKind, PlotData};

#[derive(Parser, Debug)]
#[command(author, version, about = "C-V depletion analysis CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit 1/C^2 against bias and derive V_bi, N_A and W for one or more CSV exports
    Analyze(AnalyzeArgs),
    /// Report columns, device properties and window coverage without fitting
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// CSV exports with VBias, C and G columns
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// TOML settings file; flags override its values
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Lower bound of the fit window (V)
    #[arg(long, allow_negative_numbers = true)]
    min_v: Option<f64>,

    /// Upper bound of the fit window (V)
    #[arg(long, allow_negative_numbers = true)]
    max_v: Option<f64>,

    /// Semiconductor material (si, ge, gaas, sic, gan)
    #[arg(long, conflicts_with = "eps_r")]
    material: Option<Material>,

    /// Relative permittivity of the semiconductor
    #[arg(long)]
    eps_r: Option<f64>,

    /// Junction area (m^2)
    #[arg(long)]
    area: Option<f64>,

    /// Override the elementary charge (C)
    #[arg(long)]
    elementary_charge: Option<f64>,

    /// Override the vacuum permittivity (F/m)
    #[arg(long)]
    vacuum_permittivity: Option<f64>,

    /// What to do with samples whose capacitance cannot be transformed
    #[arg(long, value_enum)]
    policy: Option<PolicyOpt>,

    /// Sign of the bias that reverse-biases the junction
    #[arg(long, value_enum)]
    polarity: Option<PolarityOpt>,

    /// Output JSON result path (`-` for stdout, single input only)
    #[arg(short, long, default_value = "cv_result.json", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Write the transformed samples as CSV
    #[arg(long, value_hint = ValueHint::FilePath)]
    samples_csv: Option<PathBuf>,

    /// Output PNG figure path (defaults next to the JSON)
    #[arg(long, value_hint = ValueHint::FilePath)]
    png: Option<PathBuf>,

    /// Output SVG figure path
    #[arg(long, value_hint = ValueHint::FilePath)]
    svg: Option<PathBuf>,

    /// Which graph to render
    #[arg(long, value_enum, default_value_t = GraphKind::InvC2)]
    graph: GraphKind,

    /// Disable plot generation
    #[arg(long, action = ArgAction::SetTrue)]
    no_plot: bool,

    /// Print the calculation steps
    #[arg(long, action = ArgAction::SetTrue)]
    steps: bool,

    /// Print the device properties
    #[arg(long, action = ArgAction::SetTrue)]
    properties: bool,

    /// Treat a non-physical doping result as a failure
    #[arg(long, action = ArgAction::SetTrue)]
    strict: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// CSV exports to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// TOML settings file; only the window is used
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Lower bound of the fit window (V)
    #[arg(long, allow_negative_numbers = true)]
    min_v: Option<f64>,

    /// Upper bound of the fit window (V)
    #[arg(long, allow_negative_numbers = true)]
    max_v: Option<f64>,

    /// Output report path (stdout when omitted)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum PolicyOpt {
    DropInvalid,
    RejectAll,
}

impl From<PolicyOpt> for InvalidSamplePolicy {
    fn from(value: PolicyOpt) -> Self {
        match value {
            PolicyOpt::DropInvalid => InvalidSamplePolicy::DropInvalid,
            PolicyOpt::RejectAll => InvalidSamplePolicy::RejectAll,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum PolarityOpt {
    ReverseNegative,
    ReversePositive,
}

impl From<PolarityOpt> for BiasPolarity {
    fn from(value: PolarityOpt) -> Self {
        match value {
            PolarityOpt::ReverseNegative => BiasPolarity::ReverseNegative,
            PolarityOpt::ReversePositive => BiasPolarity::ReversePositive,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Analyze(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Analyze(args) => handle_analyze(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    ConfigFile::from_toml_str(&text)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

fn window_layer(min_v: Option<f64>, max_v: Option<f64>) -> ConfigFile {
    ConfigFile {
        window: WindowSection { min_v, max_v },
        ..ConfigFile::default()
    }
}

fn flag_layer(args: &AnalyzeArgs) -> ConfigFile {
    ConfigFile {
        invalid_sample_policy: args.policy.map(Into::into),
        polarity: args.polarity.map(Into::into),
        constants: ConstantsSection {
            material: args.material,
            relative_permittivity: args.eps_r,
            junction_area_m2: args.area,
            elementary_charge: args.elementary_charge,
            vacuum_permittivity: args.vacuum_permittivity,
        },
        ..window_layer(args.min_v, args.max_v)
    }
}

/// Compiled defaults, then the config file, then flags.
fn build_config(args: &AnalyzeArgs) -> Result<AnalysisConfig> {
    let mut layered = ConfigFile::default();
    if let Some(path) = args.config.as_ref() {
        layered = layered.merge(load_config_file(path)?);
    }
    layered
        .merge(flag_layer(args))
        .resolve()
        .context("invalid analysis settings")
}

struct Processed {
    input: PathBuf,
    table: MeasurementTable,
    /// `None` when the reject-all policy stopped the transform.
    transformed: Option<Transformed>,
    outcome: Result<AnalysisReport, CvError>,
}

fn process_input(path: &Path, config: &AnalysisConfig) -> Result<Processed> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let table = parse_csv(&data).with_context(|| format!("failed to parse {}", path.display()))?;
    let (transformed, outcome) = match transform(&table.samples, config.invalid_sample_policy) {
        Ok(transformed) => {
            let outcome = analyze_transformed(&transformed, table.len(), config);
            (Some(transformed), outcome)
        }
        Err(err) => (None, Err(err)),
    };
    Ok(Processed {
        input: path.to_path_buf(),
        table,
        transformed,
        outcome,
    })
}

fn handle_analyze(args: AnalyzeArgs) -> Result<()> {
    if args.inputs.is_empty() {
        return Err(anyhow!("no input files supplied"));
    }
    let json_to_stdout = args.output.as_os_str() == "-";
    if json_to_stdout && args.inputs.len() > 1 {
        return Err(anyhow!(
            "`-o -` writes a single JSON document; give an output file for {} inputs",
            args.inputs.len()
        ));
    }
    let config = build_config(&args)?;
    info!(
        "Window [{}, {}] V, eps_r {}, area {:e} m^2",
        config.window.min_v,
        config.window.max_v,
        config.constants.relative_permittivity,
        config.constants.junction_area_m2
    );

    // Files are independent; results come back in input order.
    let results: Vec<(PathBuf, Result<Processed>)> = args
        .inputs
        .par_iter()
        .map(|path| (path.clone(), process_input(path, &config)))
        .collect();

    let tags = output_tags(&args.inputs);
    let mut view: Box<dyn Write> = if json_to_stdout {
        Box::new(io::stderr())
    } else {
        Box::new(io::stdout())
    };

    let mut failures = 0usize;
    for ((path, result), tag) in results.into_iter().zip(tags) {
        let processed = match result {
            Ok(processed) => processed,
            Err(err) => {
                error!("{:#}", err);
                failures += 1;
                continue;
            }
        };
        if !present(&processed, &config, &args, tag.as_deref(), view.as_mut())? {
            warn!("Analysis failed for {}", path.display());
            failures += 1;
        }
    }

    if failures > 0 {
        return Err(anyhow!(
            "{} of {} input(s) failed",
            failures,
            args.inputs.len()
        ));
    }
    Ok(())
}

/// Print and write everything for one input. Returns `false` when the
/// input counts as failed.
fn present(
    processed: &Processed,
    config: &AnalysisConfig,
    args: &AnalyzeArgs,
    tag: Option<&str>,
    view: &mut dyn Write,
) -> Result<bool> {
    let input = &processed.input;
    if tag.is_some() {
        writeln!(view, "== {} ==", input.display())?;
    }

    let succeeded = match &processed.outcome {
        Ok(report) => {
            for line in report.summary_lines() {
                writeln!(view, "{}", line)?;
            }
            if args.steps {
                writeln!(view)?;
                write!(view, "{}", report.calculation_steps())?;
            }
            true
        }
        Err(err @ CvError::NonPhysicalResult { fit, .. }) => {
            warn!("{}: {}", input.display(), err);
            if let Some(record) = err.non_physical_report() {
                for line in record.summary_lines() {
                    writeln!(view, "{}", line)?;
                }
            }
            writeln!(view, "{}", fit_line(fit))?;
            !args.strict
        }
        Err(err) => {
            error!("{}: {}", input.display(), err);
            false
        }
    };

    if args.properties {
        writeln!(view)?;
        write_properties(&processed.table.properties, view)?;
    }
    if tag.is_some() {
        writeln!(view)?;
    }

    let output = suffixed_path(&args.output, tag);
    write_result_document(processed, &output)?;
    if output.as_os_str() != "-" {
        info!("Wrote result: {}", output.display());
    }

    let Some(transformed) = processed.transformed.as_ref() else {
        return Ok(succeeded);
    };

    if let Some(base) = args.samples_csv.as_ref() {
        let path = suffixed_path(base, tag);
        write_samples_csv(transformed, &config.window, &path)?;
        info!("Wrote samples CSV: {}", path.display());
    }

    if !args.no_plot {
        let data = plot_data(processed, transformed, config);
        let png = match args.png.as_ref() {
            Some(path) => Some(suffixed_path(path, tag)),
            None if output.as_os_str() != "-" => Some(output.with_extension("png")),
            None => None,
        };
        if let Some(path) = png {
            match render_chart_guard(&data, &path, ChartKind::Png, args.graph) {
                Ok(()) => info!("Wrote plot: {}", path.display()),
                Err(err) => warn!("Skipping PNG render ({}): {}", path.display(), err),
            }
        }
        if let Some(path) = args.svg.as_ref() {
            let path = suffixed_path(path, tag);
            match render_chart_guard(&data, &path, ChartKind::Svg, args.graph) {
                Ok(()) => info!("Wrote plot: {}", path.display()),
                Err(err) => warn!("Skipping SVG render ({}): {}", path.display(), err),
            }
        }
    }

    Ok(succeeded)
}

fn fit_line(fit: &FitResult) -> String {
    format!(
        "Fit: 1/C^2 = {:.4e} * V + {:.4e} (R^2 = {:.4}, {} points)",
        fit.slope,
        fit.intercept,
        fit.r_squared(),
        fit.n
    )
}

fn write_properties(properties: &DeviceProperties, view: &mut dyn Write) -> Result<()> {
    writeln!(view, "Device properties:")?;
    for (name, value) in &properties.entries {
        writeln!(view, "  {}: {}", name, value)?;
    }
    Ok(())
}

/// Per-input name suffixes: `None` for a single input, otherwise the input
/// stem, extended with the 1-based input position when stems repeat.
fn output_tags(inputs: &[PathBuf]) -> Vec<Option<String>> {
    if inputs.len() < 2 {
        return vec![None; inputs.len()];
    }
    let stems: Vec<&str> = inputs
        .iter()
        .map(|p| p.file_stem().and_then(|s| s.to_str()).unwrap_or("input"))
        .collect();
    stems
        .iter()
        .enumerate()
        .map(|(i, stem)| {
            let repeated = stems.iter().filter(|other| *other == stem).count() > 1;
            Some(if repeated {
                format!("{}_{}", stem, i + 1)
            } else {
                stem.to_string()
            })
        })
        .collect()
}

/// `out.json` becomes `out_<tag>.json`; stdout and untagged paths are kept.
fn suffixed_path(base: &Path, tag: Option<&str>) -> PathBuf {
    let Some(tag) = tag else {
        return base.to_path_buf();
    };
    if base.as_os_str() == "-" {
        return base.to_path_buf();
    }
    let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("cv_result");
    let name = match base.extension().and_then(|s| s.to_str()) {
        Some(ext) => format!("{}_{}.{}", stem, tag, ext),
        None => format!("{}_{}", stem, tag),
    };
    base.with_file_name(name)
}

#[derive(Serialize)]
struct ResultDocument<'a> {
    generated_at: String,
    tool_version: &'static str,
    input: String,
    properties: &'a DeviceProperties,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a AnalysisReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    calculation_steps: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// Fit, V_bi, N_A and diagnostics of a non-physical run.
    #[serde(skip_serializing_if = "Option::is_none")]
    non_physical: Option<&'a NonPhysicalReport>,
}

impl<'a> ResultDocument<'a> {
    fn new(processed: &'a Processed) -> Self {
        let (report, error, non_physical) = match &processed.outcome {
            Ok(report) => (Some(report), None, None),
            Err(err) => (None, Some(err.to_string()), err.non_physical_report()),
        };
        Self {
            generated_at: Utc::now().to_rfc3339(),
            tool_version: env!("CARGO_PKG_VERSION"),
            input: processed.input.display().to_string(),
            properties: &processed.table.properties,
            report,
            calculation_steps: report.map(|r| r.calculation_steps()),
            error,
            non_physical,
        }
    }
}

fn write_result_document(processed: &Processed, path: &Path) -> Result<()> {
    let document = ResultDocument::new(processed);
    if path.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        serde_json::to_writer_pretty(&mut handle, &document)?;
        writeln!(handle)?;
        return Ok(());
    }
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, &document)
        .with_context(|| format!("failed to write {}", path.display()))
}

fn write_samples_csv(transformed: &Transformed, window: &AnalysisWindow, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_sample_rows(transformed, window, &mut writer)
}

fn write_sample_rows<W: Write>(
    transformed: &Transformed,
    window: &AnalysisWindow,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "index",
        "bias_v",
        "capacitance_f",
        "conductance_s",
        "inv_c_squared_f-2",
        "in_window",
    ])?;
    for sample in &transformed.samples {
        writer.write_record([
            sample.index().to_string(),
            format!("{}", sample.bias_voltage()),
            format!("{:e}", sample.capacitance()),
            format!("{:e}", sample.conductance()),
            format!("{:e}", sample.inv_c_squared()),
            window.contains(sample.bias_voltage()).to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// An extrapolated V_bi would stretch the axis past the data, so it is not drawn.
fn plotted_v_bi(diagnostics: &Diagnostics, v_bi: f64) -> Option<f64> {
    let extrapolated = diagnostics
        .quality_flags
        .iter()
        .any(|f| matches!(f, QualityFlag::ExtrapolatedBuiltInPotential { .. }));
    (!extrapolated).then_some(v_bi)
}

fn plot_data<'a>(
    processed: &Processed,
    transformed: &'a Transformed,
    config: &AnalysisConfig,
) -> PlotData<'a> {
    let (fit, v_bi) = match &processed.outcome {
        Ok(report) => (
            Some(report.fit),
            plotted_v_bi(&report.diagnostics, report.parameters.built_in_potential),
        ),
        Err(err @ CvError::NonPhysicalResult { fit, .. }) => (
            Some(*fit),
            err.non_physical_report()
                .and_then(|r| plotted_v_bi(&r.diagnostics, r.built_in_potential)),
        ),
        Err(_) => (None, None),
    };
    let title = processed
        .input
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("C-V")
        .to_string();
    PlotData {
        title,
        samples: &transformed.samples,
        window: config.window,
        fit,
        v_bi,
    }
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let mut layered = ConfigFile::default();
    if let Some(path) = args.config.as_ref() {
        layered = layered.merge(load_config_file(path)?);
    }
    let window = layered
        .merge(window_layer(args.min_v, args.max_v))
        .resolve_window()
        .context("invalid window")?;

    let mut report = String::new();
    for path in &args.inputs {
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let table =
            parse_csv(&data).with_context(|| format!("failed to parse {}", path.display()))?;
        report.push_str(&inspect_report(path, &table, &window)?);
        report.push('\n');
    }

    match args.output.as_ref() {
        Some(output) => {
            fs::write(output, report)
                .with_context(|| format!("failed to write {}", output.display()))?;
            info!("Inspection report written: {}", output.display());
        }
        None => print!("{}", report),
    }
    Ok(())
}

fn inspect_report(path: &Path, table: &MeasurementTable, window: &AnalysisWindow) -> Result<String> {
    let transformed = transform(&table.samples, InvalidSamplePolicy::DropInvalid)?;
    let in_window = select_window(&transformed.samples, window).len();

    let mut report = String::new();
    report.push_str(&format!("FILE: {}\n", path.display()));
    report.push_str(&format!("  columns: {}\n", table.columns.join(", ")));
    report.push_str(&format!("  rows: {}\n", table.len()));
    if let Some(range) = table.properties.get("Voltage Range") {
        report.push_str(&format!("  voltage_range: {}\n", range));
    }
    report.push_str(&format!(
        "  invalid_capacitance: {}\n",
        transformed.dropped_count()
    ));
    report.push_str(&format!(
        "  in_window [{:.2}, {:.2}] V: {}\n",
        window.min_v, window.max_v, in_window
    ));
    if in_window < cv_depletion::MIN_RECOMMENDED_POINTS {
        report.push_str("  note: fewer points in window than recommended for a fit\n");
    }
    report.push_str("  properties:\n");
    for (name, value) in &table.properties.entries {
        report.push_str(&format!("    - {}: {}\n", name, value));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SWEEP: &str = "\
VBias,C,G,Frequency
-6,0.98e-12,1e-6,1 MHz
-5,1.00e-12,1e-6,
-4,1.05e-12,1.1e-6,
-3,1.12e-12,1.2e-6,
-2,1.22e-12,1.3e-6,
-1,1.35e-12,1.4e-6,
0,,1.5e-6,
";

    fn analyze_args(extra: &[&str]) -> AnalyzeArgs {
        let mut argv = vec!["cv-depletion", "analyze"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Analyze(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_suffixed_path_only_when_tagged() {
        let base = Path::new("out/result.json");
        assert_eq!(suffixed_path(base, None), PathBuf::from("out/result.json"));
        assert_eq!(
            suffixed_path(base, Some("dev1")),
            PathBuf::from("out/result_dev1.json")
        );
        assert_eq!(suffixed_path(Path::new("-"), Some("dev1")), PathBuf::from("-"));
        assert_eq!(
            suffixed_path(Path::new("plots"), Some("dev1")),
            PathBuf::from("plots_dev1")
        );
    }

    #[test]
    fn test_output_tags_keep_repeated_stems_apart() {
        assert_eq!(output_tags(&[PathBuf::from("a/dev.csv")]), vec![None]);
        let tags = output_tags(&[
            PathBuf::from("a/dev.csv"),
            PathBuf::from("b/dev.csv"),
            PathBuf::from("b/other.csv"),
        ]);
        assert_eq!(
            tags,
            vec![
                Some("dev_1".to_string()),
                Some("dev_2".to_string()),
                Some("other".to_string())
            ]
        );
        let base = Path::new("out.json");
        assert_ne!(
            suffixed_path(base, tags[0].as_deref()),
            suffixed_path(base, tags[1].as_deref())
        );
    }

    #[test]
    fn test_same_named_inputs_write_separate_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut inputs = Vec::new();
        for sub in ["a", "b"] {
            fs::create_dir(dir.path().join(sub)).unwrap();
            let input = dir.path().join(sub).join("dev.csv");
            fs::write(&input, SWEEP).unwrap();
            inputs.push(input);
        }
        let output = dir.path().join("out.json");
        let args = analyze_args(&[
            inputs[0].to_str().unwrap(),
            inputs[1].to_str().unwrap(),
            "--material",
            "silicon",
            "--area",
            "1e-6",
            "--no-plot",
            "-o",
            output.to_str().unwrap(),
        ]);
        handle_analyze(args).unwrap();
        for (tag, input) in ["dev_1", "dev_2"].iter().zip(&inputs) {
            let path = dir.path().join(format!("out_{}.json", tag));
            let doc: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
            assert_eq!(doc["input"], input.display().to_string());
        }
    }

    #[test]
    fn test_stdout_json_rejects_several_inputs() {
        let args = analyze_args(&[
            "a.csv",
            "b.csv",
            "--material",
            "silicon",
            "--area",
            "1e-6",
            "-o",
            "-",
        ]);
        let err = handle_analyze(args).unwrap_err();
        assert!(err.to_string().contains("single JSON document"));
    }

    #[test]
    fn test_flags_build_config() {
        let args = analyze_args(&[
            "a.csv",
            "--min-v",
            "-4",
            "--material",
            "si",
            "--area",
            "1e-6",
            "--policy",
            "reject-all",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.window, AnalysisWindow::new(-4.0, -1.0).unwrap());
        assert_eq!(config.constants.relative_permittivity, 11.7);
        assert_eq!(config.invalid_sample_policy, InvalidSamplePolicy::RejectAll);
        assert_eq!(config.polarity, BiasPolarity::ReverseNegative);
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("cv.toml");
        fs::write(
            &cfg,
            "[window]\nmin_v = -3.0\nmax_v = -0.5\n[constants]\nmaterial = \"gallium_arsenide\"\njunction_area_m2 = 2e-7\n",
        )
        .unwrap();
        let args = analyze_args(&[
            "a.csv",
            "--config",
            cfg.to_str().unwrap(),
            "--eps-r",
            "11.9",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.window, AnalysisWindow::new(-3.0, -0.5).unwrap());
        assert_eq!(config.constants.relative_permittivity, 11.9);
        assert_eq!(config.constants.junction_area_m2, 2e-7);
    }

    #[test]
    fn test_missing_area_is_an_error() {
        let args = analyze_args(&["a.csv", "--material", "si"]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_sample_rows_mark_window() {
        let table = parse_csv(SWEEP.as_bytes()).unwrap();
        let transformed = transform(&table.samples, InvalidSamplePolicy::DropInvalid).unwrap();
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_sample_rows(&transformed, &AnalysisWindow::default(), &mut writer).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 7);
        assert!(lines[0].starts_with("index,bias_v"));
        assert!(lines[1].starts_with("0,-6,") && lines[1].ends_with(",false"));
        assert!(lines[2].starts_with("1,-5,") && lines[2].ends_with(",true"));
    }

    #[test]
    fn test_inspect_counts_invalid_and_window() {
        let table = parse_csv(SWEEP.as_bytes()).unwrap();
        let report =
            inspect_report(Path::new("sweep.csv"), &table, &AnalysisWindow::default()).unwrap();
        assert!(report.contains("rows: 7"));
        assert!(report.contains("invalid_capacitance: 1"));
        assert!(report.contains("in_window [-5.00, -1.00] V: 5"));
        assert!(report.contains("Frequency: 1 MHz"));
        assert!(!report.contains("note:"));
    }

    #[test]
    fn test_analyze_writes_json_and_samples() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("sweep.csv");
        fs::write(&input, SWEEP).unwrap();
        let output = dir.path().join("result.json");
        let samples = dir.path().join("samples.csv");
        let args = analyze_args(&[
            input.to_str().unwrap(),
            "--material",
            "silicon",
            "--area",
            "1e-6",
            "--no-plot",
            "-o",
            output.to_str().unwrap(),
            "--samples-csv",
            samples.to_str().unwrap(),
        ]);
        handle_analyze(args).unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        let v_bi = doc["report"]["parameters"]["built_in_potential"]
            .as_f64()
            .unwrap();
        assert!((v_bi - 3.899058551111773).abs() < 1e-9);
        assert_eq!(doc["report"]["diagnostics"]["points_used"], 5);
        assert_eq!(doc["properties"]["entries"][2][1], "1 MHz");
        assert!(doc["calculation_steps"].as_str().unwrap().contains("V_bi"));
        assert!(doc.get("error").is_none());
        assert_eq!(fs::read_to_string(&samples).unwrap().lines().count(), 7);
    }

    #[test]
    fn test_non_physical_is_warning_unless_strict() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("rising.csv");
        fs::write(
            &input,
            "VBias,C,G\n-5,1.35e-12,0\n-4,1.22e-12,0\n-3,1.12e-12,0\n-2,1.05e-12,0\n-1,1.00e-12,0\n",
        )
        .unwrap();
        let output = dir.path().join("rising.json");
        let base = [
            input.to_str().unwrap(),
            "--eps-r",
            "11.7",
            "--area",
            "1e-6",
            "--no-plot",
            "-o",
            output.to_str().unwrap(),
        ];
        handle_analyze(analyze_args(&base)).unwrap();
        let doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        let record = &doc["non_physical"];
        assert!(record["fit"]["slope"].as_f64().unwrap() > 0.0);
        assert!(record["carrier_concentration"].as_f64().unwrap() < 0.0);
        assert!(record["built_in_potential"].as_f64().is_some());
        assert_eq!(record["diagnostics"]["points_used"], 5);
        assert_eq!(record["diagnostics"]["used_indices"].as_array().unwrap().len(), 5);
        assert!(doc["error"].as_str().unwrap().contains("non-physical"));
        assert!(doc.get("report").is_none());

        let mut strict = base.to_vec();
        strict.push("--strict");
        assert!(handle_analyze(analyze_args(&strict)).is_err());
    }
}
