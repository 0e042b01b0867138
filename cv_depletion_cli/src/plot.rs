use std::ops::Range;
use std::panic;
use std::path::Path;

use anyhow::Result;
use clap::ValueEnum;
use cv_depletion::{AnalysisWindow, DerivedSample, FitResult};
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::{FontDesc, FontFamily, FontStyle};

/// 1/C² values are plotted in units of 1e24 F^-2.
const INV_C2_SCALE: f64 = 1e-24;
const PICO: f64 = 1e12;
const MICRO: f64 = 1e6;

const SINGLE_SIZE: (u32, u32) = (1280, 760);
const STACKED_SIZE: (u32, u32) = (1280, 1800);

pub enum ChartKind {
    Png,
    Svg,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum GraphKind {
    /// 1/C^2 against bias with the fit
    #[value(name = "inv-c2")]
    InvC2,
    /// Capacitance against bias
    C,
    /// Conductance against bias
    G,
    /// All three, stacked
    All,
}

pub struct PlotData<'a> {
    pub title: String,
    pub samples: &'a [DerivedSample],
    pub window: AnalysisWindow,
    pub fit: Option<FitResult>,
    /// `None` when the intercept was flagged as extrapolated.
    pub v_bi: Option<f64>,
}

pub fn render_chart_guard(
    data: &PlotData,
    path: &Path,
    kind: ChartKind,
    graph: GraphKind,
) -> Result<(), String> {
    let render = || -> Result<(), String> {
        render_chart(data, path, kind, graph).map_err(|e| format!("plotting error: {}", e))
    };

    panic::catch_unwind(panic::AssertUnwindSafe(render))
        .map_err(|_| "plotting backend panicked".to_string())?
}

fn render_chart(data: &PlotData, path: &Path, kind: ChartKind, graph: GraphKind) -> Result<()> {
    if data.samples.is_empty() {
        return Ok(());
    }
    let size = match graph {
        GraphKind::All => STACKED_SIZE,
        _ => SINGLE_SIZE,
    };
    match kind {
        ChartKind::Png => {
            let root = BitMapBackend::new(path, size).into_drawing_area();
            draw_graphs(root, data, graph)?;
        }
        ChartKind::Svg => {
            let root = SVGBackend::new(path, size).into_drawing_area();
            draw_graphs(root, data, graph)?;
        }
    }
    Ok(())
}

fn draw_graphs<DB>(root: DrawingArea<DB, Shift>, data: &PlotData, graph: GraphKind) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    root.fill(&WHITE)?;
    match graph {
        GraphKind::InvC2 => draw_inv_c2(&root, data)?,
        GraphKind::C => draw_capacitance(&root, data)?,
        GraphKind::G => draw_conductance(&root, data)?,
        GraphKind::All => {
            let areas = root.split_evenly((3, 1));
            draw_inv_c2(&areas[0], data)?;
            draw_capacitance(&areas[1], data)?;
            draw_conductance(&areas[2], data)?;
        }
    }
    root.present()?;
    Ok(())
}

fn title_font() -> FontDesc<'static> {
    FontDesc::new(FontFamily::SansSerif, 24.0, FontStyle::Normal)
}

fn axis_font() -> FontDesc<'static> {
    FontDesc::new(FontFamily::SansSerif, 18.0, FontStyle::Normal)
}

/// Span of `values` with 5% padding; a zero span is widened to +/-1.
fn padded_range(values: impl Iterator<Item = f64>) -> Option<Range<f64>> {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if lo > hi {
        return None;
    }
    let pad = if hi > lo { (hi - lo) * 0.05 } else { 1.0 };
    Some((lo - pad)..(hi + pad))
}

fn draw_inv_c2<DB>(area: &DrawingArea<DB, Shift>, data: &PlotData) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let points: Vec<(f64, f64)> = data
        .samples
        .iter()
        .map(|s| (s.bias_voltage(), s.inv_c_squared() * INV_C2_SCALE))
        .collect();
    let windowed: Vec<(f64, f64)> = data
        .samples
        .iter()
        .filter(|s| data.window.contains(s.bias_voltage()))
        .map(|s| (s.bias_voltage(), s.inv_c_squared() * INV_C2_SCALE))
        .collect();

    let Some(x_range) = padded_range(points.iter().map(|p| p.0).chain(data.v_bi)) else {
        return Ok(());
    };
    let fit_line: Vec<(f64, f64)> = data
        .fit
        .map(|fit| {
            [x_range.start, x_range.end]
                .iter()
                .map(|&v| (v, fit.predict(v) * INV_C2_SCALE))
                .collect()
        })
        .unwrap_or_default();
    let Some(y_range) = padded_range(
        points
            .iter()
            .map(|p| p.1)
            .chain(std::iter::once(0.0))
            .chain(fit_line.iter().map(|p| p.1)),
    ) else {
        return Ok(());
    };

    let mut chart = ChartBuilder::on(area)
        .caption(format!("{}: 1/C^2 vs V", data.title), title_font())
        .margin(20)
        .set_label_area_size(LabelAreaPosition::Left, 70)
        .set_label_area_size(LabelAreaPosition::Bottom, 50)
        .build_cartesian_2d(x_range.clone(), y_range.clone())?;

    chart
        .configure_mesh()
        .light_line_style(&BLACK.mix(0.05))
        .x_desc("Bias voltage (V)")
        .y_desc("1/C^2 (1e24 F^-2)")
        .x_label_formatter(&|v| format!("{:.1}", v))
        .y_label_formatter(&|v| format!("{:.2}", v))
        .label_style(axis_font().color(&BLACK.mix(0.85)))
        .draw()?;

    chart.draw_series(LineSeries::new(points.iter().copied(), BLUE.mix(0.4)))?;
    chart
        .draw_series(points.iter().map(|&p| Circle::new(p, 3, BLUE.filled())))?
        .label("All data")
        .legend(|(x, y)| Circle::new((x + 15, y), 4, BLUE.filled()));
    chart
        .draw_series(windowed.iter().map(|&p| Circle::new(p, 5, RED.filled())))?
        .label(format!(
            "Fit window [{}, {}] V",
            data.window.min_v, data.window.max_v
        ))
        .legend(|(x, y)| Circle::new((x + 15, y), 5, RED.filled()));

    if let Some(fit) = data.fit {
        let fit_style = ShapeStyle {
            color: BLACK.to_rgba(),
            filled: false,
            stroke_width: 2,
        };
        chart
            .draw_series(LineSeries::new(fit_line, fit_style))?
            .label(format!("Fit (R^2 = {:.4})", fit.r_squared()))
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 30, y)], BLACK));
    }

    if let Some(v_bi) = data.v_bi {
        chart
            .draw_series(LineSeries::new(
                vec![(v_bi, y_range.start), (v_bi, y_range.end)],
                GREEN.stroke_width(2),
            ))?
            .label(format!("V_bi = {:.3} V", v_bi))
            .legend(|(x, y)| {
                PathElement::new(vec![(x, y), (x + 30, y)], GREEN.stroke_width(2))
            });
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK.mix(0.3))
        .label_font(axis_font().color(&BLACK))
        .position(SeriesLabelPosition::UpperRight)
        .draw()?;
    Ok(())
}

fn draw_capacitance<DB>(area: &DrawingArea<DB, Shift>, data: &PlotData) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let points: Vec<(f64, f64)> = data
        .samples
        .iter()
        .map(|s| (s.bias_voltage(), s.capacitance() * PICO))
        .collect();
    draw_scatter(
        area,
        &format!("{}: C vs V", data.title),
        "Capacitance (pF)",
        &points,
        BLUE,
    )
}

fn draw_conductance<DB>(area: &DrawingArea<DB, Shift>, data: &PlotData) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let points: Vec<(f64, f64)> = data
        .samples
        .iter()
        .filter(|s| s.conductance().is_finite())
        .map(|s| (s.bias_voltage(), s.conductance() * MICRO))
        .collect();
    draw_scatter(
        area,
        &format!("{}: G vs V", data.title),
        "Conductance (uS)",
        &points,
        RGBColor(0, 128, 0),
    )
}

fn draw_scatter<DB>(
    area: &DrawingArea<DB, Shift>,
    caption: &str,
    y_desc: &str,
    points: &[(f64, f64)],
    color: RGBColor,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let (Some(x_range), Some(y_range)) = (
        padded_range(points.iter().map(|p| p.0)),
        padded_range(points.iter().map(|p| p.1)),
    ) else {
        return Ok(());
    };

    let mut chart = ChartBuilder::on(area)
        .caption(caption, title_font())
        .margin(20)
        .set_label_area_size(LabelAreaPosition::Left, 70)
        .set_label_area_size(LabelAreaPosition::Bottom, 50)
        .build_cartesian_2d(x_range, y_range)?;

    chart
        .configure_mesh()
        .light_line_style(&BLACK.mix(0.05))
        .x_desc("Bias voltage (V)")
        .y_desc(y_desc)
        .x_label_formatter(&|v| format!("{:.1}", v))
        .y_label_formatter(&|v| format!("{:.3}", v))
        .label_style(axis_font().color(&BLACK.mix(0.85)))
        .draw()?;

    chart.draw_series(LineSeries::new(points.iter().copied(), color.mix(0.5)))?;
    chart.draw_series(points.iter().map(|&p| Circle::new(p, 3, color.filled())))?;
    Ok(())
}
