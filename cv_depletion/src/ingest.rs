//! CSV ingestion boundary: turns instrument exports into typed [`Sample`]s
//! once, so nothing downstream looks columns up by name.

use serde::{Deserialize, Serialize};

use crate::transform::Sample;
use crate::CvError;

pub const COL_BIAS: &str = "VBias";
pub const COL_CAPACITANCE: &str = "C";
pub const COL_CONDUCTANCE: &str = "G";

/// Optional metadata columns copied into [`DeviceProperties`].
pub const PROPERTY_COLUMNS: [&str; 5] = [
    "Record Time",
    "Monitor Unit",
    "Frequency",
    "Batch ID",
    "Record Date",
];

const NOT_AVAILABLE: &str = "N/A";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceProperties {
    /// Insertion-ordered `(name, value)` pairs.
    pub entries: Vec<(String, String)>,
}

impl DeviceProperties {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn push(&mut self, name: &str, value: String) {
        self.entries.push((name.to_string(), value));
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MeasurementTable {
    pub columns: Vec<String>,
    pub samples: Vec<Sample>,
    pub properties: DeviceProperties,
}

impl MeasurementTable {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Parse a CSV export with at least `VBias`, `C` and `G` columns.
///
/// Header names are trimmed. Blank `C`/`G` cells become NaN and are left for
/// the transform to flag; any other unparseable number is an error.
pub fn parse_csv(input: &[u8]) -> Result<MeasurementTable, CvError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .flexible(true)
        .from_reader(input);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| CvError::CsvParse(e.to_string()))?
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
        .collect();

    let find = |name: &str| headers.iter().position(|h| h == name);
    let required = [COL_BIAS, COL_CAPACITANCE, COL_CONDUCTANCE].map(|name| (name, find(name)));
    let [(_, Some(bias_idx)), (_, Some(cap_idx)), (_, Some(cond_idx))] = required else {
        let missing = required
            .iter()
            .filter(|(_, idx)| idx.is_none())
            .map(|(name, _)| name.to_string())
            .collect();
        return Err(CvError::MissingField(missing));
    };
    let property_idx: Vec<(&str, Option<usize>)> =
        PROPERTY_COLUMNS.iter().map(|&name| (name, find(name))).collect();
    let mut property_values: Vec<Option<String>> = vec![None; PROPERTY_COLUMNS.len()];

    let mut samples = Vec::new();
    for (row_idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| CvError::CsvParse(e.to_string()))?;
        let row = row_idx + 1;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }

        let bias = parse_number(record.get(bias_idx), row, COL_BIAS, false)?;
        let capacitance = parse_number(record.get(cap_idx), row, COL_CAPACITANCE, true)?;
        let conductance = parse_number(record.get(cond_idx), row, COL_CONDUCTANCE, true)?;
        samples.push(Sample::new(bias, capacitance, conductance));

        for (slot, (_, idx)) in property_values.iter_mut().zip(property_idx.iter()) {
            if slot.is_some() {
                continue;
            }
            if let Some(value) = idx.and_then(|i| record.get(i)).map(str::trim) {
                if !value.is_empty() {
                    *slot = Some(value.to_string());
                }
            }
        }
    }

    let mut properties = DeviceProperties::default();
    for ((name, _), value) in property_idx.iter().zip(property_values) {
        properties.push(name, value.unwrap_or_else(|| NOT_AVAILABLE.to_string()));
    }
    properties.push("Number of Data Points", samples.len().to_string());
    properties.push("Voltage Range", voltage_range_label(&samples));

    Ok(MeasurementTable {
        columns: headers,
        samples,
        properties,
    })
}

fn parse_number(
    field: Option<&str>,
    row: usize,
    column: &str,
    blank_is_nan: bool,
) -> Result<f64, CvError> {
    let raw = field.unwrap_or("").trim();
    if raw.is_empty() && blank_is_nan {
        return Ok(f64::NAN);
    }
    raw.parse::<f64>().map_err(|_| CvError::InvalidNumber {
        row,
        column: column.to_string(),
        value: raw.to_string(),
    })
}

fn voltage_range_label(samples: &[Sample]) -> String {
    let mut min_v = f64::INFINITY;
    let mut max_v = f64::NEG_INFINITY;
    for s in samples {
        min_v = min_v.min(s.bias_voltage);
        max_v = max_v.max(s.bias_voltage);
    }
    if min_v > max_v {
        return NOT_AVAILABLE.to_string();
    }
    format!("{:.2} V to {:.2} V", min_v, max_v)
}
