//! Row Validator
//!
//! Turns uploaded delimited text into typed [`ValidatedRow`]s. Structural
//! problems (missing header labels, no data) fail the whole upload; rows with
//! empty or non-numeric readings are dropped one by one and never reported
//! individually.

use csv::ReaderBuilder;
use thiserror::Error;

use crate::models::ValidatedRow;

pub const COL_NAME: &str = "Equipment Name";
pub const COL_TYPE: &str = "Type";
pub const COL_FLOWRATE: &str = "Flowrate";
pub const COL_PRESSURE: &str = "Pressure";
pub const COL_TEMPERATURE: &str = "Temperature";

/// Header labels every upload must carry, matched exactly.
pub const REQUIRED_COLUMNS: [&str; 5] =
    [COL_NAME, COL_TYPE, COL_FLOWRATE, COL_PRESSURE, COL_TEMPERATURE];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("CSV file is empty")]
    EmptyInput,

    #[error("No valid data rows found in CSV file")]
    NoValidRows,

    #[error("Invalid CSV format: {0}")]
    Malformed(String),
}

/// Header plus data rows, every cell kept as the raw string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    /// Decode comma-delimited text with a header row. Ragged rows are kept
    /// as-is; missing trailing cells are treated as empty by [`validate`].
    pub fn from_csv(bytes: &[u8]) -> Result<Self, ValidationError> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes);

        let headers: Vec<String> = rdr
            .headers()
            .map_err(|e| ValidationError::Malformed(e.to_string()))?
            .iter()
            .map(|h| h.to_string())
            .collect();

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record.map_err(|e| ValidationError::Malformed(e.to_string()))?;
            rows.push(record.iter().map(|c| c.to_string()).collect());
        }

        Ok(Self { headers, rows })
    }

    fn column(&self, label: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == label)
    }
}

struct ColumnIndex {
    name: usize,
    equipment_type: usize,
    flowrate: usize,
    pressure: usize,
    temperature: usize,
}

impl ColumnIndex {
    fn resolve(table: &RawTable) -> Result<Self, ValidationError> {
        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|label| table.column(label).is_none())
            .map(|label| label.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ValidationError::MissingColumns(missing));
        }

        let find = |label: &str| table.column(label).ok_or_else(|| {
            ValidationError::MissingColumns(vec![label.to_string()])
        });
        Ok(Self {
            name: find(COL_NAME)?,
            equipment_type: find(COL_TYPE)?,
            flowrate: find(COL_FLOWRATE)?,
            pressure: find(COL_PRESSURE)?,
            temperature: find(COL_TEMPERATURE)?,
        })
    }
}

/// Validate a decoded table, returning surviving rows in input order.
///
/// Name and type cells come back with surrounding whitespace removed, so
/// `"Pump"` and `" Pump "` count as one category.
pub fn validate(table: &RawTable) -> Result<Vec<ValidatedRow>, ValidationError> {
    // No header row at all: nothing was uploaded.
    if table.headers.is_empty() {
        return Err(ValidationError::EmptyInput);
    }

    let columns = ColumnIndex::resolve(table)?;

    if table.rows.is_empty() {
        return Err(ValidationError::EmptyInput);
    }

    let rows: Vec<ValidatedRow> = table
        .rows
        .iter()
        .filter_map(|row| validate_row(row, &columns))
        .collect();

    if rows.is_empty() {
        return Err(ValidationError::NoValidRows);
    }
    Ok(rows)
}

/// One row, or `None` if it must be dropped. Every cell is trimmed before
/// the emptiness check, and the name and type are stored trimmed: a cell of
/// `" Pump "` becomes `"Pump"`, and one holding only whitespace drops the row.
fn validate_row(row: &[String], columns: &ColumnIndex) -> Option<ValidatedRow> {
    let cell = |idx: usize| row.get(idx).map(|c| c.trim()).filter(|c| !c.is_empty());

    let name = cell(columns.name)?;
    let equipment_type = cell(columns.equipment_type)?;
    let flowrate = parse_reading(cell(columns.flowrate)?)?;
    let pressure = parse_reading(cell(columns.pressure)?)?;
    let temperature = parse_reading(cell(columns.temperature)?)?;

    Some(ValidatedRow {
        name: name.to_string(),
        equipment_type: equipment_type.to_string(),
        flowrate,
        pressure,
        temperature,
    })
}

/// Locale-independent decimal parse. `inf` and `NaN` spellings parse in
/// Rust but are rejected here: every stored reading is finite.
fn parse_reading(cell: &str) -> Option<f64> {
    cell.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
