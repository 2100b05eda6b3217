//! Core record model, schema rules and destination naming for tabdrop.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest text value accepted by the bounded text columns.
pub const TEXT_COLUMN_MAX_CHARS: usize = 100;

/// Postgres truncates identifiers past this many bytes.
pub const MAX_TABLE_NAME_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Integer,
    Text { max_chars: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
}

/// Columns every record set must carry; destination tables are created with exactly these.
pub const REQUIRED_COLUMNS: [ColumnSpec; 3] = [
    ColumnSpec {
        name: "Index",
        kind: ColumnKind::Integer,
    },
    ColumnSpec {
        name: "Country",
        kind: ColumnKind::Text {
            max_chars: TEXT_COLUMN_MAX_CHARS,
        },
    },
    ColumnSpec {
        name: "Company",
        kind: ColumnKind::Text {
            max_chars: TEXT_COLUMN_MAX_CHARS,
        },
    },
];

/// Parsed contents of one tabular file: header columns plus rows aligned to them.
///
/// A `None` cell is a missing value and is written as NULL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordSet {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl RecordSet {
    /// Build a record set; rows shorter than the header are padded with missing values.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                if row.len() < width {
                    row.resize(width, None);
                }
                row
            })
            .collect();
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of the first column with exactly this name.
    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let position = self.column_position(column)?;
        self.rows.get(row)?.get(position)?.as_deref()
    }

    /// Project every row down to the required columns, dropping everything else.
    pub fn project_required(&self) -> Result<Vec<TargetRow>, MissingColumns> {
        let [Some(index), Some(country), Some(company)] =
            REQUIRED_COLUMNS.map(|spec| self.column_position(spec.name))
        else {
            return Err(MissingColumns {
                missing: missing_required(self),
            });
        };

        Ok(self
            .rows
            .iter()
            .map(|row| {
                let cell = |pos: usize| row.get(pos).cloned().flatten();
                TargetRow {
                    index: cell(index),
                    country: cell(country),
                    company: cell(company),
                }
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("missing required columns: {}", .missing.join(", "))]
pub struct MissingColumns {
    pub missing: Vec<String>,
}

/// Check that every required column is present. Names are compared exactly as parsed.
pub fn validate(records: &RecordSet) -> Result<(), MissingColumns> {
    let missing = missing_required(records);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(MissingColumns { missing })
    }
}

fn missing_required(records: &RecordSet) -> Vec<String> {
    REQUIRED_COLUMNS
        .iter()
        .filter(|spec| records.column_position(spec.name).is_none())
        .map(|spec| spec.name.to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum TableNameError {
    #[error("path {0} has no file name")]
    NoFileName(String),
    #[error("derived table name is empty")]
    Empty,
    #[error("table name `{name}` is {len} bytes, limit is {max}", max = MAX_TABLE_NAME_LEN)]
    TooLong { name: String, len: usize },
    #[error("table name `{name}` contains disallowed character {ch:?}")]
    InvalidCharacter { name: String, ch: char },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum ValidationError {
    #[error(transparent)]
    MissingColumns(#[from] MissingColumns),
    #[error("invalid destination: {0}")]
    InvalidTableName(#[from] TableNameError),
}

/// Replace the separators tolerated in file names with underscores.
pub fn derive_identifier(stem: &str) -> String {
    stem.replace(['-', ' '], "_")
}

/// Base name of the file without its extension.
pub fn destination_stem(path: &Path) -> Result<String, TableNameError> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .ok_or_else(|| TableNameError::NoFileName(path.display().to_string()))
}

/// Allow-listed destination table identifier: ASCII letters, digits and `_`, 1..=63 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TableName(String);

impl TableName {
    pub fn parse(raw: &str) -> Result<Self, TableNameError> {
        let name = derive_identifier(raw);
        if name.is_empty() {
            return Err(TableNameError::Empty);
        }
        if let Some(ch) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
        {
            return Err(TableNameError::InvalidCharacter { name, ch });
        }
        if name.len() > MAX_TABLE_NAME_LEN {
            let len = name.len();
            return Err(TableNameError::TooLong { name, len });
        }
        Ok(Self(name))
    }

    pub fn for_path(path: &Path) -> Result<Self, TableNameError> {
        Self::parse(&destination_stem(path)?)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for splicing into SQL text.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record projected to the required columns, still holding the raw text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRow {
    pub index: Option<String>,
    pub country: Option<String>,
    pub company: Option<String>,
}

/// A target row coerced to the destination column types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedRow {
    pub index: Option<i32>,
    pub country: Option<String>,
    pub company: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("value {value:?} in column {column} is not a 32-bit integer")]
    NotAnInteger { column: &'static str, value: String },
    #[error("value in column {column} is {chars} characters, limit is {max}")]
    TooLong {
        column: &'static str,
        chars: usize,
        max: usize,
    },
}

impl TargetRow {
    pub fn coerce(&self) -> Result<TypedRow, ValueError> {
        Ok(TypedRow {
            index: coerce_integer(REQUIRED_COLUMNS[0].name, self.index.as_deref())?,
            country: coerce_text(REQUIRED_COLUMNS[1], self.country.as_deref())?,
            company: coerce_text(REQUIRED_COLUMNS[2], self.company.as_deref())?,
        })
    }
}

fn coerce_integer(column: &'static str, raw: Option<&str>) -> Result<Option<i32>, ValueError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<i32>() {
        return Ok(Some(value));
    }
    // Integer columns with gaps come out of spreadsheet exports as `7.0`.
    match trimmed.parse::<f64>() {
        Ok(value)
            if value.is_finite()
                && value.fract() == 0.0
                && value >= f64::from(i32::MIN)
                && value <= f64::from(i32::MAX) =>
        {
            Ok(Some(value as i32))
        }
        _ => Err(ValueError::NotAnInteger {
            column,
            value: raw.to_string(),
        }),
    }
}

fn coerce_text(spec: ColumnSpec, raw: Option<&str>) -> Result<Option<String>, ValueError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if let ColumnKind::Text { max_chars } = spec.kind {
        let chars = raw.chars().count();
        if chars > max_chars {
            return Err(ValueError::TooLong {
                column: spec.name,
                chars,
                max: max_chars,
            });
        }
    }
    Ok(Some(raw.to_string()))
}
