//! CSV ingestion for the holdings and trades exports.
//!
//! Each collection has a column schema; unknown columns are kept as strings.
//! Every record gets an `_id` plus `created_at`/`updated_at` timestamps, and
//! records are inserted through [`SqliteStorage::insert_documents`], which
//! commits in batches.

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use tracing::{info, warn};

use crate::error::IngestError;
use crate::query::value::{date_value, new_object_id};
use crate::storage::SqliteStorage;

/// Date formats tried in order for `date` columns.
const CSV_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y", "%Y/%m/%d"];

/// How a CSV column is typed on ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Kept as trimmed text.
    Text,
    /// Parsed as a 64-bit float.
    Float,
    /// Parsed as a calendar date (midnight UTC).
    Date,
    /// `true`, `1` and `yes` (any case) are true; anything else is false.
    Bool,
}

/// Column typing for one collection.
#[derive(Debug, Clone, Copy)]
pub struct CollectionSchema {
    /// Target collection.
    pub collection: &'static str,
    columns: &'static [(&'static str, ColumnType)],
}

impl CollectionSchema {
    /// Type of a column; unknown columns are text.
    #[must_use]
    pub fn column_type(&self, name: &str) -> ColumnType {
        self.columns
            .iter()
            .find(|(column, _)| *column == name)
            .map_or(ColumnType::Text, |(_, ty)| *ty)
    }
}

/// Holdings export.
pub const HOLDINGS: CollectionSchema = CollectionSchema {
    collection: "holdings",
    columns: &[
        ("AsOfDate", ColumnType::Date),
        ("OpenDate", ColumnType::Date),
        ("CloseDate", ColumnType::Date),
        ("StartQty", ColumnType::Float),
        ("Qty", ColumnType::Float),
        ("StartPrice", ColumnType::Float),
        ("Price", ColumnType::Float),
        ("StartFXRate", ColumnType::Float),
        ("FXRate", ColumnType::Float),
        ("MV_Local", ColumnType::Float),
        ("MV_Base", ColumnType::Float),
        ("PL_DTD", ColumnType::Float),
        ("PL_QTD", ColumnType::Float),
        ("PL_MTD", ColumnType::Float),
        ("PL_YTD", ColumnType::Float),
    ],
};

/// Trades export.
pub const TRADES: CollectionSchema = CollectionSchema {
    collection: "trades",
    columns: &[
        ("TradeDate", ColumnType::Date),
        ("SettleDate", ColumnType::Date),
        ("Quantity", ColumnType::Float),
        ("Price", ColumnType::Float),
        ("TradeFXRate", ColumnType::Float),
        ("Principal", ColumnType::Float),
        ("Interest", ColumnType::Float),
        ("TotalCash", ColumnType::Float),
        ("AllocationQTY", ColumnType::Float),
        ("AllocationPrincipal", ColumnType::Float),
        ("AllocationInterest", ColumnType::Float),
        ("AllocationFees", ColumnType::Float),
        ("AllocationCash", ColumnType::Float),
        ("IsCustomAllocation", ColumnType::Bool),
    ],
};

/// Converts one raw cell. Blank cells and unparseable numbers or dates are
/// `null`.
#[must_use]
pub fn convert_cell(raw: &str, ty: ColumnType) -> Value {
    let raw = raw.trim();
    if raw.is_empty() {
        return Value::Null;
    }
    match ty {
        ColumnType::Text => Value::String(raw.to_string()),
        ColumnType::Float => raw
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map_or(Value::Null, Value::Number),
        ColumnType::Date => CSV_DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map_or(Value::Null, |dt| date_value(dt.and_utc())),
        ColumnType::Bool => Value::Bool(matches!(
            raw.to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        )),
    }
}

/// Reads a CSV file into typed documents.
///
/// # Errors
///
/// Returns [`IngestError::Csv`] if the file cannot be opened or a row is
/// malformed.
pub fn load_csv(
    path: &Path,
    schema: &CollectionSchema,
    now: DateTime<Utc>,
) -> Result<Vec<Value>, IngestError> {
    let csv_err = |source| IngestError::Csv {
        path: path.display().to_string(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    let headers = reader.headers().map_err(csv_err)?.clone();
    let stamp = date_value(now);

    let mut docs = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_err)?;
        let mut doc = Map::new();
        doc.insert("_id".to_string(), new_object_id());
        for (column, cell) in headers.iter().zip(row.iter()) {
            doc.insert(
                column.to_string(),
                convert_cell(cell, schema.column_type(column)),
            );
        }
        doc.insert("created_at".to_string(), stamp.clone());
        doc.insert("updated_at".to_string(), stamp.clone());
        docs.push(Value::Object(doc));
    }
    Ok(docs)
}

/// Documents loaded per collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Holdings inserted.
    pub holdings: usize,
    /// Trades inserted.
    pub trades: usize,
}

/// Loads one CSV file into its collection, optionally clearing it first.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the insert fails.
pub fn ingest_file(
    storage: &SqliteStorage,
    path: &Path,
    schema: &CollectionSchema,
    replace: bool,
) -> Result<usize, IngestError> {
    let docs = load_csv(path, schema, Utc::now())?;
    if replace {
        let removed = storage.clear_collection(schema.collection)?;
        info!(collection = schema.collection, removed, "cleared collection");
    }
    let inserted = storage.insert_documents(schema.collection, &docs)?;
    info!(
        collection = schema.collection,
        path = %path.display(),
        inserted,
        "ingested CSV"
    );
    Ok(inserted)
}

/// Loads the holdings and trades exports. Paths that are not given or do not
/// exist are skipped.
///
/// # Errors
///
/// Returns the first read or insert failure.
pub fn ingest(
    storage: &SqliteStorage,
    holdings: Option<&Path>,
    trades: Option<&Path>,
    replace: bool,
) -> Result<IngestReport, IngestError> {
    let mut report = IngestReport::default();
    for (path, schema, slot) in [
        (holdings, &HOLDINGS, &mut report.holdings),
        (trades, &TRADES, &mut report.trades),
    ] {
        let Some(path) = path else { continue };
        if !path.exists() {
            warn!(collection = schema.collection, path = %path.display(), "CSV file not found, skipping");
            continue;
        }
        *slot = ingest_file(storage, path, schema, replace)?;
    }
    Ok(report)
}
