//! Staging Loader: turns raw extracts into validated, canonical staging batches.
//!
//! Header labels drift between extract vintages, so every fact type declares its
//! canonical columns together with the aliases seen in the wild. Cells are coerced
//! to typed values; rows missing a natural key component or holding an uncoercible
//! value are quarantined rather than failing the whole file.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use mesw_core::{
    Attributes, EtlError, EtlResult, FieldValue, FileImportState, NaturalKey, RejectedRow,
    SourceFile, StagedRow, StagingBatch,
};
use mesw_storage::StagingStore;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strsim::jaro_winkler;
use tracing::{debug, info, warn};

pub mod source;

pub use source::{DirectorySource, ExtractSource, InMemorySource};

pub const CRATE_NAME: &str = "mesw-extract";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    #[default]
    Text,
    Integer,
    Decimal,
    Date,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ColumnType,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub required: bool,
}

/// Canonical schema of one fact table, supplied by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactTypeConfig {
    pub fact_type: String,
    pub natural_key: Vec<String>,
    #[serde(default)]
    pub event_date: Option<String>,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub delimiter: Option<char>,
    /// Keep columns the schema does not name, as text under their normalized header.
    #[serde(default)]
    pub keep_unmapped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractFormat {
    Delimited(u8),
    Json,
}

impl ExtractFormat {
    pub fn for_file(name: &str, delimiter: Option<char>) -> Self {
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "json" => ExtractFormat::Json,
            "tsv" => ExtractFormat::Delimited(delimiter.map(|c| c as u8).unwrap_or(b'\t')),
            _ => ExtractFormat::Delimited(delimiter.map(|c| c as u8).unwrap_or(b',')),
        }
    }
}

/// Lower-case, trim, and fold separators so `Batch No.` and `batch_no` compare equal.
pub fn normalize_header(raw: &str) -> String {
    let folded: String = raw
        .trim_start_matches('\u{feff}')
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    folded
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Compiled form of a [`FactTypeConfig`].
#[derive(Debug, Clone)]
pub struct ExtractSchema {
    config: FactTypeConfig,
    aliases: HashMap<String, usize>,
}

impl ExtractSchema {
    pub fn new(config: FactTypeConfig) -> EtlResult<Self> {
        if config.natural_key.is_empty() {
            return Err(EtlError::Config(format!(
                "fact type {} declares no natural key",
                config.fact_type
            )));
        }

        let mut aliases = HashMap::new();
        for (idx, column) in config.columns.iter().enumerate() {
            for label in std::iter::once(&column.name).chain(column.aliases.iter()) {
                let normalized = normalize_header(label);
                if let Some(previous) = aliases.insert(normalized.clone(), idx) {
                    if previous != idx {
                        return Err(EtlError::Config(format!(
                            "fact type {}: header `{label}` maps to both `{}` and `{}`",
                            config.fact_type, config.columns[previous].name, column.name
                        )));
                    }
                }
            }
        }

        for key in &config.natural_key {
            if !config.columns.iter().any(|c| &c.name == key) {
                return Err(EtlError::Config(format!(
                    "fact type {}: natural key column `{key}` is not declared",
                    config.fact_type
                )));
            }
        }

        if let Some(date_column) = &config.event_date {
            let column = config
                .columns
                .iter()
                .find(|c| &c.name == date_column)
                .ok_or_else(|| {
                    EtlError::Config(format!(
                        "fact type {}: event date column `{date_column}` is not declared",
                        config.fact_type
                    ))
                })?;
            if !matches!(column.kind, ColumnType::Date | ColumnType::Timestamp) {
                return Err(EtlError::Config(format!(
                    "fact type {}: event date column `{date_column}` must be a date or timestamp",
                    config.fact_type
                )));
            }
        }

        Ok(Self { config, aliases })
    }

    pub fn fact_type(&self) -> &str {
        &self.config.fact_type
    }

    pub fn config(&self) -> &FactTypeConfig {
        &self.config
    }

    fn is_required(&self, column: &ColumnSpec) -> bool {
        column.required || self.config.natural_key.contains(&column.name)
    }

    /// Parse an extract into a batch. Nothing is persisted here.
    pub fn parse(
        &self,
        state_id: uuid::Uuid,
        pipeline_name: &str,
        source: &SourceFile,
        bytes: &[u8],
        staged_at: DateTime<Utc>,
    ) -> EtlResult<StagingBatch> {
        let text = decode_text(source, bytes)?;
        let (rows, rejected) = match ExtractFormat::for_file(&source.name, self.config.delimiter) {
            ExtractFormat::Delimited(delimiter) => self.parse_delimited(source, text, delimiter)?,
            ExtractFormat::Json => self.parse_json(source, text)?,
        };

        debug!(
            fact_type = %self.config.fact_type,
            file = %source.path,
            staged = rows.len(),
            rejected = rejected.len(),
            "extract parsed"
        );

        Ok(StagingBatch {
            state_id,
            pipeline_name: pipeline_name.to_string(),
            fact_type: self.config.fact_type.clone(),
            source: source.clone(),
            rows,
            rejected,
            staged_at,
        })
    }

    fn parse_delimited(
        &self,
        source: &SourceFile,
        text: &str,
        delimiter: u8,
    ) -> EtlResult<(Vec<StagedRow>, Vec<RejectedRow>)> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let headers = reader
            .headers()
            .map_err(|err| csv_error(source, err))?
            .iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        if headers.iter().all(|h| h.trim().is_empty()) {
            return Err(EtlError::Format {
                file: source.path.to_string(),
                message: "extract has no header row".to_string(),
            });
        }
        let layout = self.resolve_headers(source, &headers)?;

        let mut rows = Vec::new();
        let mut rejected = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record.map_err(|err| csv_error(source, err))?;
            let line_no = record
                .position()
                .map(|p| p.line())
                .unwrap_or(idx as u64 + 2);
            if record.iter().all(|cell| cell.is_empty()) {
                continue;
            }
            let cells = layout
                .iter()
                .map(|(pos, target)| (target, record.get(*pos).unwrap_or("")));
            match self.stage_row(line_no, cells) {
                Ok(row) => rows.push(row),
                Err(reason) => rejected.push(RejectedRow { line_no, reason }),
            }
        }
        Ok((rows, rejected))
    }

    fn parse_json(
        &self,
        source: &SourceFile,
        text: &str,
    ) -> EtlResult<(Vec<StagedRow>, Vec<RejectedRow>)> {
        let value: JsonValue = serde_json::from_str(text).map_err(|err| EtlError::Format {
            file: source.path.to_string(),
            message: format!("invalid JSON row batch: {err}"),
        })?;
        let records = match &value {
            JsonValue::Array(items) => items.as_slice(),
            JsonValue::Object(map) => map
                .get("rows")
                .or_else(|| map.get("records"))
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .ok_or_else(|| EtlError::Format {
                    file: source.path.to_string(),
                    message: "JSON row batch needs a top-level array or a `rows` array".to_string(),
                })?,
            _ => {
                return Err(EtlError::Format {
                    file: source.path.to_string(),
                    message: "JSON row batch must be an array of objects".to_string(),
                })
            }
        };

        let mut headers: Vec<String> = Vec::new();
        for record in records {
            if let JsonValue::Object(map) = record {
                for key in map.keys() {
                    if !headers.contains(key) {
                        headers.push(key.clone());
                    }
                }
            }
        }
        let layout = self.resolve_headers(source, &headers)?;

        let mut rows = Vec::new();
        let mut rejected = Vec::new();
        for (idx, record) in records.iter().enumerate() {
            let line_no = idx as u64 + 1;
            let JsonValue::Object(map) = record else {
                rejected.push(RejectedRow {
                    line_no,
                    reason: "row is not a JSON object".to_string(),
                });
                continue;
            };
            let texts: Vec<(&Target, String)> = layout
                .iter()
                .map(|(pos, target)| (target, json_cell(map.get(&headers[*pos]))))
                .collect();
            let cells = texts.iter().map(|(target, text)| (*target, text.as_str()));
            match self.stage_row(line_no, cells) {
                Ok(row) => rows.push(row),
                Err(reason) => rejected.push(RejectedRow { line_no, reason }),
            }
        }
        Ok((rows, rejected))
    }

    /// Map source header positions onto canonical columns; fail when a required one is absent.
    fn resolve_headers(&self, source: &SourceFile, headers: &[String]) -> EtlResult<Vec<(usize, Target)>> {
        let mut layout = Vec::new();
        let mut seen = vec![false; self.config.columns.len()];

        for (pos, header) in headers.iter().enumerate() {
            let normalized = normalize_header(header);
            match self.aliases.get(&normalized) {
                Some(&idx) if seen[idx] => {
                    warn!(file = %source.path, header = %header, column = %self.config.columns[idx].name, "duplicate header ignored");
                }
                Some(&idx) => {
                    seen[idx] = true;
                    layout.push((pos, Target::Column(idx)));
                }
                None if self.config.keep_unmapped && !normalized.is_empty() => {
                    layout.push((pos, Target::Unmapped(normalized)));
                }
                None => {}
            }
        }

        let missing: Vec<String> = self
            .config
            .columns
            .iter()
            .enumerate()
            .filter(|(idx, column)| !seen[*idx] && self.is_required(column))
            .map(|(_, column)| match closest_header(column, headers) {
                Some(candidate) => format!("`{}` (closest header: `{candidate}`)", column.name),
                None => format!("`{}`", column.name),
            })
            .collect();
        if !missing.is_empty() {
            return Err(EtlError::Format {
                file: source.path.to_string(),
                message: format!("missing required columns: {}", missing.join(", ")),
            });
        }
        Ok(layout)
    }

    fn stage_row<'a>(
        &self,
        line_no: u64,
        cells: impl Iterator<Item = (&'a Target, &'a str)>,
    ) -> Result<StagedRow, String> {
        let mut attributes = Attributes::new();
        for (target, raw) in cells {
            match target {
                Target::Column(idx) => {
                    let column = &self.config.columns[*idx];
                    let value = coerce(column.kind, raw)
                        .map_err(|reason| format!("column `{}`: {reason}", column.name))?;
                    attributes.insert(column.name.clone(), value);
                }
                Target::Unmapped(name) => {
                    let value = if raw.is_empty() {
                        FieldValue::Null
                    } else {
                        FieldValue::Text(raw.to_string())
                    };
                    attributes.insert(name.clone(), value);
                }
            }
        }
        for column in &self.config.columns {
            attributes.entry(column.name.clone()).or_insert(FieldValue::Null);
        }

        let mut parts = Vec::with_capacity(self.config.natural_key.len());
        for key in &self.config.natural_key {
            let fragment = attributes
                .get(key)
                .and_then(FieldValue::key_fragment)
                .filter(|f| !f.is_empty())
                .ok_or_else(|| format!("missing natural key column `{key}`"))?;
            parts.push(fragment);
        }

        let event_date = self
            .config
            .event_date
            .as_ref()
            .and_then(|column| attributes.get(column))
            .and_then(FieldValue::as_date);

        Ok(StagedRow {
            line_no,
            natural_key: NaturalKey::new(parts),
            event_date,
            attributes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Column(usize),
    Unmapped(String),
}

fn closest_header<'a>(column: &ColumnSpec, headers: &'a [String]) -> Option<&'a str> {
    let wanted = normalize_header(&column.name);
    headers
        .iter()
        .map(|h| (h, jaro_winkler(&wanted, &normalize_header(h))))
        .filter(|(_, score)| *score >= 0.8)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(h, _)| h.as_str())
}

fn decode_text<'a>(source: &SourceFile, bytes: &'a [u8]) -> EtlResult<&'a str> {
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    std::str::from_utf8(bytes).map_err(|err| EtlError::Encoding {
        file: source.path.to_string(),
        message: format!("content is not valid UTF-8 (first bad byte at offset {})", err.valid_up_to()),
    })
}

fn csv_error(source: &SourceFile, err: csv::Error) -> EtlError {
    match err.kind() {
        csv::ErrorKind::Utf8 { .. } => EtlError::Encoding {
            file: source.path.to_string(),
            message: err.to_string(),
        },
        _ => EtlError::Format {
            file: source.path.to_string(),
            message: err.to_string(),
        },
    }
}

fn json_cell(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%Y%m%d", "%d.%m.%Y"];
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M",
    "%m/%d/%Y %H:%M",
];

/// Coerce one trimmed cell; empty cells are null for every type.
pub fn coerce(kind: ColumnType, raw: &str) -> Result<FieldValue, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(FieldValue::Null);
    }
    match kind {
        ColumnType::Text => Ok(FieldValue::Text(raw.to_string())),
        ColumnType::Integer => {
            let cleaned = raw.replace([',', '_'], "");
            if let Ok(value) = cleaned.parse::<i64>() {
                return Ok(FieldValue::Integer(value));
            }
            match Decimal::from_str(&cleaned) {
                Ok(d) if d.fract().is_zero() => i64::try_from(d)
                    .map(FieldValue::Integer)
                    .map_err(|_| format!("`{raw}` is out of integer range")),
                _ => Err(format!("cannot parse `{raw}` as integer")),
            }
        }
        ColumnType::Decimal => parse_decimal(raw)
            .map(|d| FieldValue::Decimal(d.normalize()))
            .ok_or_else(|| format!("cannot parse `{raw}` as decimal")),
        ColumnType::Date => parse_date(raw)
            .map(FieldValue::Date)
            .ok_or_else(|| format!("cannot parse `{raw}` as date")),
        ColumnType::Timestamp => parse_timestamp(raw)
            .map(FieldValue::Timestamp)
            .ok_or_else(|| format!("cannot parse `{raw}` as timestamp")),
    }
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim_end_matches('%')
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .ok()
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| parse_timestamp(raw).map(|ts| ts.date()))
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|ts| ts.naive_utc()))
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Parses extracts and commits them to the staging area.
#[derive(Debug, Clone)]
pub struct StagingLoader {
    schemas: BTreeMap<String, ExtractSchema>,
    staging: StagingStore,
}

impl StagingLoader {
    pub fn new(staging: StagingStore, fact_types: Vec<FactTypeConfig>) -> EtlResult<Self> {
        let mut schemas = BTreeMap::new();
        for config in fact_types {
            let schema = ExtractSchema::new(config)?;
            schemas.insert(schema.fact_type().to_string(), schema);
        }
        Ok(Self { schemas, staging })
    }

    pub fn schema(&self, fact_type: &str) -> EtlResult<&ExtractSchema> {
        self.schemas
            .get(fact_type)
            .ok_or_else(|| EtlError::Config(format!("unknown fact type `{fact_type}`")))
    }

    /// Validate the whole extract, then persist it and mark the state `staged` in one commit.
    pub async fn load(
        &self,
        state: &FileImportState,
        fact_type: &str,
        source: &SourceFile,
        bytes: &[u8],
    ) -> EtlResult<StagingBatch> {
        let schema = self.schema(fact_type)?;
        let batch = schema.parse(state.id, &state.pipeline_name, source, bytes, Utc::now())?;
        self.staging.commit(&batch).await?;
        info!(
            pipeline = %state.pipeline_name,
            file = %source.path,
            staged = batch.rows.len(),
            rejected = batch.rejected.len(),
            "extract staged"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesw_core::FileKey;

    fn mes_config() -> FactTypeConfig {
        FactTypeConfig {
            fact_type: "mes_output".into(),
            natural_key: vec!["batch".into(), "operation".into()],
            event_date: Some("posting_date".into()),
            columns: vec![
                ColumnSpec {
                    name: "batch".into(),
                    kind: ColumnType::Text,
                    aliases: vec!["Batch No.".into(), "Charge".into()],
                    required: false,
                },
                ColumnSpec {
                    name: "operation".into(),
                    kind: ColumnType::Text,
                    aliases: vec!["Op".into(), "Vorgang".into()],
                    required: false,
                },
                ColumnSpec {
                    name: "posting_date".into(),
                    kind: ColumnType::Date,
                    aliases: vec!["Date".into()],
                    required: true,
                },
                ColumnSpec {
                    name: "yield_qty".into(),
                    kind: ColumnType::Decimal,
                    aliases: vec!["Yield".into()],
                    required: false,
                },
                ColumnSpec {
                    name: "oee".into(),
                    kind: ColumnType::Decimal,
                    aliases: vec![],
                    required: false,
                },
            ],
            delimiter: None,
            keep_unmapped: false,
        }
    }

    fn source(name: &str) -> SourceFile {
        SourceFile {
            name: name.into(),
            path: FileKey::new(&format!("drop/{name}")),
            fingerprint: "fp".into(),
            size: 0,
            discovered_at: Utc::now(),
        }
    }

    fn parse(name: &str, body: &str) -> EtlResult<StagingBatch> {
        let schema = ExtractSchema::new(mes_config()).expect("schema");
        schema.parse(uuid::Uuid::new_v4(), "mes_output", &source(name), body.as_bytes(), Utc::now())
    }

    #[test]
    fn header_vintages_map_onto_canonical_columns() {
        let old = parse(
            "old.csv",
            "Batch No.,Op,Date,Yield,OEE\nB-1,OP10,2026/02/03,\"1,250.50\",85.5%\n",
        )
        .expect("old vintage");
        let new = parse(
            "new.csv",
            "\u{feff}batch,operation,posting_date,yield_qty,oee\nB-1,OP10,2026-02-03,1250.5,85.50\n",
        )
        .expect("new vintage");

        assert_eq!(old.rows.len(), 1);
        assert_eq!(old.rows[0].attributes, new.rows[0].attributes);
        assert_eq!(old.rows[0].natural_key, NaturalKey::new(vec!["B-1".into(), "OP10".into()]));
        assert_eq!(old.rows[0].event_date, NaiveDate::from_ymd_opt(2026, 2, 3));
        assert_eq!(
            old.rows[0].attributes["yield_qty"],
            FieldValue::Decimal(Decimal::new(12505, 1))
        );
    }

    #[test]
    fn rows_without_natural_key_are_quarantined() {
        let batch = parse(
            "mes.csv",
            "batch,operation,posting_date,yield_qty\nB-1,OP10,2026-02-03,5\n,OP20,2026-02-03,6\nB-3,OP30,not-a-date,7\n\nB-4,OP40,2026-02-04,\n",
        )
        .expect("parse");

        assert_eq!(batch.rows.len(), 2);
        assert_eq!(batch.rejected.len(), 2);
        assert_eq!(batch.rejected[0].line_no, 3);
        assert!(batch.rejected[0].reason.contains("missing natural key column `batch`"));
        assert!(batch.rejected[1].reason.contains("posting_date"));
        assert_eq!(batch.rows[1].attributes["yield_qty"], FieldValue::Null);
        assert_eq!(batch.rows[1].attributes["oee"], FieldValue::Null);
    }

    #[test]
    fn missing_required_column_is_a_format_error_with_a_hint() {
        let err = parse("mes.csv", "batch_number,operation,posting_date\nB-1,OP10,2026-02-03\n").unwrap_err();
        match err {
            EtlError::Format { message, .. } => {
                assert!(message.contains("`batch`"), "{message}");
                assert!(message.contains("closest header: `batch_number`"), "{message}");
            }
            other => panic!("expected format error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_utf8_is_an_encoding_error() {
        let schema = ExtractSchema::new(mes_config()).expect("schema");
        let err = schema
            .parse(uuid::Uuid::new_v4(), "mes_output", &source("mes.csv"), b"batch,op\n\xff\xfe,x\n", Utc::now())
            .unwrap_err();
        assert!(matches!(err, EtlError::Encoding { .. }));
    }

    #[test]
    fn json_row_batches_are_staged_like_files() {
        let batch = parse(
            "collector_batch.json",
            r#"{"rows": [
                {"Batch No.": "B-9", "Op": "OP10", "Date": "2026-02-05", "Yield": 12.5},
                {"Batch No.": "B-9", "Op": null, "Date": "2026-02-05"},
                "garbage"
            ]}"#,
        )
        .expect("json batch");
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rejected.len(), 2);
        assert_eq!(batch.rows[0].attributes["yield_qty"], FieldValue::Decimal(Decimal::new(125, 1)));
    }

    #[test]
    fn schema_configuration_is_validated() {
        let mut config = mes_config();
        config.natural_key = vec!["lot".into()];
        assert!(matches!(ExtractSchema::new(config), Err(EtlError::Config(_))));

        let mut config = mes_config();
        config.event_date = Some("yield_qty".into());
        assert!(matches!(ExtractSchema::new(config), Err(EtlError::Config(_))));

        let mut config = mes_config();
        config.columns[1].aliases.push("Batch No.".into());
        assert!(matches!(ExtractSchema::new(config), Err(EtlError::Config(_))));
    }

    #[test]
    fn coercion_rules() {
        assert_eq!(coerce(ColumnType::Integer, "1,200").unwrap(), FieldValue::Integer(1200));
        assert_eq!(coerce(ColumnType::Integer, "7.0").unwrap(), FieldValue::Integer(7));
        assert!(coerce(ColumnType::Integer, "7.5").is_err());
        assert_eq!(
            coerce(ColumnType::Timestamp, "2026-02-03 06:30").unwrap(),
            FieldValue::Timestamp(NaiveDate::from_ymd_opt(2026, 2, 3).unwrap().and_hms_opt(6, 30, 0).unwrap())
        );
        assert_eq!(
            coerce(ColumnType::Date, "02/03/2026").unwrap(),
            FieldValue::Date(NaiveDate::from_ymd_opt(2026, 2, 3).unwrap())
        );
        assert_eq!(coerce(ColumnType::Decimal, "  ").unwrap(), FieldValue::Null);
        assert_eq!(normalize_header("  Batch No. "), "batch_no");
    }

    #[test]
    fn tsv_and_unmapped_columns() {
        let mut config = mes_config();
        config.keep_unmapped = true;
        let schema = ExtractSchema::new(config).expect("schema");
        let batch = schema
            .parse(
                uuid::Uuid::new_v4(),
                "mes_output",
                &source("mes.tsv"),
                b"batch\toperation\tposting_date\tShift Lead\nB-1\tOP10\t2026-02-03\tKim\n",
                Utc::now(),
            )
            .expect("tsv");
        assert_eq!(batch.rows[0].attributes["shift_lead"], FieldValue::Text("Kim".into()));
    }
}
