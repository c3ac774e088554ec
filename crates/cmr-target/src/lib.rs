//! Target-side loading: live schema introspection, schema-driven record coercion
//! and atomic bulk inserts.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use cmr_core::{
    LoadRecord, LoadResult, LoadValue, Record, TargetColumn, TargetColumnSchema, TemporalKind,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::Postgres;
use sqlx::{Column, Executor, PgPool, QueryBuilder, Statement, TypeInfo};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "cmr-target";

/// Postgres caps one statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("column `{column}` expects a {expected}, got {value}{}", row_suffix(.row))]
pub struct CoercionError {
    pub row: Option<usize>,
    pub column: String,
    pub value: String,
    pub expected: &'static str,
}

fn row_suffix(row: &Option<usize>) -> String {
    row.map(|r| format!(" (row {r})")).unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("describing {table}: {source}")]
    Schema {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("table {table} reported no columns")]
    EmptySchema { table: String },
    #[error("coercing records for {table}: {source}")]
    Coercion {
        table: String,
        #[source]
        source: CoercionError,
    },
    #[error("row {row} for {table} has {actual} values, schema has {expected} columns")]
    ShapeMismatch {
        table: String,
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error("bulk insert into {table} rejected: {source}")]
    Load {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("wiping {table}: {source}")]
    Truncate {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("procedure {procedure} failed: {source}")]
    PostProcess {
        procedure: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Remote interface of the target store.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Column names and declared types of `table`, without fetching rows.
    async fn describe(&self, table: &str) -> Result<Vec<TargetColumn>, sqlx::Error>;

    /// Insert every row in one atomic transfer; returns affected rows.
    async fn bulk_insert(
        &self,
        table: &str,
        schema: &TargetColumnSchema,
        rows: &[LoadRecord],
    ) -> Result<u64, sqlx::Error>;

    /// Delete every row of `table`; returns deleted rows.
    async fn truncate(&self, table: &str) -> Result<u64, sqlx::Error>;

    async fn call_procedure(&self, procedure: &str) -> Result<(), sqlx::Error>;
}

/// Quote a possibly schema-qualified identifier (`Staging.Operations`).
pub fn quote_qualified(name: &str) -> Result<String, sqlx::Error> {
    let parts = name
        .split('.')
        .map(|part| {
            let valid = part
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if valid {
                Ok(format!("\"{part}\""))
            } else {
                Err(sqlx::Error::Configuration(
                    format!("invalid identifier `{name}`").into(),
                ))
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join("."))
}

/// Cast suffix for a declared type name, omitted for names that are not plain type words.
fn cast_suffix(declared_type: &str) -> Option<String> {
    let ty = declared_type.trim();
    let plain = !ty.is_empty()
        && ty
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '[' | ']'));
    plain.then(|| format!("::{ty}"))
}

/// Multi-row `INSERT` statements for `rows`, columns in schema order with each
/// placeholder cast to its declared type, chunked to stay within the bind limit.
pub fn insert_statements(
    table: &str,
    schema: &TargetColumnSchema,
    rows: &[LoadRecord],
) -> Result<Vec<QueryBuilder<'static, Postgres>>, sqlx::Error> {
    let quoted_table = quote_qualified(table)?;
    let column_list = schema
        .column_names()
        .map(|c| format!("\"{}\"", c.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(", ");
    let casts: Vec<Option<String>> = schema
        .columns()
        .iter()
        .map(|c| cast_suffix(&c.declared_type))
        .collect();
    let rows_per_statement = (MAX_BIND_PARAMS / schema.len().max(1)).max(1);

    let statements = rows
        .chunks(rows_per_statement)
        .map(|chunk| {
            let mut builder: QueryBuilder<'static, Postgres> =
                QueryBuilder::new(format!("INSERT INTO {quoted_table} ({column_list}) "));
            builder.push_values(chunk, |mut b, row| {
                for ((_, value), cast) in row.values.iter().zip(&casts) {
                    match value {
                        LoadValue::Null => b.push_bind(None::<String>),
                        LoadValue::Bool(v) => b.push_bind(*v),
                        LoadValue::Int(v) => b.push_bind(*v),
                        LoadValue::Float(v) => b.push_bind(*v),
                        LoadValue::Text(v) => b.push_bind(v.clone()),
                        LoadValue::Json(v) => b.push_bind(v.to_string()),
                        LoadValue::Timestamp(v) => b.push_bind(*v),
                        LoadValue::Date(v) => b.push_bind(*v),
                    };
                    if let Some(cast) = cast {
                        b.push_unseparated(cast);
                    }
                }
            });
            builder
        })
        .collect();
    Ok(statements)
}

#[derive(Debug, Clone)]
pub struct PgTargetStore {
    pool: PgPool,
}

impl PgTargetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TargetStore for PgTargetStore {
    async fn describe(&self, table: &str) -> Result<Vec<TargetColumn>, sqlx::Error> {
        let sql = format!("SELECT * FROM {} LIMIT 0", quote_qualified(table)?);
        let statement = (&self.pool).prepare(&sql).await?;
        Ok(statement
            .columns()
            .iter()
            .map(|c| TargetColumn::new(c.name(), c.type_info().name()))
            .collect())
    }

    async fn bulk_insert(
        &self,
        table: &str,
        schema: &TargetColumnSchema,
        rows: &[LoadRecord],
    ) -> Result<u64, sqlx::Error> {
        let statements = insert_statements(table, schema, rows)?;
        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;
        for mut builder in statements {
            affected += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn truncate(&self, table: &str) -> Result<u64, sqlx::Error> {
        let sql = format!("DELETE FROM {}", quote_qualified(table)?);
        Ok(sqlx::query(&sql).execute(&self.pool).await?.rows_affected())
    }

    async fn call_procedure(&self, procedure: &str) -> Result<(), sqlx::Error> {
        let sql = format!("CALL {}()", quote_qualified(procedure)?);
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }
}

/// Fetches a target table's live column layout.
pub struct SchemaIntrospector<'a> {
    store: &'a dyn TargetStore,
}

impl<'a> SchemaIntrospector<'a> {
    pub fn new(store: &'a dyn TargetStore) -> Self {
        Self { store }
    }

    pub async fn describe(&self, table: &str) -> Result<TargetColumnSchema, TargetError> {
        let columns = self
            .store
            .describe(table)
            .await
            .map_err(|source| TargetError::Schema {
                table: table.to_string(),
                source,
            })?;
        if columns.is_empty() {
            return Err(TargetError::EmptySchema {
                table: table.to_string(),
            });
        }
        debug!(table, columns = columns.len(), "described target table");
        Ok(TargetColumnSchema::new(columns))
    }
}

/// Parse a serialized timestamp: RFC 3339 first, then naive date-times (read as
/// UTC), then a bare date at midnight UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(text).map(|ts| ts.date_naive()))
}

fn coerce_temporal(column: &TargetColumn, kind: TemporalKind, value: &JsonValue) -> Result<LoadValue, CoercionError> {
    let parsed = match (kind, value.as_str()) {
        (TemporalKind::Timestamp, Some(text)) => parse_timestamp(text).map(LoadValue::Timestamp),
        (TemporalKind::Date, Some(text)) => parse_date(text).map(LoadValue::Date),
        (_, None) => None,
    };
    parsed.ok_or_else(|| CoercionError {
        row: None,
        column: column.name.clone(),
        value: value.to_string(),
        expected: match kind {
            TemporalKind::Timestamp => "timestamp",
            TemporalKind::Date => "date",
        },
    })
}

/// Exact field match first, then a case-insensitive one for targets whose columns
/// were created unquoted and so fold to lower case.
fn field<'r>(record: &'r Record, column: &str) -> Option<&'r JsonValue> {
    record.get(column).or_else(|| {
        record
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    })
}

/// Reshape one record to `schema`: schema order, temporal columns parsed, the
/// processing-state flag reset to false. Source fields without a column are dropped.
pub fn coerce(schema: &TargetColumnSchema, record: &Record) -> Result<LoadRecord, CoercionError> {
    let processed = false;
    let values = schema
        .columns()
        .iter()
        .map(|column| -> Result<(String, LoadValue), CoercionError> {
            let value = if column.is_processed_flag() {
                LoadValue::Bool(processed)
            } else {
                match (field(record, &column.name), column.temporal_kind()) {
                    (None, _) | (Some(JsonValue::Null), _) => LoadValue::Null,
                    (Some(value), Some(kind)) => coerce_temporal(column, kind, value)?,
                    (Some(value), None) => LoadValue::from_json(value),
                }
            };
            Ok((column.name.clone(), value))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LoadRecord { values, processed })
}

/// Coerce a whole collection; the first bad value rejects the batch.
pub fn coerce_all(schema: &TargetColumnSchema, records: &[Record]) -> Result<Vec<LoadRecord>, CoercionError> {
    records
        .iter()
        .enumerate()
        .map(|(i, record)| {
            coerce(schema, record).map_err(|e| CoercionError { row: Some(i), ..e })
        })
        .collect()
}

pub struct BulkLoader<'a> {
    store: &'a dyn TargetStore,
}

impl<'a> BulkLoader<'a> {
    pub fn new(store: &'a dyn TargetStore) -> Self {
        Self { store }
    }

    pub async fn load(
        &self,
        table: &str,
        schema: &TargetColumnSchema,
        rows: &[LoadRecord],
    ) -> Result<LoadResult, TargetError> {
        if let Some((row, record)) = rows
            .iter()
            .enumerate()
            .find(|(_, r)| r.values.len() != schema.len())
        {
            return Err(TargetError::ShapeMismatch {
                table: table.to_string(),
                row,
                expected: schema.len(),
                actual: record.values.len(),
            });
        }
        if rows.is_empty() {
            return Ok(LoadResult::default());
        }

        let rows_affected = self
            .store
            .bulk_insert(table, schema, rows)
            .await
            .map_err(|source| TargetError::Load {
                table: table.to_string(),
                source,
            })?;
        info!(table, rows = rows_affected, "bulk insert committed");
        Ok(LoadResult { rows_affected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::TimeZone;
    use serde_json::json;

    fn schema() -> TargetColumnSchema {
        TargetColumnSchema::new(vec![
            TargetColumn::new("ActionDate", "datetimeoffset"),
            TargetColumn::new("ClientTag", "varchar"),
            TargetColumn::new("HardCloseBatchDate", "date"),
            TargetColumn::new("TotalLag", "int"),
            TargetColumn::new("Processed", "bit"),
        ])
    }

    fn record(value: JsonValue) -> Record {
        value.as_object().cloned().expect("object literal")
    }

    #[derive(Default)]
    struct RecordingTarget {
        columns: Vec<TargetColumn>,
        inserted: Mutex<Vec<(String, usize)>>,
        reject_inserts: bool,
    }

    #[async_trait]
    impl TargetStore for RecordingTarget {
        async fn describe(&self, table: &str) -> Result<Vec<TargetColumn>, sqlx::Error> {
            if table == "Staging.Missing" {
                return Err(sqlx::Error::Protocol("relation does not exist".into()));
            }
            Ok(self.columns.clone())
        }

        async fn bulk_insert(
            &self,
            table: &str,
            _schema: &TargetColumnSchema,
            rows: &[LoadRecord],
        ) -> Result<u64, sqlx::Error> {
            if self.reject_inserts {
                return Err(sqlx::Error::Protocol("duplicate key".into()));
            }
            self.inserted.lock().unwrap().push((table.to_string(), rows.len()));
            Ok(rows.len() as u64)
        }

        async fn truncate(&self, _table: &str) -> Result<u64, sqlx::Error> {
            Ok(0)
        }

        async fn call_procedure(&self, _procedure: &str) -> Result<(), sqlx::Error> {
            Ok(())
        }
    }

    #[test]
    fn coercion_follows_schema_order_and_injects_flag() {
        let source = record(json!({
            "Processed": true,
            "TotalLag": 4,
            "ExtraSourceField": "dropped",
            "ClientTag": "CL1",
            "ActionDate": "2026-10-08T06:30:00+02:00",
            "HardCloseBatchDate": "2026-09-30"
        }));
        let out = coerce(&schema(), &source).expect("coerce");

        assert_eq!(out.field_count(), schema().len() + 1);
        let names: Vec<_> = out.values.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            ["ActionDate", "ClientTag", "HardCloseBatchDate", "TotalLag", "Processed"]
        );
        assert_eq!(
            out.get("ActionDate"),
            Some(&LoadValue::Timestamp(Utc.with_ymd_and_hms(2026, 10, 8, 4, 30, 0).unwrap()))
        );
        assert_eq!(
            out.get("HardCloseBatchDate"),
            Some(&LoadValue::Date(NaiveDate::from_ymd_opt(2026, 9, 30).unwrap()))
        );
        assert_eq!(out.get("ClientTag"), Some(&LoadValue::Text("CL1".into())));
        assert_eq!(out.get("TotalLag"), Some(&LoadValue::Int(4)));
        assert_eq!(out.get("Processed"), Some(&LoadValue::Bool(false)));
        assert!(!out.processed);
    }

    #[test]
    fn temporal_values_equal_direct_parse() {
        for text in [
            "2026-10-08T00:00:00Z",
            "2026-10-08T12:34:56.1234567+00:00",
            "2026-10-08T12:34:56",
            "2026-10-08 12:34:56.5",
            "2026-10-08",
        ] {
            let out = coerce(&schema(), &record(json!({ "ActionDate": text }))).expect(text);
            assert_eq!(
                out.get("ActionDate"),
                Some(&LoadValue::Timestamp(parse_timestamp(text).unwrap())),
                "{text}"
            );
        }
    }

    #[test]
    fn missing_and_null_fields_stay_null() {
        let out = coerce(&schema(), &record(json!({ "ActionDate": null }))).expect("coerce");
        assert_eq!(out.get("ActionDate"), Some(&LoadValue::Null));
        assert_eq!(out.get("ClientTag"), Some(&LoadValue::Null));
        assert_eq!(out.get("HardCloseBatchDate"), Some(&LoadValue::Null));
    }

    #[test]
    fn lower_case_target_columns_still_find_their_fields() {
        let folded = TargetColumnSchema::new(vec![
            TargetColumn::new("actiondate", "timestamptz"),
            TargetColumn::new("clienttag", "varchar"),
            TargetColumn::new("processed", "bool"),
        ]);
        let out = coerce(
            &folded,
            &record(json!({
                "ActionDate": "2026-10-08T00:00:00Z",
                "ClientTag": "CL1",
                "Processed": true
            })),
        )
        .expect("coerce");
        assert_eq!(
            out.get("actiondate"),
            Some(&LoadValue::Timestamp(Utc.with_ymd_and_hms(2026, 10, 8, 0, 0, 0).unwrap()))
        );
        assert_eq!(out.get("clienttag"), Some(&LoadValue::Text("CL1".into())));
        assert_eq!(out.get("processed"), Some(&LoadValue::Bool(false)));

        let exact = coerce(
            &folded,
            &record(json!({ "clienttag": "exact", "ClientTag": "folded" })),
        )
        .expect("coerce");
        assert_eq!(exact.get("clienttag"), Some(&LoadValue::Text("exact".into())));
    }

    #[test]
    fn unparsable_dates_are_rejected_not_nulled() {
        let err = coerce(&schema(), &record(json!({ "ActionDate": "not-a-date" }))).unwrap_err();
        assert_eq!(err.column, "ActionDate");
        assert_eq!(err.row, None);

        let err = coerce(&schema(), &record(json!({ "HardCloseBatchDate": 20260930 }))).unwrap_err();
        assert_eq!(err.column, "HardCloseBatchDate");
        assert_eq!(err.expected, "date");
    }

    #[test]
    fn coerce_all_reports_the_failing_row() {
        let records = vec![
            record(json!({ "ActionDate": "2026-10-08" })),
            record(json!({ "ActionDate": "13/45/2026" })),
        ];
        let err = coerce_all(&schema(), &records).unwrap_err();
        assert_eq!(err.row, Some(1));
        assert!(err.to_string().contains("(row 1)"), "{err}");
    }

    #[test]
    fn identifiers_are_quoted_and_validated() {
        assert_eq!(
            quote_qualified("Staging.Operations").unwrap(),
            "\"Staging\".\"Operations\""
        );
        assert_eq!(quote_qualified("spKPIRun").unwrap(), "\"spKPIRun\"");
        assert!(quote_qualified("dbo.Ops; DROP TABLE x").is_err());
        assert!(quote_qualified("Staging.").is_err());
    }

    #[test]
    fn cast_suffix_skips_odd_type_names() {
        assert_eq!(cast_suffix("TIMESTAMPTZ").as_deref(), Some("::TIMESTAMPTZ"));
        assert_eq!(cast_suffix("TEXT[]").as_deref(), Some("::TEXT[]"));
        assert_eq!(cast_suffix("x\"; --"), None);
    }

    fn blank_rows(schema: &TargetColumnSchema, count: usize) -> Vec<LoadRecord> {
        let row = coerce(schema, &record(json!({ "ClientTag": "CL1" }))).expect("coerce");
        vec![row; count]
    }

    fn placeholders(sql: &str) -> usize {
        sql.matches('$').count()
    }

    #[test]
    fn insert_lists_columns_in_schema_order_with_casts() {
        let schema = schema();
        let statements =
            insert_statements("Staging.Operations", &schema, &blank_rows(&schema, 2)).expect("sql");
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].sql(),
            "INSERT INTO \"Staging\".\"Operations\" \
             (\"ActionDate\", \"ClientTag\", \"HardCloseBatchDate\", \"TotalLag\", \"Processed\") \
             VALUES ($1::datetimeoffset, $2::varchar, $3::date, $4::int, $5::bit), \
             ($6::datetimeoffset, $7::varchar, $8::date, $9::int, $10::bit)"
        );
    }

    #[test]
    fn insert_splits_at_the_bind_parameter_limit() {
        let schema = schema();
        let per_statement = MAX_BIND_PARAMS / schema.len();

        let full = insert_statements("Staging.Operations", &schema, &blank_rows(&schema, per_statement))
            .expect("sql");
        assert_eq!(full.len(), 1);
        assert_eq!(placeholders(full[0].sql()), per_statement * schema.len());

        let rows = per_statement + 1;
        let split = insert_statements("Staging.Operations", &schema, &blank_rows(&schema, rows))
            .expect("sql");
        assert_eq!(split.len(), (rows * schema.len()).div_ceil(MAX_BIND_PARAMS));
        assert_eq!(split.len(), 2);
        for statement in &split {
            assert!(placeholders(statement.sql()) <= MAX_BIND_PARAMS);
        }
        assert_eq!(placeholders(split[1].sql()), schema.len());
        assert!(split[1].sql().ends_with("VALUES ($1::datetimeoffset, $2::varchar, $3::date, $4::int, $5::bit)"));
    }

    #[test]
    fn insert_of_nothing_builds_no_statement() {
        let statements = insert_statements("Staging.Operations", &schema(), &[]).expect("sql");
        assert!(statements.is_empty());
        assert!(insert_statements("Staging.Bad Name", &schema(), &[]).is_err());
    }

    #[tokio::test]
    async fn introspector_wraps_failures() {
        let target = RecordingTarget::default();
        let introspector = SchemaIntrospector::new(&target);

        let err = introspector.describe("Staging.Missing").await.unwrap_err();
        assert!(matches!(err, TargetError::Schema { .. }), "{err}");

        let err = introspector.describe("Staging.Operations").await.unwrap_err();
        assert!(matches!(err, TargetError::EmptySchema { .. }), "{err}");
    }

    #[tokio::test]
    async fn loader_sends_one_batch_and_reports_count() {
        let target = RecordingTarget {
            columns: schema().columns().to_vec(),
            ..Default::default()
        };
        let schema = SchemaIntrospector::new(&target)
            .describe("Staging.Operations")
            .await
            .expect("describe");
        let rows = coerce_all(
            &schema,
            &[
                record(json!({ "ClientTag": "CL1" })),
                record(json!({ "ClientTag": "CL1" })),
                record(json!({ "ClientTag": "CL1" })),
            ],
        )
        .expect("coerce");

        let result = BulkLoader::new(&target)
            .load("Staging.Operations", &schema, &rows)
            .await
            .expect("load");
        assert_eq!(result.rows_affected, 3);
        assert_eq!(
            target.inserted.lock().unwrap().as_slice(),
            &[("Staging.Operations".to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn loader_skips_empty_batches_and_surfaces_rejections() {
        let target = RecordingTarget {
            reject_inserts: true,
            ..Default::default()
        };
        let loader = BulkLoader::new(&target);

        let result = loader.load("Staging.Invoicing", &schema(), &[]).await.expect("empty");
        assert_eq!(result.rows_affected, 0);

        let rows = coerce_all(&schema(), &[record(json!({}))]).expect("coerce");
        let err = loader.load("Staging.Invoicing", &schema(), &rows).await.unwrap_err();
        assert!(matches!(err, TargetError::Load { .. }), "{err}");
    }

    #[tokio::test]
    async fn loader_rejects_rows_shaped_for_another_schema() {
        let target = RecordingTarget::default();
        let narrow = TargetColumnSchema::new(vec![TargetColumn::new("ClientTag", "varchar")]);
        let rows = coerce_all(&narrow, &[record(json!({ "ClientTag": "CL1" }))]).expect("coerce");

        let err = BulkLoader::new(&target)
            .load("Staging.Operations", &schema(), &rows)
            .await
            .unwrap_err();
        assert!(matches!(err, TargetError::ShapeMismatch { row: 0, .. }), "{err}");
        assert!(target.inserted.lock().unwrap().is_empty());
    }
}
