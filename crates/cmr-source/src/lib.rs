//! Source-side extraction: per-domain query templates, per-client extraction and
//! cross-client aggregation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use cmr_core::{ClientSpec, Domain, Record, CLIENT_TAG_FIELD};
use futures::future::try_join_all;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub const CRATE_NAME: &str = "cmr-source";

/// Schema holding the staged per-client metrics in the source store.
pub const SOURCE_SCHEMA: &str = "Staging";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("{domain} query failed for client {client}: {source}")]
    Query {
        domain: Domain,
        client: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{domain} payload for client {client} is not a JSON array of objects: {reason}")]
    Decode {
        domain: Domain,
        client: String,
        reason: String,
    },
    #[error("no extraction query registered for {0}")]
    UnknownDomain(Domain),
}

/// Remote read interface of the source store. Implementations run `query` with
/// `$1 = source_tag` and `$2 = age_window_months` and return the single JSON text
/// column it produces (`None` when the store yields SQL NULL or no row).
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn fetch_json(
        &self,
        domain: Domain,
        query: &str,
        source_tag: &str,
        age_window_months: i32,
    ) -> Result<Option<String>, sqlx::Error>;
}

#[derive(Debug, Clone)]
pub struct PgSourceStore {
    pool: PgPool,
}

impl PgSourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn fetch_json(
        &self,
        _domain: Domain,
        query: &str,
        source_tag: &str,
        age_window_months: i32,
    ) -> Result<Option<String>, sqlx::Error> {
        let row: Option<Option<String>> = sqlx::query_scalar(query)
            .bind(source_tag)
            .bind(age_window_months)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.flatten())
    }
}

/// Parametrized extraction query per domain.
#[derive(Debug, Clone)]
pub struct QueryCatalog {
    queries: BTreeMap<Domain, String>,
}

impl Default for QueryCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl QueryCatalog {
    /// Queries over `Staging.<Table>` for every domain, each aggregating the matching
    /// rows into one JSON array ordered by the domain's age column, newest first.
    pub fn standard() -> Self {
        let queries = Domain::ALL
            .into_iter()
            .map(|domain| (domain, standard_query(domain)))
            .collect();
        Self { queries }
    }

    pub fn query(&self, domain: Domain) -> Option<&str> {
        self.queries.get(&domain).map(String::as_str)
    }
}

fn standard_query(domain: Domain) -> String {
    let age = format!("\"{}\"", domain.age_column());
    let columns = domain
        .expected_fields()
        .iter()
        .map(|f| format!("\"{f}\""))
        .collect::<Vec<_>>()
        .join(", ");
    // Calendar-month boundaries crossed between the row timestamp and now.
    format!(
        r#"SELECT COALESCE(json_agg(t ORDER BY t.{age} DESC), '[]'::json)::text
FROM (
    SELECT {columns}
      FROM "{SOURCE_SCHEMA}"."{table}"
     WHERE "{tag}" = $1
       AND (EXTRACT(YEAR FROM now()) - EXTRACT(YEAR FROM {age})) * 12
         + (EXTRACT(MONTH FROM now()) - EXTRACT(MONTH FROM {age})) < $2
) t"#,
        table = domain.table_name(),
        tag = CLIENT_TAG_FIELD,
    )
}

/// Decode the single JSON column of an extraction query into flat records.
pub fn decode_records(payload: Option<&str>) -> Result<Vec<Record>, String> {
    let Some(text) = payload else {
        return Ok(Vec::new());
    };
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: JsonValue = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let JsonValue::Array(items) = value else {
        return Err("payload is not an array".to_string());
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            JsonValue::Object(record) => Ok(record),
            other => Err(format!("element {i} is not an object: {other}")),
        })
        .collect()
}

/// Runs one domain's query for one client.
pub struct DomainExtractor<'a> {
    store: &'a dyn SourceStore,
    catalog: &'a QueryCatalog,
}

impl<'a> DomainExtractor<'a> {
    pub fn new(store: &'a dyn SourceStore, catalog: &'a QueryCatalog) -> Self {
        Self { store, catalog }
    }

    pub async fn extract(
        &self,
        domain: Domain,
        client: &ClientSpec,
        age_window_months: u32,
    ) -> Result<Vec<Record>, ExtractionError> {
        let query = self
            .catalog
            .query(domain)
            .ok_or(ExtractionError::UnknownDomain(domain))?;
        let window = i32::try_from(age_window_months).unwrap_or(i32::MAX);

        let payload = self
            .store
            .fetch_json(domain, query, &client.source_tag, window)
            .await
            .map_err(|source| ExtractionError::Query {
                domain,
                client: client.source_tag.clone(),
                source,
            })?;

        let records = decode_records(payload.as_deref()).map_err(|reason| ExtractionError::Decode {
            domain,
            client: client.source_tag.clone(),
            reason,
        })?;
        info!(domain = %domain, client = %client.source_tag, records = records.len(), "query received");
        Ok(records)
    }
}

/// Merges every client's extraction into one collection per domain.
pub struct ClientAggregator<'a> {
    extractor: DomainExtractor<'a>,
}

impl<'a> ClientAggregator<'a> {
    pub fn new(extractor: DomainExtractor<'a>) -> Self {
        Self { extractor }
    }

    /// Clients run one after another in configured order; the domains of one client
    /// run concurrently. The first failure aborts the whole aggregation.
    pub async fn aggregate_all(
        &self,
        domains: &[Domain],
        clients: &[ClientSpec],
        age_window_months: u32,
    ) -> Result<BTreeMap<Domain, Vec<Record>>, ExtractionError> {
        let mut collections: BTreeMap<Domain, Vec<Record>> =
            domains.iter().map(|d| (*d, Vec::new())).collect();

        for client in clients {
            let span = info_span!("client", source_tag = %client.source_tag, target_tag = %client.target_tag);
            let results = try_join_all(
                domains
                    .iter()
                    .map(|domain| self.extractor.extract(*domain, client, age_window_months)),
            )
            .instrument(span)
            .await?;

            for (domain, records) in domains.iter().zip(results) {
                let slot = collections.entry(*domain).or_default();
                slot.extend(records.into_iter().map(|r| retag(r, &client.target_tag)));
            }
        }

        Ok(collections)
    }
}

/// Rewrite the client tag field to the downstream identifier.
pub fn retag(mut record: Record, target_tag: &str) -> Record {
    record.insert(
        CLIENT_TAG_FIELD.to_string(),
        JsonValue::String(target_tag.to_string()),
    );
    record
}
