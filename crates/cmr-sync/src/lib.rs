//! Run configuration and the two relay pipelines: download (source → artifacts)
//! and load (artifacts → target).

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cmr_core::{ClientSpec, Domain, LoadResult};
use cmr_source::{
    ClientAggregator, DomainExtractor, ExtractionError, PgSourceStore, QueryCatalog, SourceStore,
};
use cmr_storage::{ArtifactStore, StoreError};
use cmr_target::{
    coerce_all, BulkLoader, PgTargetStore, SchemaIntrospector, TargetError, TargetStore,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cmr-sync";

/// Target schema receiving freshly loaded rows.
pub const STAGING_SCHEMA: &str = "Staging";
/// Target schema fed by the post-load procedure.
pub const FINAL_SCHEMA: &str = "dbo";

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const DEFAULT_POST_PROCESS_PROCEDURE: &str = "spKPIRun";

pub fn staging_table(domain: Domain) -> String {
    format!("{STAGING_SCHEMA}.{}", domain.table_name())
}

pub fn final_table(domain: Domain) -> String {
    format!("{FINAL_SCHEMA}.{}", domain.table_name())
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config validation failed: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    #[serde(alias = "SQLServerInstance")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(alias = "SQLServerUser")]
    pub user: String,
    #[serde(alias = "SQLServerPassword")]
    pub password: String,
    #[serde(alias = "CatalogName")]
    pub database: String,
    #[serde(default = "default_true")]
    pub require_tls: bool,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("require_tls", &self.require_tls)
            .finish()
    }
}

impl ConnectionParams {
    pub fn connect_options(&self, request_timeout: Duration) -> PgConnectOptions {
        let ssl_mode = if self.require_tls {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port.unwrap_or(5432))
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(ssl_mode)
            .options([("statement_timeout", format!("{}s", request_timeout.as_secs()))])
    }

    /// Pool scoped to one run; callers close it on every exit path.
    pub async fn connect(&self, request_timeout: Duration) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(Domain::ALL.len() as u32)
            .acquire_timeout(request_timeout)
            .connect_with(self.connect_options(request_timeout))
            .await
    }

    fn validate(&self, label: &str, problems: &mut Vec<String>) {
        for (field, value) in [
            ("host", &self.host),
            ("user", &self.user),
            ("password", &self.password),
            ("database", &self.database),
        ] {
            if value.trim().is_empty() {
                problems.push(format!("{label}.{field} is required"));
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    #[serde(alias = "MonthSize")]
    pub age_window_months: i64,
    #[serde(alias = "WipeStaging")]
    pub wipe_staging: bool,
    #[serde(alias = "WipeDBO")]
    pub wipe_final: bool,
    #[serde(alias = "DoKPIRun")]
    pub run_post_process: bool,
    #[serde(default = "default_procedure")]
    pub post_process_procedure: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_procedure() -> String {
    DEFAULT_POST_PROCESS_PROCEDURE.to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl RunOptions {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn download(&self) -> DownloadOptions {
        DownloadOptions {
            age_window_months: u32::try_from(self.age_window_months.max(1)).unwrap_or(u32::MAX),
        }
    }

    pub fn load(&self) -> LoadOptions {
        LoadOptions {
            wipe_staging: self.wipe_staging,
            wipe_final: self.wipe_final,
            post_process: self
                .run_post_process
                .then(|| self.post_process_procedure.clone()),
        }
    }
}

/// Everything the download pipeline needs from the options block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    pub age_window_months: u32,
}

/// Everything the load pipeline needs from the options block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadOptions {
    pub wipe_staging: bool,
    pub wipe_final: bool,
    /// Procedure to call once after every domain was handled.
    pub post_process: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    #[serde(alias = "DataSource")]
    pub source: ConnectionParams,
    #[serde(alias = "DataTarget")]
    pub target: ConnectionParams,
    #[serde(alias = "Options")]
    pub options: RunOptions,
    #[serde(alias = "Clients")]
    pub clients: Vec<ClientSpec>,
    #[serde(default)]
    pub artifacts_dir: Option<PathBuf>,
}

impl RelayConfig {
    /// Parse a YAML (or JSON) config document and validate it.
    pub fn from_str_validated(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: RelayConfig = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str_validated(&text, path)
    }

    /// Config path from `CMR_CONFIG`, artifact directory override from `CMR_ARTIFACTS_DIR`.
    pub fn from_env(explicit_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit_path
            .or_else(|| std::env::var("CMR_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::load(&path)?;
        if let Ok(dir) = std::env::var("CMR_ARTIFACTS_DIR") {
            config.artifacts_dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }

    /// Collects every violation rather than stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        self.source.validate("source", &mut problems);
        self.target.validate("target", &mut problems);
        if self.options.age_window_months < 1 {
            problems.push(format!(
                "options.ageWindowMonths must be >= 1, got {}",
                self.options.age_window_months
            ));
        }
        if self.options.request_timeout_secs < 1 {
            problems.push("options.requestTimeoutSecs must be >= 1, got 0".into());
        }
        if self.options.run_post_process && self.options.post_process_procedure.trim().is_empty() {
            problems.push("options.postProcessProcedure is required when runPostProcess is set".into());
        }
        if self.clients.is_empty() {
            problems.push("clients must list at least one client".into());
        }
        for (i, client) in self.clients.iter().enumerate() {
            if client.source_tag.trim().is_empty() {
                problems.push(format!("clients[{i}].sourceTag is required"));
            }
            if client.target_tag.trim().is_empty() {
                problems.push(format!("clients[{i}].targetTag is required"));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn artifact_store(&self) -> ArtifactStore {
        ArtifactStore::new(self.artifacts_dir.clone().unwrap_or_else(|| PathBuf::from(".")))
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("connecting to {store} store: {source}")]
    Connect {
        store: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("persisting {domain} artifact: {source}")]
    Persist {
        domain: Domain,
        #[source]
        source: StoreError,
    },
    #[error("reading {domain} artifact: {source}")]
    Artifact {
        domain: Domain,
        #[source]
        source: StoreError,
    },
    #[error("loading {domain}: {source}")]
    Domain {
        domain: Domain,
        #[source]
        source: TargetError,
    },
    #[error("post-load processing: {0}")]
    PostProcess(#[source] TargetError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSummary {
    pub domain: Domain,
    pub records: usize,
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub clients: usize,
    pub artifacts: Vec<ArtifactSummary>,
}

impl DownloadSummary {
    pub fn total_records(&self) -> usize {
        self.artifacts.iter().map(|a| a.records).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DomainOutcome {
    Loaded {
        rows_affected: u64,
        wiped_staging: Option<u64>,
        wiped_final: Option<u64>,
    },
    Skipped {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainLoad {
    pub domain: Domain,
    pub outcome: DomainOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub domains: Vec<DomainLoad>,
    pub post_processed: bool,
    pub warnings: Vec<String>,
}

impl LoadSummary {
    pub fn rows_loaded(&self) -> u64 {
        self.domains
            .iter()
            .map(|d| match d.outcome {
                DomainOutcome::Loaded { rows_affected, .. } => rows_affected,
                DomainOutcome::Skipped { .. } => 0,
            })
            .sum()
    }

    pub fn skipped(&self) -> impl Iterator<Item = Domain> + '_ {
        self.domains
            .iter()
            .filter(|d| matches!(d.outcome, DomainOutcome::Skipped { .. }))
            .map(|d| d.domain)
    }
}

/// Source → artifacts. Clients sequential, domains of one client concurrent.
pub struct DownloadPipeline<'a> {
    source: &'a dyn SourceStore,
    artifacts: &'a ArtifactStore,
    catalog: QueryCatalog,
}

impl<'a> DownloadPipeline<'a> {
    pub fn new(source: &'a dyn SourceStore, artifacts: &'a ArtifactStore) -> Self {
        Self {
            source,
            artifacts,
            catalog: QueryCatalog::standard(),
        }
    }

    /// A failed run may leave some artifacts of this run written and others stale;
    /// its artifacts must not be loaded.
    pub async fn run(
        &self,
        clients: &[ClientSpec],
        options: DownloadOptions,
    ) -> Result<DownloadSummary, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("download", %run_id);

        let result = async {
            info!(state = "extracting", clients = clients.len(), window_months = options.age_window_months);
            let aggregator =
                ClientAggregator::new(DomainExtractor::new(self.source, &self.catalog));
            let collections = aggregator
                .aggregate_all(&Domain::ALL, clients, options.age_window_months)
                .await?;

            for (domain, records) in &collections {
                info!(state = "aggregating", domain = %domain, records = records.len());
            }

            info!(state = "persisting", artifacts = collections.len());
            // Every write runs to completion, even after a sibling fails.
            let stored = join_all(collections.iter().map(|(domain, records)| async move {
                self.artifacts
                    .write(*domain, records)
                    .await
                    .map_err(|source| RunError::Persist {
                        domain: *domain,
                        source,
                    })
            }))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

            Ok::<_, RunError>(
                stored
                    .into_iter()
                    .map(|a| ArtifactSummary {
                        domain: a.domain,
                        records: a.records,
                        path: a.path.display().to_string(),
                        sha256: a.content_hash,
                    })
                    .collect::<Vec<_>>(),
            )
        }
        .instrument(span.clone())
        .await;

        let _guard = span.enter();
        match result {
            Ok(artifacts) => {
                info!(state = "done", "data download finished");
                Ok(DownloadSummary {
                    run_id,
                    started_at,
                    finished_at: Utc::now(),
                    clients: clients.len(),
                    artifacts,
                })
            }
            Err(err) => {
                error!(state = "failed", error = %err, "data download failed; artifacts of this run are untrustworthy");
                Err(err)
            }
        }
    }
}

/// Artifacts → target. Domains strictly sequential.
pub struct LoadPipeline<'a> {
    target: &'a dyn TargetStore,
    artifacts: &'a ArtifactStore,
}

impl<'a> LoadPipeline<'a> {
    pub fn new(target: &'a dyn TargetStore, artifacts: &'a ArtifactStore) -> Self {
        Self { target, artifacts }
    }

    pub async fn run(&self, options: &LoadOptions) -> Result<LoadSummary, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("load", %run_id);

        let result = async {
            let mut domains = Vec::with_capacity(Domain::ALL.len());
            let mut warnings = Vec::new();

            for domain in Domain::ALL {
                let outcome = self
                    .load_domain(domain, options)
                    .instrument(info_span!("domain", domain = %domain))
                    .await?;
                if let DomainOutcome::Skipped { reason } = &outcome {
                    warnings.push(format!("{domain}: {reason}"));
                }
                domains.push(DomainLoad { domain, outcome });
            }

            let mut post_processed = false;
            if let Some(procedure) = &options.post_process {
                info!(state = "post_processing", procedure = %procedure, "running post-load procedure");
                self.target
                    .call_procedure(procedure)
                    .await
                    .map_err(|source| {
                        RunError::PostProcess(TargetError::PostProcess {
                            procedure: procedure.clone(),
                            source,
                        })
                    })?;
                post_processed = true;
            }

            Ok::<_, RunError>((domains, warnings, post_processed))
        }
        .instrument(span.clone())
        .await;

        let _guard = span.enter();
        match result {
            Ok((domains, warnings, post_processed)) => {
                info!(state = "done", skipped = warnings.len(), "data load finished");
                Ok(LoadSummary {
                    run_id,
                    started_at,
                    finished_at: Utc::now(),
                    domains,
                    post_processed,
                    warnings,
                })
            }
            Err(err) => {
                error!(state = "failed", error = %err, "data load failed");
                Err(err)
            }
        }
    }

    /// Truncation is not wrapped in the load's transaction: a failure after
    /// wiping leaves the table empty until the next run.
    async fn load_domain(&self, domain: Domain, options: &LoadOptions) -> Result<DomainOutcome, RunError> {
        let artifact_error = |source: StoreError| RunError::Artifact { domain, source };
        let domain_error = |source: TargetError| RunError::Domain { domain, source };

        if !self.artifacts.exists(domain).await.map_err(artifact_error)? {
            let path = self.artifacts.artifact_path(domain);
            warn!(path = %path.display(), "cannot open artifact; skipping domain");
            return Ok(DomainOutcome::Skipped {
                reason: format!("missing artifact {}", path.display()),
            });
        }

        let staging = staging_table(domain);
        let wiped_staging = if options.wipe_staging {
            Some(self.wipe(&staging).await.map_err(domain_error)?)
        } else {
            None
        };
        let wiped_final = if options.wipe_final {
            Some(self.wipe(&final_table(domain)).await.map_err(domain_error)?)
        } else {
            None
        };

        info!(state = "reading", path = %self.artifacts.artifact_path(domain).display());
        let records = match self.artifacts.read(domain).await {
            Ok(records) => records,
            Err(err) if err.is_missing() => {
                warn!(error = %err, "artifact disappeared before reading; skipping domain");
                return Ok(DomainOutcome::Skipped {
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(artifact_error(err)),
        };

        let schema = SchemaIntrospector::new(self.target)
            .describe(&staging)
            .await
            .map_err(domain_error)?;

        info!(state = "coercing", records = records.len(), columns = schema.len());
        let rows = coerce_all(&schema, &records).map_err(|source| {
            domain_error(TargetError::Coercion {
                table: staging.clone(),
                source,
            })
        })?;

        info!(state = "loading", table = %staging, rows = rows.len());
        let LoadResult { rows_affected } = BulkLoader::new(self.target)
            .load(&staging, &schema, &rows)
            .await
            .map_err(domain_error)?;
        info!(rows_affected, "inserted rows");

        Ok(DomainOutcome::Loaded {
            rows_affected,
            wiped_staging,
            wiped_final,
        })
    }

    async fn wipe(&self, table: &str) -> Result<u64, TargetError> {
        info!(state = "truncating", table, "wiping table");
        self.target
            .truncate(table)
            .await
            .map_err(|source| TargetError::Truncate {
                table: table.to_string(),
                source,
            })
    }
}

/// Connect to the source store, run one download, release the pool.
pub async fn run_download(config: &RelayConfig) -> Result<DownloadSummary, RunError> {
    let pool = config
        .source
        .connect(config.options.request_timeout())
        .await
        .map_err(|source| RunError::Connect {
            store: "source",
            source,
        })?;
    let source = PgSourceStore::new(pool.clone());
    let artifacts = config.artifact_store();
    let result = DownloadPipeline::new(&source, &artifacts)
        .run(&config.clients, config.options.download())
        .await;
    pool.close().await;
    result
}

/// Connect to the target store, run one load, release the pool.
pub async fn run_load(config: &RelayConfig) -> Result<LoadSummary, RunError> {
    let pool = config
        .target
        .connect(config.options.request_timeout())
        .await
        .map_err(|source| RunError::Connect {
            store: "target",
            source,
        })?;
    let target = PgTargetStore::new(pool.clone());
    let artifacts = config.artifact_store();
    let result = LoadPipeline::new(&target, &artifacts)
        .run(&config.options.load())
        .await;
    pool.close().await;
    result
}

/// Record counts per domain, for log lines and summaries.
pub fn counts_by_domain(summary: &DownloadSummary) -> BTreeMap<Domain, usize> {
    summary
        .artifacts
        .iter()
        .map(|a| (a.domain, a.records))
        .collect()
}
