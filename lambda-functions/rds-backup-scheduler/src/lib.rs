//! Scheduled on-demand backups for tagged RDS instances and Aurora clusters.
//!
//! Each invocation lists instances and clusters, keeps the ones carrying the
//! configured tag pair, and starts one AWS Backup job per resource. No state
//! is kept between invocations; AWS Backup owns jobs and recovery points.

pub mod aws;
pub mod config;
pub mod error;

use chrono::{DateTime, Utc};
use lambda_runtime::LambdaEvent;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::{error, info, warn};

pub use aws::{AwsBackupService, BackupService, DatabaseInventory, RdsInventory};
pub use config::BackupConfig;
pub use error::{ApiError, ConfigError, DiscoveryError, RunError};

pub const STATUS_OK: u16 = 200;
pub const STATUS_PARTIAL: u16 = 207;
pub const STATUS_ERROR: u16 = 500;

/// Second resolution; two dispatches of one resource within the same second
/// share a token and collapse into one backup job.
pub const TOKEN_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Fallback for descriptors that do not report an engine
const UNKNOWN_ENGINE: &str = "unknown";

/// The two kinds of database resource that can be backed up.
///
/// Everything that differs between an RDS instance and an Aurora cluster on
/// the backup side hangs off this descriptor.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    #[serde(rename = "RDS")]
    Instance,
    #[serde(rename = "Aurora")]
    Cluster,
}

impl ResourceKind {
    /// Discovery and dispatch order
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Instance, ResourceKind::Cluster];

    /// Prefix of the idempotency token and backup name
    pub fn token_prefix(&self) -> &'static str {
        match self {
            Self::Instance => "rds",
            Self::Cluster => "aurora",
        }
    }

    /// Value of the `ResourceType` recovery-point tag
    pub fn label(&self) -> &'static str {
        match self {
            Self::Instance => "RDS",
            Self::Cluster => "Aurora",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTag {
    pub key: String,
    pub value: String,
}

impl ResourceTag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A required tag pair. Both key and value must match on the same tag entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub value: String,
}

impl TagFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, tags: &[ResourceTag]) -> bool {
        tags.iter().any(|tag| tag.key == self.key && tag.value == self.value)
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// A resource as returned by the inventory listing, before tag filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseDescriptor {
    pub arn: Option<String>,
    pub identifier: Option<String>,
    pub engine: Option<String>,
}

/// A resource that carries the required tag and will be backed up.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaggedResource {
    pub arn: String,
    pub identifier: String,
    pub engine: String,
    pub kind: ResourceKind,
}

/// List every resource of `kind` and keep those carrying `filter`.
///
/// A failed tag lookup drops only that resource. A failed listing is returned
/// as an error so the caller can tell it apart from "nothing tagged".
pub async fn discover(
    inventory: &dyn DatabaseInventory,
    kind: ResourceKind,
    filter: &TagFilter,
) -> Result<Vec<TaggedResource>, DiscoveryError> {
    let descriptors = inventory
        .list_resources(kind)
        .await
        .map_err(|source| DiscoveryError::Listing { kind, source })?;

    let mut tagged = Vec::new();

    for descriptor in descriptors {
        let (Some(arn), Some(identifier)) = (descriptor.arn, descriptor.identifier) else {
            warn!("Skipping {} without ARN or identifier", kind);
            continue;
        };

        let tags = match inventory.list_tags(&arn).await {
            Ok(tags) => tags,
            Err(e) => {
                warn!("Could not read tags for {} {}: {}", kind, identifier, e);
                continue;
            }
        };

        if filter.matches(&tags) {
            let engine = descriptor
                .engine
                .unwrap_or_else(|| UNKNOWN_ENGINE.to_string());
            info!("Found {} {} ({})", kind, identifier, engine);
            tagged.push(TaggedResource {
                arn,
                identifier,
                engine,
                kind,
            });
        }
    }

    info!("Total tagged {} resources: {}", kind, tagged.len());
    Ok(tagged)
}

pub fn idempotency_token(kind: ResourceKind, identifier: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}",
        kind.token_prefix(),
        identifier,
        at.format(TOKEN_TIMESTAMP_FORMAT)
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupRequest {
    pub resource: TaggedResource,
    /// Also used as the backup name and the `Name` recovery-point tag
    pub idempotency_token: String,
    pub vault_name: String,
    pub retention_days: u32,
    pub iam_role_arn: String,
}

impl BackupRequest {
    pub fn new(resource: TaggedResource, config: &BackupConfig, at: DateTime<Utc>) -> Self {
        let idempotency_token = idempotency_token(resource.kind, &resource.identifier, at);
        Self {
            resource,
            idempotency_token,
            vault_name: config.vault_name.clone(),
            retention_days: config.retention_days,
            iam_role_arn: config.iam_role_arn.clone(),
        }
    }

    pub fn backup_name(&self) -> &str {
        &self.idempotency_token
    }

    pub fn recovery_point_tags(&self) -> HashMap<String, String> {
        HashMap::from([
            ("Name".to_string(), self.idempotency_token.clone()),
            (
                "ResourceType".to_string(),
                self.resource.kind.label().to_string(),
            ),
            (
                "ResourceIdentifier".to_string(),
                self.resource.identifier.clone(),
            ),
            ("Engine".to_string(), self.resource.engine.clone()),
            ("AutomatedBackup".to_string(), "True".to_string()),
            ("CreatedBy".to_string(), "Lambda".to_string()),
            ("RetentionDays".to_string(), self.retention_days.to_string()),
        ])
    }
}

/// Result of one dispatch attempt. Success fields and failure fields are
/// mutually exclusive; see the constructors.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackupOutcome {
    pub success: bool,
    pub resource: String,
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub engine: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl BackupOutcome {
    pub fn succeeded(request: &BackupRequest, backup_job_id: String) -> Self {
        Self {
            success: true,
            resource: request.resource.identifier.clone(),
            kind: request.resource.kind,
            engine: request.resource.engine.clone(),
            backup_job_id: Some(backup_job_id),
            backup_name: Some(request.backup_name().to_string()),
            vault: Some(request.vault_name.clone()),
            retention_days: Some(request.retention_days),
            error_code: None,
            error_message: None,
        }
    }

    pub fn failed(request: &BackupRequest, err: &ApiError) -> Self {
        Self {
            success: false,
            resource: request.resource.identifier.clone(),
            kind: request.resource.kind,
            engine: request.resource.engine.clone(),
            backup_job_id: None,
            backup_name: None,
            vault: None,
            retention_days: None,
            error_code: err.code().map(str::to_string),
            error_message: Some(err.message()),
        }
    }
}

pub struct BackupDispatcher<'a> {
    backup: &'a dyn BackupService,
    config: &'a BackupConfig,
}

impl<'a> BackupDispatcher<'a> {
    pub fn new(backup: &'a dyn BackupService, config: &'a BackupConfig) -> Self {
        Self { backup, config }
    }

    pub async fn dispatch(&self, resource: &TaggedResource) -> BackupOutcome {
        self.dispatch_at(resource, Utc::now()).await
    }

    /// Issue exactly one `StartBackupJob` for `resource`. Never fails: service
    /// and transport errors are folded into the outcome.
    pub async fn dispatch_at(&self, resource: &TaggedResource, at: DateTime<Utc>) -> BackupOutcome {
        let request = BackupRequest::new(resource.clone(), self.config, at);

        info!(
            "Starting backup for {} {} as {}",
            resource.kind,
            resource.identifier,
            request.backup_name()
        );

        match self.backup.start_backup_job(&request).await {
            Ok(job_id) => {
                info!(
                    "Backup started for {} {}: job {}",
                    resource.kind, resource.identifier, job_id
                );
                BackupOutcome::succeeded(&request, job_id)
            }
            Err(e) => {
                error!(
                    "Failed to start backup for {} {}: {}",
                    resource.kind, resource.identifier, e
                );
                BackupOutcome::failed(&request, &e)
            }
        }
    }
}

/// Per-run result. `total_processed` always equals
/// `successful.len() + failed.len()`; `record` is the only way to add to it.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RunSummary {
    successful: Vec<BackupOutcome>,
    failed: Vec<BackupOutcome>,
    total_processed: usize,
    pub timestamp: String,
    /// Kinds whose listing failed; treated as having no resources
    #[serde(skip_serializing_if = "Vec::is_empty")]
    discovery_errors: Vec<ResourceKind>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            successful: Vec::new(),
            failed: Vec::new(),
            total_processed: 0,
            timestamp: Utc::now().to_rfc3339(),
            discovery_errors: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: BackupOutcome) {
        self.total_processed += 1;
        if outcome.success {
            self.successful.push(outcome);
        } else {
            self.failed.push(outcome);
        }
    }

    pub fn record_discovery_error(&mut self, err: &DiscoveryError) {
        self.discovery_errors.push(err.kind());
    }

    pub fn successful(&self) -> &[BackupOutcome] {
        &self.successful
    }

    pub fn failed(&self) -> &[BackupOutcome] {
        &self.failed
    }

    pub fn total_processed(&self) -> usize {
        self.total_processed
    }

    pub fn discovery_errors(&self) -> &[ResourceKind] {
        &self.discovery_errors
    }

    /// 200 when nothing failed (including nothing found), 207 otherwise
    pub fn status_code(&self) -> u16 {
        if self.failed.is_empty() {
            STATUS_OK
        } else {
            STATUS_PARTIAL
        }
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

/// Lambda response envelope.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResponse {
    pub status_code: u16,
    pub body: String,
}

impl InvocationResponse {
    /// The single place where run errors become a status code.
    pub fn from_run(result: Result<RunSummary, RunError>) -> Self {
        let encoded = result.and_then(|summary| {
            let body = serde_json::to_string_pretty(&summary)?;
            Ok((summary.status_code(), body))
        });

        match encoded {
            Ok((status_code, body)) => Self { status_code, body },
            Err(e) => {
                error!("Backup run aborted: {}", e);
                Self {
                    status_code: STATUS_ERROR,
                    body: json!({ "error": e.to_string() }).to_string(),
                }
            }
        }
    }
}

pub struct BackupSchedulerService {
    inventory: Box<dyn DatabaseInventory>,
    backup: Box<dyn BackupService>,
    config: BackupConfig,
}

impl BackupSchedulerService {
    /// Build the service against real AWS clients.
    pub async fn new(config: BackupConfig) -> Self {
        let sdk_config = aws::load_sdk_config(config.api_timeout()).await;

        Self {
            inventory: Box::new(RdsInventory::new(&sdk_config)),
            backup: Box::new(AwsBackupService::new(&sdk_config)),
            config,
        }
    }

    pub fn with_clients(
        config: BackupConfig,
        inventory: Box<dyn DatabaseInventory>,
        backup: Box<dyn BackupService>,
    ) -> Self {
        Self {
            inventory,
            backup,
            config,
        }
    }

    async fn discover_all(&self, summary: &mut RunSummary) -> Vec<TaggedResource> {
        let filter = self.config.tag_filter();
        let mut resources = Vec::new();

        for kind in ResourceKind::ALL {
            match discover(self.inventory.as_ref(), kind, &filter).await {
                Ok(found) => resources.extend(found),
                Err(e) => {
                    error!("{}", e);
                    summary.record_discovery_error(&e);
                }
            }
        }
        resources
    }

    /// Discover tagged instances then clusters, and start one backup per
    /// resource. Only a configuration fault aborts the run.
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        self.config.validate()?;

        info!("Starting automated backup run");
        info!(
            "Vault: {}, retention: {} days",
            self.config.vault_name, self.config.retention_days
        );
        info!("Looking for resources tagged {}", self.config.tag_filter());

        let mut summary = RunSummary::new();
        let resources = self.discover_all(&mut summary).await;

        let dispatcher = BackupDispatcher::new(self.backup.as_ref(), &self.config);
        for resource in &resources {
            let outcome = dispatcher.dispatch(resource).await;
            summary.record(outcome);
        }

        info!(
            "Backup run completed: {} processed, {} successful, {} failed",
            summary.total_processed(),
            summary.successful().len(),
            summary.failed().len()
        );

        if !summary.failed().is_empty() {
            let failed: Vec<&str> = summary
                .failed()
                .iter()
                .map(|o| o.resource.as_str())
                .collect();
            warn!("Resources with failed backups: {:?}", failed);
        }

        Ok(summary)
    }

    /// Lambda entry point. The scheduler event carries nothing the run uses.
    pub async fn handle_event(&self, _event: LambdaEvent<Value>) -> InvocationResponse {
        InvocationResponse::from_run(self.run().await)
    }
}
