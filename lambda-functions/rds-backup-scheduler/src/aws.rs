//! AWS service seams.
//!
//! The scheduler talks to RDS and AWS Backup only through the two traits in
//! this module, so the orchestration can be exercised without credentials.

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_backup::types::Lifecycle;
use aws_sdk_backup::Client as BackupClient;
use aws_sdk_rds::Client as RdsClient;
use std::time::Duration;

use crate::error::ApiError;
use crate::{BackupRequest, DatabaseDescriptor, ResourceKind, ResourceTag};

/// Read-only view of the database inventory.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseInventory: Send + Sync {
    /// Every resource of `kind`, all pages, in listing order.
    async fn list_resources(
        &self,
        kind: ResourceKind,
    ) -> Result<Vec<DatabaseDescriptor>, ApiError>;

    async fn list_tags(&self, arn: &str) -> Result<Vec<ResourceTag>, ApiError>;
}

/// On-demand backup jobs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackupService: Send + Sync {
    /// Start one backup job and return its job id.
    async fn start_backup_job(&self, request: &BackupRequest) -> Result<String, ApiError>;
}

/// Load the shared SDK configuration with an explicit per-operation timeout.
pub async fn load_sdk_config(operation_timeout: Duration) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .timeout_config(
            TimeoutConfig::builder()
                .operation_timeout(operation_timeout)
                .build(),
        )
        .load()
        .await
}

pub struct RdsInventory {
    client: RdsClient,
}

impl RdsInventory {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: RdsClient::new(config),
        }
    }

    async fn list_instances(&self) -> Result<Vec<DatabaseDescriptor>, ApiError> {
        let mut out = Vec::new();
        let mut pages = self.client.describe_db_instances().into_paginator().send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(ApiError::from_sdk)?;
            for db in page.db_instances() {
                out.push(DatabaseDescriptor {
                    arn: db.db_instance_arn().map(str::to_string),
                    identifier: db.db_instance_identifier().map(str::to_string),
                    engine: db.engine().map(str::to_string),
                });
            }
        }
        Ok(out)
    }

    async fn list_clusters(&self) -> Result<Vec<DatabaseDescriptor>, ApiError> {
        let mut out = Vec::new();
        let mut pages = self.client.describe_db_clusters().into_paginator().send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(ApiError::from_sdk)?;
            for cluster in page.db_clusters() {
                out.push(DatabaseDescriptor {
                    arn: cluster.db_cluster_arn().map(str::to_string),
                    identifier: cluster.db_cluster_identifier().map(str::to_string),
                    engine: cluster.engine().map(str::to_string),
                });
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DatabaseInventory for RdsInventory {
    async fn list_resources(
        &self,
        kind: ResourceKind,
    ) -> Result<Vec<DatabaseDescriptor>, ApiError> {
        match kind {
            ResourceKind::Instance => self.list_instances().await,
            ResourceKind::Cluster => self.list_clusters().await,
        }
    }

    async fn list_tags(&self, arn: &str) -> Result<Vec<ResourceTag>, ApiError> {
        let response = self
            .client
            .list_tags_for_resource()
            .resource_name(arn)
            .send()
            .await
            .map_err(ApiError::from_sdk)?;

        // Tags without a key or value can never match a filter
        Ok(response
            .tag_list()
            .iter()
            .filter_map(|tag| Some(ResourceTag::new(tag.key()?, tag.value()?)))
            .collect())
    }
}

pub struct AwsBackupService {
    client: BackupClient,
}

impl AwsBackupService {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: BackupClient::new(config),
        }
    }
}

#[async_trait]
impl BackupService for AwsBackupService {
    async fn start_backup_job(&self, request: &BackupRequest) -> Result<String, ApiError> {
        let lifecycle = Lifecycle::builder()
            .delete_after_days(i64::from(request.retention_days))
            .build();

        let response = self
            .client
            .start_backup_job()
            .backup_vault_name(&request.vault_name)
            .resource_arn(&request.resource.arn)
            .iam_role_arn(&request.iam_role_arn)
            .idempotency_token(&request.idempotency_token)
            .lifecycle(lifecycle)
            .set_recovery_point_tags(Some(request.recovery_point_tags()))
            .send()
            .await
            .map_err(ApiError::from_sdk)?;

        response
            .backup_job_id()
            .map(str::to_string)
            .ok_or(ApiError::MalformedResponse("BackupJobId"))
    }
}
