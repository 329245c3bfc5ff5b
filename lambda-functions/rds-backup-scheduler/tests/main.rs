use async_trait::async_trait;
use lambda_runtime::{Context, LambdaEvent};
use rds_backup_scheduler::{
    idempotency_token, ApiError, BackupConfig, BackupRequest, BackupSchedulerService,
    BackupService, DatabaseDescriptor, DatabaseInventory, ResourceKind, ResourceTag,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const ROLE_ARN: &str = "arn:aws:iam::123456789012:role/backup";

fn backup_tag() -> Vec<ResourceTag> {
    vec![
        ResourceTag::new("Name", "primary"),
        ResourceTag::new("Backup", "True"),
    ]
}

fn descriptor(kind: ResourceKind, id: &str, engine: &str) -> DatabaseDescriptor {
    let segment = match kind {
        ResourceKind::Instance => "db",
        ResourceKind::Cluster => "cluster",
    };
    DatabaseDescriptor {
        arn: Some(format!("arn:aws:rds:us-east-1:123456789012:{segment}:{id}")),
        identifier: Some(id.to_string()),
        engine: Some(engine.to_string()),
    }
}

#[derive(Default, Clone)]
struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    fn push(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct FakeInventory {
    resources: HashMap<ResourceKind, Result<Vec<DatabaseDescriptor>, ApiError>>,
    tags: HashMap<String, Result<Vec<ResourceTag>, ApiError>>,
    log: CallLog,
}

impl FakeInventory {
    fn with_resource(mut self, kind: ResourceKind, id: &str, tags: Vec<ResourceTag>) -> Self {
        let descriptor = descriptor(kind, id, "postgres");
        let arn = descriptor.arn.clone().unwrap();
        self.resources
            .entry(kind)
            .or_insert_with(|| Ok(Vec::new()))
            .as_mut()
            .unwrap()
            .push(descriptor);
        self.tags.insert(arn, Ok(tags));
        self
    }

    fn with_tag_error(mut self, kind: ResourceKind, id: &str) -> Self {
        let descriptor = descriptor(kind, id, "postgres");
        let arn = descriptor.arn.clone().unwrap();
        self.resources
            .entry(kind)
            .or_insert_with(|| Ok(Vec::new()))
            .as_mut()
            .unwrap()
            .push(descriptor);
        self.tags.insert(
            arn,
            Err(ApiError::Service {
                code: Some("AccessDenied".to_string()),
                message: "not authorized to list tags".to_string(),
            }),
        );
        self
    }
}

#[async_trait]
impl DatabaseInventory for FakeInventory {
    async fn list_resources(
        &self,
        kind: ResourceKind,
    ) -> Result<Vec<DatabaseDescriptor>, ApiError> {
        self.log.push(format!("list:{kind}"));
        self.resources
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn list_tags(&self, arn: &str) -> Result<Vec<ResourceTag>, ApiError> {
        self.log.push(format!("tags:{arn}"));
        self.tags.get(arn).cloned().unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[derive(Default)]
struct FakeBackup {
    failures: HashMap<String, ApiError>,
    requests: Arc<Mutex<Vec<BackupRequest>>>,
}

impl FakeBackup {
    fn failing(mut self, identifier: &str, err: ApiError) -> Self {
        self.failures.insert(identifier.to_string(), err);
        self
    }
}

#[async_trait]
impl BackupService for FakeBackup {
    async fn start_backup_job(&self, request: &BackupRequest) -> Result<String, ApiError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.failures.get(&request.resource.identifier) {
            Some(err) => Err(err.clone()),
            None => Ok(format!("job-{}", request.resource.identifier)),
        }
    }
}

fn config() -> BackupConfig {
    BackupConfig::builder().iam_role_arn(ROLE_ARN).build()
}

fn scheduled_event() -> LambdaEvent<Value> {
    LambdaEvent::new(
        json!({"source": "aws.events", "detail-type": "Scheduled Event"}),
        Context::default(),
    )
}

fn service(inventory: FakeInventory, backup: FakeBackup) -> BackupSchedulerService {
    BackupSchedulerService::with_clients(config(), Box::new(inventory), Box::new(backup))
}

#[tokio::test]
async fn test_zero_tagged_resources() {
    let inventory = FakeInventory::default()
        .with_resource(ResourceKind::Instance, "untagged", vec![])
        .with_resource(
            ResourceKind::Cluster,
            "other",
            vec![ResourceTag::new("Backup", "False")],
        );

    let response = service(inventory, FakeBackup::default())
        .handle_event(scheduled_event())
        .await;

    assert_eq!(response.status_code, 200);
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["successful"], json!([]));
    assert_eq!(body["failed"], json!([]));
    assert_eq!(body["total_processed"], 0);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_all_backups_succeed() {
    let inventory = FakeInventory::default()
        .with_resource(ResourceKind::Instance, "orders", backup_tag())
        .with_resource(ResourceKind::Instance, "users", backup_tag())
        .with_resource(ResourceKind::Cluster, "analytics", backup_tag());
    let backup = FakeBackup::default();
    let requests = backup.requests.clone();

    let summary = service(inventory, backup).run().await.unwrap();

    assert_eq!(summary.total_processed(), 3);
    assert_eq!(summary.successful().len(), 3);
    assert!(summary.failed().is_empty());
    assert_eq!(summary.status_code(), 200);

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.iam_role_arn == ROLE_ARN));
    assert!(requests.iter().all(|r| r.vault_name == "Default"));
    assert!(requests.iter().all(|r| r.retention_days == 5));
    assert!(requests[0].idempotency_token.starts_with("rds-orders-"));
    assert!(requests[1].idempotency_token.starts_with("rds-users-"));
    assert!(requests[2].idempotency_token.starts_with("aurora-analytics-"));
}

#[tokio::test]
async fn test_partial_failure_returns_207() {
    let inventory = FakeInventory::default()
        .with_resource(ResourceKind::Instance, "orders", backup_tag())
        .with_resource(ResourceKind::Cluster, "analytics", backup_tag());
    let backup = FakeBackup::default().failing(
        "analytics",
        ApiError::Service {
            code: Some("InvalidParameterValueException".to_string()),
            message: "Invalid backup vault".to_string(),
        },
    );

    let response = service(inventory, backup)
        .handle_event(scheduled_event())
        .await;

    assert_eq!(response.status_code, 207);
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["total_processed"], 2);
    assert_eq!(body["successful"].as_array().unwrap().len(), 1);
    let failed = body["failed"].as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["resource"], "analytics");
    assert_eq!(failed[0]["type"], "Aurora");
    assert_eq!(failed[0]["error_code"], "InvalidParameterValueException");
    assert_eq!(failed[0]["error"], "Invalid backup vault");
}

#[tokio::test]
async fn test_dispatch_failure_does_not_stop_remaining_resources() {
    let inventory = FakeInventory::default()
        .with_resource(ResourceKind::Instance, "first", backup_tag())
        .with_resource(ResourceKind::Instance, "second", backup_tag())
        .with_resource(ResourceKind::Cluster, "third", backup_tag());
    let backup = FakeBackup::default().failing(
        "first",
        ApiError::Transport {
            message: "dispatch failure: connection reset".to_string(),
        },
    );
    let requests = backup.requests.clone();

    let summary = service(inventory, backup).run().await.unwrap();

    assert_eq!(requests.lock().unwrap().len(), 3);
    assert_eq!(summary.total_processed(), 3);
    assert_eq!(summary.failed().len(), 1);
    assert_eq!(summary.failed()[0].error_code, None);
    assert_eq!(summary.successful().len(), 2);
}

#[tokio::test]
async fn test_tag_lookup_failure_isolated_across_kinds() {
    let inventory = FakeInventory::default()
        .with_tag_error(ResourceKind::Instance, "locked")
        .with_resource(ResourceKind::Instance, "orders", backup_tag())
        .with_resource(ResourceKind::Cluster, "analytics", backup_tag());

    let summary = service(inventory, FakeBackup::default()).run().await.unwrap();

    let ids: Vec<_> = summary
        .successful()
        .iter()
        .map(|o| o.resource.as_str())
        .collect();
    assert_eq!(ids, vec!["orders", "analytics"]);
}

#[tokio::test]
async fn test_listing_failure_flagged_in_body() {
    let mut inventory =
        FakeInventory::default().with_resource(ResourceKind::Instance, "orders", backup_tag());
    inventory.resources.insert(
        ResourceKind::Cluster,
        Err(ApiError::Transport {
            message: "timeout".to_string(),
        }),
    );

    let response = service(inventory, FakeBackup::default())
        .handle_event(scheduled_event())
        .await;

    assert_eq!(response.status_code, 200);
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["total_processed"], 1);
    assert_eq!(body["discovery_errors"], json!(["Aurora"]));
}

#[tokio::test]
async fn test_missing_role_arn_makes_no_api_calls() {
    let log = CallLog::default();
    let inventory = FakeInventory {
        log: log.clone(),
        ..FakeInventory::default()
    }
    .with_resource(ResourceKind::Instance, "orders", backup_tag());
    let backup = FakeBackup::default();
    let requests = backup.requests.clone();

    let no_role = BackupConfig::builder().iam_role_arn("").build();
    let service =
        BackupSchedulerService::with_clients(no_role, Box::new(inventory), Box::new(backup));
    let response = service.handle_event(scheduled_event()).await;

    assert_eq!(response.status_code, 500);
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert!(body["error"].as_str().unwrap().contains("BACKUP_ROLE_ARN"));
    assert!(log.calls().is_empty());
    assert!(requests.lock().unwrap().is_empty());
}

#[test]
fn test_missing_role_arn_fails_config_loading() {
    let err = BackupConfig::from_lookup(|name| match name {
        "BACKUP_VAULT_NAME" => Some("nightly".to_string()),
        _ => None,
    })
    .unwrap_err();
    assert!(err.to_string().contains("BACKUP_ROLE_ARN"));
}

#[test]
fn test_token_differs_across_kinds() {
    let at = chrono::Utc::now();
    let instance = idempotency_token(ResourceKind::Instance, "shared-name", at);
    let cluster = idempotency_token(ResourceKind::Cluster, "shared-name", at);

    assert_ne!(instance, cluster);
    assert_eq!(
        instance,
        idempotency_token(ResourceKind::Instance, "shared-name", at)
    );
}

#[tokio::test]
async fn test_event_payload_does_not_change_the_run() {
    let inventory = FakeInventory::default()
        .with_resource(ResourceKind::Instance, "orders", backup_tag())
        .with_resource(ResourceKind::Cluster, "analytics", backup_tag());
    let backup = FakeBackup::default().failing(
        "orders",
        ApiError::Service {
            code: Some("ThrottlingException".to_string()),
            message: "Rate exceeded".to_string(),
        },
    );
    let service = service(inventory, backup);

    let custom = LambdaEvent::new(
        json!({"vault": "elsewhere", "resources": ["ignored"], "dryRun": true}),
        Context::default(),
    );
    let first = service.handle_event(scheduled_event()).await;
    let second = service.handle_event(custom).await;

    assert_eq!(first.status_code, 207);
    assert_eq!(first.status_code, second.status_code);

    let mut first: Value = serde_json::from_str(&first.body).unwrap();
    let mut second: Value = serde_json::from_str(&second.body).unwrap();
    for body in [&mut first, &mut second] {
        let removed = body.as_object_mut().unwrap().remove("timestamp");
        assert!(removed.is_some());
    }
    assert_eq!(first, second);
    assert_eq!(first["successful"][0]["vault"], "Default");
}
