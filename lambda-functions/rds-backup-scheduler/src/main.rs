use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use rds_backup_scheduler::{BackupConfig, BackupSchedulerService, InvocationResponse};
use serde_json::Value;

async fn function_handler(
    service: &BackupSchedulerService,
    event: LambdaEvent<Value>,
) -> Result<InvocationResponse, Error> {
    Ok(service.handle_event(event).await)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    // Missing role ARN or bad retention stops the process before any AWS call
    let config = BackupConfig::from_env()?;
    let service = BackupSchedulerService::new(config).await;
    let service = &service;

    run(service_fn(move |event: LambdaEvent<Value>| async move {
        function_handler(service, event).await
    }))
    .await
}
