mod config;

use common::nats::{NatsClient, TracingErrorReporter};
use common::telemetry::{
    init_telemetry, shutdown_telemetry, LogFormat, TelemetryConfig, TelemetryProviders,
};
use crate::config::ServiceConfig;
use sms_runner::Runner;
use sms_worker::{LoggingSmsNotificationHandler, SmsWorker, SmsWorkerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&TelemetryConfig {
        service_name: config.otel_service_name.clone(),
        otel_endpoint: config.otel_endpoint.clone(),
        otel_enabled: config.otel_enabled,
        log_level: config.log_level.clone(),
        log_format: LogFormat::parse(&config.log_format),
    }) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        otel_enabled = config.otel_enabled,
        otel_endpoint = %config.otel_endpoint,
        "Starting sms-service"
    );
    debug!("Configuration: {:?}", config);

    let nats_client = match initialize_nats(&config).await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to initialize NATS: {:#}", e);
            shutdown_telemetry(telemetry_providers);
            std::process::exit(1);
        }
    };

    let sms_worker = SmsWorker::new(
        nats_client.create_consumer_client(config.sms_dead_letter_subject.clone()),
        Arc::new(LoggingSmsNotificationHandler::new()),
        Arc::new(TracingErrorReporter::new()),
        sms_worker_config(&config),
    );

    let runner = Runner::new()
        .with_named_process("sms_worker", sms_worker.into_runner_process())
        .with_closer({
            let nats_for_close = Arc::clone(&nats_client);
            move || async move {
                info!("Running cleanup tasks...");
                if let Ok(client) = Arc::try_unwrap(nats_for_close) {
                    client.close().await;
                }

                // Flush pending traces and logs
                shutdown_telemetry(telemetry_providers);

                info!("Cleanup complete");
                Ok(())
            }
        })
        .with_closer_timeout(Duration::from_secs(config.shutdown_timeout_secs));

    drop(nats_client);

    if runner.run().await.is_err() {
        std::process::exit(1);
    }
}

async fn initialize_nats(config: &ServiceConfig) -> anyhow::Result<Arc<NatsClient>> {
    info!("Initializing NATS...");
    let nats_client = NatsClient::connect(
        &config.nats_url,
        Duration::from_secs(config.startup_timeout_secs),
    )
    .await?;

    nats_client
        .ensure_stream(
            &config.sms_notifications_stream,
            "SMS notification requests",
        )
        .await?;
    nats_client
        .ensure_stream(
            &config.sms_dead_letter_stream,
            "SMS notification requests that could not be processed",
        )
        .await?;

    Ok(Arc::new(nats_client))
}

fn sms_worker_config(config: &ServiceConfig) -> SmsWorkerConfig {
    SmsWorkerConfig {
        stream: config.sms_notifications_stream.clone(),
        subject: config.sms_notifications_subject.clone(),
        consumer_name: config.sms_consumer_name.clone(),
        concurrency: config.sms_concurrency,
        prefetch: config.sms_prefetch,
        max_wait: Duration::from_secs(config.sms_max_wait_secs),
        ack_wait: Duration::from_secs(config.sms_ack_wait_secs),
        max_deliver: config.sms_max_deliver,
        auto_ack: config.sms_auto_ack,
        drain_timeout: Duration::from_secs(config.sms_drain_timeout_secs),
    }
}
