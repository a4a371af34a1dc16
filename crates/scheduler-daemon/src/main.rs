use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use scheduler_broker::redis_backend::{
    RedisCompletionSource, RedisDispatchSink, RedisHeartbeatSource, RedisPredictionStore, RedisTaskSource,
};
use scheduler_broker::{CompletionSource, DispatchSink, HeartbeatSource, PredictionStore, TaskSource};
use scheduler_core::{
    CircuitBreaker, CompletionSubscriber, Dispatcher, DispatcherConfig, FeedbackConfig, HealthReaper, HeartbeatConfig,
    HeartbeatSubscriber, HeuristicPredictor, PredictorConfig, ScoringConfig, WorkerRegistry,
};
use scheduler_protocol::config::SchedulerConfig;
use scheduler_protocol::DEFAULT_PREDICTION_KEY;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "scheduler-daemon", about = "Predictive task scheduler daemon")]
struct Args {
    /// Path to the scheduling-policy configuration file.
    #[arg(short, long, default_value = "config/scheduler.toml")]
    config: PathBuf,

    /// Connection URL for the task/heartbeat/completion stream broker.
    /// Kept out of the TOML config (spec.md §6 "Environment bootstrap")
    /// since it is environment-specific, not scheduling policy.
    #[arg(long, env = "SCHEDULER_STREAM_URL", default_value = "redis://127.0.0.1:6379")]
    stream_url: String,

    /// Connection URL for predictor snapshot persistence. May point at
    /// the same broker or a separate store.
    #[arg(long, env = "SCHEDULER_PERSISTENCE_URL", default_value = "redis://127.0.0.1:6379")]
    persistence_url: String,

    /// Consumer-group identity for this process, used on both the task
    /// and completion streams.
    #[arg(long, env = "SCHEDULER_CONSUMER_ID", default_value = "scheduler-1")]
    consumer_id: String,

    #[arg(long, default_value = "scheduler:tasks")]
    task_stream_key: String,
    #[arg(long, default_value = "scheduler-dispatchers")]
    task_group: String,

    #[arg(long, default_value = "scheduler:heartbeats")]
    heartbeat_channel: String,

    #[arg(long, default_value = "scheduler:completions")]
    completion_stream_key: String,
    #[arg(long, default_value = "scheduler-feedback")]
    completion_group: String,

    #[arg(long, default_value = "scheduler:dispatch:")]
    dispatch_channel_prefix: String,

    #[arg(long, default_value = DEFAULT_PREDICTION_KEY)]
    prediction_key: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config_str = tokio::fs::read_to_string(&args.config).await.map_err(|e| {
        error!(path = ?args.config, error = %e, "failed to read config file");
        e
    })?;
    let config: SchedulerConfig = toml::from_str(&config_str).map_err(|e| {
        error!(error = %e, "failed to parse config file");
        e
    })?;
    config.validate().map_err(|e| {
        error!(error = %e, "configuration failed validation");
        anyhow::anyhow!(e)
    })?;

    info!(
        fallback_threshold = config.fallback_threshold,
        alpha = config.alpha,
        "scheduler daemon starting"
    );

    let task_source: Arc<dyn TaskSource> = Arc::new(
        RedisTaskSource::connect(&args.stream_url, &args.task_stream_key, &args.task_group, &args.consumer_id).await?,
    );
    let heartbeat_source: Arc<dyn HeartbeatSource> =
        Arc::new(RedisHeartbeatSource::subscribe(&args.stream_url, &args.heartbeat_channel).await?);
    let completion_source: Arc<dyn CompletionSource> = Arc::new(
        RedisCompletionSource::connect(
            &args.stream_url,
            &args.completion_stream_key,
            &args.completion_group,
            &args.consumer_id,
        )
        .await?,
    );
    let dispatch_sink: Arc<dyn DispatchSink> =
        Arc::new(RedisDispatchSink::connect(&args.stream_url, &args.dispatch_channel_prefix).await?);
    let prediction_store: Arc<dyn PredictionStore> =
        Arc::new(RedisPredictionStore::connect(&args.persistence_url, &args.prediction_key).await?);

    let registry = Arc::new(WorkerRegistry::new(Duration::from_millis(config.heartbeat_timeout_ms)));

    let predictor = Arc::new(
        HeuristicPredictor::new(
            prediction_store,
            PredictorConfig {
                alpha: config.alpha,
                confidence_threshold: config.confidence_threshold,
                default_duration_ms: config.default_duration_ms,
                snapshot_interval: config.snapshot_interval,
            },
        )
        .await,
    );

    let breaker = Arc::new(CircuitBreaker::new(config.fallback_threshold));

    let scoring_config =
        ScoringConfig { weights: config.weights.clone(), max_wait_ms: config.max_wait_ms, max_priority: config.max_priority };

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&task_source),
        Arc::clone(&dispatch_sink),
        Arc::clone(&registry),
        Arc::clone(&predictor),
        Arc::clone(&breaker),
        scoring_config,
        DispatcherConfig::default(),
    ));

    let heartbeat_cfg = || HeartbeatConfig {
        heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
        unhealthy_timeout: Duration::from_millis(config.unhealthy_timeout_ms),
        removed_timeout: Duration::from_millis(config.removed_timeout_ms),
        health_check_interval: Duration::from_millis(config.health_check_interval_ms),
        avg_task_duration_ms: config.avg_task_duration_ms,
    };

    let last_health = Arc::new(Mutex::new(HashMap::new()));
    let (heartbeat_subscriber, mut worker_events) =
        HeartbeatSubscriber::new(Arc::clone(&registry), heartbeat_cfg(), Arc::clone(&last_health));
    let heartbeat_subscriber = Arc::new(heartbeat_subscriber);
    let reaper = Arc::new(HealthReaper::new(
        Arc::clone(&registry),
        heartbeat_cfg(),
        heartbeat_subscriber.events_sender(),
        last_health,
    ));

    let (completion_subscriber, mut feedback_events) = CompletionSubscriber::new(
        Arc::clone(&predictor),
        FeedbackConfig {
            accuracy_window_size: config.accuracy_window_size,
            accuracy_threshold: config.accuracy_threshold,
            drift_lower: config.drift_lower,
            drift_upper: config.drift_upper,
        },
    );
    let completion_subscriber = Arc::new(completion_subscriber);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher_handle = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.run(shutdown_rx).await })
    };
    let heartbeat_handle = {
        let subscriber = Arc::clone(&heartbeat_subscriber);
        let source = Arc::clone(&heartbeat_source);
        tokio::spawn(async move { subscriber.run(source).await })
    };
    let reaper_handle = {
        let reaper = Arc::clone(&reaper);
        tokio::spawn(async move { reaper.run().await })
    };
    let completion_handle = {
        let subscriber = Arc::clone(&completion_subscriber);
        let source = Arc::clone(&completion_source);
        tokio::spawn(async move { subscriber.run(source).await })
    };
    let worker_events_handle = tokio::spawn(async move {
        while let Some(event) = worker_events.recv().await {
            info!(?event, "worker event");
        }
    });
    let feedback_events_handle = tokio::spawn(async move {
        while let Some(event) = feedback_events.recv().await {
            info!(?event, "feedback event");
        }
    });

    info!("scheduler daemon running");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining in-flight work");

    let _ = shutdown_tx.send(true);
    heartbeat_source.cancel().await;
    reaper.stop();
    completion_subscriber.stop();
    completion_source.cancel().await;

    if let Err(e) = dispatcher_handle.await {
        warn!(error = %e, "dispatcher task join failed");
    }
    heartbeat_handle.abort();
    reaper_handle.abort();
    completion_handle.abort();
    worker_events_handle.abort();
    feedback_events_handle.abort();

    predictor.shutdown().await;
    info!("scheduler daemon stopped");

    Ok(())
}
