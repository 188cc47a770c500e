//! Long-lived service binary: one sensor poller feeding the pipeline
//! engine, shut down cooperatively on ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use tickd_core::retry::{Backoff, RetryPolicy};
use tickd_core::TickdConfig;
use tickd_db::Db;
use tickd_extract::VisionClient;
use tickd_pipeline::{Engine, PipelineContext, PipelineRunner, SignalNotifier};
use tickd_sensor::{SignalSensor, TickOutcome};
use tickd_signal::SignalAdapter;

#[derive(Parser)]
#[command(name = "tickd", about = "Signal receipt ingestion service")]
struct Args {
    /// Config file path (falls back to TICKD_CONFIG, then ./tickd.toml).
    #[arg(long)]
    config: Option<String>,

    /// Run the ungated test sensor (1-minute interval, tagged runs).
    #[arg(long)]
    test_sensor: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickd=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(
        TickdConfig::load(args.config.as_deref())
            .map_err(|e| anyhow::anyhow!("config load failed: {e}"))?,
    );

    let db = Arc::new(Db::connect(&config.database).await?);
    let signal = Arc::new(SignalAdapter::new(&config.signal));
    let llm = Arc::new(VisionClient::new(&config.llm));
    let ctx = PipelineContext::new(
        Arc::clone(&config),
        Arc::clone(&db),
        Arc::clone(&signal),
        Arc::clone(&llm),
    );

    let mut engine = Engine::new(
        Arc::new(PipelineRunner::new(ctx)),
        config.pipeline.max_concurrent_jobs,
    );
    engine.add_observer(Arc::new(SignalNotifier::new(
        Arc::clone(&signal),
        config.signal.default_group_id.clone(),
    )));

    let test_mode = args.test_sensor || config.sensor.test_mode;
    let sensor = if test_mode {
        info!("starting TEST sensor: no schedule gate, 60s interval");
        SignalSensor::test_variant(Arc::clone(&signal), Arc::clone(&db), &config.sensor)
    } else {
        SignalSensor::production(Arc::clone(&signal), Arc::clone(&db), &config.sensor)
    };

    let (job_tx, job_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_task = tokio::spawn(engine.run(job_rx, shutdown_rx));

    info!(
        account = %config.signal.phone_number,
        interval_secs = sensor.interval().as_secs(),
        "tickd started"
    );

    // Single poller: each tick completes before the next is considered, so
    // sidecar receive calls never overlap.
    let mut interval = tokio::time::interval(sensor.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_tick(&sensor, &job_tx).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    shutdown_tx.send(true).ok();
    drop(job_tx);
    if let Err(e) = engine_task.await {
        error!("engine task ended abnormally: {e}");
    }
    info!("tickd stopped");
    Ok(())
}

/// One sensor tick with the receive-retry discipline (at most two retries on
/// sidecar transport errors).
async fn run_tick(sensor: &SignalSensor, job_tx: &mpsc::Sender<tickd_sensor::JobRequest>) {
    let tick_retry = RetryPolicy {
        max_attempts: 3,
        backoff: Backoff::Linear(Duration::from_secs(2)),
    };

    let outcome = tick_retry
        .run(
            |e: &tickd_signal::SignalError| e.kind().is_retryable(),
            || sensor.tick(),
        )
        .await;

    match outcome {
        Ok(TickOutcome::Skip(reason)) => debug!(%reason, "sensor tick skipped"),
        Ok(TickOutcome::Requests(requests)) => {
            for request in requests {
                if let Err(e) = job_tx.send(request).await {
                    warn!("engine channel closed, dropping job request: {e}");
                    return;
                }
            }
        }
        Err(e) => error!("sensor tick failed: {e}"),
    }
}
