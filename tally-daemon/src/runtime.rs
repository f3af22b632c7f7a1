use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use tally_core::{config, LoggingSettings, TallyConfig};
use tally_sync::{pipeline, CancelFlag, SyncError, SyncReport};

use crate::error::{io_err, DaemonError};
use crate::http;

/// Single-flight guard for syncs started by this daemon.
#[derive(Debug, Default)]
pub struct SyncGate {
    in_flight: AtomicBool,
}

/// Held for the duration of one sync; releases the gate on drop.
#[derive(Debug)]
pub struct SyncPermit {
    gate: Arc<SyncGate>,
}

impl SyncGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `None` while another sync holds the gate.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SyncPermit> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncPermit { gate: self.clone() })
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        self.gate.in_flight.store(false, Ordering::Release);
    }
}

pub(crate) struct SyncJob {
    trigger: &'static str,
    permit: SyncPermit,
    respond_to: oneshot::Sender<Result<SyncReport, DaemonError>>,
}

/// Load config, install tracing and block the current thread on [`run`].
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    let config = config::load_at(home)?;
    config.validate()?;
    init_tracing(&config.logging);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Bind the configured address and serve until ctrl-c.
pub async fn run(home: PathBuf, config: TallyConfig) -> Result<(), DaemonError> {
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .map_err(|err| DaemonError::Protocol(format!("invalid bind address '{}': {err}", config.server.bind)))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| io_err(config.server.bind.as_str(), e))?;

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let served = run_until_shutdown(home, config, listener, shutdown_tx.clone()).await;
    let _ = shutdown_tx.send(());
    handle_join("signal_handler", signal_handle.await)?;
    served
}

/// Serve on `listener` until `shutdown` fires. Runs the HTTP trigger, the
/// scheduler and the sync processor; a shutdown cancels an in-flight sync
/// between chunks.
pub async fn run_until_shutdown(
    home: PathBuf,
    config: TallyConfig,
    listener: TcpListener,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let config = Arc::new(config);
    let gate = SyncGate::new();
    let cancel = CancelFlag::new();
    let (sync_tx, sync_rx) = mpsc::channel::<SyncJob>(16);

    let local = listener
        .local_addr()
        .map_err(|e| io_err(config.server.bind.as_str(), e))?;
    tracing::info!(
        addr = %local,
        schedule = config.schedule.enabled,
        interval_minutes = config.schedule.interval_minutes,
        "tally daemon listening",
    );

    let cancel_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;
            cancel.cancel();
            Ok::<(), DaemonError>(())
        })
    };

    let processor_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let config = config.clone();
        let cancel = cancel.clone();
        let run = move || pipeline::run(&config, &home, cancel.clone());
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = sync_processor_task(run, sync_rx, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let config = config.clone();
        let gate = gate.clone();
        let sync_tx = sync_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = scheduler_task(config, gate, sync_tx, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let server_handle = {
        let shutdown = shutdown_tx.clone();
        let state = http::AppState::new(home, config.clone(), gate, sync_tx);
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = http::serve(listener, state, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let (cancel_result, processor_result, scheduler_result, server_result) =
        tokio::join!(cancel_handle, processor_handle, scheduler_handle, server_handle);

    handle_join("cancel_on_shutdown", cancel_result)?;
    handle_join("sync_processor", processor_result)?;
    handle_join("scheduler", scheduler_result)?;
    handle_join("http_server", server_result)?;
    tracing::info!("tally daemon stopped");
    Ok(())
}

/// Claim the gate and queue a sync; the answer arrives once it finishes.
pub(crate) async fn trigger_sync(
    gate: &Arc<SyncGate>,
    sync_tx: &mpsc::Sender<SyncJob>,
    trigger: &'static str,
) -> Result<SyncReport, DaemonError> {
    let permit = gate.try_acquire().ok_or(DaemonError::SyncInProgress)?;
    let (tx, rx) = oneshot::channel();
    sync_tx
        .send(SyncJob {
            trigger,
            permit,
            respond_to: tx,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("sync queue"))?;

    rx.await
        .map_err(|_| DaemonError::ChannelClosed("sync response"))?
}

async fn sync_processor_task<R>(
    run: R,
    mut sync_rx: mpsc::Receiver<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError>
where
    R: Fn() -> Result<SyncReport, SyncError> + Clone + Send + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = sync_rx.recv() => {
                let Some(job) = maybe_job else { break };
                process_job(job, run.clone()).await;
            }
        }
    }

    Ok(())
}

/// Run one job on the blocking pool and answer its trigger. A run that
/// panics is reported as an error; the processor keeps serving.
async fn process_job<F>(job: SyncJob, run: F)
where
    F: FnOnce() -> Result<SyncReport, SyncError> + Send + 'static,
{
    let SyncJob { trigger, permit, respond_to } = job;
    let started = Instant::now();
    let joined = tokio::task::spawn_blocking(run).await;
    drop(permit);

    let duration_ms = started.elapsed().as_millis() as u64;
    let result = match joined {
        Ok(Ok(report)) => {
            tracing::info!(
                trigger,
                run_id = %report.run_id,
                inserted = report.counts.inserted_rows,
                updated = report.counts.updated_rows,
                deleted = report.counts.deleted_rows,
                duration_ms,
                "triggered sync completed",
            );
            Ok(report)
        }
        Ok(Err(err)) if err.is_already_running() => {
            tracing::warn!(trigger, error = %err, "sync skipped; another process holds the run lease");
            Err(DaemonError::from(err))
        }
        Ok(Err(err)) => {
            tracing::error!(trigger, error = %err, duration_ms, "triggered sync failed");
            Err(DaemonError::from(err))
        }
        Err(err) => {
            tracing::error!(trigger, error = %err, duration_ms, "sync task aborted");
            Err(DaemonError::Protocol(format!("sync task aborted: {err}")))
        }
    };

    let _ = respond_to.send(result);
}

async fn scheduler_task(
    config: Arc<TallyConfig>,
    gate: Arc<SyncGate>,
    sync_tx: mpsc::Sender<SyncJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    if !config.schedule.enabled {
        tracing::info!("scheduled sync disabled");
        let _ = shutdown_rx.recv().await;
        return Ok(());
    }

    let period = Duration::from_secs(config.schedule.interval_minutes.max(1).saturating_mul(60));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    if !config.schedule.run_on_start {
        interval.tick().await; // consume the first immediate tick
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                match trigger_sync(&gate, &sync_tx, "schedule").await {
                    Ok(_) => {}
                    Err(DaemonError::SyncInProgress) => {
                        tracing::info!("scheduled sync skipped; a sync is already in flight");
                    }
                    Err(DaemonError::ChannelClosed(what)) => {
                        tracing::debug!(channel = what, "scheduler stopping; sync processor is gone");
                        break;
                    }
                    // Outcome already logged by the processor.
                    Err(_) => {}
                }
            }
        }
    }

    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(settings: &LoggingSettings) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
