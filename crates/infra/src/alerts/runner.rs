use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{AlertSink, AlertSource};

/// Periodic alert runner config.
#[derive(Debug, Clone)]
pub struct StockAlertRunner {
    pub interval: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for StockAlertRunner {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_retries: 5,
            base_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug)]
pub struct StockAlertRunnerHandle {
    shutdown: oneshot::Sender<()>,
    trigger: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl StockAlertRunnerHandle {
    /// Ask for a run now. Triggers coalesce while one is already pending.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Stop the runner and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.join.await {
            warn!(error = %e, "stock alert runner task failed");
        }
    }
}

impl StockAlertRunner {
    /// Spawn on the current tokio runtime.
    ///
    /// Runs once at startup, then every `interval` and on each trigger. A
    /// failed run is retried with exponential backoff up to `max_retries`
    /// times, then skipped until the next tick. Failures never stop the loop.
    pub fn spawn<Src, Snk>(
        &self,
        name: &'static str,
        source: Arc<Src>,
        sink: Arc<Snk>,
    ) -> StockAlertRunnerHandle
    where
        Src: AlertSource,
        Snk: AlertSink,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let cfg = self.clone();

        let join = tokio::spawn(runner_loop(name, cfg, shutdown_rx, trigger_rx, source, sink));

        StockAlertRunnerHandle {
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            join,
        }
    }
}

async fn runner_loop<Src, Snk>(
    name: &'static str,
    cfg: StockAlertRunner,
    mut shutdown_rx: oneshot::Receiver<()>,
    mut trigger_rx: mpsc::Receiver<()>,
    source: Arc<Src>,
    sink: Arc<Snk>,
) where
    Src: AlertSource,
    Snk: AlertSink,
{
    info!(runner = name, interval_secs = cfg.interval.as_secs(), "stock alert runner started");

    let mut ticker = time::interval(cfg.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'run: loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break 'run,
            _ = ticker.tick() => {}
            Some(()) = trigger_rx.recv() => {}
        }

        let mut failures: u32 = 0;
        loop {
            match source.collect().await {
                Ok(alerts) => {
                    debug!(runner = name, alerts = alerts.len(), "stock alert run finished");
                    for (tenant_id, alert) in alerts {
                        sink.emit(tenant_id, alert);
                    }
                    break;
                }
                Err(e) => {
                    failures += 1;
                    warn!(runner = name, attempt = failures, error = %e, "stock alert run failed");
                    if failures > cfg.max_retries {
                        warn!(runner = name, "retries exhausted, waiting for next tick");
                        break;
                    }
                    tokio::select! {
                        biased;
                        _ = &mut shutdown_rx => break 'run,
                        _ = time::sleep(backoff(cfg.base_backoff, failures)) => {}
                    }
                }
            }
        }
    }

    info!(runner = name, "stock alert runner stopped");
}

/// `base * 2^(attempt-1)`, capped at 10s.
fn backoff(base: Duration, attempt: u32) -> Duration {
    let pow = 1u32 << attempt.saturating_sub(1).min(10);
    let ms = base.as_millis().saturating_mul(pow as u128);
    Duration::from_millis(ms.min(10_000) as u64)
}
