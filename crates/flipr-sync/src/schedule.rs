//! Cron-driven cycles and cooperative shutdown.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::IngestionOrchestrator;

/// Observed by provider tasks between pages and between properties.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), ShutdownSignal(rx))
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal(self.0.subscribe())
    }
}

impl ShutdownSignal {
    /// A signal that is never raised.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is triggered or the trigger is dropped.
    pub async fn triggered(&mut self) {
        let _ = self.0.wait_for(|raised| *raised).await;
    }
}

/// Runs at most one cycle at a time in the background and tracks it for draining.
pub struct CycleRunner {
    orchestrator: Arc<IngestionOrchestrator>,
    shutdown: ShutdownSignal,
    busy: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

impl CycleRunner {
    pub fn new(orchestrator: Arc<IngestionOrchestrator>, shutdown: ShutdownSignal) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            shutdown,
            busy: AtomicBool::new(false),
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Start a cycle unless one is running or shutdown began. Returns whether one started.
    pub fn trigger(self: &Arc<Self>) -> bool {
        if self.shutdown.is_triggered() || self.busy.swap(true, Ordering::SeqCst) {
            return false;
        }
        let runner = self.clone();
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            match runner.orchestrator.run_cycle(&runner.shutdown).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    new = summary.total_new(),
                    "scheduled cycle complete"
                ),
                Err(err) => error!(error = %err, "scheduled cycle failed"),
            }
            runner.busy.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Wait up to `grace` for in-flight cycles, then abort them. True when all finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let finished = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !finished {
            warn!(?grace, "in-flight cycles exceeded the shutdown grace period; aborting");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        finished
    }
}

pub async fn build_scheduler(runner: Arc<CycleRunner>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let runner = runner.clone();
        Box::pin(async move {
            if !runner.trigger() {
                debug!("previous cycle still running or shutting down; tick skipped");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Run scheduled cycles until `stop` resolves, then shut down gracefully.
///
/// The first cycle starts immediately. Returns whether in-flight work finished
/// within `grace`.
pub async fn run_until(
    runner: Arc<CycleRunner>,
    cron: &str,
    trigger: &ShutdownTrigger,
    grace: Duration,
    stop: impl Future<Output = ()>,
) -> Result<bool> {
    let mut sched = build_scheduler(runner.clone(), cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron, "scheduler started");
    runner.trigger();

    stop.await;
    info!("shutdown requested; waiting for in-flight cycles");
    trigger.trigger();
    if let Err(err) = sched.shutdown().await {
        warn!(error = %err, "scheduler did not stop cleanly");
    }
    Ok(runner.drain(grace).await)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::test_support::{orchestrator, FixedTransport, HangingTransport, ATTOM_ONLY};

    #[tokio::test]
    async fn triggered_signal_is_visible_to_every_subscriber() {
        let (trigger, signal) = shutdown_channel();
        let mut other = trigger.subscribe();
        assert!(!signal.is_triggered());

        trigger.trigger();
        other.triggered().await;
        assert!(signal.is_triggered());
        assert!(!ShutdownSignal::never().is_triggered());
    }

    #[tokio::test]
    async fn overlapping_ticks_are_skipped_and_stuck_cycles_are_aborted() {
        let transport = Arc::new(HangingTransport::default());
        let orchestrator = Arc::new(orchestrator(ATTOM_ONLY, transport.clone()).await);
        let (trigger, signal) = shutdown_channel();
        let runner = CycleRunner::new(orchestrator, signal);
        tokio::time::pause();

        assert!(runner.trigger());
        assert!(!runner.trigger());
        while transport.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        trigger.trigger();
        assert!(!runner.trigger());
        assert!(!runner.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn quick_cycles_drain_within_grace() {
        let transport = Arc::new(FixedTransport { status: 200, body: r#"{"property":[]}"# });
        let orchestrator = Arc::new(orchestrator(ATTOM_ONLY, transport).await);
        let (trigger, signal) = shutdown_channel();
        let runner = CycleRunner::new(orchestrator, signal);

        assert!(runner.trigger());
        trigger.trigger();
        assert!(runner.drain(Duration::from_secs(30)).await);
        assert!(!runner.is_busy());
    }
}
