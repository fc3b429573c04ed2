use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};

use crate::config::NetworkConfig;
use crate::scenario::{ScenarioEngine, SweepReport};
use crate::util::discovery::{probe_once, Debounced, DiscoveryError, DiscoveryListener};
use crate::util::traits::BulbConnector;

/**
Runs the controller: a passive listening phase followed by an active
probe-and-sweep phase, forever.

The listener is always stopped before probing starts, so the two never race
for replies on the discovery port.
*/
pub struct Orchestrator<C> {
    engine: Arc<ScenarioEngine<C>>,
    config: NetworkConfig,
    refresh_interval: Duration,
}

impl<C> Orchestrator<C>
where
    C: BulbConnector + 'static,
{
    pub fn new(engine: Arc<ScenarioEngine<C>>, config: NetworkConfig) -> Self {
        let refresh_interval = config.refresh_interval();
        Orchestrator {
            engine,
            config,
            refresh_interval,
        }
    }

    /// Overrides the length of the listening phase.
    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    pub async fn run(&self) {
        loop {
            self.listening_phase().await;
            let report = self.reconcile_phase().await;
            info!(
                "Sweep done: {} applied, {} unchanged, {} skipped, {} failed",
                report.applied,
                report.unchanged,
                report.skipped,
                report.failures.len()
            );
        }
    }

    /**
    Runs the debounced listener for one refresh interval, then cancels it and
    waits for it to stop.

    A listener that fails earlier is not restarted within the phase: the
    phase still lasts the full interval, and the listener is bound afresh on
    the next cycle.
    */
    pub async fn listening_phase(&self) {
        let deadline = Instant::now() + self.refresh_interval;
        let listener = match DiscoveryListener::bind(&self.config.listen_address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Cannot start listener: {}", e);
                sleep_until(deadline).await;
                return;
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let sink = Debounced::new(self.engine.clone(), self.config.bounce_window());
        let handle = tokio::spawn(async move { listener.run(&sink, cancel_rx).await });
        Self::supervise_listener(handle, cancel_tx, deadline).await;
    }

    async fn supervise_listener(
        mut handle: JoinHandle<Result<(), DiscoveryError>>,
        cancel_tx: watch::Sender<bool>,
        deadline: Instant,
    ) {
        tokio::select! {
            _ = sleep_until(deadline) => {
                // The receiver only goes away once the listener has returned.
                let _ = cancel_tx.send(true);
                Self::report_listener(handle.await);
            }
            result = &mut handle => {
                Self::report_listener(result);
                sleep_until(deadline).await;
            }
        }
    }

    fn report_listener(result: Result<Result<(), DiscoveryError>, JoinError>) {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Listener failed, restarting next cycle: {}", e),
            Err(e) => error!("Listener task aborted: {}", e),
        }
    }

    pub async fn reconcile_phase(&self) -> SweepReport {
        self.reconcile_phase_at(Local::now().naive_local()).await
    }

    /// Probes every scenario's device once and sweeps the whole table.
    pub async fn reconcile_phase_at(&self, now: NaiveDateTime) -> SweepReport {
        let local = self.config.probe_local_address();
        let mut records = Vec::new();
        for identity in self.engine.scenarios().identities() {
            let remote = self.config.probe_remote_address(identity);
            match probe_once(&local, &remote).await {
                Ok(record) => records.push(record),
                Err(e) => warn!("Probe of {} failed: {}", identity, e),
            }
        }
        self.engine.sweep(&records, now).await
    }
}
