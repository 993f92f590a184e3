use crate::cli_config::Config;
use crate::runtime::{GatewayError, RuntimeGateway};
use crate::state::{Container, ContainerRegistry, Patient, PatientRegistry};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

// =============================================================================
// Main Monitor Logic
// =============================================================================

/// A patient healthy for this long since its last restart attempt is cured.
pub const CURED_AFTER: Duration = Duration::from_secs(30);

/// Capacity of the queue between scraping and healing. When it is full the
/// scrape loop waits, which bounds the amount of pending healing work.
pub const HEAL_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScrapeReport {
    pub seen: usize,
    pub stuck: usize,
    pub enqueued: usize,
    pub pruned: usize,
}

pub struct ContainerMonitor<G> {
    config: Config,
    gateway: Arc<G>,
    containers: ContainerRegistry,
    patients: PatientRegistry,
}

impl<G: RuntimeGateway> ContainerMonitor<G> {
    pub fn new(
        config: Config,
        gateway: Arc<G>,
        containers: ContainerRegistry,
        patients: PatientRegistry,
    ) -> Self {
        Self {
            config,
            gateway,
            containers,
            patients,
        }
    }

    /// One scrape tick: refresh every container, schedule the sick ones for
    /// healing, and prune names the runtime no longer reports.
    ///
    /// A failed list call returns early without touching the registries.
    /// Once shutdown is signalled, a send waiting on a full queue is
    /// abandoned and the rest of the tick enqueues nothing.
    pub async fn scrape(
        &self,
        heal_queue: &mpsc::Sender<String>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<ScrapeReport, GatewayError> {
        let listed = self.gateway.list_all_containers().await?;
        let mut shutdown = shutdown.clone();
        let mut stopping = false;

        let existing: HashSet<String> = listed.iter().map(|c| c.name.clone()).collect();
        let mut report = ScrapeReport {
            seen: existing.len(),
            ..Default::default()
        };

        for summary in listed {
            let name = summary.name;
            let previous = self.containers.get(&name);

            let mut container = Container {
                id: summary.id,
                image: summary.image,
                state: summary.state,
                ..Default::default()
            };
            if let Some(previous) = previous {
                container.restart_count = previous.restart_count;
                container.health = previous.health;
            }

            let inspected = self
                .gateway
                .inspect(&container.id, self.config.inspect_timeout)
                .await;
            match inspected {
                Ok(info) => {
                    container.restart_count = info.restart_count;
                    container.health = info.health;
                    container.stuck_inspect = false;
                }
                Err(e) => {
                    error!(container = %name, error = %e, "Failed to inspect container");
                    container.stuck_inspect = true;
                    report.stuck += 1;
                }
            }

            let sick = self.config.heal_mode && container.is_unhealthy();
            self.containers.refresh(name.clone(), container);

            if sick {
                if self.patients.get(&name).is_none() {
                    self.patients.put(
                        name.clone(),
                        Patient::new(
                            self.config.restart_backoff_min,
                            self.config.restart_backoff_max,
                        ),
                    );
                    info!(container = %name, "Container is sick, scheduled for treatment");
                } else {
                    debug!(container = %name, "Container is sick and already scheduled");
                }

                if stopping {
                    continue;
                }
                tokio::select! {
                    biased;
                    sent = heal_queue.send(name) => match sent {
                        Ok(()) => report.enqueued += 1,
                        Err(_) => warn!("Heal queue is closed, dropping patient"),
                    },
                    _ = stop_requested(&mut shutdown) => {
                        info!("Shutting down, no longer scheduling treatments");
                        stopping = true;
                    }
                }
            }
        }

        report.pruned = self.containers.delete_missing(&existing);
        Ok(report)
    }

    /// One reaper tick. Returns the number of patients retired.
    pub fn reap(&self) -> usize {
        let mut removed = 0;

        self.patients.retain(|name, patient| match self.containers.get(name) {
            None => {
                info!(
                    container = %name,
                    "Patient can no longer be seen in containers list, removing"
                );
                removed += 1;
                false
            }
            Some(container)
                if container.is_healthy() && patient.since_last_attempt() > CURED_AFTER =>
            {
                info!(
                    container = %name,
                    "Patient is healthy for {}s since last healing, removing",
                    CURED_AFTER.as_secs()
                );
                removed += 1;
                false
            }
            Some(_) => true,
        });

        removed
    }

    fn print_status(&self) {
        let snapshot = self.containers.snapshot();
        let unhealthy = snapshot.iter().filter(|(_, c)| c.is_unhealthy()).count();
        let stuck = snapshot.iter().filter(|(_, c)| c.stuck_inspect).count();

        let mut patients = 0;
        let mut in_treatment = 0;
        self.patients.for_each(|name, patient| {
            patients += 1;
            if patient.being_treated {
                in_treatment += 1;
            }
            debug!(
                container = %name,
                being_treated = patient.being_treated,
                next_delay = ?patient.backoff.peek(),
                "Patient"
            );
        });

        info!(
            monitored = snapshot.len(),
            unhealthy, stuck, patients, in_treatment, "Status"
        );

        // Log containers with healing history
        for (name, container) in &snapshot {
            if container.healed.total() > 0 {
                info!(
                    "Container {} - healed: {}, failed heals: {}",
                    name, container.healed.success, container.healed.fail
                );
            }
        }
    }

    pub async fn run_scrape_loop(
        &self,
        heal_queue: mpsc::Sender<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let scrape_shutdown = shutdown.clone();
        let mut ticker = interval(self.config.scrape_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.config.scrape_interval, "Entering scrape loop");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.scrape(&heal_queue, &scrape_shutdown).await {
                        Ok(report) => debug!(
                            seen = report.seen,
                            stuck = report.stuck,
                            enqueued = report.enqueued,
                            pruned = report.pruned,
                            "Scrape completed"
                        ),
                        Err(e) => error!(error = %e, "Failed to get containers info"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Scrape loop stopped");
    }

    pub async fn run_reaper_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.config.cleanup_interval, "Entering reaper loop");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.reap();
                    if removed > 0 {
                        debug!(removed, remaining = self.patients.len(), "Reaped patients");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Reaper loop stopped");
    }

    pub async fn run_status_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.status_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.print_status(),
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Resolves once shutdown is signalled. A dropped sender never resolves it.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
