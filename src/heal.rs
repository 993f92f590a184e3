use crate::runtime::RuntimeGateway;
use crate::state::{ContainerRegistry, HealOutcome, PatientRegistry};

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info};

// =============================================================================
// Healing Worker
// =============================================================================

/// Grace period the runtime gives a container to stop before killing it.
pub const RESTART_GRACE_SECONDS: u32 = 10;

/// Pause between a restart and the verification inspect.
pub const SETTLE_TIME: Duration = Duration::from_secs(3);

/// A restarted container reporting more uptime than this was not actually
/// replaced. Heuristic: creation-time semantics differ across runtime versions.
pub const MAX_UPTIME_AFTER_RESTART: Duration = Duration::from_secs(20);

/// Drains the healing queue and launches one treatment task per eligible name.
pub struct Healer<G> {
    gateway: Arc<G>,
    containers: ContainerRegistry,
    patients: PatientRegistry,
    inspect_timeout: Duration,
    /// Names with a treatment future that has not finished yet. Outlives the
    /// patient entry, which the reaper may retire mid-treatment.
    active: Arc<Mutex<HashSet<String>>>,
}

impl<G: RuntimeGateway> Healer<G> {
    pub fn new(
        gateway: Arc<G>,
        containers: ContainerRegistry,
        patients: PatientRegistry,
        inspect_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            containers,
            patients,
            inspect_timeout,
            active: Arc::default(),
        }
    }

    /// Runs until the queue closes or shutdown is signalled, then waits for
    /// treatments already in flight: they are never cancelled.
    pub async fn run(self, mut queue: mpsc::Receiver<String>, mut shutdown: watch::Receiver<bool>) {
        info!("Healer started");
        let mut in_flight: JoinSet<HealOutcome> = JoinSet::new();

        loop {
            tokio::select! {
                next = queue.recv() => match next {
                    Some(name) => {
                        while let Some(done) = in_flight.try_join_next() {
                            log_join_result(done);
                        }
                        if let Some(treatment) = self.dispatch(&name) {
                            in_flight.spawn(treatment);
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "Waiting for in-flight treatments");
        }
        while let Some(done) = in_flight.join_next().await {
            log_join_result(done);
        }

        info!("Healer stopped");
    }

    /// Prepares a treatment for `name` if it is still sick, not already
    /// being treated, and no earlier treatment for the name is still
    /// running. The returned future must be spawned to run; dropping it
    /// releases the claim.
    pub fn dispatch(
        &self,
        name: &str,
    ) -> Option<impl Future<Output = HealOutcome> + Send + use<G>> {
        let (Some(container), Some(patient)) = (self.containers.get(name), self.patients.get(name))
        else {
            return None;
        };

        if patient.being_treated {
            debug!(container = %name, "Patient is already being treated");
            return None;
        }

        if !container.is_unhealthy() {
            debug!(
                container = %name,
                health = %container.health,
                "Patient is no longer unhealthy, skipping restart"
            );
            return None;
        }

        if !self.active.lock().insert(name.to_string()) {
            debug!(container = %name, "Previous treatment is still running");
            return None;
        }

        let Some(ticket) = self.patients.start_treatment(name) else {
            self.active.lock().remove(name);
            return None;
        };
        debug!(container = %name, "Starting treatment");

        let guard = TreatmentGuard {
            patients: self.patients.clone(),
            active: Arc::clone(&self.active),
            name: name.to_string(),
            token: ticket.token,
        };
        let treatment = Treatment {
            name: name.to_string(),
            container_id: container.id,
            delay: ticket.delay,
            inspect_timeout: self.inspect_timeout,
        };
        let gateway = Arc::clone(&self.gateway);
        let containers = self.containers.clone();

        Some(async move {
            let _guard = guard;
            let outcome = treatment.perform(gateway.as_ref()).await;
            containers.record_outcome(&treatment.name, outcome);
            outcome
        })
    }
}

fn log_join_result(result: Result<HealOutcome, JoinError>) {
    match result {
        Ok(outcome) => debug!(?outcome, "Treatment finished"),
        Err(e) => error!(error = %e, "Treatment task failed"),
    }
}

/// Releases the treatment claim however the treatment ends, panics included.
struct TreatmentGuard {
    patients: PatientRegistry,
    active: Arc<Mutex<HashSet<String>>>,
    name: String,
    token: u64,
}

impl Drop for TreatmentGuard {
    fn drop(&mut self) {
        if !self.patients.stop_treatment(&self.name, self.token) {
            debug!(container = %self.name, "Patient was retired or replaced during treatment");
        }
        self.active.lock().remove(&self.name);
    }
}

/// Everything one treatment needs, captured when it starts.
struct Treatment {
    name: String,
    container_id: String,
    delay: Duration,
    inspect_timeout: Duration,
}

impl Treatment {
    async fn perform<G: RuntimeGateway>(&self, gateway: &G) -> HealOutcome {
        let name = &self.name;

        debug!(container = %name, delay = ?self.delay, "Sleeping before restart");
        sleep(self.delay).await;

        if let Err(e) = gateway
            .restart(&self.container_id, RESTART_GRACE_SECONDS)
            .await
        {
            error!(container = %name, error = %e, "Failed to restart container");
            return HealOutcome::Fail;
        }

        // The restart call can succeed without the container being replaced,
        // so check its uptime once it has had a moment to come back.
        sleep(SETTLE_TIME).await;

        match gateway.inspect(&self.container_id, self.inspect_timeout).await {
            Err(e) => {
                error!(
                    container = %name,
                    error = %e,
                    "Failed to inspect container after restart, assuming restart failed"
                );
                HealOutcome::Fail
            }
            Ok(info) => {
                let uptime = info.uptime();
                if uptime > MAX_UPTIME_AFTER_RESTART {
                    debug!(container = %name, uptime = ?uptime, "Uptime after restart");
                    info!(
                        container = %name,
                        "Uptime is more than {}s, assuming restart failed",
                        MAX_UPTIME_AFTER_RESTART.as_secs()
                    );
                    HealOutcome::Fail
                } else {
                    info!(container = %name, "Restarted container");
                    HealOutcome::Success
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::{FakeGateway, InspectScript};
    use crate::state::{Container, HealOutcomes, Patient, HEALTH_HEALTHY, HEALTH_UNHEALTHY};

    const MIN: Duration = Duration::from_secs(10);
    const MAX: Duration = Duration::from_secs(80);

    struct Fixture {
        gateway: Arc<FakeGateway>,
        containers: ContainerRegistry,
        patients: PatientRegistry,
        healer: Healer<FakeGateway>,
    }

    fn fixture() -> Fixture {
        let gateway = Arc::new(FakeGateway::new());
        let containers = ContainerRegistry::new();
        let patients = PatientRegistry::new();
        let healer = Healer::new(
            Arc::clone(&gateway),
            containers.clone(),
            patients.clone(),
            Duration::from_secs(5),
        );
        Fixture {
            gateway,
            containers,
            patients,
            healer,
        }
    }

    impl Fixture {
        fn sick(&self, name: &str) {
            self.gateway.add(name, HEALTH_UNHEALTHY);
            self.containers.put(
                name,
                Container {
                    id: format!("id-{name}"),
                    image: format!("{name}:latest"),
                    state: "running".to_string(),
                    health: HEALTH_UNHEALTHY.to_string(),
                    ..Default::default()
                },
            );
            self.patients.put(name, Patient::new(MIN, MAX));
        }

        fn spawn(&self, name: &str) -> Option<tokio::task::JoinHandle<HealOutcome>> {
            self.healer.dispatch(name).map(tokio::spawn)
        }

        fn healed(&self, name: &str) -> HealOutcomes {
            self.containers.get(name).unwrap().healed
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_restart_records_success() {
        let f = fixture();
        f.sick("web-1");

        let handle = f.spawn("web-1").unwrap();
        assert!(f.patients.get("web-1").unwrap().being_treated);

        assert_eq!(handle.await.unwrap(), HealOutcome::Success);
        assert_eq!(f.healed("web-1"), HealOutcomes { success: 1, fail: 0 });
        assert!(!f.patients.get("web-1").unwrap().being_treated);
        assert_eq!(f.gateway.restarts(), vec!["id-web-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn treatment_waits_for_backoff_before_restarting() {
        let f = fixture();
        f.sick("web-1");

        let handle = f.spawn("web-1").unwrap();

        tokio::time::sleep(MIN - Duration::from_secs(1)).await;
        assert!(f.gateway.restarts().is_empty());

        handle.await.unwrap();
        assert_eq!(f.gateway.restarts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_uptime_after_restart_is_a_failure() {
        let f = fixture();
        f.sick("cache-3");
        f.gateway.set_uptime_after_restart(Duration::from_secs(25));

        let outcome = f.spawn("cache-3").unwrap().await.unwrap();

        assert_eq!(outcome, HealOutcome::Fail);
        assert_eq!(f.healed("cache-3"), HealOutcomes { success: 0, fail: 1 });
        assert_eq!(f.gateway.restarts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_error_is_a_failure_and_releases_guard() {
        let f = fixture();
        f.sick("web-1");
        f.gateway.fail_restart(true);

        let outcome = f.spawn("web-1").unwrap().await.unwrap();

        assert_eq!(outcome, HealOutcome::Fail);
        assert!(!f.patients.get("web-1").unwrap().being_treated);
        assert_eq!(f.healed("web-1").fail, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_verification_inspect_is_a_failure() {
        let f = fixture();
        f.sick("web-1");
        f.gateway.script_inspect("web-1", InspectScript::Timeout);

        let outcome = f.spawn("web-1").unwrap().await.unwrap();

        assert_eq!(outcome, HealOutcome::Fail);
        assert!(!f.patients.get("web-1").unwrap().being_treated);
    }

    #[tokio::test(start_paused = true)]
    async fn skips_names_without_container_or_patient() {
        let f = fixture();
        f.sick("web-1");
        f.patients.delete("web-1");
        assert!(f.spawn("web-1").is_none());

        f.sick("web-2");
        f.containers.delete_missing(&Default::default());
        assert!(f.spawn("web-2").is_none());
        assert!(!f.patients.get("web-2").unwrap().being_treated);
    }

    #[tokio::test(start_paused = true)]
    async fn skips_recovered_container_without_marking_treatment() {
        let f = fixture();
        f.sick("web-1");
        let mut container = f.containers.get("web-1").unwrap();
        container.health = HEALTH_HEALTHY.to_string();
        f.containers.put("web-1", container);

        assert!(f.spawn("web-1").is_none());
        let patient = f.patients.get("web-1").unwrap();
        assert!(!patient.being_treated);
        assert_eq!(patient.backoff.attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn skips_while_treatment_in_flight() {
        let f = fixture();
        f.sick("web-1");

        let first = f.spawn("web-1").unwrap();
        assert!(f.spawn("web-1").is_none());
        first.await.unwrap();

        assert_eq!(f.gateway.restarts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn treatment_outliving_its_patient_blocks_the_next_one() {
        let f = fixture();
        f.sick("web-1");
        let first = f.spawn("web-1").unwrap();

        // Retired while sleeping through the backoff, then sick again
        f.patients.delete("web-1");
        f.patients.put("web-1", Patient::new(MIN, MAX));
        assert!(f.spawn("web-1").is_none());
        assert!(!f.patients.get("web-1").unwrap().being_treated);

        first.await.unwrap();
        assert_eq!(f.gateway.restarts().len(), 1);

        let second = f.spawn("web-1").unwrap();
        assert!(f.patients.get("web-1").unwrap().being_treated);
        second.await.unwrap();
        assert!(!f.patients.get("web-1").unwrap().being_treated);
        assert_eq!(f.gateway.restarts().len(), 2);
        assert_eq!(f.gateway.max_concurrent_restarts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_an_unspawned_treatment_releases_the_claim() {
        let f = fixture();
        f.sick("web-1");

        let treatment = f.healer.dispatch("web-1").unwrap();
        assert!(f.patients.get("web-1").unwrap().being_treated);
        drop(treatment);

        assert!(!f.patients.get("web-1").unwrap().being_treated);
        assert!(f.spawn("web-1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn run_treats_a_name_again_after_its_treatment_finished() {
        let f = fixture();
        f.sick("web-1");
        f.gateway.fail_restart(true);

        let (tx, rx) = mpsc::channel(10);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(f.healer.run(rx, shutdown_rx));

        tx.send("web-1".to_string()).await.unwrap();
        tokio::time::sleep(MIN + Duration::from_secs(1)).await;
        assert_eq!(f.containers.get("web-1").unwrap().healed.fail, 1);

        tx.send("web-1".to_string()).await.unwrap();
        tokio::time::sleep(MIN * 2 + Duration::from_secs(1)).await;
        assert_eq!(f.containers.get("web-1").unwrap().healed.fail, 2);

        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
        assert!(!f.patients.get("web-1").unwrap().being_treated);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_across_treatments_and_caps() {
        let f = fixture();
        f.sick("web-1");
        f.gateway.fail_restart(true);

        let mut delays = Vec::new();
        for _ in 0..6 {
            let before = tokio::time::Instant::now();
            let handle = f.spawn("web-1").unwrap();
            handle.await.unwrap();
            delays.push(tokio::time::Instant::now() - before);
        }

        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[0], MIN);
        assert_eq!(*delays.last().unwrap(), MAX);
        assert_eq!(f.healed("web-1").fail, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_enqueues_restart_each_name_at_most_once_at_a_time() {
        let f = fixture();
        let names = ["a", "b", "c"];
        for name in names {
            f.sick(name);
        }
        f.gateway.set_restart_latency(Duration::from_secs(7));

        let (tx, rx) = mpsc::channel(10);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(f.healer.run(rx, shutdown_rx));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let tx = tx.clone();
                tokio::spawn(async move {
                    for _ in 0..25 {
                        for name in names {
                            tx.send(name.to_string()).await.unwrap();
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                })
            })
            .collect();
        for p in producers {
            p.await.unwrap();
        }

        // Let the last treatments finish.
        tokio::time::sleep(MAX * 2).await;
        shutdown_tx.send(true).unwrap();
        run.await.unwrap();

        assert_eq!(f.gateway.max_concurrent_restarts(), 1);
        for name in names {
            assert!(!f.patients.get(name).unwrap().being_treated);
            assert!(f.containers.get(name).unwrap().healed.total() >= 1);
        }
    }
}
