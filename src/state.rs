use crate::backoff::Backoff;

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// Container State
// =============================================================================

pub const HEALTH_HEALTHY: &str = "healthy";
pub const HEALTH_UNHEALTHY: &str = "unhealthy";
pub const STATE_RUNNING: &str = "running";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealOutcome {
    Success,
    Fail,
}

/// Cumulative results of this daemon's restart attempts for one name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealOutcomes {
    pub success: u64,
    pub fail: u64,
}

impl HealOutcomes {
    pub fn total(&self) -> u64 {
        self.success + self.fail
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub image: String,
    /// Runtime lifecycle state: running, exited, paused...
    pub state: String,
    /// Runtime health status; empty when the container has no healthcheck.
    pub health: String,
    /// Restarts performed by the runtime itself, not by us.
    pub restart_count: i64,
    /// The last inspect call failed or timed out.
    pub stuck_inspect: bool,
    pub healed: HealOutcomes,
}

impl Container {
    pub fn is_unhealthy(&self) -> bool {
        self.health == HEALTH_UNHEALTHY
    }

    pub fn is_healthy(&self) -> bool {
        self.health == HEALTH_HEALTHY
    }

    pub fn is_running(&self) -> bool {
        self.state == STATE_RUNNING
    }
}

/// Latest known state per container name. Cloning shares the same store.
#[derive(Debug, Clone, Default)]
pub struct ContainerRegistry {
    db: Arc<RwLock<HashMap<String, Container>>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Container> {
        self.db.read().get(name).cloned()
    }

    #[allow(dead_code)] // Registry API; the scrape loop goes through `refresh`
    pub fn put(&self, name: impl Into<String>, container: Container) {
        self.db.write().insert(name.into(), container);
    }

    /// Stores a fresh observation for `name`, keeping whatever heal counters
    /// are already recorded for it (new names start at zero).
    pub fn refresh(&self, name: impl Into<String>, mut container: Container) {
        let name = name.into();
        let mut db = self.db.write();
        container.healed = db.get(&name).map(|c| c.healed).unwrap_or_default();
        db.insert(name, container);
    }

    /// Bumps one heal counter in place. Unknown names are ignored: the
    /// container may have been pruned while its treatment was running.
    pub fn record_outcome(&self, name: &str, outcome: HealOutcome) {
        if let Some(container) = self.db.write().get_mut(name) {
            match outcome {
                HealOutcome::Success => container.healed.success += 1,
                HealOutcome::Fail => container.healed.fail += 1,
            }
        }
    }

    /// Drops every entry whose name is not in `seen`, returning how many went.
    pub fn delete_missing(&self, seen: &HashSet<String>) -> usize {
        let mut db = self.db.write();
        let before = db.len();
        db.retain(|name, _| seen.contains(name));
        before - db.len()
    }

    /// Point-in-time copy of every entry, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, Container)> {
        let mut entries: Vec<_> = self
            .db
            .read()
            .iter()
            .map(|(name, container)| (name.clone(), container.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    #[allow(dead_code)] // Registry API, exercised by tests
    pub fn len(&self) -> usize {
        self.db.read().len()
    }

    #[allow(dead_code)] // Registry API, exercised by tests
    pub fn is_empty(&self) -> bool {
        self.db.read().is_empty()
    }
}

// =============================================================================
// Patient State
// =============================================================================

/// A container under healing supervision.
#[derive(Debug, Clone)]
pub struct Patient {
    pub backoff: Backoff,
    pub last_restart_attempt: Instant,
    pub being_treated: bool,
    /// Token of the treatment holding the guard, meaningful while
    /// `being_treated` is set.
    pub treatment_token: u64,
}

impl Patient {
    pub fn new(backoff_min: Duration, backoff_max: Duration) -> Self {
        Self {
            backoff: Backoff::new(backoff_min, backoff_max),
            last_restart_attempt: Instant::now(),
            being_treated: false,
            treatment_token: 0,
        }
    }

    pub fn since_last_attempt(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_restart_attempt)
    }
}

/// Handed out by [`PatientRegistry::start_treatment`]. Only the holder of
/// the matching token can release the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreatmentTicket {
    pub token: u64,
    pub delay: Duration,
}

/// In-treatment state per sick container name. Cloning shares the same store.
#[derive(Debug, Clone, Default)]
pub struct PatientRegistry {
    db: Arc<RwLock<HashMap<String, Patient>>>,
    next_token: Arc<AtomicU64>,
}

impl PatientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Patient> {
        self.db.read().get(name).cloned()
    }

    pub fn put(&self, name: impl Into<String>, patient: Patient) {
        self.db.write().insert(name.into(), patient);
    }

    /// Claims the treatment guard for `name`.
    ///
    /// Returns `None` if there is no patient or a treatment is already in
    /// flight. Otherwise marks it as being treated, stamps the attempt time,
    /// and returns a fresh token with the backoff delay for this attempt
    /// (advancing the backoff). Tokens are unique across patients, so a
    /// patient recreated under the same name never matches an old ticket.
    pub fn start_treatment(&self, name: &str) -> Option<TreatmentTicket> {
        let mut db = self.db.write();
        let patient = db.get_mut(name)?;
        if patient.being_treated {
            return None;
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        patient.being_treated = true;
        patient.treatment_token = token;
        patient.last_restart_attempt = Instant::now();
        Some(TreatmentTicket {
            token,
            delay: patient.backoff.next_delay(),
        })
    }

    /// Releases the guard if `token` still owns it. Returns whether it did.
    pub fn stop_treatment(&self, name: &str, token: u64) -> bool {
        match self.db.write().get_mut(name) {
            Some(patient) if patient.being_treated && patient.treatment_token == token => {
                patient.being_treated = false;
                true
            }
            _ => false,
        }
    }

    #[allow(dead_code)] // Registry API, exercised by tests
    pub fn delete(&self, name: &str) -> Option<Patient> {
        self.db.write().remove(name)
    }

    pub fn for_each(&self, mut visit: impl FnMut(&str, &Patient)) {
        for (name, patient) in self.db.read().iter() {
            visit(name, patient);
        }
    }

    /// Keeps only the patients for which `keep` returns true, under a single
    /// write lock.
    pub fn retain(&self, mut keep: impl FnMut(&str, &Patient) -> bool) {
        self.db.write().retain(|name, patient| keep(name, patient));
    }

    pub fn len(&self) -> usize {
        self.db.read().len()
    }

    #[allow(dead_code)] // Registry API, exercised by tests
    pub fn is_empty(&self) -> bool {
        self.db.read().is_empty()
    }
}
