use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-identity async mutexes serializing balance mutations inside this process.
///
/// Multi-identity acquisitions lock in lexicographic order so two transfers between the
/// same pair cannot deadlock.
#[derive(Debug, Clone, Default)]
pub struct IdentityLocks {
    slots: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, identities: &[&str]) -> IdentityGuard {
        let mut ordered: Vec<String> = identities.iter().map(|id| id.to_string()).collect();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for identity in &ordered {
            let slot = self.slot(identity);
            guards.push(slot.lock_owned().await);
        }

        IdentityGuard {
            identities: ordered,
            _guards: guards,
        }
    }

    /// Identities with a live slot. Idle slots are pruned on the next acquisition.
    pub fn tracked(&self) -> usize {
        self.slots_guard().len()
    }

    fn slot(&self, identity: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots_guard();
        slots.retain(|key, slot| key == identity || Arc::strong_count(slot) > 1);
        slots
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn slots_guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Held for the whole duration of a mutation sequence, including its compensation.
#[derive(Debug)]
pub struct IdentityGuard {
    identities: Vec<String>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl IdentityGuard {
    pub fn identities(&self) -> &[String] {
        &self.identities
    }

    pub fn covers(&self, identity: &str) -> bool {
        self.identities.iter().any(|held| held == identity)
    }
}
