//! In-memory dedup store: id -> expiry on a pluggable clock.

use super::DedupStore;
use crate::clock::{Clock, MonotonicClock};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct InMemoryDedupStore {
    /// id -> expiry in clock milliseconds.
    records: Mutex<HashMap<String, u64>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryDedupStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::default())
    }

    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self { records: Mutex::new(HashMap::new()), clock: Arc::new(clock) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_live(&self, expires_at: u64) -> bool {
        self.clock.now_millis() < expires_at
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn insert_if_absent(&self, id: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(ttl.as_millis() as u64);
        let mut records = self.lock();
        match records.get(id) {
            Some(&existing) if now < existing => Ok(false),
            _ => {
                // Absent or expired; either way this caller owns the record.
                records.insert(id.to_string(), expires_at);
                Ok(true)
            }
        }
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.lock().get(id).is_some_and(|&expires_at| self.is_live(expires_at)))
    }

    async fn remove_expired(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, &mut expires_at| now < expires_at);
        Ok(before - records.len())
    }

    async fn live_ids(&self) -> Result<Vec<String>> {
        let records = self.lock();
        Ok(records
            .iter()
            .filter(|(_, &expires_at)| self.is_live(expires_at))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.lock().len())
    }
}
