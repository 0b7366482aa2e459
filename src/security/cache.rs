use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use super::directory::MembershipCache;
use super::privilege::Privilege;
use super::snapshot::SecuritySnapshot;
use crate::adapter::Connection;
use crate::error::{ConnectivityError, DataError};

/// Where a [`SnapshotCache`] reloads from.
pub trait SnapshotSource<P: Privilege>: Send + Sync {
    fn load(&self) -> Result<SecuritySnapshot<P>, DataError>;
}

/// Reads the ontology through a [`Connection`].
pub struct ConnectionSource {
    conn: Arc<Connection>,
}

impl ConnectionSource {
    pub fn new(conn: Arc<Connection>) -> Self {
        ConnectionSource { conn }
    }
}

impl<P: Privilege> SnapshotSource<P> for ConnectionSource {
    fn load(&self) -> Result<SecuritySnapshot<P>, DataError> {
        SecuritySnapshot::load(&self.conn)
    }
}

struct Cached<P: Privilege> {
    stored: Arc<SecuritySnapshot<P>>,
    effective: Arc<SecuritySnapshot<P>>,
    loaded_at: DateTime<Utc>,
    generation: u64,
}

/// Caches the resolved snapshot for a bounded time.
///
/// The stored ontology is reloaded once `ttl` has elapsed since the last
/// load, or on the next read after [`invalidate`](Self::invalidate). With a
/// membership cache attached, directory-linked groups are re-overlaid
/// whenever that cache has been refreshed.
pub struct SnapshotCache<P: Privilege> {
    source: Arc<dyn SnapshotSource<P>>,
    ttl: Duration,
    directory: Option<Arc<MembershipCache>>,
    state: Mutex<Option<Cached<P>>>,
}

impl<P: Privilege> SnapshotCache<P> {
    pub fn new(source: Arc<dyn SnapshotSource<P>>, ttl: Duration) -> Self {
        SnapshotCache {
            source,
            ttl,
            directory: None,
            state: Mutex::new(None),
        }
    }

    pub fn with_directory(mut self, directory: Arc<MembershipCache>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn get(&self, now: DateTime<Utc>) -> Result<Arc<SecuritySnapshot<P>>, DataError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ConnectivityError::Poisoned("snapshot cache"))?;

        let generation = self.generation();
        match state.as_mut() {
            Some(cached) if now - cached.loaded_at < self.ttl => {
                if cached.generation != generation {
                    cached.effective = self.overlay(&cached.stored, now);
                    cached.generation = generation;
                }
                Ok(Arc::clone(&cached.effective))
            }
            _ => {
                let cached = self.load(now, generation)?;
                let effective = Arc::clone(&cached.effective);
                *state = Some(cached);
                Ok(effective)
            }
        }
    }

    /// Reload now regardless of age.
    pub fn refresh(&self, now: DateTime<Utc>) -> Result<Arc<SecuritySnapshot<P>>, DataError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ConnectivityError::Poisoned("snapshot cache"))?;
        let cached = self.load(now, self.generation())?;
        let effective = Arc::clone(&cached.effective);
        *state = Some(cached);
        Ok(effective)
    }

    /// Drop the cached snapshot; the next read reloads.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = None;
        tracing::debug!("security snapshot invalidated");
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.as_ref().map(|cached| cached.loaded_at)
    }

    fn generation(&self) -> u64 {
        self.directory.as_ref().map_or(0, |d| d.generation())
    }

    fn load(&self, now: DateTime<Utc>, generation: u64) -> Result<Cached<P>, DataError> {
        let stored = Arc::new(self.source.load()?);
        tracing::debug!(loaded_at = %now, "security snapshot reloaded");
        Ok(Cached {
            effective: self.overlay(&stored, now),
            stored,
            loaded_at: now,
            generation,
        })
    }

    fn overlay(&self, stored: &Arc<SecuritySnapshot<P>>, now: DateTime<Utc>) -> Arc<SecuritySnapshot<P>> {
        match &self.directory {
            None => Arc::clone(stored),
            Some(directory) => {
                let mut effective = SecuritySnapshot::clone(stored);
                directory.overlay(&mut effective, now);
                Arc::new(effective)
            }
        }
    }
}
