//! Registry of session records.
//!
//! The store only registers and removes whole records; field updates happen
//! under each record's own lock.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::{ProtocolError, SessionId};

use super::record::SessionRecord;

/// A record shared between the store and the tasks driving it.
pub type SharedRecord = Arc<tokio::sync::Mutex<SessionRecord>>;

/// Thread-safe session registry backed by DashMap.
pub struct SessionStore {
    sessions: DashMap<SessionId, SharedRecord>,
    max_sessions: usize,
}

impl SessionStore {
    /// Creates a store holding at most `max_sessions` records.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
        }
    }

    /// Returns the record for `id`, registering a new one if needed.
    ///
    /// The boolean is true when the record was created by this call.
    ///
    /// # Errors
    /// `InvalidInput` if a new record would exceed the session limit.
    pub fn create(&self, id: &str) -> Result<(SharedRecord, bool), ProtocolError> {
        if let Some(existing) = self.get(id) {
            return Ok((existing, false));
        }

        // len() locks every shard, so it must not run while holding an entry.
        if self.sessions.len() >= self.max_sessions {
            return Err(ProtocolError::InvalidInput(format!(
                "session limit of {} reached",
                self.max_sessions
            )));
        }

        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(entry) => Ok((Arc::clone(entry.get()), false)),
            Entry::Vacant(entry) => {
                let record = Arc::new(tokio::sync::Mutex::new(SessionRecord::new(id)));
                entry.insert(Arc::clone(&record));
                tracing::info!(session_id = %id, "Registered session");
                Ok((record, true))
            }
        }
    }

    /// Returns the record for `id`.
    pub fn get(&self, id: &str) -> Option<SharedRecord> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the record for `id` or `NotFound`.
    pub fn require(&self, id: &str) -> Result<SharedRecord, ProtocolError> {
        self.get(id)
            .ok_or_else(|| ProtocolError::NotFound(id.to_string()))
    }

    /// Removes the record for `id`.
    pub fn remove(&self, id: &str) -> Result<SharedRecord, ProtocolError> {
        match self.sessions.remove(id) {
            Some((_, record)) => {
                tracing::info!(session_id = %id, "Removed session");
                Ok(record)
            }
            None => Err(ProtocolError::NotFound(id.to_string())),
        }
    }

    /// Returns every registered id, sorted.
    pub fn list(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Returns every registered record, sorted by id.
    pub fn records(&self) -> Vec<(SessionId, SharedRecord)> {
        let mut records: Vec<(SessionId, SharedRecord)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        records
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
