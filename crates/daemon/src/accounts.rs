//! Best-effort account bookkeeping.
//!
//! Pairing progress observed by streaming connections is reported to an
//! [`AccountNotifier`]. Notifications run off the async runtime and their
//! failures are logged, never propagated to the stream or the caller.
//!
//! The shipped notifier, [`AccountLedger`], keeps the last known pairing and
//! auth timestamps per session in a JSON file under the data directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use protocol::{ProtocolError, SessionId};
use serde::{Deserialize, Serialize};

/// Receives best-effort account updates.
pub trait AccountNotifier: Send + Sync {
    /// A pairing code was shown for the session at `at` (Unix ms).
    fn record_pairing_code(&self, session_id: &str, at: u64) -> Result<(), ProtocolError>;

    /// The session's auth status changed at `at` (Unix ms).
    fn record_auth_status(
        &self,
        session_id: &str,
        ready: bool,
        phone_identity: Option<&str>,
        at: u64,
    ) -> Result<(), ProtocolError>;
}

/// Records a pairing code in the background, logging failures.
pub fn spawn_pairing_code(notifier: Arc<dyn AccountNotifier>, session_id: String, at: u64) {
    tokio::task::spawn_blocking(move || {
        if let Err(e) = notifier.record_pairing_code(&session_id, at) {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to record pairing code");
        }
    });
}

/// Records an auth status change in the background, logging failures.
pub fn spawn_auth_status(
    notifier: Arc<dyn AccountNotifier>,
    session_id: String,
    ready: bool,
    phone_identity: Option<String>,
    at: u64,
) {
    tokio::task::spawn_blocking(move || {
        if let Err(e) =
            notifier.record_auth_status(&session_id, ready, phone_identity.as_deref(), at)
        {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to record auth status");
        }
    });
}

/// Last known account state of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    /// Session identifier.
    pub session_id: SessionId,
    /// Unix ms of the last pairing code shown.
    pub last_code_at: Option<u64>,
    /// Whether the session was ready at the last update.
    pub is_ready: bool,
    /// Paired phone identity.
    pub phone_identity: Option<String>,
    /// Unix ms of the last successful pairing.
    pub authenticated_at: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerData {
    version: u32,
    accounts: Vec<AccountEntry>,
}

/// JSON-file backed [`AccountNotifier`].
#[derive(Debug)]
pub struct AccountLedger {
    path: PathBuf,
    accounts: RwLock<HashMap<SessionId, AccountEntry>>,
}

impl AccountLedger {
    /// Creates a ledger that persists to `path`. Call `load()` to read it.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a ledger and loads any existing file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let ledger = Self::new(path);
        ledger.load()?;
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the ledger from disk. A missing file leaves it empty.
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            tracing::debug!("Account ledger not found at {:?}, starting empty", self.path);
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read account ledger: {}", self.path.display()))?;
        let data: LedgerData = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse account ledger: {}", self.path.display()))?;

        let mut accounts = self
            .accounts
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on account ledger"))?;
        accounts.clear();
        for entry in data.accounts {
            accounts.insert(entry.session_id.clone(), entry);
        }

        tracing::info!("Loaded {} accounts from {:?}", accounts.len(), self.path);
        Ok(())
    }

    /// Writes the ledger atomically (temp file, then rename).
    fn save_locked(&self, accounts: &HashMap<SessionId, AccountEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create ledger directory: {}", parent.display())
            })?;
        }

        let mut entries: Vec<AccountEntry> = accounts.values().cloned().collect();
        entries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        let data = LedgerData {
            version: 1,
            accounts: entries,
        };
        let contents =
            serde_json::to_string_pretty(&data).context("Failed to serialize account ledger")?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).with_context(|| {
            format!("Failed to write temp ledger: {}", temp_path.display())
        })?;
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp ledger {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;

        tracing::debug!("Saved {} accounts to {:?}", accounts.len(), self.path);
        Ok(())
    }

    /// Applies `update` to a session's entry and persists the ledger.
    fn update<F>(&self, session_id: &str, update: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&mut AccountEntry),
    {
        let mut accounts = self.accounts.write().map_err(|_| {
            ProtocolError::PersistenceFailure("account ledger lock poisoned".to_string())
        })?;

        let entry = accounts
            .entry(session_id.to_string())
            .or_insert_with(|| AccountEntry {
                session_id: session_id.to_string(),
                ..Default::default()
            });
        update(entry);

        self.save_locked(&accounts)
            .map_err(|e| ProtocolError::PersistenceFailure(format!("{:#}", e)))
    }

    /// Returns the entry for a session.
    pub fn get(&self, session_id: &str) -> Option<AccountEntry> {
        self.accounts
            .read()
            .ok()
            .and_then(|accounts| accounts.get(session_id).cloned())
    }

    /// Returns every entry, sorted by session id.
    pub fn entries(&self) -> Vec<AccountEntry> {
        let mut entries: Vec<AccountEntry> = self
            .accounts
            .read()
            .map(|accounts| accounts.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        entries
    }
}

impl AccountNotifier for AccountLedger {
    fn record_pairing_code(&self, session_id: &str, at: u64) -> Result<(), ProtocolError> {
        self.update(session_id, |entry| {
            entry.last_code_at = Some(at);
        })
    }

    fn record_auth_status(
        &self,
        session_id: &str,
        ready: bool,
        phone_identity: Option<&str>,
        at: u64,
    ) -> Result<(), ProtocolError> {
        self.update(session_id, |entry| {
            entry.is_ready = ready;
            entry.phone_identity = phone_identity.map(str::to_string);
            if ready {
                entry.authenticated_at = Some(at);
            }
        })
    }
}
