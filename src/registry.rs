//! Per-table install reference counting.
//!
//! Every session on a table shares the same function/trigger names, so without
//! coordination the first session to close would drop the trigger a second
//! session still depends on. Within one client the registry counts sessions
//! per table: the first acquire installs, the last release uninstalls, and a
//! session asking for a different field/operation selection on an already
//! streamed table is rejected before any DDL runs.
//!
//! Sessions in other processes are not coordinated; the last install wins.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, RowNotifyError};
use crate::events::OperationSet;
use crate::provisioner::TriggerProvisioner;
use crate::sanitize::sanitize_identifier;
use crate::subscription::FieldSelection;

/// Installs and removes change triggers
#[async_trait]
pub trait TriggerInstaller: Send + Sync {
    async fn install(
        &self,
        table: &str,
        selection: &FieldSelection,
        operations: OperationSet,
    ) -> Result<()>;

    async fn uninstall(&self, table: &str) -> Result<()>;
}

#[async_trait]
impl TriggerInstaller for TriggerProvisioner {
    async fn install(
        &self,
        table: &str,
        selection: &FieldSelection,
        operations: OperationSet,
    ) -> Result<()> {
        TriggerProvisioner::install(self, table, selection, operations).await
    }

    async fn uninstall(&self, table: &str) -> Result<()> {
        TriggerProvisioner::uninstall(self, table).await
    }
}

#[derive(Debug, Clone)]
struct InstallEntry {
    selection: FieldSelection,
    operations: OperationSet,
    sessions: usize,
}

impl InstallEntry {
    fn matches(&self, selection: &FieldSelection, operations: OperationSet) -> bool {
        &self.selection == selection && self.operations == operations
    }
}

type Slot = Arc<Mutex<Option<InstallEntry>>>;

/// Reference counts of installed change triggers, keyed by sanitized table name
#[derive(Debug, Default)]
pub struct InstallRegistry {
    tables: DashMap<String, Slot>,
}

impl InstallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Slot {
        self.tables
            .entry(key.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Drop the map entry for an empty slot nobody else is waiting on.
    ///
    /// Called while the caller still holds the slot's lock; the map and the
    /// caller are then the only two owners.
    fn forget_if_idle(&self, key: &str) {
        self.tables
            .remove_if(key, |_, slot| Arc::strong_count(slot) == 2);
    }

    /// Number of tables with a live or pending entry
    pub fn tracked_tables(&self) -> usize {
        self.tables.len()
    }

    /// Register a session on `table`, installing the trigger if it is the first.
    ///
    /// A failed install is followed by a best-effort uninstall so no half-applied
    /// DDL stays behind.
    pub async fn acquire(
        &self,
        installer: &dyn TriggerInstaller,
        table: &str,
        selection: &FieldSelection,
        operations: OperationSet,
    ) -> Result<()> {
        let key = sanitize_identifier(table);
        let slot = self.slot(&key);
        let mut entry = slot.lock().await;

        match entry.as_mut() {
            Some(existing) if existing.matches(selection, operations) => {
                existing.sessions += 1;
                debug!(table = %table, sessions = existing.sessions, "Sharing installed change trigger");
                Ok(())
            }
            Some(_) => Err(RowNotifyError::subscription_conflict(key)),
            None => {
                if let Err(e) = installer.install(table, selection, operations).await {
                    if let Err(cleanup) = installer.uninstall(table).await {
                        warn!(table = %table, error = %cleanup, "Cleanup after failed install also failed");
                    }
                    self.forget_if_idle(&key);
                    return Err(e);
                }
                *entry = Some(InstallEntry {
                    selection: selection.clone(),
                    operations,
                    sessions: 1,
                });
                Ok(())
            }
        }
    }

    /// Drop one session's claim on `table`, uninstalling when none remain.
    ///
    /// Releasing a table the registry does not know about uninstalls
    /// unconditionally, which keeps teardown after a failed setup safe.
    pub async fn release(&self, installer: &dyn TriggerInstaller, table: &str) -> Result<()> {
        let key = sanitize_identifier(table);
        let slot = self.slot(&key);
        let mut entry = slot.lock().await;

        if let Some(existing) = entry.as_mut() {
            if existing.sessions > 1 {
                existing.sessions -= 1;
                debug!(table = %table, sessions = existing.sessions, "Change trigger still in use");
                return Ok(());
            }
        }

        *entry = None;
        let uninstalled = installer.uninstall(table).await;
        self.forget_if_idle(&key);
        uninstalled
    }

    /// Number of sessions currently sharing the trigger on `table`
    pub async fn sessions(&self, table: &str) -> usize {
        let Some(slot) = self
            .tables
            .get(&sanitize_identifier(table))
            .map(|slot| slot.value().clone())
        else {
            return 0;
        };
        let entry = slot.lock().await;
        entry.as_ref().map_or(0, |e| e.sessions)
    }
}
