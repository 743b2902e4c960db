//! Thread-safe registry of stage executions.
//!
//! Keyed by `(session, stage)`: at most one execution per stage and session.
//! Conflict checks and inserts happen under one write lock, so two requests
//! racing for the same or dependent stages cannot both be admitted.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use pagerun_shared::errors::{PagerunError, PagerunResult};
use serde::{Deserialize, Serialize};

use crate::conflict::ConflictKind;
use crate::execution::{ExecutionInfo, StageExecution};
use crate::stage::PipelineStage;

/// Opaque identifier of a user session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

type RegistryKey = (SessionId, PipelineStage);

/// Which executions count as active when checking a new request.
#[derive(Debug, Clone, Copy)]
pub enum ActiveScope<'a> {
    /// Executions of the same session.
    Session,
    /// Executions of any session on the same project directory.
    Project(&'a Path),
}

#[derive(Debug)]
struct RegistryEntry {
    execution: Arc<StageExecution>,
    released_at: Option<Instant>,
}

impl RegistryEntry {
    /// Holds its key until terminal; idle entries are about to start.
    fn occupies(&self) -> bool {
        !self.execution.state().is_terminal()
    }

    fn expired(&self, retention: Duration, now: Instant) -> bool {
        self.released_at
            .is_some_and(|at| now.saturating_duration_since(at) >= retention)
    }
}

/// Shared map of `(session, stage)` to execution.
///
/// Cloneable; clones share the same map.
#[derive(Clone)]
pub struct ExecutionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    retention: Duration,
}

struct RegistryInner {
    entries: HashMap<RegistryKey, RegistryEntry>,
}

impl fmt::Debug for ExecutionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRegistry")
            .field("retention", &self.retention)
            .finish()
    }
}

impl Default for ExecutionRegistry {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

fn poisoned<E: fmt::Display>(e: E) -> PagerunError {
    PagerunError::Internal(format!("registry lock poisoned: {}", e))
}

impl ExecutionRegistry {
    /// Terminal executions stay visible for `retention` after release so
    /// late observers can read their outcome. Zero removes them at once.
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                entries: HashMap::new(),
            })),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Insert `execution` under its `(session, stage)` key.
    ///
    /// Returns `false` if an unfinished execution already holds the key. A
    /// terminal execution is replaced.
    pub fn try_register(&self, execution: Arc<StageExecution>) -> PagerunResult<bool> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        inner.evict_expired(self.retention, Instant::now());
        Ok(inner.insert(execution))
    }

    /// Classify and insert in one critical section.
    ///
    /// A session holding an unfinished execution of the same stage is a
    /// [`ConflictKind::SelfConflict`] in every scope. Otherwise `classify`
    /// receives the stages of unfinished executions in `scope`. The
    /// execution is inserted only when the result is [`ConflictKind::None`];
    /// the classification is returned either way.
    pub fn register_if<F>(
        &self,
        execution: Arc<StageExecution>,
        scope: ActiveScope<'_>,
        classify: F,
    ) -> PagerunResult<ConflictKind>
    where
        F: FnOnce(&HashSet<PipelineStage>) -> ConflictKind,
    {
        let mut inner = self.inner.write().map_err(poisoned)?;
        inner.evict_expired(self.retention, Instant::now());

        let key = (execution.session().clone(), execution.stage());
        let kind = if inner.entries.get(&key).is_some_and(RegistryEntry::occupies) {
            ConflictKind::SelfConflict
        } else {
            let active = match scope {
                ActiveScope::Session => {
                    inner.active_stages(|other, _| other.0 == *execution.session())
                }
                ActiveScope::Project(root) => {
                    inner.active_stages(|_, entry| entry.execution.layout().root() == root)
                }
            };
            classify(&active)
        };

        if kind.is_conflict() {
            tracing::debug!(
                session = %execution.session(),
                stage = %execution.stage(),
                conflict = %kind,
                "Execution rejected"
            );
            return Ok(kind);
        }

        if !inner.insert(execution) {
            // The key was checked free above under the same lock
            return Err(PagerunError::Internal(
                "registry key occupied after conflict check".into(),
            ));
        }
        Ok(ConflictKind::None)
    }

    /// Execution registered for `(session, stage)`, if any.
    pub fn get(
        &self,
        session: &SessionId,
        stage: PipelineStage,
    ) -> PagerunResult<Option<Arc<StageExecution>>> {
        let inner = self.inner.read().map_err(poisoned)?;
        let now = Instant::now();
        Ok(inner
            .entries
            .get(&(session.clone(), stage))
            .filter(|entry| !entry.expired(self.retention, now))
            .map(|entry| Arc::clone(&entry.execution)))
    }

    /// Remove the entry for `(session, stage)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the execution there is still running.
    pub fn remove(
        &self,
        session: &SessionId,
        stage: PipelineStage,
    ) -> PagerunResult<Option<Arc<StageExecution>>> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let key = (session.clone(), stage);

        if inner.entries.get(&key).is_some_and(RegistryEntry::occupies) {
            return Err(PagerunError::InvalidState(format!(
                "cannot remove running {} execution of session {}",
                stage, session
            )));
        }

        let removed = inner.entries.remove(&key).map(|entry| entry.execution);
        if removed.is_some() {
            tracing::debug!(session = %session, stage = %stage, "Removed execution from registry");
        }
        Ok(removed)
    }

    /// Called once an execution reached a terminal state.
    ///
    /// Drops the entry right away with zero retention, otherwise marks it
    /// for later eviction. Does nothing if the key now belongs to a newer
    /// execution.
    pub fn release(&self, execution: &Arc<StageExecution>) -> PagerunResult<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let key = (execution.session().clone(), execution.stage());

        let owned = inner
            .entries
            .get(&key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.execution, execution));
        if !owned {
            return Ok(());
        }

        if self.retention.is_zero() {
            inner.entries.remove(&key);
            tracing::debug!(
                session = %key.0,
                stage = %key.1,
                state = %execution.state(),
                "Deregistered execution"
            );
        } else if let Some(entry) = inner.entries.get_mut(&key) {
            entry.released_at = Some(Instant::now());
            tracing::debug!(
                session = %key.0,
                stage = %key.1,
                state = %execution.state(),
                retention_ms = self.retention.as_millis() as u64,
                "Execution finished, retained for observers"
            );
        }
        Ok(())
    }

    /// Stages with an unfinished execution in `session`.
    pub fn active_stages_for(&self, session: &SessionId) -> PagerunResult<HashSet<PipelineStage>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.active_stages(|key, _| key.0 == *session))
    }

    /// Stages with an unfinished execution on the project at `root`, any session.
    pub fn active_stages_for_project(&self, root: &Path) -> PagerunResult<HashSet<PipelineStage>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.active_stages(|_, entry| entry.execution.layout().root() == root))
    }

    /// Snapshot of every registered execution, newest first.
    pub fn list(&self) -> PagerunResult<Vec<ExecutionInfo>> {
        let inner = self.inner.read().map_err(poisoned)?;
        let now = Instant::now();
        let mut infos: Vec<ExecutionInfo> = inner
            .entries
            .values()
            .filter(|entry| !entry.expired(self.retention, now))
            .map(|entry| entry.execution.info())
            .collect();
        infos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(infos)
    }

    /// Number of entries, retained ones included.
    pub fn len(&self) -> PagerunResult<usize> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.entries.len())
    }

    pub fn is_empty(&self) -> PagerunResult<bool> {
        self.len().map(|n| n == 0)
    }

    /// Drop retained entries whose retention has run out.
    pub fn evict_expired(&self) -> PagerunResult<usize> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        Ok(inner.evict_expired(self.retention, Instant::now()))
    }
}

impl RegistryInner {
    fn insert(&mut self, execution: Arc<StageExecution>) -> bool {
        let key = (execution.session().clone(), execution.stage());
        if self.entries.get(&key).is_some_and(RegistryEntry::occupies) {
            return false;
        }

        tracing::debug!(
            execution_id = %execution.id(),
            session = %key.0,
            stage = %key.1,
            pages = execution.pages().len(),
            "Registering execution"
        );
        self.entries.insert(
            key,
            RegistryEntry {
                execution,
                released_at: None,
            },
        );
        true
    }

    fn active_stages<P>(&self, mut include: P) -> HashSet<PipelineStage>
    where
        P: FnMut(&RegistryKey, &RegistryEntry) -> bool,
    {
        self.entries
            .iter()
            .filter(|(key, entry)| entry.occupies() && include(key, entry))
            .map(|(key, _)| key.1)
            .collect()
    }

    fn evict_expired(&mut self, retention: Duration, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            let keep = !entry.expired(retention, now);
            if !keep {
                tracing::trace!(session = %key.0, stage = %key.1, "Evicting retained execution");
            }
            keep
        });
        before - self.entries.len()
    }
}
