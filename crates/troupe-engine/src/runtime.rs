use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use troupe_core::ids::SessionId;
use troupe_store::{InMemorySessionStore, SessionStore, StoreError};

use crate::agent::AgentBuilder;
use crate::error::EngineError;
use crate::settings::{load_settings_from_path, EngineSettings};
use crate::team::TeamBuilder;

struct ActiveRun {
    cancel: CancellationToken,
    started_at: Instant,
}

/// Sessions with an in-flight turn.
#[derive(Clone, Default)]
pub struct ActiveRuns {
    runs: Arc<DashMap<SessionId, ActiveRun>>,
}

impl ActiveRuns {
    /// Claim a session for one turn. Fails if another turn holds it.
    pub fn try_acquire(
        &self,
        session_id: &SessionId,
        cancel: CancellationToken,
    ) -> Result<RunLease, EngineError> {
        match self.runs.entry(session_id.clone()) {
            Entry::Occupied(_) => Err(EngineError::SessionBusy(session_id.clone())),
            Entry::Vacant(slot) => {
                let _ = slot.insert(ActiveRun {
                    cancel,
                    started_at: Instant::now(),
                });
                Ok(RunLease {
                    runs: Arc::clone(&self.runs),
                    session_id: session_id.clone(),
                })
            }
        }
    }

    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.runs.contains_key(session_id)
    }

    /// Cancel the in-flight turn on a session, if any.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        match self.runs.get(session_id) {
            Some(run) => {
                debug!(
                    session_id = %session_id,
                    running_ms = u64::try_from(run.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "cancelling active run"
                );
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

/// Releases the session when the turn ends, however it ends.
pub struct RunLease {
    runs: Arc<DashMap<SessionId, ActiveRun>>,
    session_id: SessionId,
}

impl Drop for RunLease {
    fn drop(&mut self) {
        let _ = self.runs.remove(&self.session_id);
    }
}

struct RuntimeInner {
    store: Arc<dyn SessionStore>,
    active: ActiveRuns,
    settings: EngineSettings,
}

/// Shared wiring for agents and teams: the session store, the active-run registry and
/// the loaded settings.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(store: Arc<dyn SessionStore>, settings: EngineSettings) -> Result<Self, EngineError> {
        settings.validate()?;
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                store,
                active: ActiveRuns::default(),
                settings,
            }),
        })
    }

    /// Runtime over a fresh in-memory store.
    pub fn in_memory(settings: EngineSettings) -> Result<Self, EngineError> {
        let store = InMemorySessionStore::with_default_max_history(settings.session.max_history);
        Self::new(Arc::new(store), settings)
    }

    /// Load settings from a JSON file (defaults when absent) plus env overrides.
    pub fn from_settings_file(
        store: Arc<dyn SessionStore>,
        path: &Path,
    ) -> Result<Self, EngineError> {
        let settings = load_settings_from_path(path)?;
        info!(
            max_steps = settings.agent.max_steps,
            planning = settings.agent.planning,
            "runtime settings loaded"
        );
        Self::new(store, settings)
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.inner.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn active_runs(&self) -> &ActiveRuns {
        &self.inner.active
    }

    pub fn agent(&self, name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(self.clone(), name)
    }

    pub fn team(&self, name: impl Into<String>) -> TeamBuilder {
        TeamBuilder::new(self.clone(), name)
    }

    pub fn is_busy(&self, session_id: &SessionId) -> bool {
        self.inner.active.is_active(session_id)
    }

    pub fn cancel(&self, session_id: &SessionId) -> bool {
        self.inner.active.cancel(session_id)
    }

    /// Whether two handles share the same wiring.
    pub fn same_as(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Make sure a durable session exists, created with the configured history bound.
    pub(crate) fn ensure_session(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let store = &self.inner.store;
        if store.exists(session_id) {
            return Ok(());
        }
        match store.create(session_id, self.inner.settings.session.max_history) {
            Ok(_) | Err(StoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Where a call's session state lives.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub store: Arc<dyn SessionStore>,
    pub id: SessionId,
    pub ephemeral: bool,
}

impl SessionHandle {
    /// Resolve a caller's session argument. `None` gets a throwaway store.
    pub fn resolve(runtime: &Runtime, session: Option<&SessionId>) -> Result<Self, EngineError> {
        match session {
            Some(id) => {
                runtime.ensure_session(id)?;
                Ok(Self {
                    store: Arc::clone(runtime.store()),
                    id: id.clone(),
                    ephemeral: false,
                })
            }
            None => {
                let store = InMemorySessionStore::new();
                let id = SessionId::new();
                let _ = store.create(&id, runtime.settings().session.max_history)?;
                Ok(Self {
                    store: Arc::new(store),
                    id,
                    ephemeral: true,
                })
            }
        }
    }

    /// Session id as reported to the caller.
    pub fn public_id(&self) -> Option<SessionId> {
        (!self.ephemeral).then(|| self.id.clone())
    }
}
