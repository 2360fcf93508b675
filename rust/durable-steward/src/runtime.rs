//! Assembled orchestration runtime.
//!
//! [`StewardBuilder`] wires the audit log, state store, policy store,
//! engine, timers and watcher together and starts their background tasks.
//! [`Steward::shutdown`] cancels them and waits for them to exit.

use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actors::{Actor, ActorRegistry};
use crate::audit::{AuditLog, InMemoryAuditLog};
use crate::config::{EngineConfig, WatcherConfig};
use crate::engine::{EngineParts, LocalTicketSurface, TicketSurface, WorkflowEngine};
use crate::error::StewardResult;
use crate::fanout::EventFanOut;
use crate::journal::Journal;
use crate::policy::PolicyStore;
use crate::storage::{MemoryStateStore, StateStore};
use crate::timer::TimerService;
use crate::watcher::RollbackWatcher;

/// A running orchestration core.
pub struct Steward {
    pub policies: Arc<PolicyStore>,
    pub engine: WorkflowEngine,
    pub audit: Arc<dyn AuditLog>,
    pub fanout: EventFanOut,
    pub timers: TimerService,
    pub actors: Arc<ActorRegistry>,
    pub watcher: Arc<RollbackWatcher>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for Steward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Steward")
            .field("engine", &self.engine)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Steward {
    #[must_use]
    pub fn builder() -> StewardBuilder {
        StewardBuilder::default()
    }

    /// Token cancelled on shutdown. Useful to tie other tasks to the runtime.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop background tasks and wait for them.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Steward stopped");
    }
}

/// Builder for [`Steward`]. Defaults to in-memory storage.
pub struct StewardBuilder {
    audit: Option<Arc<dyn AuditLog>>,
    state: Option<Arc<dyn StateStore>>,
    actors: Vec<(String, Arc<dyn Actor>)>,
    tickets: Arc<dyn TicketSurface>,
    engine_config: EngineConfig,
    watcher_config: WatcherConfig,
}

impl Default for StewardBuilder {
    fn default() -> Self {
        Self {
            audit: None,
            state: None,
            actors: Vec::new(),
            tickets: Arc::new(LocalTicketSurface),
            engine_config: EngineConfig::default(),
            watcher_config: WatcherConfig::default(),
        }
    }
}

impl fmt::Debug for StewardBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StewardBuilder")
            .field("engine_config", &self.engine_config)
            .field("watcher_config", &self.watcher_config)
            .field("actors", &self.actors.iter().map(|(r, _)| r).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl StewardBuilder {
    #[must_use]
    pub fn with_audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    #[must_use]
    pub fn with_state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    #[must_use]
    pub fn with_actor(mut self, role: impl Into<String>, actor: Arc<dyn Actor>) -> Self {
        self.actors.push((role.into(), actor));
        self
    }

    #[must_use]
    pub fn with_ticket_surface(mut self, tickets: Arc<dyn TicketSurface>) -> Self {
        self.tickets = tickets;
        self
    }

    #[must_use]
    pub fn with_engine_config(mut self, config: EngineConfig) -> Self {
        self.engine_config = config;
        self
    }

    #[must_use]
    pub fn with_watcher_config(mut self, config: WatcherConfig) -> Self {
        self.watcher_config = config;
        self
    }

    /// Wire components, recover in-flight instances and start the timer
    /// dispatcher, engine workers and (if enabled) the rollback watcher.
    pub async fn start(self) -> StewardResult<Steward> {
        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(InMemoryAuditLog::new()) as Arc<dyn AuditLog>);
        let state = self
            .state
            .unwrap_or_else(|| Arc::new(MemoryStateStore::new()) as Arc<dyn StateStore>);

        let fanout = EventFanOut::new();
        let journal = Journal::new(Arc::clone(&audit), fanout.clone());
        let policies = Arc::new(PolicyStore::new(Arc::clone(&state), journal.clone()));
        let timers = TimerService::new();

        let actors = Arc::new(ActorRegistry::new());
        for (role, actor) in self.actors {
            actors.register(role, actor);
        }

        let engine = WorkflowEngine::new(EngineParts {
            policies: Arc::clone(&policies),
            state,
            journal,
            timers: timers.clone(),
            actors: Arc::clone(&actors),
            tickets: self.tickets,
            config: self.engine_config,
        });
        let watcher = Arc::new(RollbackWatcher::new(
            Arc::clone(&policies),
            Arc::clone(&audit),
            self.watcher_config,
        ));

        let shutdown = CancellationToken::new();
        let mut tasks = engine.spawn_workers(&shutdown);
        engine.recover().await?;
        tasks.push(timers.spawn(shutdown.clone()));
        if watcher.config().enabled {
            tasks.push(watcher.spawn(shutdown.clone()));
        } else {
            tracing::info!("Rollback watcher disabled");
        }

        tracing::info!(
            background_tasks = tasks.len(),
            actors = actors.len(),
            "Steward started"
        );

        Ok(Steward {
            policies,
            engine,
            audit,
            fanout,
            timers,
            actors,
            watcher,
            shutdown,
            tasks,
        })
    }
}
