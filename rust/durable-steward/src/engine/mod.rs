//! Workflow execution engine.
//!
//! Each [`WorkflowInstance`] is a small state machine:
//!
//! ```text
//! RUNNING ──(last step completes)──────────────> DONE
//!    │ ▲
//!    │ └──(ticket APPROVED / EDITED)──┐
//!    ├──(approval step)──> PAUSED ────┴─(REJECTED / abort)─┐
//!    ├──(step failure / abort)──> unwind ──────────────────┴─> ABORTED
//!    └──────────────────────────(compensation error)─────────> FAILED_NEEDS_MANUAL
//! ```
//!
//! Transitions of one instance are serialized by a per-instance async
//! mutex; different instances proceed in parallel. A transition first
//! changes the instance in memory and collects its side effects (audit
//! entries, timer changes, actor dispatches). The new state is stored
//! before any of them run, so a failed save leaves no trace and a retried
//! signal is judged against the old state.
//!
//! Actor calls never run under the mutex: the engine records
//! `STEP_DISPATCHED`, spawns the call, and the outcome comes back through the
//! event queue drained by the worker pool. Timer expiries take the same
//! path. Compensations also run outside the mutex; meanwhile the stored
//! instance carries an unwind marker that turns every other signal into a
//! no-op.
//!
//! Every signal is checked against the instance's current step before it
//! mutates anything, so duplicate or stale signals are reported as
//! [`Transition::Ignored`] and leave no audit entry.

pub mod escalation;
mod instance;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actors::{Actor, ActorOutcome, ActorRegistry, ActorRequest};
use crate::audit::{AuditEntry, AuditEventType, NewAuditEntry};
use crate::config::EngineConfig;
use crate::error::{EntityKind, StewardError, StewardResult};
use crate::journal::Journal;
use crate::policy::{PolicyDefinition, PolicyStore, StepSpec, Version};
use crate::storage::StateStore;
use crate::timer::TimerService;

pub use escalation::EscalationNotice;
pub use instance::{
    InstanceStatus, InstanceView, Ticket, TicketResolution, TicketStatus, Transition,
    WorkflowInstance,
};

/// Surface where human decision tickets are shown.
///
/// The engine stores every ticket itself; the surface only announces it
/// to whatever console or queue the operators use.
#[async_trait]
pub trait TicketSurface: Send + Sync {
    /// Announce a new ticket. Returns the surface's reference for it.
    async fn create_ticket(&self, ticket: &Ticket) -> anyhow::Result<String>;
}

/// Ticket surface that only logs. Tickets are read through the API.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTicketSurface;

#[async_trait]
impl TicketSurface for LocalTicketSurface {
    async fn create_ticket(&self, ticket: &Ticket) -> anyhow::Result<String> {
        tracing::info!(
            ticket_id = %ticket.ticket_id,
            instance_id = %ticket.instance_id,
            step_id = %ticket.step_id,
            "Approval ticket awaiting decision"
        );
        Ok(ticket.ticket_id.clone())
    }
}

/// Signals drained by the worker pool.
#[derive(Debug, Clone)]
enum EngineEvent {
    ActorReported {
        instance_id: String,
        step_index: usize,
        step_id: String,
        outcome: ActorOutcome,
    },
    TimerExpired {
        instance_id: String,
        step_index: usize,
        step_id: String,
        hop: usize,
    },
}

impl EngineEvent {
    fn instance_id(&self) -> &str {
        match self {
            Self::ActorReported { instance_id, .. } | Self::TimerExpired { instance_id, .. } => {
                instance_id
            }
        }
    }
}

/// Side effect of a transition.
enum Effect {
    Record(AuditEventType, serde_json::Value),
    Disarm(String),
    Arm {
        key: String,
        delay: Duration,
        event: EngineEvent,
    },
    SaveTicket(Ticket),
    /// Announce a new ticket, then record `TICKET_CREATED`.
    AnnounceTicket { ticket: Ticket, actor_role: String },
    Dispatch {
        actor: Arc<dyn Actor>,
        request: ActorRequest,
    },
}

/// Effects of one transition, run in order once the instance is stored.
#[derive(Default)]
struct Effects(Vec<Effect>);

impl Effects {
    fn record(&mut self, event_type: AuditEventType, payload: serde_json::Value) {
        self.0.push(Effect::Record(event_type, payload));
    }

    fn push(&mut self, effect: Effect) {
        self.0.push(effect);
    }
}

/// Where a planned transition leads once its state is stored.
enum Followup {
    Settled(Transition),
    /// Run the compensation unwind of the stored instance.
    Unwind,
}

/// Per-instance mutexes. An entry lives only while some caller holds or
/// awaits it.
#[derive(Debug, Default)]
struct InstanceLocks {
    slots: parking_lot::Mutex<HashMap<String, LockSlot>>,
}

#[derive(Debug, Default)]
struct LockSlot {
    mutex: Arc<Mutex<()>>,
    users: usize,
}

impl InstanceLocks {
    async fn acquire(self: &Arc<Self>, instance_id: &str) -> InstanceGuard {
        let mutex = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(instance_id.to_string()).or_default();
            slot.users += 1;
            Arc::clone(&slot.mutex)
        };
        // Registered before awaiting so a cancelled wait still releases its slot
        let mut guard = InstanceGuard {
            instance_id: instance_id.to_string(),
            locks: Arc::clone(self),
            held: None,
        };
        guard.held = Some(mutex.lock_owned().await);
        guard
    }

    fn release(&self, instance_id: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(instance_id) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                slots.remove(instance_id);
            }
        }
    }

    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Exclusive hold on one instance's transitions.
struct InstanceGuard {
    instance_id: String,
    locks: Arc<InstanceLocks>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.held.take();
        self.locks.release(&self.instance_id);
    }
}

/// Engine counters.
#[derive(Debug, Default)]
struct EngineCounters {
    started: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    failed_needs_manual: AtomicU64,
    sla_missed: AtomicU64,
    ignored_signals: AtomicU64,
    events_processed: AtomicU64,
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub started: u64,
    pub completed: u64,
    pub aborted: u64,
    pub failed_needs_manual: u64,
    pub sla_missed: u64,
    pub ignored_signals: u64,
    pub events_processed: u64,
    pub pending_timers: usize,
}

struct EngineInner {
    policies: Arc<PolicyStore>,
    state: Arc<dyn StateStore>,
    journal: Journal,
    timers: TimerService,
    actors: Arc<ActorRegistry>,
    tickets: Arc<dyn TicketSurface>,
    config: EngineConfig,
    locks: Arc<InstanceLocks>,
    definitions: RwLock<HashMap<(String, Version), Arc<PolicyDefinition>>>,
    queue: mpsc::Sender<EngineEvent>,
    receiver: parking_lot::Mutex<Option<mpsc::Receiver<EngineEvent>>>,
    counters: EngineCounters,
}

/// The workflow execution engine. Cloning shares the same engine.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.inner.config)
            .field("timers", &self.inner.timers)
            .finish_non_exhaustive()
    }
}

/// Collaborators the engine is built from.
pub struct EngineParts {
    pub policies: Arc<PolicyStore>,
    pub state: Arc<dyn StateStore>,
    pub journal: Journal,
    pub timers: TimerService,
    pub actors: Arc<ActorRegistry>,
    pub tickets: Arc<dyn TicketSurface>,
    pub config: EngineConfig,
}

impl fmt::Debug for EngineParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineParts")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// Build an engine. Call [`spawn_workers`](Self::spawn_workers) before
    /// use so actor outcomes and timer expiries are processed.
    #[must_use]
    pub fn new(parts: EngineParts) -> Self {
        let (queue, receiver) = mpsc::channel(parts.config.queue_capacity.max(1));
        Self {
            inner: Arc::new(EngineInner {
                policies: parts.policies,
                state: parts.state,
                journal: parts.journal,
                timers: parts.timers,
                actors: parts.actors,
                tickets: parts.tickets,
                config: parts.config,
                locks: Arc::new(InstanceLocks::default()),
                definitions: RwLock::new(HashMap::new()),
                queue,
                receiver: parking_lot::Mutex::new(Some(receiver)),
                counters: EngineCounters::default(),
            }),
        }
    }

    /// Start the worker pool. Subsequent calls return no handles.
    pub fn spawn_workers(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let Some(receiver) = self.inner.receiver.lock().take() else {
            tracing::warn!("Engine workers already running");
            return Vec::new();
        };
        let receiver = Arc::new(Mutex::new(receiver));
        let worker_count = self.inner.config.worker_count.max(1);

        (0..worker_count)
            .map(|worker_id| {
                let engine = self.clone();
                let receiver = Arc::clone(&receiver);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    engine.worker_loop(worker_id, receiver, shutdown).await;
                })
            })
            .collect()
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<EngineEvent>>>,
        shutdown: CancellationToken,
    ) {
        tracing::debug!(worker_id, "Engine worker started");
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break,
                event = async { receiver.lock().await.recv().await } => event,
            };
            let Some(event) = event else { break };

            let instance_id = event.instance_id().to_string();
            if let Err(e) = self.process(event).await {
                tracing::error!(worker_id, instance_id = %instance_id, error = %e, "Failed to process engine event");
            }
            self.inner.counters.events_processed.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(worker_id, "Engine worker stopped");
    }

    async fn process(&self, event: EngineEvent) -> StewardResult<Transition> {
        match event {
            EngineEvent::ActorReported {
                instance_id,
                step_index,
                step_id,
                outcome,
            } => match outcome {
                ActorOutcome::Success(result) => {
                    self.signal_step(&instance_id, Some(step_index), &step_id, Ok(result))
                        .await
                }
                ActorOutcome::Failure(reason) => {
                    self.signal_step(&instance_id, Some(step_index), &step_id, Err(reason))
                        .await
                }
                ActorOutcome::Deferred => Ok(Transition::ignored("deferred")),
            },
            EngineEvent::TimerExpired {
                instance_id,
                step_index,
                step_id,
                hop,
            } => self.on_timer(&instance_id, step_index, &step_id, hop).await,
        }
    }

    // ---------------------------------------------------------------------
    // Public operations
    // ---------------------------------------------------------------------

    /// Start an instance pinned to the policy's current version.
    pub async fn start_workflow(
        &self,
        policy_id: &str,
        context: serde_json::Value,
    ) -> StewardResult<WorkflowInstance> {
        let version = self.inner.policies.current_version(policy_id).await?;
        let definition = self.definition(policy_id, version).await?;

        let mut instance = WorkflowInstance::new(policy_id, version, context);
        let _guard = self.lock(&instance.instance_id).await;

        let mut effects = Effects::default();
        effects.record(
            AuditEventType::InstanceStarted,
            serde_json::json!({ "context": instance.context }),
        );
        self.enter_step(&mut instance, &definition, &mut effects)
            .await?;
        self.commit(&instance, effects).await?;

        self.inner.counters.started.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            instance_id = %instance.instance_id,
            policy_id,
            version,
            "Workflow started"
        );
        Ok(instance)
    }

    /// Report completion of a deferred step.
    pub async fn complete_step(
        &self,
        instance_id: &str,
        step_id: &str,
        result: serde_json::Value,
    ) -> StewardResult<Transition> {
        self.signal_step(instance_id, None, step_id, Ok(result)).await
    }

    /// Report failure of a deferred step. Starts the compensation unwind.
    pub async fn fail_step(
        &self,
        instance_id: &str,
        step_id: &str,
        reason: impl Into<String>,
    ) -> StewardResult<Transition> {
        self.signal_step(instance_id, None, step_id, Err(reason.into()))
            .await
    }

    /// Resolve a human approval ticket.
    ///
    /// `APPROVED` completes the gated step, `EDITED` merges the edits into
    /// the context first, and `REJECTED` fails the step.
    pub async fn resolve_ticket(
        &self,
        ticket_id: &str,
        resolution: TicketResolution,
    ) -> StewardResult<Transition> {
        if resolution.decision == TicketStatus::Pending {
            return Err(StewardError::validation(
                ticket_id,
                "decision must be APPROVED, REJECTED or EDITED",
            ));
        }
        if resolution.decided_by.trim().is_empty() {
            return Err(StewardError::validation(ticket_id, "decided_by must not be empty"));
        }

        let ticket = self.ticket(ticket_id).await?;
        let guard = self.lock(&ticket.instance_id).await;

        // Re-read under the instance lock
        let mut ticket = self.ticket(ticket_id).await?;
        if ticket.status != TicketStatus::Pending {
            return Ok(self.ignored(format!("ticket already {}", ticket.status)));
        }
        let mut instance = self.load(&ticket.instance_id).await?;
        if instance.status != InstanceStatus::Paused
            || instance.unwinding.is_some()
            || instance.current_step_index != ticket.step_index
            || instance.pending_ticket_id.as_deref() != Some(ticket_id)
        {
            return Ok(self.ignored("ticket no longer gates the instance"));
        }
        let definition = self.instance_definition(&instance).await?;

        ticket.status = resolution.decision;
        ticket.decided_by = Some(resolution.decided_by.clone());
        ticket.decision_timestamp = Some(Utc::now());
        ticket.note.clone_from(&resolution.note);
        ticket.edits.clone_from(&resolution.edits);
        instance.pending_ticket_id = None;

        let mut effects = Effects::default();
        effects.push(Effect::SaveTicket(ticket.clone()));
        effects.record(
            AuditEventType::TicketResolved,
            serde_json::json!({
                "ticket_id": ticket.ticket_id,
                "step_id": ticket.step_id,
                "decision": ticket.status,
                "decided_by": ticket.decided_by,
                "note": ticket.note,
            }),
        );

        let followup = match resolution.decision {
            TicketStatus::Approved | TicketStatus::Edited => {
                if resolution.decision == TicketStatus::Edited {
                    if let Some(edits) = resolution.edits.as_ref() {
                        instance.merge_edits(edits);
                    }
                }
                instance.set_status(InstanceStatus::Running);
                effects.record(
                    AuditEventType::InstanceResumed,
                    serde_json::json!({ "ticket_id": ticket.ticket_id }),
                );
                let result = serde_json::json!({
                    "decision": ticket.status,
                    "decided_by": ticket.decided_by,
                });
                Followup::Settled(
                    self.complete_current(&mut instance, &definition, result, &mut effects)
                        .await?,
                )
            }
            TicketStatus::Rejected | TicketStatus::Pending => {
                let reason = format!("rejected by {}", resolution.decided_by);
                self.fail_current(&mut instance, &definition, &reason, &mut effects)
            }
        };

        self.settle(guard, instance, effects, followup).await
    }

    /// Abort an instance, unwinding from its current step.
    pub async fn abort(
        &self,
        instance_id: &str,
        reason: Option<String>,
    ) -> StewardResult<Transition> {
        let guard = self.lock(instance_id).await;
        let mut instance = self.load(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(StewardError::InvalidState {
                instance_id: instance_id.to_string(),
                state: instance.status,
                operation: "abort",
            });
        }
        if instance.unwinding.is_some() {
            return Ok(self.ignored("unwind already in progress"));
        }
        let definition = self.instance_definition(&instance).await?;
        let reason = reason.unwrap_or_else(|| "aborted by request".to_string());

        let mut effects = Effects::default();
        effects.record(
            AuditEventType::AbortRequested,
            serde_json::json!({
                "reason": reason,
                "step_index": instance.current_step_index,
            }),
        );

        if let Some(ticket_id) = instance.pending_ticket_id.take() {
            if let Some(mut ticket) = self.inner.state.load_ticket(&ticket_id).await? {
                ticket.status = TicketStatus::Rejected;
                ticket.decided_by = Some("system".to_string());
                ticket.decision_timestamp = Some(Utc::now());
                ticket.note = Some(reason.clone());
                effects.record(
                    AuditEventType::TicketResolved,
                    serde_json::json!({
                        "ticket_id": ticket.ticket_id,
                        "step_id": ticket.step_id,
                        "decision": ticket.status,
                        "decided_by": ticket.decided_by,
                        "note": ticket.note,
                    }),
                );
                effects.push(Effect::SaveTicket(ticket));
            }
        }

        self.begin_unwind(&mut instance, &definition, &reason, &mut effects);
        self.settle(guard, instance, effects, Followup::Unwind).await
    }

    /// Current state of an instance, with its pending ticket.
    pub async fn instance(&self, instance_id: &str) -> StewardResult<InstanceView> {
        let instance = self.load(instance_id).await?;
        let definition = self.instance_definition(&instance).await?;
        let pending_ticket = match instance.pending_ticket_id.as_deref() {
            Some(id) => self.inner.state.load_ticket(id).await?,
            None => None,
        };
        Ok(InstanceView {
            current_step_id: definition
                .step(instance.current_step_index)
                .map(|s| s.step_id.clone()),
            total_steps: definition.steps.len(),
            pending_ticket,
            instance,
        })
    }

    pub async fn ticket(&self, ticket_id: &str) -> StewardResult<Ticket> {
        self.inner
            .state
            .load_ticket(ticket_id)
            .await?
            .ok_or_else(|| StewardError::not_found(EntityKind::Ticket, ticket_id))
    }

    /// Full audit history of an instance.
    pub async fn history(&self, instance_id: &str) -> StewardResult<Vec<AuditEntry>> {
        self.load(instance_id).await?;
        Ok(self.inner.journal.audit().for_instance(instance_id).await?)
    }

    /// Re-arm timers for every non-terminal instance after a restart.
    ///
    /// In-flight actor calls are not re-dispatched; a step that was waiting
    /// on an actor stays pending until it is completed, failed or aborted.
    /// An unwind cut short by the restart cannot tell which compensations
    /// ran, so its instance is frozen in `FAILED_NEEDS_MANUAL`.
    pub async fn recover(&self) -> StewardResult<usize> {
        let instances = self.inner.state.list_active_instances().await?;
        let mut rearmed = 0;

        for instance in instances {
            if instance.unwinding.is_some() {
                self.freeze_interrupted(instance).await?;
                continue;
            }
            let definition = self.instance_definition(&instance).await?;
            let Some(step) = definition.step(instance.current_step_index) else {
                continue;
            };
            let Some(deadline) = instance.timer_deadline else {
                continue;
            };

            let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            let event = timer_event(&instance, step, instance.escalation_level);
            self.arm(instance.timer_key(&step.step_id), remaining, event);
            rearmed += 1;
        }

        if rearmed > 0 {
            tracing::info!(rearmed, "Recovered workflow timers");
        }
        Ok(rearmed)
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let c = &self.inner.counters;
        EngineStats {
            started: c.started.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            aborted: c.aborted.load(Ordering::Relaxed),
            failed_needs_manual: c.failed_needs_manual.load(Ordering::Relaxed),
            sla_missed: c.sla_missed.load(Ordering::Relaxed),
            ignored_signals: c.ignored_signals.load(Ordering::Relaxed),
            events_processed: c.events_processed.load(Ordering::Relaxed),
            pending_timers: self.inner.timers.pending(),
        }
    }

    #[must_use]
    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.inner.policies
    }

    #[must_use]
    pub fn actors(&self) -> &Arc<ActorRegistry> {
        &self.inner.actors
    }

    #[must_use]
    pub fn timers(&self) -> &TimerService {
        &self.inner.timers
    }

    // ---------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------

    async fn signal_step(
        &self,
        instance_id: &str,
        step_index: Option<usize>,
        step_id: &str,
        outcome: Result<serde_json::Value, String>,
    ) -> StewardResult<Transition> {
        let guard = self.lock(instance_id).await;
        let mut instance = self.load(instance_id).await?;

        if instance.status != InstanceStatus::Running {
            return Ok(self.ignored(format!("instance is {}", instance.status)));
        }
        if instance.unwinding.is_some() {
            return Ok(self.ignored("instance is unwinding"));
        }
        let definition = self.instance_definition(&instance).await?;
        let current = definition.step(instance.current_step_index);
        let matches = current.is_some_and(|s| s.step_id == step_id)
            && step_index.is_none_or(|i| i == instance.current_step_index);
        if !matches {
            return Ok(self.ignored(format!(
                "step '{step_id}' is not the current step of instance {instance_id}"
            )));
        }

        let mut effects = Effects::default();
        let followup = match outcome {
            Ok(result) => Followup::Settled(
                self.complete_current(&mut instance, &definition, result, &mut effects)
                    .await?,
            ),
            Err(reason) => self.fail_current(&mut instance, &definition, &reason, &mut effects),
        };
        self.settle(guard, instance, effects, followup).await
    }

    /// Store the planned state, run its effects, then release the instance
    /// and carry out the followup.
    async fn settle(
        &self,
        guard: InstanceGuard,
        instance: WorkflowInstance,
        effects: Effects,
        followup: Followup,
    ) -> StewardResult<Transition> {
        self.commit(&instance, effects).await?;
        drop(guard);
        match followup {
            Followup::Settled(transition) => self.finish_transition(&instance, transition),
            Followup::Unwind => self.run_unwind(instance).await,
        }
    }

    async fn complete_current(
        &self,
        instance: &mut WorkflowInstance,
        definition: &PolicyDefinition,
        result: serde_json::Value,
        effects: &mut Effects,
    ) -> StewardResult<Transition> {
        let index = instance.current_step_index;
        let Some(step) = definition.step(index) else {
            return Ok(self.ignored("no current step"));
        };

        effects.push(Effect::Disarm(instance.timer_key(&step.step_id)));
        effects.record(
            AuditEventType::StepCompleted,
            serde_json::json!({
                "step_id": step.step_id,
                "step_index": index,
                "result": result,
            }),
        );

        tracing::debug!(
            instance_id = %instance.instance_id,
            step_id = %step.step_id,
            step_index = index,
            "Step completed"
        );

        instance.record_result(&step.step_id, result);
        instance.current_step_index = index + 1;
        instance.escalation_level = 0;
        instance.timer_deadline = None;
        instance.updated_at = Utc::now();

        if instance.current_step_index >= definition.steps.len() {
            instance.set_status(InstanceStatus::Done);
            effects.record(
                AuditEventType::InstanceCompleted,
                serde_json::json!({ "steps": definition.steps.len() }),
            );
        } else {
            self.enter_step(instance, definition, effects).await?;
        }

        Ok(Transition::Applied {
            status: instance.status,
        })
    }

    fn fail_current(
        &self,
        instance: &mut WorkflowInstance,
        definition: &PolicyDefinition,
        reason: &str,
        effects: &mut Effects,
    ) -> Followup {
        let index = instance.current_step_index;
        let Some(step) = definition.step(index) else {
            return Followup::Settled(self.ignored("no current step"));
        };

        effects.record(
            AuditEventType::StepFailed,
            serde_json::json!({
                "step_id": step.step_id,
                "step_index": index,
                "actor_role": step.actor_role,
                "reason": reason,
            }),
        );
        tracing::warn!(
            instance_id = %instance.instance_id,
            step_id = %step.step_id,
            reason,
            "Step failed, unwinding"
        );
        self.begin_unwind(instance, definition, reason, effects);
        Followup::Unwind
    }

    /// Plan the step at `current_step_index`: arm its SLA timer, then
    /// either open an approval ticket or dispatch to the actor.
    async fn enter_step(
        &self,
        instance: &mut WorkflowInstance,
        definition: &PolicyDefinition,
        effects: &mut Effects,
    ) -> StewardResult<()> {
        let index = instance.current_step_index;
        let Some(step) = definition.step(index).cloned() else {
            return Ok(());
        };

        instance.escalation_level = 0;
        self.plan_timer(instance, &step, 0, step.sla_duration, effects);
        effects.record(
            AuditEventType::StepStarted,
            serde_json::json!({
                "step_id": step.step_id,
                "step_index": index,
                "actor_role": step.actor_role,
                "sla_duration_ms": u64::try_from(step.sla_duration.as_millis()).unwrap_or(u64::MAX),
                "requires_human_approval": step.requires_human_approval,
            }),
        );

        if step.requires_human_approval {
            let ticket = Ticket::new(instance, &step.step_id);
            // Stored ahead of the instance so a paused instance never points
            // at a missing ticket
            self.inner.state.save_ticket(&ticket).await?;

            instance.pending_ticket_id = Some(ticket.ticket_id.clone());
            instance.set_status(InstanceStatus::Paused);
            let paused = serde_json::json!({ "ticket_id": ticket.ticket_id, "step_id": step.step_id });
            effects.push(Effect::AnnounceTicket {
                ticket,
                actor_role: step.actor_role.clone(),
            });
            effects.record(AuditEventType::InstancePaused, paused);
            return Ok(());
        }

        let actor = self.inner.actors.get(&step.actor_role);
        effects.record(
            AuditEventType::StepDispatched,
            serde_json::json!({
                "step_id": step.step_id,
                "step_index": index,
                "actor_role": step.actor_role,
                "action": step.action,
                "deferred": actor.is_none(),
            }),
        );
        if let Some(actor) = actor {
            let request = self.request_for(instance, &step, index);
            effects.push(Effect::Dispatch { actor, request });
        }
        Ok(())
    }

    /// Mark the instance as unwinding and stop its step timer.
    fn begin_unwind(
        &self,
        instance: &mut WorkflowInstance,
        definition: &PolicyDefinition,
        reason: &str,
        effects: &mut Effects,
    ) {
        if let Some(step) = definition.step(instance.current_step_index) {
            effects.push(Effect::Disarm(instance.timer_key(&step.step_id)));
        }
        instance.last_error = Some(reason.to_string());
        instance.timer_deadline = None;
        instance.unwinding = Some(reason.to_string());
        instance.updated_at = Utc::now();
    }

    /// Compensate the current step (if it defines a compensation) and then
    /// every completed step in reverse order, without holding the instance
    /// lock. The stored unwind marker keeps other signals out meanwhile.
    async fn run_unwind(&self, instance: WorkflowInstance) -> StewardResult<Transition> {
        let definition = self.instance_definition(&instance).await?;
        let reason = instance.unwinding.clone().unwrap_or_default();
        let upto = (instance.current_step_index + 1).min(definition.steps.len());

        let mut frozen = None;
        for index in (0..upto).rev() {
            let step = &definition.steps[index];
            let Some(compensation) = step.compensation_action.as_ref() else {
                continue;
            };

            match self.compensate(&instance, step, index, compensation).await {
                Ok((delivery, result)) => {
                    self.record(
                        &instance,
                        AuditEventType::StepCompensated,
                        serde_json::json!({
                            "step_id": step.step_id,
                            "step_index": index,
                            "compensation_action": compensation,
                            "delivery": delivery,
                            "result": result,
                        }),
                    )
                    .await?;
                }
                Err(e) => {
                    let error = format!("{e:#}");
                    tracing::error!(
                        instance_id = %instance.instance_id,
                        step_id = %step.step_id,
                        error = %error,
                        "Compensation failed, instance needs manual intervention"
                    );
                    self.record(
                        &instance,
                        AuditEventType::CompensationFailed,
                        serde_json::json!({
                            "step_id": step.step_id,
                            "step_index": index,
                            "error": error,
                        }),
                    )
                    .await?;
                    frozen = Some((step.step_id.clone(), error));
                    break;
                }
            }
        }

        let guard = self.lock(&instance.instance_id).await;
        let mut instance = self.load(&instance.instance_id).await?;
        if instance.unwinding.take().is_none() {
            return Ok(self.ignored("unwind already settled"));
        }
        instance.timer_deadline = None;

        let mut effects = Effects::default();
        match frozen {
            Some((step_id, error)) => {
                instance.last_error = Some(error.clone());
                instance.manual_step_id = Some(step_id.clone());
                instance.set_status(InstanceStatus::FailedNeedsManual);
                effects.record(
                    AuditEventType::InstanceFailedNeedsManual,
                    serde_json::json!({
                        "step_id": step_id,
                        "cause": reason,
                        "error": error,
                    }),
                );
            }
            None => {
                instance.set_status(InstanceStatus::Aborted);
                effects.record(
                    AuditEventType::InstanceAborted,
                    serde_json::json!({ "reason": reason }),
                );
            }
        }
        self.commit(&instance, effects).await?;
        drop(guard);

        let status = instance.status;
        self.finish_transition(&instance, Transition::Applied { status })
    }

    /// Run one compensation. Roles without a registered actor get the
    /// compensation announced on the fan-out via `STEP_COMPENSATED`.
    async fn compensate(
        &self,
        instance: &WorkflowInstance,
        step: &StepSpec,
        index: usize,
        compensation: &serde_json::Value,
    ) -> anyhow::Result<(&'static str, serde_json::Value)> {
        let Some(actor) = self.inner.actors.get(&step.actor_role) else {
            return Ok(("fan_out", serde_json::Value::Null));
        };
        let request = self.request_for(instance, step, index);
        let timeout = self.inner.config.dispatch_timeout().max(Duration::from_millis(1));
        let result = tokio::time::timeout(timeout, actor.compensate(&request, compensation))
            .await
            .map_err(|_elapsed| anyhow::anyhow!("compensation timed out after {timeout:?}"))??;
        Ok(("actor", result))
    }

    async fn freeze_interrupted(&self, mut instance: WorkflowInstance) -> StewardResult<()> {
        let _guard = self.lock(&instance.instance_id).await;
        let cause = instance.unwinding.take().unwrap_or_default();
        let error = "unwind interrupted by restart".to_string();

        instance.last_error = Some(error.clone());
        instance.timer_deadline = None;
        instance.set_status(InstanceStatus::FailedNeedsManual);
        let mut effects = Effects::default();
        effects.record(
            AuditEventType::InstanceFailedNeedsManual,
            serde_json::json!({ "cause": cause, "error": error }),
        );
        self.commit(&instance, effects).await
    }

    async fn on_timer(
        &self,
        instance_id: &str,
        step_index: usize,
        step_id: &str,
        hop: usize,
    ) -> StewardResult<Transition> {
        let guard = self.lock(instance_id).await;
        let mut instance = self.load(instance_id).await?;
        if instance.status.is_terminal()
            || instance.unwinding.is_some()
            || instance.current_step_index != step_index
        {
            return Ok(self.ignored("step already resolved"));
        }
        let definition = self.instance_definition(&instance).await?;
        let Some(step) = definition.step(step_index).cloned() else {
            return Ok(self.ignored("no such step"));
        };
        if step.step_id != step_id || hop != instance.escalation_level {
            return Ok(self.ignored("stale escalation timer"));
        }

        let next = escalation::next_hop(&step, hop);
        let notice = EscalationNotice {
            instance_id: instance.instance_id.clone(),
            policy_id: instance.policy_id.clone(),
            policy_version: instance.pinned_version(),
            step_id: step.step_id.clone(),
            step_index,
            hop,
            contact: escalation::hop_contact(&step, hop),
            more_hops: next.is_some(),
            missed_at: Utc::now(),
        };
        let mut effects = Effects::default();
        effects.record(
            AuditEventType::SlaMissed,
            serde_json::to_value(&notice).map_err(anyhow::Error::from)?,
        );

        instance.escalation_level = hop + 1;
        match next {
            Some((next_hop, delay)) => {
                self.plan_timer(&mut instance, &step, next_hop, delay, &mut effects);
            }
            None => instance.timer_deadline = None,
        }
        instance.updated_at = Utc::now();
        self.commit(&instance, effects).await?;
        drop(guard);

        self.inner.counters.sla_missed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            instance_id = %instance.instance_id,
            step_id = %step.step_id,
            hop,
            contact = notice.contact.as_deref().unwrap_or("-"),
            "SLA missed, escalating"
        );
        Ok(Transition::Applied {
            status: instance.status,
        })
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    /// Store `instance`, then run `effects` in order. Nothing runs if the
    /// save fails.
    async fn commit(&self, instance: &WorkflowInstance, effects: Effects) -> StewardResult<()> {
        self.inner.state.save_instance(instance).await?;

        for effect in effects.0 {
            match effect {
                Effect::Record(event_type, payload) => {
                    self.record(instance, event_type, payload).await?;
                }
                Effect::Disarm(key) => {
                    self.inner.timers.disarm(&key);
                }
                Effect::Arm { key, delay, event } => self.arm(key, delay, event),
                Effect::SaveTicket(ticket) => self.inner.state.save_ticket(&ticket).await?,
                Effect::AnnounceTicket { ticket, actor_role } => {
                    self.announce_ticket(instance, &ticket, &actor_role).await?;
                }
                Effect::Dispatch { actor, request } => self.spawn_dispatch(actor, request),
            }
        }

        let counters = &self.inner.counters;
        match instance.status {
            InstanceStatus::Done => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(instance_id = %instance.instance_id, "Workflow completed");
            }
            InstanceStatus::Aborted => {
                counters.aborted.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    instance_id = %instance.instance_id,
                    reason = instance.last_error.as_deref().unwrap_or("-"),
                    "Workflow aborted"
                );
            }
            InstanceStatus::FailedNeedsManual => {
                counters.failed_needs_manual.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(instance_id = %instance.instance_id, "Workflow needs manual intervention");
            }
            InstanceStatus::Running | InstanceStatus::Paused => {}
        }
        Ok(())
    }

    async fn announce_ticket(
        &self,
        instance: &WorkflowInstance,
        ticket: &Ticket,
        actor_role: &str,
    ) -> StewardResult<()> {
        let surface = match self.inner.tickets.create_ticket(ticket).await {
            Ok(reference) => serde_json::json!({ "reference": reference }),
            Err(e) => {
                tracing::warn!(ticket_id = %ticket.ticket_id, error = %e, "Ticket surface rejected ticket");
                serde_json::json!({ "error": e.to_string() })
            }
        };
        self.record(
            instance,
            AuditEventType::TicketCreated,
            serde_json::json!({
                "ticket_id": ticket.ticket_id,
                "step_id": ticket.step_id,
                "actor_role": actor_role,
                "surface": surface,
            }),
        )
        .await?;
        Ok(())
    }

    fn spawn_dispatch(&self, actor: Arc<dyn Actor>, request: ActorRequest) {
        let queue = self.inner.queue.clone();
        let timeout = self.inner.config.dispatch_timeout().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, actor.dispatch(&request)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(
                        instance_id = %request.instance_id,
                        step_id = %request.step_id,
                        actor = actor.name(),
                        "Actor dispatch timed out, step stays pending"
                    );
                    ActorOutcome::Deferred
                }
            };
            if matches!(outcome, ActorOutcome::Deferred) {
                return;
            }
            let event = EngineEvent::ActorReported {
                instance_id: request.instance_id,
                step_index: request.step_index,
                step_id: request.step_id,
                outcome,
            };
            if queue.send(event).await.is_err() {
                tracing::debug!("Engine queue closed, dropping actor outcome");
            }
        });
    }

    fn plan_timer(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepSpec,
        hop: usize,
        delay: Duration,
        effects: &mut Effects,
    ) {
        effects.push(Effect::Arm {
            key: instance.timer_key(&step.step_id),
            delay,
            event: timer_event(instance, step, hop),
        });
        instance.timer_deadline = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
    }

    fn arm(&self, key: String, delay: Duration, event: EngineEvent) {
        let queue = self.inner.queue.clone();
        self.inner.timers.arm(key, delay, move || {
            if let Err(mpsc::error::TrySendError::Full(event)) = queue.try_send(event) {
                tokio::spawn(async move {
                    queue.send(event).await.ok();
                });
            }
        });
    }

    fn request_for(&self, instance: &WorkflowInstance, step: &StepSpec, index: usize) -> ActorRequest {
        ActorRequest {
            instance_id: instance.instance_id.clone(),
            policy_id: instance.policy_id.clone(),
            policy_version: instance.pinned_version(),
            step_id: step.step_id.clone(),
            step_index: index,
            actor_role: step.actor_role.clone(),
            action: step.action.clone(),
            context: instance.context.clone(),
        }
    }

    async fn record(
        &self,
        instance: &WorkflowInstance,
        event_type: AuditEventType,
        payload: serde_json::Value,
    ) -> StewardResult<AuditEntry> {
        self.inner
            .journal
            .record(
                NewAuditEntry::instance(
                    event_type,
                    &instance.instance_id,
                    &instance.policy_id,
                    instance.pinned_version(),
                )
                .with_payload(payload),
            )
            .await
    }

    async fn load(&self, instance_id: &str) -> StewardResult<WorkflowInstance> {
        self.inner
            .state
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| StewardError::not_found(EntityKind::Instance, instance_id))
    }

    async fn instance_definition(
        &self,
        instance: &WorkflowInstance,
    ) -> StewardResult<Arc<PolicyDefinition>> {
        self.definition(&instance.policy_id, instance.pinned_version())
            .await
    }

    /// Policy versions are immutable once stored, so they are cached.
    async fn definition(
        &self,
        policy_id: &str,
        version: Version,
    ) -> StewardResult<Arc<PolicyDefinition>> {
        let key = (policy_id.to_string(), version);
        if let Some(definition) = self.inner.definitions.read().get(&key) {
            return Ok(Arc::clone(definition));
        }
        let definition = Arc::new(self.inner.policies.get(policy_id, version).await?);
        self.inner
            .definitions
            .write()
            .insert(key, Arc::clone(&definition));
        Ok(definition)
    }

    async fn lock(&self, instance_id: &str) -> InstanceGuard {
        self.inner.locks.acquire(instance_id).await
    }

    fn ignored(&self, reason: impl Into<String>) -> Transition {
        self.inner.counters.ignored_signals.fetch_add(1, Ordering::Relaxed);
        let transition = Transition::ignored(reason);
        tracing::debug!(?transition, "Signal ignored");
        transition
    }

    /// Map a frozen unwind to a typed error.
    fn finish_transition(
        &self,
        instance: &WorkflowInstance,
        transition: Transition,
    ) -> StewardResult<Transition> {
        if instance.status == InstanceStatus::FailedNeedsManual && transition.is_applied() {
            return Err(StewardError::CompensationFailure {
                instance_id: instance.instance_id.clone(),
                step_id: instance.manual_step_id.clone().unwrap_or_default(),
                reason: instance.last_error.clone().unwrap_or_default(),
            });
        }
        Ok(transition)
    }
}

fn timer_event(instance: &WorkflowInstance, step: &StepSpec, hop: usize) -> EngineEvent {
    EngineEvent::TimerExpired {
        instance_id: instance.instance_id.clone(),
        step_index: instance.current_step_index,
        step_id: step.step_id.clone(),
        hop,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use tokio::sync::Notify;

    use super::*;
    use crate::config::WatcherConfig;
    use crate::policy::PolicyStatus;
    use crate::runtime::{Steward, StewardBuilder};
    use crate::storage::{HeadSwap, MemoryStateStore, PolicyHead};

    const HOUR: Duration = Duration::from_secs(3600);

    /// Memory store whose next instance save can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStateStore,
        fail_next_save: AtomicBool,
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        async fn insert_policy_version(&self, definition: &PolicyDefinition) -> anyhow::Result<bool> {
            self.inner.insert_policy_version(definition).await
        }

        async fn policy_version(
            &self,
            policy_id: &str,
            version: Version,
        ) -> anyhow::Result<Option<PolicyDefinition>> {
            self.inner.policy_version(policy_id, version).await
        }

        async fn policy_versions(&self, policy_id: &str) -> anyhow::Result<Vec<PolicyDefinition>> {
            self.inner.policy_versions(policy_id).await
        }

        async fn latest_version(&self, policy_id: &str) -> anyhow::Result<Option<Version>> {
            self.inner.latest_version(policy_id).await
        }

        async fn policy_head(&self, policy_id: &str) -> anyhow::Result<Option<PolicyHead>> {
            self.inner.policy_head(policy_id).await
        }

        async fn swap_head(&self, swap: HeadSwap) -> anyhow::Result<Option<PolicyHead>> {
            self.inner.swap_head(swap).await
        }

        async fn list_policy_ids(&self) -> anyhow::Result<Vec<String>> {
            self.inner.list_policy_ids().await
        }

        async fn save_instance(&self, instance: &WorkflowInstance) -> anyhow::Result<()> {
            if self.fail_next_save.swap(false, Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.save_instance(instance).await
        }

        async fn load_instance(&self, instance_id: &str) -> anyhow::Result<Option<WorkflowInstance>> {
            self.inner.load_instance(instance_id).await
        }

        async fn list_active_instances(&self) -> anyhow::Result<Vec<WorkflowInstance>> {
            self.inner.list_active_instances().await
        }

        async fn save_ticket(&self, ticket: &Ticket) -> anyhow::Result<()> {
            self.inner.save_ticket(ticket).await
        }

        async fn load_ticket(&self, ticket_id: &str) -> anyhow::Result<Option<Ticket>> {
            self.inner.load_ticket(ticket_id).await
        }
    }

    /// Actor that leaves every step pending and holds compensations until
    /// released.
    #[derive(Default)]
    struct GatedActor {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Actor for GatedActor {
        fn name(&self) -> &str {
            "gated"
        }

        async fn dispatch(&self, _request: &ActorRequest) -> ActorOutcome {
            ActorOutcome::Deferred
        }

        async fn compensate(
            &self,
            request: &ActorRequest,
            _compensation: &serde_json::Value,
        ) -> anyhow::Result<serde_json::Value> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(serde_json::json!({ "undone": request.step_id }))
        }
    }

    fn builder() -> StewardBuilder {
        Steward::builder().with_watcher_config(WatcherConfig {
            enabled: false,
            ..WatcherConfig::default()
        })
    }

    fn two_steps() -> Vec<StepSpec> {
        vec![
            StepSpec::new("a", "clerk", HOUR),
            StepSpec::new("b", "clerk", HOUR),
        ]
    }

    async fn count(steward: &Steward, instance_id: &str, event_type: AuditEventType) -> usize {
        steward
            .engine
            .history(instance_id)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    #[tokio::test]
    async fn test_failed_save_leaves_no_effects_and_retry_applies_once() {
        let store = Arc::new(FlakyStore::default());
        let steward = builder()
            .with_state_store(Arc::clone(&store) as Arc<dyn StateStore>)
            .start()
            .await
            .unwrap();
        steward.policies.publish("P", two_steps(), None).await.unwrap();
        let instance = steward
            .engine
            .start_workflow("P", serde_json::json!({}))
            .await
            .unwrap();
        let id = instance.instance_id.clone();
        let timer_a = instance.timer_key("a");

        store.fail_next_save.store(true, Ordering::SeqCst);
        let err = steward
            .engine
            .complete_step(&id, "a", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, StewardError::Storage(_)));
        assert_eq!(count(&steward, &id, AuditEventType::StepCompleted).await, 0);
        assert_eq!(count(&steward, &id, AuditEventType::StepStarted).await, 1);
        assert!(steward.timers.is_armed(&timer_a));

        let t = steward
            .engine
            .complete_step(&id, "a", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(t.is_applied());
        assert_eq!(count(&steward, &id, AuditEventType::StepCompleted).await, 1);
        assert_eq!(count(&steward, &id, AuditEventType::StepStarted).await, 2);
        assert!(!steward.timers.is_armed(&timer_a));
        assert!(steward.timers.is_armed(&instance.timer_key("b")));

        store.fail_next_save.store(true, Ordering::SeqCst);
        assert!(steward.engine.abort(&id, None).await.is_err());
        assert_eq!(count(&steward, &id, AuditEventType::AbortRequested).await, 0);

        let t = steward.engine.abort(&id, None).await.unwrap();
        assert_eq!(t, Transition::Applied { status: InstanceStatus::Aborted });
        assert_eq!(count(&steward, &id, AuditEventType::AbortRequested).await, 1);
        assert_eq!(count(&steward, &id, AuditEventType::InstanceAborted).await, 1);

        steward.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_start_records_nothing() {
        let store = Arc::new(FlakyStore::default());
        let steward = builder()
            .with_state_store(Arc::clone(&store) as Arc<dyn StateStore>)
            .start()
            .await
            .unwrap();
        steward.policies.publish("P", two_steps(), None).await.unwrap();

        store.fail_next_save.store(true, Ordering::SeqCst);
        assert!(steward
            .engine
            .start_workflow("P", serde_json::json!({}))
            .await
            .is_err());
        assert_eq!(steward.timers.pending(), 0);
        assert_eq!(steward.engine.stats().started, 0);

        steward.shutdown().await;
    }

    #[tokio::test]
    async fn test_lock_map_does_not_grow_with_unknown_ids() {
        let steward = builder().start().await.unwrap();

        for i in 0..1000 {
            let id = format!("missing-{i}");
            let err = steward
                .engine
                .complete_step(&id, "a", serde_json::Value::Null)
                .await
                .unwrap_err();
            assert!(matches!(err, StewardError::NotFound { .. }));
            assert!(steward.engine.abort(&id, None).await.is_err());
        }
        assert_eq!(steward.engine.inner.locks.len(), 0);

        steward.policies.publish("P", two_steps(), None).await.unwrap();
        let instance = steward
            .engine
            .start_workflow("P", serde_json::json!({}))
            .await
            .unwrap();
        steward
            .engine
            .complete_step(&instance.instance_id, "a", serde_json::Value::Null)
            .await
            .unwrap();
        // Released even though the instance is still running
        assert_eq!(steward.engine.inner.locks.len(), 0);

        steward.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_lock_wait_releases_its_slot() {
        let locks = Arc::new(InstanceLocks::default());
        let held = locks.acquire("i-1").await;

        let waiter = tokio::time::timeout(Duration::from_millis(20), locks.acquire("i-1")).await;
        assert!(waiter.is_err());
        assert_eq!(locks.len(), 1);

        drop(held);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_compensation_runs_outside_the_instance_lock() {
        let actor = Arc::new(GatedActor::default());
        let steward = builder()
            .with_actor("clerk", Arc::clone(&actor) as Arc<dyn Actor>)
            .start()
            .await
            .unwrap();
        steward
            .policies
            .publish(
                "P",
                vec![StepSpec::new("a", "clerk", HOUR).with_compensation(serde_json::json!("undo-a"))],
                None,
            )
            .await
            .unwrap();
        let instance = steward
            .engine
            .start_workflow("P", serde_json::json!({}))
            .await
            .unwrap();
        let id = instance.instance_id.clone();

        let engine = steward.engine.clone();
        let abort_id = id.clone();
        let abort = tokio::spawn(async move { engine.abort(&abort_id, None).await });
        actor.entered.notified().await;

        // The instance stays reachable while its compensation is in flight
        let t = tokio::time::timeout(
            Duration::from_secs(1),
            steward.engine.complete_step(&id, "a", serde_json::Value::Null),
        )
        .await
        .expect("instance lock is free during compensation")
        .unwrap();
        assert!(!t.is_applied());
        let t = steward.engine.abort(&id, None).await.unwrap();
        assert!(!t.is_applied());
        let view = steward.engine.instance(&id).await.unwrap();
        assert_eq!(view.instance.unwinding.as_deref(), Some("aborted by request"));

        actor.release.notify_one();
        let t = abort.await.unwrap().unwrap();
        assert_eq!(t, Transition::Applied { status: InstanceStatus::Aborted });
        let view = steward.engine.instance(&id).await.unwrap();
        assert!(view.instance.unwinding.is_none());
        assert_eq!(count(&steward, &id, AuditEventType::StepCompensated).await, 1);
        assert_eq!(count(&steward, &id, AuditEventType::StepCompleted).await, 0);

        steward.shutdown().await;
    }

    #[tokio::test]
    async fn test_recover_freezes_interrupted_unwind() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let first = builder()
            .with_state_store(Arc::clone(&store))
            .start()
            .await
            .unwrap();
        first.policies.publish("P", two_steps(), None).await.unwrap();
        let mut instance = first
            .engine
            .start_workflow("P", serde_json::json!({}))
            .await
            .unwrap();
        first.shutdown().await;

        // Crash between the unwind marker and the final status
        instance.unwinding = Some("step a exploded".to_string());
        store.save_instance(&instance).await.unwrap();

        let second = builder()
            .with_state_store(Arc::clone(&store))
            .start()
            .await
            .unwrap();
        let view = second.engine.instance(&instance.instance_id).await.unwrap();
        assert_eq!(view.instance.status, InstanceStatus::FailedNeedsManual);
        assert!(view.instance.unwinding.is_none());
        assert_eq!(
            view.instance.last_error.as_deref(),
            Some("unwind interrupted by restart")
        );
        assert_eq!(second.timers.pending(), 0);
        let history = second.engine.history(&instance.instance_id).await.unwrap();
        let frozen = history
            .iter()
            .find(|e| e.event_type == AuditEventType::InstanceFailedNeedsManual)
            .expect("freeze recorded");
        assert_eq!(frozen.payload["cause"], "step a exploded");

        let definition = second.policies.get("P", 1).await.unwrap();
        assert_eq!(definition.status, PolicyStatus::Active);

        second.shutdown().await;
    }
}
