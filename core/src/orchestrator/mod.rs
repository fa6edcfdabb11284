//! Orchestrator
//!
//! Owns every incident aggregate and drives it through the phase pipeline:
//! alert ingress with fingerprint dedup, sequential analysis roles, the
//! consensus gate, action execution, and the terminal transitions. Work for
//! one incident is serialized onto a single worker stripe (hash of the id),
//! so events stay totally ordered per incident while incidents proceed in
//! parallel.

pub mod actions;

pub use actions::{ActionExecutor, ActionReceipt, LoggingActionExecutor, ProposedAction};

use crate::agent::{AgentBudget, AgentOutput, AgentRole, AgentRunner, AgentStatus};
use crate::bus::{MessageBus, Priority};
use crate::clock::{SharedClock, SharedIdGen};
use crate::consensus::{self, ConsensusConfig};
use crate::error::{VigilError, VigilResult};
use crate::event::Event;
use crate::hub::SubscriberHub;
use crate::incident::{
    ActionOutcome, Alert, CloseOutcome, ExecutedAction, Incident, Phase,
};
use crate::metrics::INCIDENT_EVENT_TOPIC;
use crate::retry::RetryPolicy;
use crate::store::EventStore;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const STRIPE_QUEUE_DEPTH: usize = 256;
const CONFLICT_RETRIES: u32 = 3;

/// Orchestrator tuning knobs
#[derive(Clone)]
pub struct OrchestratorConfig {
    pub dedup_window: chrono::Duration,
    /// How long closed incidents stay queryable for late subscribers
    pub retention: chrono::Duration,
    /// Worker stripes; also the cross-incident concurrency cap
    pub workers: usize,
    pub consensus: ConsensusConfig,
    pub budget: AgentBudget,
    pub action_retry: RetryPolicy,
    /// Fixed jitter seed for tests
    pub rng_seed: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dedup_window: chrono::Duration::seconds(300),
            retention: chrono::Duration::seconds(300),
            workers: 8,
            consensus: ConsensusConfig::default(),
            budget: AgentBudget::default(),
            action_retry: RetryPolicy::default(),
            rng_seed: None,
        }
    }
}

/// Acknowledgement returned by alert ingress
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubmitAck {
    pub incident_id: String,
    /// True when the alert coalesced into an existing incident
    pub deduplicated: bool,
}

struct IncidentCell {
    incident: RwLock<Incident>,
    cancel: CancellationToken,
}

struct FingerprintEntry {
    incident_id: String,
    opened_at: DateTime<Utc>,
}

enum Job {
    RunPipeline { incident_id: String },
    AttachAlert { incident_id: String, alert: Alert },
    Cancel { incident_id: String },
}

struct Inner {
    config: OrchestratorConfig,
    clock: SharedClock,
    ids: SharedIdGen,
    store: Arc<dyn EventStore>,
    bus: MessageBus,
    hub: SubscriberHub,
    runner: Arc<AgentRunner>,
    executor: Arc<dyn ActionExecutor>,
    incidents: RwLock<HashMap<String, Arc<IncidentCell>>>,
    fingerprints: Mutex<HashMap<String, FingerprintEntry>>,
    stripes: Vec<mpsc::Sender<Job>>,
    root_cancel: CancellationToken,
    rng: Mutex<StdRng>,
}

/// Drives incidents from alert to terminal state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        clock: SharedClock,
        ids: SharedIdGen,
        store: Arc<dyn EventStore>,
        bus: MessageBus,
        hub: SubscriberHub,
        runner: Arc<AgentRunner>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        let workers = config.workers.max(1);
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let root_cancel = CancellationToken::new();

        let mut stripes = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel(STRIPE_QUEUE_DEPTH);
            stripes.push(tx);
            receivers.push(rx);
        }

        let inner = Arc::new(Inner {
            config,
            clock,
            ids,
            store,
            bus,
            hub,
            runner,
            executor,
            incidents: RwLock::new(HashMap::new()),
            fingerprints: Mutex::new(HashMap::new()),
            stripes,
            root_cancel: root_cancel.clone(),
            rng: Mutex::new(rng),
        });

        for rx in receivers {
            let inner = inner.clone();
            let cancel = root_cancel.clone();
            tokio::spawn(async move {
                stripe_worker(inner, rx, cancel).await;
            });
        }

        Self { inner }
    }

    /// Alert ingress: coalesce into an open fingerprint match or open a new
    /// incident. Returns immediately; the pipeline runs on a worker stripe.
    pub async fn submit_alert(&self, alert: Alert) -> VigilResult<SubmitAck> {
        if !alert.payload.is_object() {
            return Err(VigilError::validation("alert payload must be a JSON object"));
        }
        let now = self.inner.clock.now();
        self.sweep_retention(now);

        let fingerprint = alert.fingerprint();
        let existing = {
            let mut fingerprints = self.inner.fingerprints.lock();
            fingerprints
                .retain(|_, entry| entry.opened_at + self.inner.config.dedup_window > now);
            fingerprints.get(&fingerprint).map(|e| e.incident_id.clone())
        };

        if let Some(incident_id) = existing {
            self.dispatch(Job::AttachAlert {
                incident_id: incident_id.clone(),
                alert,
            })
            .await?;
            return Ok(SubmitAck {
                incident_id,
                deduplicated: true,
            });
        }

        let incident_id = self.inner.ids.new_id("inc");
        let incident = Incident::open(incident_id.clone(), alert, now);
        let cell = Arc::new(IncidentCell {
            incident: RwLock::new(incident),
            cancel: self.inner.root_cancel.child_token(),
        });
        self.inner
            .incidents
            .write()
            .insert(incident_id.clone(), cell);
        self.inner.fingerprints.lock().insert(
            fingerprint,
            FingerprintEntry {
                incident_id: incident_id.clone(),
                opened_at: now,
            },
        );
        self.dispatch(Job::RunPipeline {
            incident_id: incident_id.clone(),
        })
        .await?;
        Ok(SubmitAck {
            incident_id,
            deduplicated: false,
        })
    }

    /// Snapshot of one incident; closed incidents stay visible for the
    /// configured retention.
    pub fn get_incident(&self, incident_id: &str) -> VigilResult<Incident> {
        self.inner
            .incidents
            .read()
            .get(incident_id)
            .map(|cell| cell.incident.read().clone())
            .ok_or_else(|| VigilError::NotFound {
                kind: "incident".into(),
                id: incident_id.to_string(),
            })
    }

    /// Cancels an incident: signals all in-flight child work, then records
    /// the terminal transition on the incident's stripe.
    pub async fn cancel_incident(&self, incident_id: &str) -> VigilResult<()> {
        let cell = self
            .inner
            .incidents
            .read()
            .get(incident_id)
            .cloned()
            .ok_or_else(|| VigilError::NotFound {
                kind: "incident".into(),
                id: incident_id.to_string(),
            })?;
        cell.cancel.cancel();
        self.dispatch(Job::Cancel {
            incident_id: incident_id.to_string(),
        })
        .await
    }

    /// Number of incidents currently held in memory (open + retained).
    pub fn incident_count(&self) -> usize {
        self.inner.incidents.read().len()
    }

    /// Cancels all incident work and stops the stripes.
    pub fn shutdown(&self) {
        self.inner.root_cancel.cancel();
    }

    async fn dispatch(&self, job: Job) -> VigilResult<()> {
        let incident_id = match &job {
            Job::RunPipeline { incident_id }
            | Job::AttachAlert { incident_id, .. }
            | Job::Cancel { incident_id } => incident_id.clone(),
        };
        let stripe = stripe_for(&incident_id, self.inner.stripes.len());
        self.inner.stripes[stripe]
            .send(job)
            .await
            .map_err(|_| VigilError::internal("orchestrator stripes are shut down"))
    }

    fn sweep_retention(&self, now: DateTime<Utc>) {
        let retention = self.inner.config.retention;
        let mut incidents = self.inner.incidents.write();
        incidents.retain(|_, cell| {
            let incident = cell.incident.read();
            !incident.phase.is_terminal() || incident.updated_at + retention > now
        });
    }
}

fn stripe_for(incident_id: &str, stripes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    incident_id.hash(&mut hasher);
    (hasher.finish() % stripes as u64) as usize
}

// ============================================================================
// Stripe worker and pipeline
// ============================================================================

async fn stripe_worker(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<Job>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            job = rx.recv() => match job {
                Some(job) => job,
                None => return,
            },
            _ = cancel.cancelled() => return,
        };
        match job {
            Job::RunPipeline { incident_id } => {
                run_pipeline(&inner, &incident_id).await;
            }
            Job::AttachAlert { incident_id, alert } => {
                attach_alert(&inner, &incident_id, alert).await;
            }
            Job::Cancel { incident_id } => {
                finalize(
                    &inner,
                    &incident_id,
                    CloseOutcome::Cancelled,
                    Event::IncidentCancelled,
                )
                .await;
            }
        }
    }
}

fn cell_for(inner: &Inner, incident_id: &str) -> Option<Arc<IncidentCell>> {
    inner.incidents.read().get(incident_id).cloned()
}

async fn run_pipeline(inner: &Arc<Inner>, incident_id: &str) {
    let Some(cell) = cell_for(inner, incident_id) else {
        return;
    };
    match drive(inner, &cell).await {
        Ok(()) => {}
        Err(VigilError::Cancelled) => {
            finalize(
                inner,
                incident_id,
                CloseOutcome::Cancelled,
                Event::IncidentCancelled,
            )
            .await;
        }
        Err(err) => {
            tracing::error!(incident = %incident_id, error = %err, "pipeline failed");
            finalize(
                inner,
                incident_id,
                CloseOutcome::Failed,
                Event::IncidentFailed {
                    reason: err.to_string(),
                },
            )
            .await;
        }
    }
}

/// The happy-path control loop; every early exit is an error mapped to a
/// terminal transition by the caller.
async fn drive(inner: &Arc<Inner>, cell: &Arc<IncidentCell>) -> VigilResult<()> {
    let (incident_id, opened_event) = {
        let incident = cell.incident.read();
        (
            incident.id.clone(),
            Event::IncidentOpened {
                severity: incident.severity,
                fingerprint: incident.fingerprint.clone(),
                alert: incident.alerts[0].clone(),
            },
        )
    };
    append_and_publish(inner, &incident_id, vec![opened_event]).await?;

    // Sequential analysis phases: each role feeds the next.
    for role in AgentRole::SEQUENTIAL {
        let phase = match role {
            AgentRole::Detection => Phase::Detecting,
            AgentRole::Diagnosis => Phase::Diagnosing,
            _ => Phase::Predicting,
        };
        enter_phase(inner, cell, phase).await?;
        run_role(inner, cell, role).await?;
    }

    // Consensus phase: the resolution proposal and the comms draft are
    // produced concurrently, then the weighted vote decides.
    enter_phase(inner, cell, Phase::Consensus).await?;
    append_and_publish(
        inner,
        &incident_id,
        vec![
            Event::AgentStarted {
                role: AgentRole::Resolution,
            },
            Event::AgentStarted {
                role: AgentRole::Communication,
            },
        ],
    )
    .await?;
    let snapshot = cell.incident.read().clone();
    let (resolution, communication) = tokio::join!(
        inner
            .runner
            .run(&snapshot, AgentRole::Resolution, inner.config.budget, &cell.cancel),
        inner.runner.run(
            &snapshot,
            AgentRole::Communication,
            inner.config.budget,
            &cell.cancel
        ),
    );
    if resolution.status == AgentStatus::Cancelled
        || communication.status == AgentStatus::Cancelled
    {
        return Err(VigilError::Cancelled);
    }
    record_output(inner, cell, resolution).await?;
    record_output(inner, cell, communication).await?;

    let decision = {
        let now = inner.clock.now();
        let mut incident = cell.incident.write();
        let result = consensus::evaluate(&inner.config.consensus, &incident.agent_outputs, now);
        incident.record_consensus(result.clone(), now);
        result
    };
    append_and_publish(
        inner,
        &incident_id,
        vec![Event::ConsensusReached {
            result: decision.clone(),
        }],
    )
    .await?;
    publish_snapshot(inner, cell);

    if decision.approved {
        enter_phase(inner, cell, Phase::Resolving).await?;
        execute_actions(inner, cell).await?;
        enter_phase(inner, cell, Phase::Communicating).await?;

        let (resolved_at, duration_ms) = {
            let now = inner.clock.now();
            let mut incident = cell.incident.write();
            incident.transition(Phase::Closed(CloseOutcome::Resolved), now)?;
            let resolved_at = incident.resolved_at.unwrap_or(now);
            let duration = (resolved_at - incident.created_at).num_milliseconds().max(0) as u64;
            (resolved_at, duration)
        };
        append_and_publish(
            inner,
            &incident_id,
            vec![Event::IncidentResolved {
                resolved_at,
                duration_ms,
            }],
        )
        .await?;
        publish_snapshot(inner, cell);
        tracing::info!(incident = %incident_id, duration_ms, "incident resolved autonomously");
    } else {
        enter_phase(inner, cell, Phase::AwaitingHuman).await?;
        {
            let now = inner.clock.now();
            let mut incident = cell.incident.write();
            incident.transition(Phase::Closed(CloseOutcome::Rejected), now)?;
        }
        append_and_publish(inner, &incident_id, vec![Event::IncidentRejected]).await?;
        publish_snapshot(inner, cell);
        tracing::info!(
            incident = %incident_id,
            score = decision.weighted_score,
            "consensus rejected autonomous action"
        );
    }
    Ok(())
}

async fn run_role(
    inner: &Arc<Inner>,
    cell: &Arc<IncidentCell>,
    role: AgentRole,
) -> VigilResult<()> {
    let incident_id = cell.incident.read().id.clone();
    append_and_publish(inner, &incident_id, vec![Event::AgentStarted { role }]).await?;

    let snapshot = cell.incident.read().clone();
    let output = inner
        .runner
        .run(&snapshot, role, inner.config.budget, &cell.cancel)
        .await;
    if output.status == AgentStatus::Cancelled {
        return Err(VigilError::Cancelled);
    }
    record_output(inner, cell, output).await
}

async fn record_output(
    inner: &Arc<Inner>,
    cell: &Arc<IncidentCell>,
    output: AgentOutput,
) -> VigilResult<()> {
    let incident_id = {
        let now = inner.clock.now();
        let mut incident = cell.incident.write();
        incident.record_output(output.clone(), now);
        incident.id.clone()
    };
    append_and_publish(
        inner,
        &incident_id,
        vec![Event::AgentCompleted { output }],
    )
    .await?;
    publish_snapshot(inner, cell);
    Ok(())
}

async fn enter_phase(
    inner: &Arc<Inner>,
    cell: &Arc<IncidentCell>,
    phase: Phase,
) -> VigilResult<()> {
    if cell.cancel.is_cancelled() {
        return Err(VigilError::Cancelled);
    }
    let incident_id = {
        let now = inner.clock.now();
        let mut incident = cell.incident.write();
        incident.transition(phase, now)?;
        incident.id.clone()
    };
    append_and_publish(inner, &incident_id, vec![Event::PhaseEntered { phase }]).await?;
    publish_snapshot(inner, cell);
    Ok(())
}

/// Runs every proposed action with retry and best-effort rollback.
async fn execute_actions(inner: &Arc<Inner>, cell: &Arc<IncidentCell>) -> VigilResult<()> {
    let (incident_id, proposal) = {
        let incident = cell.incident.read();
        (
            incident.id.clone(),
            incident
                .agent_outputs
                .get(&AgentRole::Resolution)
                .map(|o| o.proposal.clone())
                .unwrap_or(serde_json::Value::Null),
        )
    };
    let proposed = ProposedAction::from_proposal(&proposal);
    let mut completed: Vec<ExecutedAction> = Vec::new();

    for action in proposed {
        let action_id = inner.ids.new_id("act");
        let mut record = ExecutedAction {
            id: action_id,
            kind: action.kind.clone(),
            started_at: inner.clock.now(),
            finished_at: None,
            outcome: ActionOutcome::Pending,
            rollback_token: None,
            error: None,
        };
        {
            let now = inner.clock.now();
            cell.incident.write().record_action(record.clone(), now);
        }
        append_and_publish(
            inner,
            &incident_id,
            vec![Event::ActionStarted {
                action: record.clone(),
            }],
        )
        .await?;

        let mut attempts = 0u32;
        let receipt = loop {
            attempts += 1;
            match inner
                .executor
                .execute(&incident_id, &action, &cell.cancel)
                .await
            {
                Ok(receipt) => break Ok(receipt),
                Err(VigilError::Cancelled) => return Err(VigilError::Cancelled),
                Err(err)
                    if err.is_retryable() && inner.config.action_retry.allows_retry(attempts) =>
                {
                    let delay = {
                        let mut rng = inner.rng.lock();
                        inner.config.action_retry.delay_for_attempt(attempts, &mut *rng)
                    };
                    tracing::warn!(
                        incident = %incident_id,
                        kind = %action.kind,
                        attempt = attempts,
                        error = %err,
                        "action failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cell.cancel.cancelled() => return Err(VigilError::Cancelled),
                    }
                }
                Err(err) => break Err(err),
            }
        };

        match receipt {
            Ok(receipt) => {
                record.finished_at = Some(inner.clock.now());
                record.outcome = ActionOutcome::Succeeded;
                record.rollback_token = receipt.rollback_token;
                {
                    let now = inner.clock.now();
                    cell.incident.write().record_action(record.clone(), now);
                }
                append_and_publish(
                    inner,
                    &incident_id,
                    vec![Event::ActionFinished {
                        action: record.clone(),
                    }],
                )
                .await?;
                completed.push(record);
            }
            Err(err) => {
                record.finished_at = Some(inner.clock.now());
                record.outcome = ActionOutcome::Failed;
                record.error = Some(err.to_string());
                {
                    let now = inner.clock.now();
                    cell.incident.write().record_action(record.clone(), now);
                }
                append_and_publish(
                    inner,
                    &incident_id,
                    vec![Event::ActionFinished {
                        action: record.clone(),
                    }],
                )
                .await?;
                rollback_completed(inner, cell, &incident_id, completed).await;
                return Err(VigilError::internal(format!(
                    "action {} failed after {} attempts: {}",
                    record.kind, attempts, err
                )));
            }
        }
    }
    Ok(())
}

/// Undoes previously succeeded actions in reverse order, best-effort.
async fn rollback_completed(
    inner: &Arc<Inner>,
    cell: &Arc<IncidentCell>,
    incident_id: &str,
    completed: Vec<ExecutedAction>,
) {
    for mut action in completed.into_iter().rev() {
        let Some(token) = action.rollback_token.clone() else {
            continue;
        };
        let outcome = match inner.executor.rollback(incident_id, &token).await {
            Ok(()) => ActionOutcome::RolledBack,
            Err(err) => {
                tracing::warn!(
                    incident = %incident_id,
                    kind = %action.kind,
                    error = %err,
                    "rollback failed"
                );
                ActionOutcome::Failed
            }
        };
        action.outcome = outcome;
        action.finished_at = Some(inner.clock.now());
        {
            let now = inner.clock.now();
            cell.incident.write().record_action(action.clone(), now);
        }
        if let Err(err) =
            append_and_publish(inner, incident_id, vec![Event::ActionFinished { action }]).await
        {
            tracing::warn!(incident = %incident_id, error = %err, "failed to record rollback event");
        }
    }
}

/// Terminal transition shared by failure and cancellation paths. A no-op if
/// the incident is already closed.
async fn finalize(inner: &Arc<Inner>, incident_id: &str, outcome: CloseOutcome, event: Event) {
    let Some(cell) = cell_for(inner, incident_id) else {
        return;
    };
    {
        let now = inner.clock.now();
        let mut incident = cell.incident.write();
        if incident.phase.is_terminal() {
            return;
        }
        if let Err(err) = incident.transition(Phase::Closed(outcome), now) {
            tracing::error!(incident = %incident_id, error = %err, "terminal transition refused");
            return;
        }
    }
    if let Err(err) = append_and_publish(inner, incident_id, vec![event]).await {
        tracing::error!(incident = %incident_id, error = %err, "failed to record terminal event");
    }
    publish_snapshot(inner, &cell);
}

async fn attach_alert(inner: &Arc<Inner>, incident_id: &str, alert: Alert) {
    let Some(cell) = cell_for(inner, incident_id) else {
        tracing::debug!(incident = %incident_id, "dropping alert for evicted incident");
        return;
    };
    {
        let now = inner.clock.now();
        cell.incident.write().attach_alert(alert.clone(), now);
    }
    if let Err(err) =
        append_and_publish(inner, incident_id, vec![Event::AlertAttached { alert }]).await
    {
        tracing::warn!(incident = %incident_id, error = %err, "failed to record attached alert");
    }
    publish_snapshot(inner, &cell);
}

/// Appends events with optimistic-concurrency retry, then fans the stored
/// records out to the hub and the bus.
async fn append_and_publish(
    inner: &Arc<Inner>,
    incident_id: &str,
    events: Vec<Event>,
) -> VigilResult<()> {
    let mut attempt = 0u32;
    let from = loop {
        let head = inner.store.head(incident_id).await?;
        match inner.store.append(incident_id, head, &events).await {
            Ok(_) => break head,
            Err(VigilError::Conflict { .. }) if attempt < CONFLICT_RETRIES => {
                attempt += 1;
                continue;
            }
            Err(err) => return Err(err),
        }
    };

    let stored = inner
        .store
        .read(incident_id, from, events.len())
        .await?;
    for record in &stored {
        inner.hub.publish(record);
        if let Ok(payload) = serde_json::to_value(record) {
            inner
                .bus
                .publish_json(INCIDENT_EVENT_TOPIC, Priority::Medium, payload);
        }
    }
    Ok(())
}

/// Sends the current aggregate state down the bus for components that want
/// snapshots instead of the event stream.
fn publish_snapshot(inner: &Arc<Inner>, cell: &Arc<IncidentCell>) {
    let incident = cell.incident.read();
    if let Ok(payload) = serde_json::to_value(&*incident) {
        inner
            .bus
            .publish_json("incident.snapshot", Priority::Low, payload);
    }
}
