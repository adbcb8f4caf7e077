//! Per-workflow dispatcher.
//!
//! The orchestrator receives every event published to its topic, looks up the
//! transition for `(event type, event outcome)`, runs the step and publishes
//! the step's reply back to the same topic. The loop ends when a terminal
//! transition is reached and the finalizer marks the saga `COMPLETED`.

use std::time::Instant;

use common::{EventOutcome, EventType, SagaId};
use saga_store::{CorrelationIds, SagaRecord, SagaStatus, SagaStore, StoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::channel::MessageChannel;
use crate::error::{Result, SagaError};
use crate::event::Event;
use crate::graph::{StepContext, StepGraph, Transition, TransitionKind};
use crate::service::SagaService;

/// How a delivery relates to the saga's persisted progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// The event continues from the saga's current step.
    Forward,
    /// The event is the last one recorded; its reply may never have been published.
    Redelivered,
    /// The saga has already moved past this event.
    Superseded,
}

/// Why an event was dropped without touching the saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No transition is registered for the event's key.
    UnknownTransition,
    /// The saga is already `COMPLETED` or `FAILED`.
    SagaTerminal,
}

/// Outcome of dispatching one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The event was recorded and the saga moved to `next`.
    Advanced { next: EventType },
    /// The event had already been recorded; the step's reply was published again.
    Republished,
    /// The saga had already moved past this event; nothing was recorded or published.
    Superseded,
    /// The finalizer marked the saga `COMPLETED`.
    Completed,
    /// The event was dropped.
    Ignored(IgnoreReason),
}

/// Drives one workflow.
pub struct Orchestrator<T, S, C> {
    name: String,
    topic: String,
    graph: StepGraph<T>,
    service: SagaService<S>,
    channel: C,
}

impl<T, S, C> Orchestrator<T, S, C>
where
    T: DeserializeOwned + Send + 'static,
    S: SagaStore,
    C: MessageChannel,
{
    pub fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        graph: StepGraph<T>,
        service: SagaService<S>,
        channel: C,
    ) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            graph,
            service,
            channel,
        }
    }

    /// The workflow name stored on every saga this orchestrator runs.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn graph(&self) -> &StepGraph<T> {
        &self.graph
    }

    pub fn service(&self) -> &SagaService<S> {
        &self.service
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Publishes the `INITIATED` event for an already persisted saga.
    #[tracing::instrument(skip(self, saga), fields(saga = %self.name, saga_id = %saga.saga_id))]
    pub async fn start_saga(&self, saga: &SagaRecord) -> Result<Event> {
        let event = Event::initiated(saga.saga_id, saga.payload.clone()).created_by(&saga.create_user);
        self.channel.publish(&self.topic, &event).await?;

        tracing::info!("saga started");
        metrics::counter!("saga_started_total", "saga" => self.name.clone()).increment(1);
        Ok(event)
    }

    /// Persists a new saga for `payload` and starts it.
    ///
    /// The record is written before anything is published, so no handler
    /// ever runs for a saga that does not exist.
    pub async fn create_and_start<P: Serialize + Sync>(
        &self,
        payload: &P,
        create_user: &str,
        correlation_ids: CorrelationIds,
    ) -> Result<SagaRecord> {
        let saga = self
            .service
            .create_saga_record(
                &self.name,
                create_user,
                serde_json::to_string(payload)?,
                correlation_ids,
            )
            .await?;

        self.start_saga(&saga).await?;
        Ok(saga)
    }

    /// Starts a saga unless one is already in progress for `key = value`.
    ///
    /// Best effort: two concurrent callers can both pass the check.
    pub async fn start_if_absent<P: Serialize + Sync>(
        &self,
        payload: &P,
        create_user: &str,
        key: &str,
        value: &str,
    ) -> Result<SagaRecord> {
        if let Some(existing) = self.service.find_active(&self.name, key, value).await? {
            return Err(SagaError::AlreadyActive {
                existing: existing.saga_id,
                key: key.to_string(),
                value: value.to_string(),
            });
        }

        self.create_and_start(payload, create_user, CorrelationIds::new().with(key, value))
            .await
    }

    /// Dispatches one event.
    ///
    /// Unknown keys and events for finished sagas are dropped with `Ok`. An
    /// event for a saga that does not exist fails with
    /// [`SagaError::SagaNotFound`]. A handler error leaves the saga as it was.
    #[tracing::instrument(
        skip(self, event),
        fields(
            saga = %self.name,
            saga_id = %event.saga_id(),
            event_type = %event.event_type(),
            event_outcome = %event.event_outcome(),
        )
    )]
    pub async fn handle_event(&self, event: &Event) -> Result<Dispatch> {
        let Some(transition) = self.graph.get(event.event_type(), event.event_outcome()) else {
            tracing::error!("no transition registered for event, dropping it");
            metrics::counter!(
                "saga_events_dropped_total",
                "saga" => self.name.clone(),
                "reason" => "unknown_transition"
            )
            .increment(1);
            return Ok(Dispatch::Ignored(IgnoreReason::UnknownTransition));
        };

        let saga = self.service.find_saga(event.saga_id()).await?;
        if saga.status.is_terminal() {
            tracing::warn!(status = %saga.status, "saga already finished, dropping event");
            metrics::counter!(
                "saga_events_dropped_total",
                "saga" => self.name.clone(),
                "reason" => "saga_terminal"
            )
            .increment(1);
            return Ok(Dispatch::Ignored(IgnoreReason::SagaTerminal));
        }

        metrics::counter!("saga_events_dispatched_total", "saga" => self.name.clone()).increment(1);
        let started = Instant::now();

        let result = self.dispatch(transition, event, saga).await;

        metrics::histogram!("saga_step_duration_seconds", "saga" => self.name.clone())
            .record(started.elapsed().as_secs_f64());
        if let Err(ref e) = result {
            tracing::warn!(error = %e, retriable = e.is_retriable(), "step failed");
            metrics::counter!(
                "saga_step_failures_total",
                "saga" => self.name.clone(),
                "kind" => e.kind()
            )
            .increment(1);
        }
        result
    }

    /// Resumes a saga that stopped making progress.
    ///
    /// A saga with an empty log gets its `INITIATED` event again; otherwise
    /// the last recorded event is dispatched again, which re-runs that step's
    /// handler and republishes its reply.
    #[tracing::instrument(skip(self), fields(saga = %self.name))]
    pub async fn replay_saga(&self, saga_id: SagaId) -> Result<Dispatch> {
        let saga = self.service.find_saga(saga_id).await?;
        if saga.status.is_terminal() {
            return Ok(Dispatch::Ignored(IgnoreReason::SagaTerminal));
        }

        let saga = self.service.record_replay(saga_id).await?;
        metrics::counter!("saga_replays_total", "saga" => self.name.clone()).increment(1);
        tracing::info!(retry_count = saga.retry_count, "replaying saga");

        let rows = self.service.event_states(saga_id).await?;
        match rows.last() {
            None => {
                self.start_saga(&saga).await?;
                Ok(Dispatch::Republished)
            }
            Some(last) => {
                let event = Event::new(
                    saga_id,
                    last.saga_event_state.clone(),
                    last.saga_event_outcome.clone(),
                    last.payload.clone(),
                )
                .created_by(&saga.create_user)
                .updated_by(&saga.update_user);
                self.handle_event(&event).await
            }
        }
    }

    async fn dispatch(&self, transition: &Transition<T>, event: &Event, saga: SagaRecord) -> Result<Dispatch> {
        let position = self.position(&saga, event).await?;
        if position == Position::Superseded {
            tracing::warn!(
                saga_state = ?saga.saga_state,
                "saga already past this event, nothing to record"
            );
        }

        match transition.kind() {
            TransitionKind::Step { target, handler } => {
                let payload: T = event.payload()?;
                let ctx = StepContext::new(event.clone(), saga.clone(), payload, target.clone());
                let reply = handler.handle(ctx).await?;

                if reply.event_type() != target {
                    return Err(SagaError::MisroutedEvent {
                        expected: target.clone(),
                        actual: reply.event_type().clone(),
                    });
                }

                self.settle(position, &saga, event, target, SagaStatus::InProgress, Some(reply))
                    .await
            }
            TransitionKind::Terminal => {
                let completion = event.next(
                    EventType::MARK_SAGA_COMPLETE,
                    EventOutcome::SAGA_COMPLETED,
                    event.event_payload(),
                );
                self.settle(
                    position,
                    &saga,
                    event,
                    &EventType::MARK_SAGA_COMPLETE,
                    SagaStatus::InProgress,
                    Some(completion),
                )
                .await
            }
            TransitionKind::Finalize => {
                let dispatch = self
                    .settle(
                        position,
                        &saga,
                        event,
                        &EventType::MARK_SAGA_COMPLETE,
                        SagaStatus::Completed,
                        None,
                    )
                    .await?;

                if matches!(dispatch, Dispatch::Advanced { .. }) {
                    tracing::info!("saga completed");
                    metrics::counter!("saga_completed_total", "saga" => self.name.clone())
                        .increment(1);
                    return Ok(Dispatch::Completed);
                }
                Ok(dispatch)
            }
        }
    }

    /// Persists and publishes according to where the delivery stands.
    async fn settle(
        &self,
        position: Position,
        saga: &SagaRecord,
        event: &Event,
        next_state: &EventType,
        status: SagaStatus,
        reply: Option<Event>,
    ) -> Result<Dispatch> {
        match position {
            Position::Forward => {
                let advanced = self
                    .service
                    .update_attached_saga_with_events(saga, next_state.clone(), status, event)
                    .await;

                match advanced {
                    Ok(_) => {}
                    // Another delivery of this event won the race and publishes the reply.
                    Err(SagaError::Store(StoreError::StateConflict { .. })) => {
                        tracing::warn!("concurrent delivery already advanced the saga");
                        return Ok(Dispatch::Superseded);
                    }
                    Err(SagaError::Store(StoreError::InvalidStatusTransition { .. })) => {
                        tracing::warn!("saga finished while the step was running");
                        return Ok(Dispatch::Ignored(IgnoreReason::SagaTerminal));
                    }
                    Err(e) => return Err(e),
                }

                tracing::info!(next_state = %next_state, "saga advanced");
                if let Some(reply) = reply {
                    self.channel.publish(&self.topic, &reply).await?;
                }
                Ok(Dispatch::Advanced {
                    next: next_state.clone(),
                })
            }
            Position::Redelivered => {
                tracing::info!("event already recorded, republishing reply");
                if let Some(reply) = reply {
                    self.channel.publish(&self.topic, &reply).await?;
                }
                Ok(Dispatch::Republished)
            }
            Position::Superseded => Ok(Dispatch::Superseded),
        }
    }

    async fn position(&self, saga: &SagaRecord, event: &Event) -> Result<Position> {
        let current = saga.saga_state.clone().unwrap_or(EventType::INITIATED);
        if event.event_type() == &current {
            return Ok(Position::Forward);
        }

        let rows = self.service.event_states(saga.saga_id).await?;
        let is_last = rows.last().is_some_and(|last| {
            &last.saga_event_state == event.event_type()
                && &last.saga_event_outcome == event.event_outcome()
        });

        Ok(if is_last {
            Position::Redelivered
        } else {
            Position::Superseded
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use saga_store::InMemorySagaStore;
    use serde::Deserialize;

    use super::*;
    use crate::channel::InMemoryChannel;

    const TOPIC: &str = "test-saga";
    const STEP1: EventType = EventType::from_static("STEP1");
    const STEP1_DONE: EventOutcome = EventOutcome::from_static("STEP1_DONE");
    const STEP1_FAILED: EventOutcome = EventOutcome::from_static("STEP1_FAILED");

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Payload {
        key: String,
    }

    type TestOrchestrator = Orchestrator<Payload, InMemorySagaStore, InMemoryChannel>;

    struct Harness {
        orchestrator: TestOrchestrator,
        store: InMemorySagaStore,
        channel: InMemoryChannel,
        calls: Arc<AtomicUsize>,
    }

    /// One business step; the handler fails while `fail` is set.
    fn harness(fail: bool) -> Harness {
        let store = InMemorySagaStore::new();
        let channel = InMemoryChannel::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let graph = StepGraph::builder()
            .begin(STEP1, move |ctx: StepContext<Payload>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        return Err(SagaError::StepFailed {
                            step: "STEP1".into(),
                            reason: "collaborator down".into(),
                        });
                    }
                    ctx.reply_with(STEP1_DONE, &ctx.payload)
                }
            })
            .end(STEP1, STEP1_DONE)
            .build()
            .unwrap();

        let orchestrator = Orchestrator::new(
            "TEST_SAGA",
            TOPIC,
            graph,
            SagaService::new(store.clone()),
            channel.clone(),
        );

        Harness {
            orchestrator,
            store,
            channel,
            calls,
        }
    }

    fn payload() -> Payload {
        Payload { key: "K1".into() }
    }

    async fn started(h: &Harness) -> SagaRecord {
        h.orchestrator
            .create_and_start(&payload(), "alice", CorrelationIds::new().with("key", "K1"))
            .await
            .unwrap()
    }

    fn keys(events: &[Event]) -> Vec<(String, String)> {
        events
            .iter()
            .map(|e| (e.event_type().to_string(), e.event_outcome().to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_start_persists_then_publishes_initiated() {
        let h = harness(false);
        let saga = started(&h).await;

        assert_eq!(saga.saga_name, "TEST_SAGA");
        assert_eq!(saga.status, SagaStatus::InProgress);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        let published = h.channel.published(TOPIC);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type(), &EventType::INITIATED);
        assert_eq!(published[0].saga_id(), saga.saga_id);
        assert_eq!(published[0].create_user(), "alice");
    }

    #[tokio::test]
    async fn test_single_step_workflow_runs_to_completion() {
        let h = harness(false);
        let saga = started(&h).await;

        let initiated = h.channel.published(TOPIC)[0].clone();
        let dispatch = h.orchestrator.handle_event(&initiated).await.unwrap();
        assert_eq!(dispatch, Dispatch::Advanced { next: STEP1 });

        let after_first = h.store.get_saga(saga.saga_id).await.unwrap().unwrap();
        assert_eq!(after_first.saga_state, Some(STEP1));

        let step1 = h.channel.published(TOPIC)[1].clone();
        let dispatch = h.orchestrator.handle_event(&step1).await.unwrap();
        assert_eq!(
            dispatch,
            Dispatch::Advanced {
                next: EventType::MARK_SAGA_COMPLETE
            }
        );

        let completion = h.channel.published(TOPIC)[2].clone();
        let dispatch = h.orchestrator.handle_event(&completion).await.unwrap();
        assert_eq!(dispatch, Dispatch::Completed);

        assert_eq!(
            keys(&h.channel.published(TOPIC)),
            vec![
                ("INITIATED".into(), "INITIATE_SUCCESS".into()),
                ("STEP1".into(), "STEP1_DONE".into()),
                ("MARK_SAGA_COMPLETE".into(), "SAGA_COMPLETED".into()),
            ]
        );

        let done = h.store.get_saga(saga.saga_id).await.unwrap().unwrap();
        assert_eq!(done.status, SagaStatus::Completed);

        let rows = h.store.get_event_states(saga.saga_id).await.unwrap();
        let path: Vec<_> = rows
            .iter()
            .map(|r| (r.saga_event_state.clone(), r.saga_event_outcome.clone()))
            .collect();
        assert_eq!(path.len(), 3);
        assert!(h.orchestrator.graph().is_valid_path(&path));
    }

    #[tokio::test]
    async fn test_unknown_transition_is_dropped() {
        let h = harness(false);
        let saga = started(&h).await;

        let stray = Event::new(saga.saga_id, STEP1, STEP1_FAILED, "{}");
        let dispatch = h.orchestrator.handle_event(&stray).await.unwrap();

        assert_eq!(dispatch, Dispatch::Ignored(IgnoreReason::UnknownTransition));
        let unchanged = h.store.get_saga(saga.saga_id).await.unwrap().unwrap();
        assert_eq!(unchanged, saga);
        assert_eq!(h.store.event_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_saga_fails_explicitly() {
        let h = harness(false);
        let event = Event::initiated(SagaId::new(), r#"{"key":"K1"}"#);

        let result = h.orchestrator.handle_event(&event).await;
        assert!(matches!(result, Err(SagaError::SagaNotFound(_))));
    }

    #[tokio::test]
    async fn test_handler_failure_leaves_saga_unchanged() {
        let h = harness(true);
        let saga = started(&h).await;

        let initiated = h.channel.published(TOPIC)[0].clone();
        let result = h.orchestrator.handle_event(&initiated).await;

        assert!(matches!(result, Err(SagaError::StepFailed { .. })));
        let unchanged = h.store.get_saga(saga.saga_id).await.unwrap().unwrap();
        assert_eq!(unchanged.saga_state, None);
        assert_eq!(unchanged.status, SagaStatus::InProgress);
        assert_eq!(h.store.event_count().await, 0);
        assert_eq!(h.channel.published(TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_bad_payload_fails_without_running_handler() {
        let h = harness(false);
        let saga = started(&h).await;

        let garbage = Event::initiated(saga.saga_id, "not json");
        let result = h.orchestrator.handle_event(&garbage).await;

        assert!(matches!(result, Err(SagaError::Serialization(_))));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_redelivered_event_republishes_without_second_row() {
        let h = harness(false);
        let saga = started(&h).await;
        let initiated = h.channel.published(TOPIC)[0].clone();

        h.orchestrator.handle_event(&initiated).await.unwrap();
        let dispatch = h.orchestrator.handle_event(&initiated).await.unwrap();

        assert_eq!(dispatch, Dispatch::Republished);
        assert_eq!(h.store.get_event_states(saga.saga_id).await.unwrap().len(), 1);
        assert_eq!(
            keys(&h.channel.published(TOPIC)[1..]),
            vec![
                ("STEP1".into(), "STEP1_DONE".into()),
                ("STEP1".into(), "STEP1_DONE".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_superseded_event_records_nothing() {
        let h = harness(false);
        let saga = started(&h).await;
        let initiated = h.channel.published(TOPIC)[0].clone();

        h.orchestrator.handle_event(&initiated).await.unwrap();
        let step1 = h.channel.published(TOPIC)[1].clone();
        h.orchestrator.handle_event(&step1).await.unwrap();

        // The saga is waiting for its completion event; INITIATED is two steps back.
        let published_before = h.channel.published(TOPIC).len();
        let dispatch = h.orchestrator.handle_event(&initiated).await.unwrap();

        assert_eq!(dispatch, Dispatch::Superseded);
        assert_eq!(h.store.get_event_states(saga.saga_id).await.unwrap().len(), 2);
        assert_eq!(h.channel.published(TOPIC).len(), published_before);
    }

    #[tokio::test]
    async fn test_events_for_finished_saga_are_ignored() {
        let h = harness(false);
        let saga = started(&h).await;
        h.orchestrator
            .service()
            .mark_failed(saga.saga_id, "admin")
            .await
            .unwrap();

        let initiated = h.channel.published(TOPIC)[0].clone();
        let dispatch = h.orchestrator.handle_event(&initiated).await.unwrap();

        assert_eq!(dispatch, Dispatch::Ignored(IgnoreReason::SagaTerminal));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_misrouted_reply_is_rejected() {
        let store = InMemorySagaStore::new();
        let channel = InMemoryChannel::new();
        let graph = StepGraph::builder()
            .begin(STEP1, |ctx: StepContext<Payload>| async move {
                Ok::<_, SagaError>(ctx.event.next(EventType::from_static("OTHER"), STEP1_DONE, "{}"))
            })
            .end(STEP1, STEP1_DONE)
            .build()
            .unwrap();
        let orchestrator = Orchestrator::new(
            "TEST_SAGA",
            TOPIC,
            graph,
            SagaService::new(store.clone()),
            channel.clone(),
        );

        let saga = orchestrator
            .create_and_start(&payload(), "alice", CorrelationIds::new())
            .await
            .unwrap();
        let initiated = channel.published(TOPIC)[0].clone();
        let result = orchestrator.handle_event(&initiated).await;

        assert!(matches!(result, Err(SagaError::MisroutedEvent { .. })));
        assert_eq!(store.get_event_states(saga.saga_id).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_start_if_absent_guards_business_key() {
        let h = harness(false);
        let first = h
            .orchestrator
            .start_if_absent(&payload(), "alice", "key", "K1")
            .await
            .unwrap();

        let second = h
            .orchestrator
            .start_if_absent(&payload(), "alice", "key", "K1")
            .await;
        assert!(matches!(
            second,
            Err(SagaError::AlreadyActive { existing, .. }) if existing == first.saga_id
        ));

        assert!(
            h.orchestrator
                .start_if_absent(&payload(), "alice", "key", "K2")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_replay_of_unstarted_saga_republishes_initiated() {
        let h = harness(false);
        let saga = h
            .orchestrator
            .service()
            .create_saga_record("TEST_SAGA", "alice", r#"{"key":"K1"}"#, CorrelationIds::new())
            .await
            .unwrap();

        let dispatch = h.orchestrator.replay_saga(saga.saga_id).await.unwrap();

        assert_eq!(dispatch, Dispatch::Republished);
        let published = h.channel.published(TOPIC);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type(), &EventType::INITIATED);
        assert_eq!(
            h.store.get_saga(saga.saga_id).await.unwrap().unwrap().retry_count,
            1
        );
    }

    #[tokio::test]
    async fn test_replay_republishes_reply_of_last_step() {
        let h = harness(false);
        let saga = started(&h).await;
        let initiated = h.channel.published(TOPIC)[0].clone();
        h.orchestrator.handle_event(&initiated).await.unwrap();

        let dispatch = h.orchestrator.replay_saga(saga.saga_id).await.unwrap();

        assert_eq!(dispatch, Dispatch::Republished);
        let published = h.channel.published(TOPIC);
        assert_eq!(published.last().unwrap().event_type(), &STEP1);
        assert_eq!(h.store.get_event_states(saga.saga_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_of_finished_saga_is_ignored() {
        let h = harness(false);
        let saga = started(&h).await;
        h.orchestrator
            .service()
            .mark_failed(saga.saga_id, "admin")
            .await
            .unwrap();

        let dispatch = h.orchestrator.replay_saga(saga.saga_id).await.unwrap();
        assert_eq!(dispatch, Dispatch::Ignored(IgnoreReason::SagaTerminal));
    }
}
