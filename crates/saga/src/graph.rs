//! The transition table of a workflow.
//!
//! A [`StepGraph`] maps `(event type, event outcome)` to what the engine does
//! when such an event arrives. It is assembled once with [`StepGraphBuilder`],
//! validated, and never mutated afterwards:
//!
//! ```text
//! (INITIATED, INITIATE_SUCCESS) ──begin──► GENERATE_FILE
//! (GENERATE_FILE, FILE_GENERATED) ──step──► NOTIFY
//! (NOTIFY, NOTIFIED) ──end──► MARK_SAGA_COMPLETE
//! (MARK_SAGA_COMPLETE, SAGA_COMPLETED) ──finalizer──► status = COMPLETED
//! ```
//!
//! The finalizer entry is added by the builder; workflows never register it.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use common::{EventOutcome, EventType};
use saga_store::SagaRecord;
use serde::Serialize;

use crate::error::{GraphError, Result};
use crate::event::Event;

static INITIATED: EventType = EventType::INITIATED;
static MARK_SAGA_COMPLETE: EventType = EventType::MARK_SAGA_COMPLETE;

/// Composite lookup key of the transition table.
pub type TransitionKey = (EventType, EventOutcome);

/// Everything a step handler gets to see.
#[derive(Debug, Clone)]
pub struct StepContext<T> {
    /// The incoming event.
    pub event: Event,
    /// The saga as loaded before the handler runs.
    pub saga: SagaRecord,
    /// The incoming event payload, deserialized.
    pub payload: T,
    target: EventType,
}

impl<T> StepContext<T> {
    pub fn new(event: Event, saga: SagaRecord, payload: T, target: EventType) -> Self {
        Self {
            event,
            saga,
            payload,
            target,
        }
    }

    /// The step this handler executes; the type its reply must carry.
    pub fn target(&self) -> &EventType {
        &self.target
    }

    /// Builds the reply event for this step with a raw payload.
    pub fn reply(&self, outcome: EventOutcome, payload: impl Into<String>) -> Event {
        self.event.next(self.target.clone(), outcome, payload)
    }

    /// Builds the reply event for this step with a JSON payload.
    pub fn reply_with<P: Serialize>(&self, outcome: EventOutcome, payload: &P) -> Result<Event> {
        Ok(self.reply(outcome, serde_json::to_string(payload)?))
    }
}

/// Business logic bound to one transition.
///
/// A handler performs its side effect and returns the next event, whose type
/// must be the transition's target. It may run more than once for the same
/// event and must be idempotent.
#[async_trait]
pub trait StepHandler<T>: Send + Sync {
    async fn handle(&self, ctx: StepContext<T>) -> Result<Event>;
}

#[async_trait]
impl<T, F, Fut> StepHandler<T> for F
where
    T: Send + 'static,
    F: Fn(StepContext<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Event>> + Send,
{
    async fn handle(&self, ctx: StepContext<T>) -> Result<Event> {
        (self)(ctx).await
    }
}

/// What the engine does for a matched key.
pub enum TransitionKind<T> {
    /// Run a business handler that emits an event of type `target`.
    Step {
        target: EventType,
        handler: Arc<dyn StepHandler<T>>,
    },
    /// Record the event and emit `(MARK_SAGA_COMPLETE, SAGA_COMPLETED)`.
    Terminal,
    /// Mark the saga `COMPLETED`.
    Finalize,
}

impl<T> Clone for TransitionKind<T> {
    fn clone(&self) -> Self {
        match self {
            TransitionKind::Step { target, handler } => TransitionKind::Step {
                target: target.clone(),
                handler: handler.clone(),
            },
            TransitionKind::Terminal => TransitionKind::Terminal,
            TransitionKind::Finalize => TransitionKind::Finalize,
        }
    }
}

impl<T> std::fmt::Debug for TransitionKind<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionKind::Step { target, .. } => {
                f.debug_struct("Step").field("target", target).finish()
            }
            TransitionKind::Terminal => f.write_str("Terminal"),
            TransitionKind::Finalize => f.write_str("Finalize"),
        }
    }
}

/// One entry of the transition table.
#[derive(Debug, Clone)]
pub struct Transition<T> {
    key: TransitionKey,
    kind: TransitionKind<T>,
}

impl<T> Transition<T> {
    pub fn key(&self) -> &TransitionKey {
        &self.key
    }

    pub fn kind(&self) -> &TransitionKind<T> {
        &self.kind
    }

    /// The step name the saga moves to when this transition is recorded.
    pub fn target(&self) -> &EventType {
        match &self.kind {
            TransitionKind::Step { target, .. } => target,
            TransitionKind::Terminal | TransitionKind::Finalize => &MARK_SAGA_COMPLETE,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, TransitionKind::Terminal)
    }
}

/// Immutable, validated transition table of one workflow.
#[derive(Debug)]
pub struct StepGraph<T> {
    transitions: HashMap<TransitionKey, Transition<T>>,
    first_step: EventType,
}

impl<T> StepGraph<T> {
    pub fn builder() -> StepGraphBuilder<T> {
        StepGraphBuilder::new()
    }

    /// Looks up the transition for an incoming event.
    pub fn get(&self, event_type: &EventType, event_outcome: &EventOutcome) -> Option<&Transition<T>> {
        self.transitions
            .get(&(event_type.clone(), event_outcome.clone()))
    }

    /// The first business step, fired by `(INITIATED, INITIATE_SUCCESS)`.
    pub fn first_step(&self) -> &EventType {
        &self.first_step
    }

    /// Number of entries, the built-in ones included.
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TransitionKey> {
        self.transitions.keys()
    }

    /// Returns true if `keys`, in order, follow the table from the start.
    ///
    /// A saga's recorded event rows must always satisfy this.
    pub fn is_valid_path(&self, keys: &[TransitionKey]) -> bool {
        let mut expected_from = EventType::INITIATED;
        for (event_type, event_outcome) in keys {
            if *event_type != expected_from {
                return false;
            }
            match self.get(event_type, event_outcome) {
                Some(transition) => expected_from = transition.target().clone(),
                None => return false,
            }
        }
        true
    }
}

/// Fluent builder for a [`StepGraph`].
///
/// Registration never fails; every check runs in [`StepGraphBuilder::build`].
pub struct StepGraphBuilder<T> {
    entries: Vec<(TransitionKey, TransitionKind<T>)>,
    first_step: Option<EventType>,
}

impl<T> Default for StepGraphBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> StepGraphBuilder<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            first_step: None,
        }
    }

    /// Registers the handler fired by `(INITIATED, INITIATE_SUCCESS)`, which
    /// executes `first_step`.
    pub fn begin(mut self, first_step: EventType, handler: impl StepHandler<T> + 'static) -> Self {
        self.first_step.get_or_insert_with(|| first_step.clone());
        self.entries.push((
            (EventType::INITIATED, EventOutcome::INITIATE_SUCCESS),
            TransitionKind::Step {
                target: first_step,
                handler: Arc::new(handler),
            },
        ));
        self
    }

    /// Registers an interior transition: on `(from_type, from_outcome)` run
    /// `handler`, which executes step `to_type`.
    pub fn step(
        mut self,
        from_type: EventType,
        from_outcome: EventOutcome,
        to_type: EventType,
        handler: impl StepHandler<T> + 'static,
    ) -> Self {
        self.entries.push((
            (from_type, from_outcome),
            TransitionKind::Step {
                target: to_type,
                handler: Arc::new(handler),
            },
        ));
        self
    }

    /// Marks `(event_type, event_outcome)` as terminal.
    pub fn end(mut self, event_type: EventType, event_outcome: EventOutcome) -> Self {
        self.entries
            .push(((event_type, event_outcome), TransitionKind::Terminal));
        self
    }

    /// Validates the registrations and freezes them.
    ///
    /// Fails on a missing `begin`, duplicate keys, keys that use the
    /// engine's reserved names, targets nothing handles, transitions that
    /// can never fire, and cycles.
    pub fn build(self) -> std::result::Result<StepGraph<T>, GraphError> {
        let first_step = self.first_step.ok_or(GraphError::MissingBegin)?;

        let mut transitions = HashMap::with_capacity(self.entries.len() + 1);
        let mut order = Vec::with_capacity(self.entries.len());

        for (key, kind) in self.entries {
            check_reserved(&key, &kind)?;
            if transitions.contains_key(&key) {
                return Err(GraphError::DuplicateTransition {
                    event_type: key.0,
                    event_outcome: key.1,
                });
            }
            order.push(key.clone());
            transitions.insert(key.clone(), Transition { key, kind });
        }

        let finalizer = (EventType::MARK_SAGA_COMPLETE, EventOutcome::SAGA_COMPLETED);
        transitions.insert(
            finalizer.clone(),
            Transition {
                key: finalizer,
                kind: TransitionKind::Finalize,
            },
        );

        let sources: BTreeSet<&EventType> = transitions.keys().map(|(t, _)| t).collect();
        for key in &order {
            if let TransitionKind::Step { target, .. } = &transitions[key].kind
                && !sources.contains(target)
            {
                return Err(GraphError::DanglingTarget {
                    event_type: key.0.clone(),
                    event_outcome: key.1.clone(),
                    target: target.clone(),
                });
            }
        }

        // Step-level edges: from_type -> target.
        let mut edges: BTreeMap<&EventType, BTreeSet<&EventType>> = BTreeMap::new();
        for key in &order {
            edges
                .entry(&key.0)
                .or_default()
                .insert(transitions[key].target());
        }

        let mut reachable: BTreeSet<&EventType> = BTreeSet::new();
        let mut queue = VecDeque::from([&INITIATED]);
        while let Some(step) = queue.pop_front() {
            if reachable.insert(step)
                && let Some(next) = edges.get(step)
            {
                queue.extend(next.iter().copied());
            }
        }
        for key in &order {
            if !reachable.contains(&key.0) {
                return Err(GraphError::UnreachableTransition {
                    event_type: key.0.clone(),
                    event_outcome: key.1.clone(),
                });
            }
        }

        if let Some(step) = find_cycle(&edges) {
            return Err(GraphError::Cycle(step.clone()));
        }

        Ok(StepGraph {
            transitions,
            first_step,
        })
    }
}

fn check_reserved<T>(key: &TransitionKey, kind: &TransitionKind<T>) -> std::result::Result<(), GraphError> {
    let is_begin = key.0 == EventType::INITIATED && key.1 == EventOutcome::INITIATE_SUCCESS;
    let reserved_source = (key.0 == EventType::INITIATED && !is_begin)
        || key.0 == EventType::MARK_SAGA_COMPLETE;
    let reserved_target = match kind {
        TransitionKind::Step { target, .. } => {
            *target == EventType::INITIATED || *target == EventType::MARK_SAGA_COMPLETE
        }
        TransitionKind::Terminal => is_begin,
        TransitionKind::Finalize => true,
    };

    if reserved_source || reserved_target {
        return Err(GraphError::ReservedKey {
            event_type: key.0.clone(),
            event_outcome: key.1.clone(),
        });
    }
    Ok(())
}

/// Depth-first search for a step that can reach itself.
fn find_cycle<'a>(edges: &BTreeMap<&'a EventType, BTreeSet<&'a EventType>>) -> Option<&'a EventType> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        step: &'a EventType,
        edges: &BTreeMap<&'a EventType, BTreeSet<&'a EventType>>,
        marks: &mut HashMap<&'a EventType, Mark>,
    ) -> Option<&'a EventType> {
        match marks.get(step) {
            Some(Mark::Visiting) => return Some(step),
            Some(Mark::Done) => return None,
            None => {}
        }
        marks.insert(step, Mark::Visiting);
        if let Some(next) = edges.get(step) {
            for &n in next {
                if let Some(found) = visit(n, edges, marks) {
                    return Some(found);
                }
            }
        }
        marks.insert(step, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    for &step in edges.keys() {
        if let Some(found) = visit(step, edges, &mut marks) {
            return Some(found);
        }
    }
    None
}
