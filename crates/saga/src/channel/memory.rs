//! In-process message channel for tests and single-node deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::{Acknowledger, Delivery, DeliveryStream, MessageChannel};
use crate::error::ChannelError;
use crate::event::Event;
use crate::retry::RetryPolicy;

/// Published events and dead letters kept for inspection, per channel.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// A message that used up its attempts or was rejected.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub topic: String,
    pub event: Event,
    pub attempts: u32,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Queued {
    event: Event,
    attempts: u32,
}

#[derive(Debug, Default)]
struct TopicQueue {
    ready: VecDeque<Queued>,
    in_flight: usize,
    scheduled: usize,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct ChannelState {
    topics: HashMap<String, TopicQueue>,
    published: VecDeque<(String, Event)>,
    dead_letters: VecDeque<DeadLetter>,
    closed: bool,
    fail_on_publish: bool,
}

fn push_bounded<T>(log: &mut VecDeque<T>, limit: usize, item: T) {
    if limit == 0 {
        return;
    }
    while log.len() >= limit {
        log.pop_front();
    }
    log.push_back(item);
}

/// In-memory channel with the same at-least-once contract as the broker.
///
/// Keeps the most recent published events and dead letters, up to the
/// history limit, so tests and operators can inspect them.
#[derive(Debug, Clone)]
pub struct InMemoryChannel {
    state: Arc<Mutex<ChannelState>>,
    retry: RetryPolicy,
    history_limit: usize,
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }
}

impl InMemoryChannel {
    /// Creates a channel with the default redelivery policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a channel that redelivers according to `retry`.
    pub fn with_retry_policy(retry: RetryPolicy) -> Self {
        Self {
            state: Arc::default(),
            retry,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Keeps at most `limit` published events and `limit` dead letters;
    /// older entries are dropped first. Zero disables the history.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configures the channel to fail every publish.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.lock().fail_on_publish = fail;
    }

    /// Recent events published to `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<Event> {
        self.lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.iter().cloned().collect()
    }

    /// Returns true if `topic` has nothing queued, in flight or waiting for
    /// redelivery.
    pub fn is_idle(&self, topic: &str) -> bool {
        self.lock()
            .topics
            .get(topic)
            .is_none_or(|q| q.ready.is_empty() && q.in_flight == 0 && q.scheduled == 0)
    }

    /// Ends every subscription once its queue is drained and rejects
    /// further publishes.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        for queue in state.topics.values() {
            queue.notify.notify_waiters();
        }
    }

    fn dead_letter(&self, state: &mut ChannelState, topic: &str, event: Event, attempts: u32, reason: &str) {
        tracing::error!(
            topic,
            saga_id = %event.saga_id(),
            event_type = %event.event_type(),
            attempts,
            reason,
            "message dead-lettered"
        );
        metrics::counter!("saga_channel_dead_letters_total", "topic" => topic.to_string())
            .increment(1);
        push_bounded(
            &mut state.dead_letters,
            self.history_limit,
            DeadLetter {
                topic: topic.to_string(),
                event,
                attempts,
                reason: reason.to_string(),
                dead_at: Utc::now(),
            },
        );
    }

    async fn next_delivery(&self, topic: &str, notify: &Notify) -> Option<Delivery> {
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                let closed = state.closed;
                let queue = state.topics.entry(topic.to_string()).or_default();

                if let Some(queued) = queue.ready.pop_front() {
                    queue.in_flight += 1;
                    let attempt = queued.attempts + 1;
                    let acker = InMemoryAck {
                        channel: self.clone(),
                        topic: topic.to_string(),
                        event: queued.event.clone(),
                        attempt,
                        settled: false,
                    };
                    return Some(Delivery::new(queued.event, attempt, acker));
                }
                if closed {
                    return None;
                }
            }

            notified.await;
        }
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    async fn publish(&self, topic: &str, event: &Event) -> Result<(), ChannelError> {
        let mut state = self.lock();

        if state.closed {
            return Err(ChannelError::Closed);
        }
        if state.fail_on_publish {
            return Err(ChannelError::Publish {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }

        let limit = self.history_limit;
        push_bounded(&mut state.published, limit, (topic.to_string(), event.clone()));
        let queue = state.topics.entry(topic.to_string()).or_default();
        queue.ready.push_back(Queued {
            event: event.clone(),
            attempts: 0,
        });
        queue.notify.notify_one();
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<DeliveryStream, ChannelError> {
        let notify = {
            let mut state = self.lock();
            if state.closed {
                return Err(ChannelError::Closed);
            }
            state.topics.entry(topic.to_string()).or_default().notify.clone()
        };

        let stream = futures_util::stream::unfold(
            (self.clone(), topic.to_string(), notify),
            |(channel, topic, notify)| async move {
                let delivery = channel.next_delivery(&topic, &notify).await?;
                Some((delivery, (channel, topic, notify)))
            },
        );
        Ok(Box::pin(stream))
    }

    async fn purge_dead_letters(&self, older_than: Duration) -> Result<u64, ChannelError> {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let mut state = self.lock();
        let before = state.dead_letters.len();
        state.dead_letters.retain(|dead| dead.dead_at > cutoff);
        Ok((before - state.dead_letters.len()) as u64)
    }
}

struct InMemoryAck {
    channel: InMemoryChannel,
    topic: String,
    event: Event,
    attempt: u32,
    settled: bool,
}

impl InMemoryAck {
    fn settle(&self, state: &mut ChannelState) {
        if let Some(queue) = state.topics.get_mut(&self.topic) {
            queue.in_flight = queue.in_flight.saturating_sub(1);
        }
    }
}

/// A delivery dropped without being settled, e.g. because its handler
/// panicked, goes straight back to the queue. On its last attempt it is
/// dead-lettered instead.
impl Drop for InMemoryAck {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let mut state = self.channel.lock();
        self.settle(&mut state);

        if !self.channel.retry.can_retry(self.attempt) {
            self.channel.dead_letter(
                &mut state,
                &self.topic,
                self.event.clone(),
                self.attempt,
                "delivery dropped without being settled",
            );
            return;
        }

        tracing::warn!(
            topic = %self.topic,
            saga_id = %self.event.saga_id(),
            attempt = self.attempt,
            "delivery dropped without being settled, requeued"
        );
        if state.closed {
            return;
        }
        let queue = state.topics.entry(self.topic.clone()).or_default();
        queue.ready.push_back(Queued {
            event: self.event.clone(),
            attempts: self.attempt,
        });
        queue.notify.notify_one();
    }
}

#[async_trait]
impl Acknowledger for InMemoryAck {
    async fn ack(mut self: Box<Self>) -> Result<(), ChannelError> {
        self.settled = true;
        let mut state = self.channel.lock();
        self.settle(&mut state);
        Ok(())
    }

    async fn nack(mut self: Box<Self>, reason: &str) -> Result<(), ChannelError> {
        self.settled = true;
        let retry = &self.channel.retry;

        if !retry.can_retry(self.attempt) {
            let mut state = self.channel.lock();
            self.settle(&mut state);
            self.channel
                .dead_letter(&mut state, &self.topic, self.event.clone(), self.attempt, reason);
            return Ok(());
        }

        let delay = retry.delay_for(self.attempt);
        {
            let mut state = self.channel.lock();
            self.settle(&mut state);
            state.topics.entry(self.topic.clone()).or_default().scheduled += 1;
        }

        tracing::debug!(
            topic = %self.topic,
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "redelivery scheduled"
        );

        let channel = self.channel.clone();
        let topic = self.topic.clone();
        let event = self.event.clone();
        let attempt = self.attempt;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = channel.lock();
            let closed = state.closed;
            let queue = state.topics.entry(topic).or_default();
            queue.scheduled = queue.scheduled.saturating_sub(1);
            if !closed {
                queue.ready.push_back(Queued {
                    event,
                    attempts: attempt,
                });
                queue.notify.notify_one();
            }
        });

        Ok(())
    }

    async fn reject(mut self: Box<Self>, reason: &str) -> Result<(), ChannelError> {
        self.settled = true;
        let mut state = self.channel.lock();
        self.settle(&mut state);
        self.channel
            .dead_letter(&mut state, &self.topic, self.event.clone(), self.attempt, reason);
        Ok(())
    }
}
