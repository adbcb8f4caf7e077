//! Durable message channel on a PostgreSQL table.
//!
//! Consumers claim one message at a time with `FOR UPDATE SKIP LOCKED`, so
//! any number of workers can poll the same topic. A claimed message stays
//! invisible until its lock expires; a consumer that dies mid-step therefore
//! gets its message redelivered to someone else. A lock that expires on the
//! last allowed attempt dead-letters the message instead.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use super::{Acknowledger, Delivery, DeliveryStream, MessageChannel};
use crate::error::ChannelError;
use crate::event::Event;
use crate::retry::RetryPolicy;

/// Polling and redelivery settings for [`PostgresChannel`].
#[derive(Debug, Clone)]
pub struct PostgresChannelConfig {
    /// Pause between polls when a topic is empty.
    pub poll_interval: Duration,
    /// How long a claimed message stays invisible to other consumers.
    pub visibility_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PostgresChannelConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            visibility_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Message channel backed by the `saga_messages` table.
#[derive(Debug, Clone)]
pub struct PostgresChannel {
    pool: PgPool,
    config: PostgresChannelConfig,
}

impl PostgresChannel {
    pub fn new(pool: PgPool, config: PostgresChannelConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Number of dead-lettered messages on a topic.
    pub async fn dead_letter_count(&self, topic: &str) -> Result<i64, ChannelError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM saga_messages WHERE topic = $1 AND status = 'DEAD'",
        )
        .bind(topic)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Number of messages on a topic that are waiting or being processed.
    pub async fn pending_count(&self, topic: &str) -> Result<i64, ChannelError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM saga_messages WHERE topic = $1 AND status IN ('PENDING', 'INFLIGHT')",
        )
        .bind(topic)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Claims the next due message on `topic`, if any.
    async fn claim(&self, topic: &str) -> Result<Option<(i64, i32, serde_json::Value)>, ChannelError> {
        let row = sqlx::query(
            r#"
            UPDATE saga_messages
            SET status = 'INFLIGHT',
                attempts = attempts + 1,
                locked_until = NOW() + make_interval(secs => $2)
            WHERE id = (
                SELECT id
                FROM saga_messages
                WHERE topic = $1
                  AND ((status = 'PENDING' AND available_at <= NOW())
                       OR (status = 'INFLIGHT' AND locked_until < NOW()))
                ORDER BY available_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, attempts, payload
            "#,
        )
        .bind(topic)
        .bind(self.config.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some((
                row.try_get("id")?,
                row.try_get("attempts")?,
                row.try_get::<Json<serde_json::Value>, _>("payload")?.0,
            ))),
            None => Ok(None),
        }
    }

    async fn next_delivery(&self, topic: &str) -> Delivery {
        loop {
            match self.claim(topic).await {
                Ok(Some((id, attempts, payload))) => {
                    let attempt = attempts.max(1) as u32;
                    let acker = PgAck {
                        pool: self.pool.clone(),
                        id,
                        attempt,
                        retry: self.config.retry.clone(),
                        topic: topic.to_string(),
                    };

                    if attempt > self.config.retry.max_attempts {
                        let reason = format!(
                            "lock expired after {} attempts",
                            self.config.retry.max_attempts
                        );
                        if let Err(e) = acker.dead_letter(&reason).await {
                            tracing::warn!(topic, error = %e, "failed to dead-letter message");
                        }
                        continue;
                    }

                    match serde_json::from_value::<Event>(payload) {
                        Ok(event) => return Delivery::new(event, attempt, acker),
                        Err(e) => {
                            // Undecodable messages never become valid.
                            if let Err(e) = Box::new(acker).reject(&e.to_string()).await {
                                tracing::warn!(topic, error = %e, "failed to dead-letter message");
                            }
                        }
                    }
                }
                Ok(None) => tokio::time::sleep(self.config.poll_interval).await,
                Err(e) => {
                    tracing::warn!(topic, error = %e, "failed to poll saga messages");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }
}

#[async_trait]
impl MessageChannel for PostgresChannel {
    async fn publish(&self, topic: &str, event: &Event) -> Result<(), ChannelError> {
        sqlx::query("INSERT INTO saga_messages (topic, payload) VALUES ($1, $2)")
            .bind(topic)
            .bind(Json(event))
            .execute(&self.pool)
            .await
            .map_err(|e| ChannelError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<DeliveryStream, ChannelError> {
        let stream = futures_util::stream::unfold(
            (self.clone(), topic.to_string()),
            |(channel, topic)| async move {
                let delivery = channel.next_delivery(&topic).await;
                Some((delivery, (channel, topic)))
            },
        );
        Ok(Box::pin(stream))
    }

    async fn purge_dead_letters(&self, older_than: Duration) -> Result<u64, ChannelError> {
        let result = sqlx::query(
            r#"
            DELETE FROM saga_messages
            WHERE status = 'DEAD'
              AND dead_at <= NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!(purged, "dead-lettered messages purged");
        }
        Ok(purged)
    }
}

struct PgAck {
    pool: PgPool,
    id: i64,
    attempt: u32,
    retry: RetryPolicy,
    topic: String,
}

impl PgAck {
    async fn dead_letter(&self, reason: &str) -> Result<(), ChannelError> {
        sqlx::query(
            r#"
            UPDATE saga_messages
            SET status = 'DEAD', locked_until = NULL, last_error = $2, dead_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| ChannelError::Acknowledge(e.to_string()))?;

        tracing::error!(
            topic = %self.topic,
            message_id = self.id,
            attempts = self.attempt,
            reason,
            "message dead-lettered"
        );
        metrics::counter!("saga_channel_dead_letters_total", "topic" => self.topic.clone())
            .increment(1);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for PgAck {
    async fn ack(self: Box<Self>) -> Result<(), ChannelError> {
        sqlx::query("DELETE FROM saga_messages WHERE id = $1")
            .bind(self.id)
            .execute(&self.pool)
            .await
            .map_err(|e| ChannelError::Acknowledge(e.to_string()))?;
        Ok(())
    }

    async fn nack(self: Box<Self>, reason: &str) -> Result<(), ChannelError> {
        if !self.retry.can_retry(self.attempt) {
            return self.dead_letter(reason).await;
        }

        let delay = self.retry.delay_for(self.attempt);
        sqlx::query(
            r#"
            UPDATE saga_messages
            SET status = 'PENDING',
                locked_until = NULL,
                available_at = NOW() + make_interval(secs => $2),
                last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(self.id)
        .bind(delay.as_secs_f64())
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| ChannelError::Acknowledge(e.to_string()))?;

        tracing::debug!(
            topic = %self.topic,
            message_id = self.id,
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "redelivery scheduled"
        );
        Ok(())
    }

    async fn reject(self: Box<Self>, reason: &str) -> Result<(), ChannelError> {
        self.dead_letter(reason).await
    }
}
