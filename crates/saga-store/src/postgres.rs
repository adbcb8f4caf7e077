use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventOutcome, EventType, SagaId};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CorrelationIds, NewSaga, Result, SagaEventState, SagaQuery, SagaRecord, SagaStatus,
    StoreError,
    store::{Advanced, SagaAdvance, SagaStore, validate_advance, validate_status_change},
};

const SAGA_COLUMNS: &str = "saga_id, saga_name, saga_state, status, payload, retry_count, \
     correlation_ids, create_user, create_date, update_user, update_date";

const EVENT_COLUMNS: &str = "id, saga_id, saga_event_state, saga_event_outcome, \
     saga_step_number, payload, create_date";

/// PostgreSQL-backed saga store implementation.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_saga(row: PgRow) -> Result<SagaRecord> {
        let saga_state: Option<String> = row.try_get("saga_state")?;
        let saga_state = saga_state
            .map(EventType::parse)
            .transpose()
            .map_err(|e| StoreError::InvalidRow(e.to_string()))?;

        let status: String = row.try_get("status")?;
        let status = status.parse::<SagaStatus>().map_err(StoreError::InvalidRow)?;

        let correlation_ids: Json<CorrelationIds> = row.try_get("correlation_ids")?;

        Ok(SagaRecord {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            saga_name: row.try_get("saga_name")?,
            saga_state,
            status,
            payload: row.try_get("payload")?,
            retry_count: row.try_get("retry_count")?,
            correlation_ids: correlation_ids.0,
            create_user: row.try_get("create_user")?,
            create_date: row.try_get("create_date")?,
            update_user: row.try_get("update_user")?,
            update_date: row.try_get("update_date")?,
        })
    }

    fn row_to_event_state(row: PgRow) -> Result<SagaEventState> {
        let event_type: String = row.try_get("saga_event_state")?;
        let event_outcome: String = row.try_get("saga_event_outcome")?;

        Ok(SagaEventState {
            id: row.try_get("id")?,
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            saga_event_state: EventType::parse(event_type)
                .map_err(|e| StoreError::InvalidRow(e.to_string()))?,
            saga_event_outcome: EventOutcome::parse(event_outcome)
                .map_err(|e| StoreError::InvalidRow(e.to_string()))?,
            saga_step_number: row.try_get("saga_step_number")?,
            payload: row.try_get("payload")?,
            create_date: row.try_get::<DateTime<Utc>, _>("create_date")?,
        })
    }

    /// Loads a saga inside a transaction, locking its row until commit.
    async fn lock_saga(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        saga_id: SagaId,
    ) -> Result<SagaRecord> {
        let row: Option<PgRow> = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM saga WHERE saga_id = $1 FOR UPDATE"
        ))
        .bind(saga_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?;

        match row {
            Some(row) => Self::row_to_saga(row),
            None => Err(StoreError::SagaNotFound(saga_id)),
        }
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn insert_saga(&self, saga: NewSaga) -> Result<SagaRecord> {
        let saga_id = saga.saga_id;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO saga (saga_id, saga_name, saga_state, status, payload, retry_count,
                              correlation_ids, create_user, create_date, update_user, update_date)
            VALUES ($1, $2, NULL, $3, $4, 0, $5, $6, NOW(), $6, NOW())
            RETURNING {SAGA_COLUMNS}
            "#
        ))
        .bind(saga_id.as_uuid())
        .bind(&saga.saga_name)
        .bind(SagaStatus::InProgress.as_str())
        .bind(&saga.payload)
        .bind(Json(&saga.correlation_ids))
        .bind(&saga.create_user)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("saga_pkey")
            {
                return StoreError::SagaAlreadyExists(saga_id);
            }
            StoreError::Database(e)
        })?;

        Self::row_to_saga(row)
    }

    async fn get_saga(&self, saga_id: SagaId) -> Result<Option<SagaRecord>> {
        let row: Option<PgRow> = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM saga WHERE saga_id = $1"
        ))
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    #[tracing::instrument(skip(self, advance), fields(saga_id = %advance.saga_id, next_state = %advance.next_state))]
    async fn append_event_and_advance(&self, advance: SagaAdvance) -> Result<Advanced> {
        let mut tx = self.pool.begin().await?;

        let current = Self::lock_saga(&mut tx, advance.saga_id).await?;
        validate_advance(&current, &advance)?;

        let step_number: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(saga_step_number), 0) + 1 FROM saga_event_states WHERE saga_id = $1",
        )
        .bind(advance.saga_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        let event_row = sqlx::query(&format!(
            r#"
            INSERT INTO saga_event_states (id, saga_id, saga_event_state, saga_event_outcome,
                                           saga_step_number, payload, create_date)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(advance.saga_id.as_uuid())
        .bind(advance.event.event_type.as_str())
        .bind(advance.event.event_outcome.as_str())
        .bind(step_number)
        .bind(&advance.event.payload)
        .fetch_one(&mut *tx)
        .await?;

        let saga_row = sqlx::query(&format!(
            r#"
            UPDATE saga
            SET saga_state = $2, status = $3, update_user = $4, update_date = NOW()
            WHERE saga_id = $1
            RETURNING {SAGA_COLUMNS}
            "#
        ))
        .bind(advance.saga_id.as_uuid())
        .bind(advance.next_state.as_str())
        .bind(advance.status.as_str())
        .bind(&advance.update_user)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(step_number, "event state appended");

        Ok(Advanced {
            saga: Self::row_to_saga(saga_row)?,
            event_state: Self::row_to_event_state(event_row)?,
        })
    }

    async fn get_event_states(&self, saga_id: SagaId) -> Result<Vec<SagaEventState>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM saga_event_states
            WHERE saga_id = $1
            ORDER BY saga_step_number ASC
            "#
        ))
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event_state).collect()
    }

    async fn query_sagas(&self, query: SagaQuery) -> Result<Vec<SagaRecord>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {SAGA_COLUMNS} FROM saga WHERE 1=1"));

        if let Some(name) = query.saga_name {
            builder.push(" AND saga_name = ").push_bind(name);
        }
        if let Some(statuses) = query.statuses {
            let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            builder.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some((key, value)) = query.correlation {
            builder
                .push(" AND correlation_ids @> ")
                .push_bind(Json(CorrelationIds::new().with(key, value)));
        }
        if let Some(before) = query.updated_before {
            builder.push(" AND update_date < ").push_bind(before);
        }
        if let Some(before) = query.created_before {
            builder.push(" AND create_date < ").push_bind(before);
        }
        if let Some(count) = query.retry_count_below {
            builder.push(" AND retry_count < ").push_bind(count);
        }
        if let Some(count) = query.retry_count_at_least {
            builder.push(" AND retry_count >= ").push_bind(count);
        }

        builder.push(" ORDER BY create_date ASC, saga_id ASC");

        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_saga).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn set_status(
        &self,
        saga_id: SagaId,
        status: SagaStatus,
        update_user: &str,
    ) -> Result<SagaRecord> {
        let mut tx = self.pool.begin().await?;

        let current = Self::lock_saga(&mut tx, saga_id).await?;
        validate_status_change(&current, status)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE saga
            SET status = $2, update_user = $3, update_date = NOW()
            WHERE saga_id = $1
            RETURNING {SAGA_COLUMNS}
            "#
        ))
        .bind(saga_id.as_uuid())
        .bind(status.as_str())
        .bind(update_user)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Self::row_to_saga(row)
    }

    async fn increment_retry_count(
        &self,
        saga_id: SagaId,
        update_user: &str,
    ) -> Result<SagaRecord> {
        let row: Option<PgRow> = sqlx::query(&format!(
            r#"
            UPDATE saga
            SET retry_count = retry_count + 1, update_user = $2, update_date = NOW()
            WHERE saga_id = $1
            RETURNING {SAGA_COLUMNS}
            "#
        ))
        .bind(saga_id.as_uuid())
        .bind(update_user)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_saga(row),
            None => Err(StoreError::SagaNotFound(saga_id)),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        // Event rows go with their saga through ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM saga WHERE create_date < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
