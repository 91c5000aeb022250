//! PostgreSQL store.
//!
//! Writers lock the instance row first (`FOR UPDATE`), so all changes to an
//! instance, its steps and its events are serialized per instance. Claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never block on each other.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use keel_core::error::{KeelError, Result};
use keel_core::store::{ClaimedStep, Effect, EventStore, StepChange, Transition, WorkflowRepository};
use keel_core::workflow::{
    Event, EventDraft, InstanceSnapshot, StepId, StepRecord, WorkflowError, WorkflowInstance,
};

use super::memory::lease_duration;

const INSTANCE_COLUMNS: &str = "id, workflow_type, status, input, output, error_class, \
     error_message, version, created_at, completed_at";

const STEP_COLUMNS: &str = "instance_id, seq, kind, name, status, attempts, input, output, \
     error_class, error_message, next_eligible_at, wake_at, awaits, detached, claimed_by, \
     claim_token, claim_expires_at, started_at, completed_at";

const EVENT_COLUMNS: &str =
    "instance_id, sequence, step_seq, category, status, name, started_at, ended_at, summary";

/// Eligible step predicate, for a step table aliased `s`.
const ELIGIBLE: &str = "((s.status = 'ready' AND s.next_eligible_at <= NOW()) \
     OR (s.status = 'running' AND s.claim_expires_at <= NOW()))";

/// Live claim predicate, for a step table aliased `s`.
const LIVE_CLAIM: &str = "(s.status = 'running' AND s.claim_expires_at > NOW())";

/// Store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn error_from_columns(class: Option<String>, message: Option<String>) -> Option<WorkflowError> {
    class.map(|class| WorkflowError::new(class, message.unwrap_or_default()))
}

fn instance_from_row(row: &PgRow) -> Result<WorkflowInstance> {
    Ok(WorkflowInstance {
        id: row.try_get("id")?,
        workflow_type: row.try_get("workflow_type")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        input: row.try_get("input")?,
        output: row.try_get("output")?,
        error: error_from_columns(row.try_get("error_class")?, row.try_get("error_message")?),
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn step_from_row(row: &PgRow) -> Result<StepRecord> {
    Ok(StepRecord {
        instance_id: row.try_get("instance_id")?,
        seq: row.try_get("seq")?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        name: row.try_get("name")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        attempts: row.try_get("attempts")?,
        input: row.try_get("input")?,
        output: row.try_get("output")?,
        error: error_from_columns(row.try_get("error_class")?, row.try_get("error_message")?),
        next_eligible_at: row.try_get("next_eligible_at")?,
        wake_at: row.try_get("wake_at")?,
        awaits: row.try_get("awaits")?,
        detached: row.try_get("detached")?,
        claimed_by: row.try_get("claimed_by")?,
        claim_token: row.try_get("claim_token")?,
        claim_expires_at: row.try_get("claim_expires_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<Event> {
    Ok(Event {
        instance_id: row.try_get("instance_id")?,
        sequence: row.try_get("sequence")?,
        step_seq: row.try_get("step_seq")?,
        category: row.try_get::<String, _>("category")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        name: row.try_get("name")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        summary: row.try_get("summary")?,
    })
}

/// Map constraint violations onto the store's error taxonomy.
fn map_write_error(err: sqlx::Error, what: impl FnOnce() -> String) -> KeelError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return KeelError::Conflict(format!("{} already exists", what()));
        }
        if db.is_foreign_key_violation() {
            return KeelError::NotFound(what());
        }
    }
    KeelError::Sql(err)
}

async fn insert_step(tx: &mut Transaction<'_, Postgres>, step: &StepRecord) -> Result<()> {
    let sql = format!(
        "INSERT INTO keel_steps ({}) VALUES \
         ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)",
        STEP_COLUMNS
    );
    sqlx::query(&sql)
        .bind(step.instance_id)
        .bind(step.seq)
        .bind(step.kind.as_str())
        .bind(&step.name)
        .bind(step.status.as_str())
        .bind(step.attempts)
        .bind(&step.input)
        .bind(&step.output)
        .bind(step.error.as_ref().map(|e| e.class.as_str()))
        .bind(step.error.as_ref().map(|e| e.message.as_str()))
        .bind(step.next_eligible_at)
        .bind(step.wake_at)
        .bind(step.awaits)
        .bind(step.detached)
        .bind(&step.claimed_by)
        .bind(step.claim_token)
        .bind(step.claim_expires_at)
        .bind(step.started_at)
        .bind(step.completed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_write_error(e, || format!("step {}", step.id())))?;
    Ok(())
}

/// Insert an event with the next sequence of its instance. The caller holds
/// the instance row lock, which serializes sequence assignment.
async fn insert_event_draft(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: Uuid,
    draft: &EventDraft,
) -> Result<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO keel_events
            (instance_id, sequence, step_seq, category, status, name, started_at, ended_at, summary)
        SELECT $1, COALESCE(MAX(sequence), 0) + 1, $2, $3, $4, $5, $6, $7, $8
        FROM keel_events
        WHERE instance_id = $1
        RETURNING sequence
        "#,
    )
    .bind(instance_id)
    .bind(draft.step_seq)
    .bind(draft.category.as_str())
    .bind(draft.status.as_str())
    .bind(&draft.name)
    .bind(draft.started_at)
    .bind(draft.ended_at)
    .bind(&draft.summary)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_write_error(e, || format!("event of {}", instance_id)))?;
    Ok(row.try_get("sequence")?)
}

async fn apply_step_change(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: Uuid,
    change: &StepChange,
) -> Result<()> {
    let update = &change.update;
    let result = sqlx::query(
        r#"
        UPDATE keel_steps
        SET
            status = $3,
            attempts = $4,
            input = COALESCE($5, input),
            output = $6,
            error_class = $7,
            error_message = $8,
            next_eligible_at = COALESCE($9, next_eligible_at),
            completed_at = $10,
            claimed_by = NULL,
            claim_token = NULL,
            claim_expires_at = NULL
        WHERE instance_id = $1 AND seq = $2
        "#,
    )
    .bind(instance_id)
    .bind(change.seq)
    .bind(update.status.as_str())
    .bind(update.attempts)
    .bind(&update.input)
    .bind(&update.output)
    .bind(update.error.as_ref().map(|e| e.class.as_str()))
    .bind(update.error.as_ref().map(|e| e.message.as_str()))
    .bind(update.next_eligible_at)
    .bind(update.completed_at)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(KeelError::NotFound(format!(
            "step {}",
            StepId::new(instance_id, change.seq)
        )));
    }
    Ok(())
}

async fn cancel_open_steps(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: Uuid,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE keel_steps
        SET status = 'cancelled', completed_at = $2,
            claimed_by = NULL, claim_token = NULL, claim_expires_at = NULL
        WHERE instance_id = $1
          AND (status IN ('pending', 'ready')
               OR (status = 'running' AND claim_expires_at <= NOW()))
        "#,
    )
    .bind(instance_id)
    .bind(at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn apply_effect(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: Uuid,
    effect: &Effect,
) -> Result<()> {
    match effect {
        Effect::InsertStep(step) => insert_step(tx, step).await?,
        Effect::MarkReady { seq, input, at } => {
            let result = sqlx::query(
                r#"
                UPDATE keel_steps
                SET status = 'ready', next_eligible_at = $3, input = COALESCE($4, input)
                WHERE instance_id = $1 AND seq = $2 AND status = 'pending'
                "#,
            )
            .bind(instance_id)
            .bind(*seq)
            .bind(*at)
            .bind(input)
            .execute(&mut **tx)
            .await?;
            if result.rows_affected() == 0 {
                tracing::debug!(%instance_id, step = *seq, "Step was not pending, left as is");
            }
        }
        Effect::CompleteInstance { output, at } => {
            sqlx::query(
                r#"
                UPDATE keel_instances
                SET status = 'completed', output = $2, completed_at = $3
                WHERE id = $1
                "#,
            )
            .bind(instance_id)
            .bind(output)
            .bind(*at)
            .execute(&mut **tx)
            .await?;
        }
        Effect::FailInstance { error, at } => {
            sqlx::query(
                r#"
                UPDATE keel_instances
                SET status = 'failed', error_class = $2, error_message = $3, completed_at = $4
                WHERE id = $1
                "#,
            )
            .bind(instance_id)
            .bind(&error.class)
            .bind(&error.message)
            .bind(*at)
            .execute(&mut **tx)
            .await?;
            cancel_open_steps(tx, instance_id, *at).await?;
        }
        Effect::CancelInstance { at } => {
            sqlx::query(
                r#"
                UPDATE keel_instances
                SET status = 'cancelled', completed_at = $2
                WHERE id = $1
                "#,
            )
            .bind(instance_id)
            .bind(*at)
            .execute(&mut **tx)
            .await?;
            cancel_open_steps(tx, instance_id, *at).await?;
        }
        Effect::AppendEvent(draft) => {
            insert_event_draft(tx, instance_id, draft).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl EventStore for PgStore {
    async fn append(&self, event: &Event) -> Result<()> {
        let sql = format!(
            "INSERT INTO keel_events ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            EVENT_COLUMNS
        );
        sqlx::query(&sql)
            .bind(event.instance_id)
            .bind(event.sequence)
            .bind(event.step_seq)
            .bind(event.category.as_str())
            .bind(event.status.as_str())
            .bind(&event.name)
            .bind(event.started_at)
            .bind(event.ended_at)
            .bind(&event.summary)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_write_error(e, || {
                    format!("event {} of {}", event.sequence, event.instance_id)
                })
            })?;
        Ok(())
    }

    fn stream_for(&self, instance_id: Uuid) -> BoxStream<'_, Result<Event>> {
        sqlx::query(
            r#"
            SELECT instance_id, sequence, step_seq, category, status, name,
                   started_at, ended_at, summary
            FROM keel_events
            WHERE instance_id = $1
            ORDER BY started_at ASC, sequence ASC
            "#,
        )
        .bind(instance_id)
        .fetch(&self.pool)
        .map(|row| row.map_err(KeelError::from).and_then(|row| event_from_row(&row)))
        .boxed()
    }
}

#[async_trait]
impl WorkflowRepository for PgStore {
    async fn create(
        &self,
        instance: &WorkflowInstance,
        steps: &[StepRecord],
        started: EventDraft,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO keel_instances
                (id, workflow_type, status, input, output, error_class, error_message,
                 version, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(instance.id)
        .bind(&instance.workflow_type)
        .bind(instance.status.as_str())
        .bind(&instance.input)
        .bind(&instance.output)
        .bind(instance.error.as_ref().map(|e| e.class.as_str()))
        .bind(instance.error.as_ref().map(|e| e.message.as_str()))
        .bind(instance.version)
        .bind(instance.created_at)
        .bind(instance.completed_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(KeelError::Duplicate(format!(
                "workflow instance {}",
                instance.id
            )));
        }

        for step in steps {
            insert_step(&mut tx, step).await?;
        }
        insert_event_draft(&mut tx, instance.id, &started).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn transition(&self, transition: Transition) -> Result<i64> {
        let id = transition.instance_id;
        let mut tx = self.pool.begin().await?;

        let version: i64 = sqlx::query("SELECT version FROM keel_instances WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| KeelError::NotFound(format!("workflow instance {}", id)))?
            .try_get("version")?;

        if let Some(StepChange {
            seq,
            claim_token: Some(token),
            ..
        }) = &transition.step
        {
            let held = sqlx::query(
                r#"
                SELECT 1 FROM keel_steps
                WHERE instance_id = $1 AND seq = $2
                  AND status = 'running'
                  AND claim_token = $3
                  AND claim_expires_at > NOW()
                "#,
            )
            .bind(id)
            .bind(*seq)
            .bind(*token)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
            if !held {
                return Err(KeelError::LeaseLost {
                    step: StepId::new(id, *seq),
                });
            }
        }

        if version != transition.expected_version {
            return Err(KeelError::VersionConflict {
                expected: transition.expected_version,
                actual: version,
            });
        }

        if let Some(change) = &transition.step {
            apply_step_change(&mut tx, id, change).await?;
        }
        for effect in &transition.effects {
            apply_effect(&mut tx, id, effect).await?;
        }

        let new_version: i64 =
            sqlx::query("UPDATE keel_instances SET version = version + 1 WHERE id = $1 RETURNING version")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?
                .try_get("version")?;

        tx.commit().await?;
        Ok(new_version)
    }

    async fn load_instance(&self, id: Uuid) -> Result<WorkflowInstance> {
        let sql = format!("SELECT {} FROM keel_instances WHERE id = $1", INSTANCE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| KeelError::NotFound(format!("workflow instance {}", id)))?;
        instance_from_row(&row)
    }

    async fn load_snapshot(&self, id: Uuid) -> Result<InstanceSnapshot> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let sql = format!("SELECT {} FROM keel_instances WHERE id = $1", INSTANCE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| KeelError::NotFound(format!("workflow instance {}", id)))?;
        let instance = instance_from_row(&row)?;

        let sql = format!(
            "SELECT {} FROM keel_steps WHERE instance_id = $1 ORDER BY seq",
            STEP_COLUMNS
        );
        let steps = sqlx::query(&sql)
            .bind(id)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(step_from_row)
            .collect::<Result<Vec<_>>>()?;

        tx.commit().await?;
        Ok(InstanceSnapshot { instance, steps })
    }

    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedStep>> {
        let lease = lease_duration(lease)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            SELECT i.id
            FROM keel_instances i
            WHERE i.status = 'running'
              AND EXISTS (SELECT 1 FROM keel_steps s WHERE s.instance_id = i.id AND {eligible})
              AND NOT EXISTS (SELECT 1 FROM keel_steps s WHERE s.instance_id = i.id AND {live})
            ORDER BY i.created_at
            LIMIT $1
            FOR UPDATE OF i SKIP LOCKED
            "#,
            eligible = ELIGIBLE,
            live = LIVE_CLAIM,
        );
        let ids: Vec<Uuid> = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| row.try_get("id"))
            .collect::<std::result::Result<_, _>>()?;

        let claim_sql = format!(
            r#"
            UPDATE keel_steps
            SET status = 'running', claimed_by = $2, claim_token = $3,
                claim_expires_at = NOW() + $4
            WHERE instance_id = $1
              AND seq = (
                  SELECT s.seq FROM keel_steps s
                  WHERE s.instance_id = $1 AND {eligible}
                  ORDER BY s.next_eligible_at, s.seq
                  LIMIT 1
              )
              AND NOT EXISTS (SELECT 1 FROM keel_steps s WHERE s.instance_id = $1 AND {live})
            RETURNING {columns}
            "#,
            eligible = ELIGIBLE,
            live = LIVE_CLAIM,
            columns = STEP_COLUMNS,
        );
        let bump_sql = format!(
            "UPDATE keel_instances SET version = version + 1 WHERE id = $1 RETURNING {}",
            INSTANCE_COLUMNS
        );

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(row) = sqlx::query(&claim_sql)
                .bind(id)
                .bind(worker_id)
                .bind(Uuid::new_v4())
                .bind(lease)
                .fetch_optional(&mut *tx)
                .await?
            else {
                continue;
            };
            let step = step_from_row(&row)?;

            let row = sqlx::query(&bump_sql).bind(id).fetch_one(&mut *tx).await?;
            let instance = instance_from_row(&row)?;

            claimed.push(ClaimedStep { instance, step });
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn heartbeat(
        &self,
        step: StepId,
        token: Uuid,
        lease: Duration,
    ) -> Result<DateTime<Utc>> {
        let lease = lease_duration(lease)?;
        let row = sqlx::query(
            r#"
            UPDATE keel_steps
            SET claim_expires_at = NOW() + $4
            WHERE instance_id = $1 AND seq = $2
              AND status = 'running'
              AND claim_token = $3
              AND claim_expires_at > NOW()
            RETURNING claim_expires_at
            "#,
        )
        .bind(step.instance_id)
        .bind(step.seq)
        .bind(token)
        .bind(lease)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(KeelError::LeaseLost { step })?;
        Ok(row.try_get("claim_expires_at")?)
    }
}
