// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Postgres Pattern Repository
//!
//! Durable [`PatternRepository`] backed by PostgreSQL via sqlx.
//!
//! # Schema
//!
//! - `cortex_patterns`: one row per pattern; embeddings are packed as
//!   little-endian `f32` in a `BYTEA`, subject features as `JSONB`.
//! - `cortex_estimator_state`: singleton row holding the serialized estimator.
//! - `cortex_consolidation_history`: append-only audit of completed runs.
//!
//! Filters are pushed into SQL. A consolidation commit runs in one
//! transaction.

use async_trait::async_trait;
use bytes::{Buf, BufMut};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::consolidation::ConsolidationRecord;
use crate::domain::pattern::{OutcomeKind, Pattern, PatternId, SubjectFeatures};
use crate::domain::repository::{
    ConsolidationCommit, EstimatorState, PatternFilter, PatternRepository, PatternStatistics,
    RepositoryError,
};

const PATTERN_COLUMNS: &str = "id, context_embedding, subject_id, subject_features, outcome_kind, \
     reward, importance, access_count, created_at, last_accessed_at";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS cortex_patterns (
        id UUID PRIMARY KEY,
        context_embedding BYTEA NOT NULL,
        subject_id TEXT NOT NULL,
        subject_features JSONB NOT NULL DEFAULT 'null'::jsonb,
        outcome_kind TEXT NOT NULL,
        reward DOUBLE PRECISION NOT NULL,
        importance DOUBLE PRECISION NOT NULL CHECK (importance >= 0),
        access_count BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL,
        last_accessed_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_cortex_patterns_subject ON cortex_patterns (subject_id)",
    "CREATE INDEX IF NOT EXISTS idx_cortex_patterns_importance ON cortex_patterns (importance)",
    "CREATE INDEX IF NOT EXISTS idx_cortex_patterns_outcome ON cortex_patterns (outcome_kind)",
    r#"
    CREATE TABLE IF NOT EXISTS cortex_estimator_state (
        id SMALLINT PRIMARY KEY CHECK (id = 1),
        state BYTEA NOT NULL,
        update_count BIGINT NOT NULL,
        last_decay_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cortex_consolidation_history (
        id UUID PRIMARY KEY,
        run_at TIMESTAMPTZ NOT NULL,
        processed BIGINT NOT NULL,
        preserved BIGINT NOT NULL,
        pruned BIGINT NOT NULL,
        preservation_rate DOUBLE PRECISION NOT NULL,
        duration_ms BIGINT NOT NULL,
        avg_importance DOUBLE PRECISION NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_cortex_history_run_at ON cortex_consolidation_history (run_at DESC)",
];

pub struct PostgresPatternRepository {
    pool: PgPool,
}

impl PostgresPatternRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn initialize(&self) -> Result<(), RepositoryError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| RepositoryError::Database(format!("Failed to create schema: {}", e)))?;
        }
        info!("Pattern cortex schema ready");
        Ok(())
    }
}

#[async_trait]
impl PatternRepository for PostgresPatternRepository {
    async fn insert(&self, pattern: &Pattern) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO cortex_patterns (
                id, context_embedding, subject_id, subject_features, outcome_kind,
                reward, importance, access_count, created_at, last_accessed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(pattern.id.0)
        .bind(encode_embedding(&pattern.context_embedding))
        .bind(&pattern.subject_id)
        .bind(&pattern.subject_features.0)
        .bind(pattern.outcome_kind.as_str())
        .bind(pattern.reward)
        .bind(pattern.importance)
        .bind(pattern.access_count as i64)
        .bind(pattern.created_at)
        .bind(pattern.last_accessed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to insert pattern: {}", e)))?;

        Ok(())
    }

    async fn find_by_id(&self, id: PatternId) -> Result<Option<Pattern>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM cortex_patterns WHERE id = $1", PATTERN_COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        row.map(parse_pattern_row).transpose()
    }

    async fn scan(&self, filter: &PatternFilter) -> Result<Vec<Pattern>, RepositoryError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM cortex_patterns
            WHERE ($1::text IS NULL OR subject_id = $1)
              AND ($2::text IS NULL OR subject_features->>'category' = $2)
              AND ($3::float8 IS NULL OR importance >= $3)
              AND ($4::text IS NULL OR outcome_kind = $4)
              AND (NOT $5 OR reward > 0)
            "#,
            PATTERN_COLUMNS
        ))
        .bind(filter.subject_id.as_deref())
        .bind(filter.category.as_deref())
        .bind(filter.min_importance)
        .bind(filter.outcome_kind.map(|k| k.as_str()))
        .bind(filter.positive_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.into_iter().map(parse_pattern_row).collect()
    }

    async fn reinforce(
        &self,
        id: PatternId,
        importance_delta: f64,
        accessed_at: DateTime<Utc>,
    ) -> Result<Pattern, RepositoryError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE cortex_patterns
            SET importance = GREATEST(importance + $2, 0),
                access_count = access_count + 1,
                last_accessed_at = $3
            WHERE id = $1
            RETURNING {}
            "#,
            PATTERN_COLUMNS
        ))
        .bind(id.0)
        .bind(importance_delta)
        .bind(accessed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to reinforce pattern: {}", e)))?;

        match row {
            Some(row) => parse_pattern_row(row),
            None => Err(RepositoryError::NotFound(format!("Pattern {} not found", id))),
        }
    }

    async fn record_access(
        &self,
        ids: &[PatternId],
        importance_boost: f64,
        accessed_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();

        sqlx::query(
            r#"
            UPDATE cortex_patterns
            SET importance = GREATEST(importance + $2, 0),
                access_count = access_count + 1,
                last_accessed_at = $3
            WHERE id = ANY($1)
            "#,
        )
        .bind(&ids)
        .bind(importance_boost)
        .bind(accessed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to record access: {}", e)))?;

        Ok(())
    }

    async fn delete(&self, id: PatternId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM cortex_patterns WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("Pattern {} not found", id)));
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Pattern>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {} FROM cortex_patterns", PATTERN_COLUMNS))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.into_iter().map(parse_pattern_row).collect()
    }

    async fn count(&self) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cortex_patterns")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;
        Ok(count as u64)
    }

    async fn statistics(&self) -> Result<PatternStatistics, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT outcome_kind, COUNT(*) AS total, COALESCE(SUM(importance), 0) AS importance_sum
            FROM cortex_patterns
            GROUP BY outcome_kind
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        let mut stats = PatternStatistics::default();
        let mut importance_sum = 0.0;
        for row in rows {
            let kind: String = row.try_get("outcome_kind")?;
            let kind: OutcomeKind = kind
                .parse()
                .map_err(|e: crate::domain::errors::ValidationError| RepositoryError::Serialization(e.to_string()))?;
            let total: i64 = row.try_get("total")?;
            let sum: f64 = row.try_get("importance_sum")?;

            stats.counts_by_outcome.insert(kind, total as u64);
            stats.total_patterns += total as u64;
            importance_sum += sum;
        }
        if stats.total_patterns > 0 {
            stats.average_importance = importance_sum / stats.total_patterns as f64;
        }
        Ok(stats)
    }

    async fn load_estimator_state(&self) -> Result<Option<EstimatorState>, RepositoryError> {
        let row = sqlx::query("SELECT state, update_count, last_decay_at FROM cortex_estimator_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let update_count: i64 = row.try_get("update_count")?;
        Ok(Some(EstimatorState {
            bytes: row.try_get("state")?,
            update_count: u32::try_from(update_count)
                .map_err(|_| RepositoryError::Serialization(format!("Invalid update count {}", update_count)))?,
            last_decay_at: row.try_get("last_decay_at")?,
        }))
    }

    async fn save_estimator_state(&self, state: &EstimatorState) -> Result<(), RepositoryError> {
        upsert_estimator_state(&self.pool, state).await
    }

    async fn commit_consolidation(&self, commit: &ConsolidationCommit) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to begin transaction: {}", e)))?;

        if !commit.importance_updates.is_empty() {
            let ids: Vec<Uuid> = commit.importance_updates.iter().map(|u| u.id.0).collect();
            let observed: Vec<f64> = commit.importance_updates.iter().map(|u| u.observed).collect();
            let values: Vec<f64> = commit.importance_updates.iter().map(|u| u.importance).collect();
            // Keep any reinforcement that landed after the run read the row
            sqlx::query(
                r#"
                UPDATE cortex_patterns AS p
                SET importance = GREATEST(u.importance + (p.importance - u.observed), 0)
                FROM UNNEST($1::uuid[], $2::float8[], $3::float8[]) AS u(id, observed, importance)
                WHERE p.id = u.id
                "#,
            )
            .bind(&ids)
            .bind(&observed)
            .bind(&values)
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to update importance: {}", e)))?;
        }

        if !commit.deletions.is_empty() {
            let ids: Vec<Uuid> = commit.deletions.iter().map(|id| id.0).collect();
            sqlx::query("DELETE FROM cortex_patterns WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Database(format!("Failed to prune patterns: {}", e)))?;
        }

        upsert_estimator_state(&mut *tx, &commit.estimator_state).await?;

        let record = &commit.record;
        sqlx::query(
            r#"
            INSERT INTO cortex_consolidation_history (
                id, run_at, processed, preserved, pruned,
                preservation_rate, duration_ms, avg_importance
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(record.timestamp)
        .bind(record.processed as i64)
        .bind(record.preserved as i64)
        .bind(record.pruned as i64)
        .bind(record.preservation_rate)
        .bind(record.duration_ms as i64)
        .bind(record.avg_importance)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to record consolidation: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to commit consolidation: {}", e)))?;

        debug!(
            updated = commit.importance_updates.len(),
            deleted = commit.deletions.len(),
            "Consolidation committed"
        );
        Ok(())
    }

    async fn consolidation_history(&self, limit: usize) -> Result<Vec<ConsolidationRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_at, processed, preserved, pruned, preservation_rate, duration_ms, avg_importance
            FROM cortex_consolidation_history
            ORDER BY run_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.into_iter().map(parse_history_row).collect()
    }
}

async fn upsert_estimator_state<'e, E>(executor: E, state: &EstimatorState) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO cortex_estimator_state (id, state, update_count, last_decay_at, updated_at)
        VALUES (1, $1, $2, $3, NOW())
        ON CONFLICT (id) DO UPDATE SET
            state = EXCLUDED.state,
            update_count = EXCLUDED.update_count,
            last_decay_at = EXCLUDED.last_decay_at,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&state.bytes)
    .bind(state.update_count as i64)
    .bind(state.last_decay_at)
    .execute(executor)
    .await
    .map_err(|e| RepositoryError::Database(format!("Failed to save estimator state: {}", e)))?;

    Ok(())
}

fn parse_pattern_row(row: PgRow) -> Result<Pattern, RepositoryError> {
    let kind: String = row.try_get("outcome_kind")?;
    let outcome_kind: OutcomeKind = kind
        .parse()
        .map_err(|e: crate::domain::errors::ValidationError| RepositoryError::Serialization(e.to_string()))?;
    let embedding: Vec<u8> = row.try_get("context_embedding")?;
    let access_count: i64 = row.try_get("access_count")?;

    Ok(Pattern {
        id: PatternId(row.try_get("id")?),
        context_embedding: decode_embedding(&embedding)?,
        subject_id: row.try_get("subject_id")?,
        subject_features: SubjectFeatures(row.try_get("subject_features")?),
        outcome_kind,
        reward: row.try_get("reward")?,
        importance: row.try_get("importance")?,
        access_count: access_count.max(0) as u64,
        created_at: row.try_get("created_at")?,
        last_accessed_at: row.try_get("last_accessed_at")?,
    })
}

fn parse_history_row(row: PgRow) -> Result<ConsolidationRecord, RepositoryError> {
    let processed: i64 = row.try_get("processed")?;
    let preserved: i64 = row.try_get("preserved")?;
    let pruned: i64 = row.try_get("pruned")?;
    let duration_ms: i64 = row.try_get("duration_ms")?;

    Ok(ConsolidationRecord {
        id: row.try_get("id")?,
        timestamp: row.try_get("run_at")?,
        consolidated: true,
        processed: processed as u64,
        preserved: preserved as u64,
        pruned: pruned as u64,
        preservation_rate: row.try_get("preservation_rate")?,
        duration_ms: duration_ms as u64,
        avg_importance: row.try_get("avg_importance")?,
    })
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        buf.put_f32_le(*value);
    }
    buf
}

fn decode_embedding(mut bytes: &[u8]) -> Result<Vec<f32>, RepositoryError> {
    if bytes.len() % 4 != 0 {
        return Err(RepositoryError::Serialization(format!(
            "Embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    let mut embedding = Vec::with_capacity(bytes.len() / 4);
    while bytes.has_remaining() {
        embedding.push(bytes.get_f32_le());
    }
    Ok(embedding)
}
