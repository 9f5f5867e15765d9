//! Cross-shard consistency auditing and repair
//!
//! Invoked by an external scheduler. Checks validate the invariants the
//! sharding layer depends on: every referenced id decodes to a
//! registered shard, a row lives on the shard its id names, and no
//! identifier appears on two shards. Repair is best-effort and
//! two-phased: a dry run computes the plan without mutating anything,
//! the real run applies it and reports failures instead of retrying.

use crate::core::{Result, ShardError};
use crate::router::ShardRouter;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Which tables to sample and how many ids per shard per table.
#[derive(Debug, Clone)]
pub struct ConsistencyConfig {
    pub tables: Vec<String>,
    pub sample_limit: usize,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            tables: vec![
                "users".to_string(),
                "projects".to_string(),
                "tasks".to_string(),
                "items".to_string(),
            ],
            sample_limit: 100,
        }
    }
}

impl ConsistencyConfig {
    pub fn tables(mut self, tables: &[&str]) -> Self {
        self.tables = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn sample_limit(mut self, limit: usize) -> Self {
        self.sample_limit = limit;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Warning,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyIssue {
    pub check: String,
    pub status: CheckStatus,
    pub detail: String,
}

/// Liveness probe result for one shard.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub shard_id: String,
    pub healthy: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairKind {
    /// Row found on a shard other than the one its id names.
    MoveRow,
    /// Same id present on several shards; drop the stray copies.
    DeleteDuplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairStatus {
    Planned,
    Applied,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairAction {
    pub kind: RepairKind,
    pub table: String,
    pub id: String,
    pub shard_id: String,
    pub target_shard: Option<String>,
    pub status: RepairStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RepairOutcome {
    pub repairs: Vec<RepairAction>,
    pub applied: bool,
}

pub struct ConsistencyService {
    router: Arc<ShardRouter>,
    config: ConsistencyConfig,
}

struct SampledId {
    table: String,
    shard_id: String,
    id: String,
}

impl ConsistencyService {
    pub fn new(router: Arc<ShardRouter>, config: ConsistencyConfig) -> Self {
        Self { router, config }
    }

    /// Lightweight per-shard liveness probe plus a usage refresh,
    /// intended for a frequent cron trigger.
    pub async fn scheduled_check(&self) -> Vec<ProbeOutcome> {
        let outcomes = self
            .router
            .query_all(|conn| async move { conn.first("SELECT 1", &[]).await })
            .await;

        let mut probes = Vec::new();
        for (shard_id, outcome) in outcomes {
            match outcome {
                Ok(_) => {
                    if let Err(err) = self.router.update_shard_metadata(&shard_id).await {
                        tracing::warn!(shard = %shard_id, error = %err, "usage refresh failed");
                    }
                    probes.push(ProbeOutcome {
                        shard_id,
                        healthy: true,
                        error: None,
                    });
                }
                Err(err) => {
                    tracing::warn!(shard = %shard_id, error = %err, "shard liveness probe failed");
                    probes.push(ProbeOutcome {
                        shard_id,
                        healthy: false,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        probes
    }

    /// Full audit of the cross-shard invariants. Never fails as a
    /// whole: problems become `Failed`/`Warning` issues in the report.
    pub async fn run_consistency_checks(&self) -> Vec<ConsistencyIssue> {
        let mut issues = Vec::new();

        // Liveness.
        let probes = self.scheduled_check().await;
        let dead: Vec<&ProbeOutcome> = probes.iter().filter(|p| !p.healthy).collect();
        issues.push(if dead.is_empty() {
            ConsistencyIssue {
                check: "shard-liveness".into(),
                status: CheckStatus::Passed,
                detail: format!("{} shards reachable", probes.len()),
            }
        } else {
            ConsistencyIssue {
                check: "shard-liveness".into(),
                status: CheckStatus::Failed,
                detail: format!(
                    "unreachable shards: {}",
                    dead.iter()
                        .map(|p| p.shard_id.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            }
        });

        // Capacity headroom.
        let ceiling = self.router.capacity_ceiling();
        let over: Vec<String> = self
            .router
            .shard_stats()
            .await
            .into_iter()
            .filter(|s| s.usage.as_ref().is_some_and(|u| u.size_bytes >= ceiling))
            .map(|s| s.id)
            .collect();
        issues.push(if over.is_empty() {
            ConsistencyIssue {
                check: "shard-capacity".into(),
                status: CheckStatus::Passed,
                detail: "all shards under the capacity ceiling".into(),
            }
        } else {
            ConsistencyIssue {
                check: "shard-capacity".into(),
                status: CheckStatus::Warning,
                detail: format!("shards at or over ceiling: {}", over.join(", ")),
            }
        });

        // Identifier invariants over sampled rows.
        let samples = self.sample_ids().await;
        issues.push(self.check_id_ownership(&samples));
        issues.push(self.check_id_collisions(&samples));

        issues
    }

    /// Compute (and optionally apply) repairs for the issues the audit
    /// can fix: misplaced rows and cross-shard id collisions.
    pub async fn repair_consistency_issues(&self, dry_run: bool) -> Result<RepairOutcome> {
        let samples = self.sample_ids().await;
        let codec = self.router.codec();

        // ids seen on more than one shard
        let mut holders_by_id: BTreeMap<&str, Vec<&SampledId>> = BTreeMap::new();
        for sample in &samples {
            holders_by_id.entry(&sample.id).or_default().push(sample);
        }

        let mut repairs = Vec::new();
        for (id, holders) in &holders_by_id {
            let shard_set: BTreeSet<&str> =
                holders.iter().map(|h| h.shard_id.as_str()).collect();
            let decoded_shard = codec.decode(id).ok().map(|d| d.shard_id);

            if shard_set.len() > 1 {
                // Collision: keep the copy on the owning shard when it
                // holds one, otherwise the first holder.
                let keep = decoded_shard
                    .as_deref()
                    .filter(|owner| shard_set.contains(owner))
                    .unwrap_or_else(|| holders[0].shard_id.as_str())
                    .to_string();
                for holder in holders {
                    if holder.shard_id != keep {
                        repairs.push(RepairAction {
                            kind: RepairKind::DeleteDuplicate,
                            table: holder.table.clone(),
                            id: holder.id.clone(),
                            shard_id: holder.shard_id.clone(),
                            target_shard: Some(keep.clone()),
                            status: RepairStatus::Planned,
                            detail: None,
                        });
                    }
                }
                continue;
            }

            // Misplaced row: single holder, but the id names another
            // registered shard.
            if let Some(owner) = decoded_shard {
                let holder = holders[0];
                if owner != holder.shard_id && self.router.connection(&owner).is_some() {
                    repairs.push(RepairAction {
                        kind: RepairKind::MoveRow,
                        table: holder.table.clone(),
                        id: holder.id.clone(),
                        shard_id: holder.shard_id.clone(),
                        target_shard: Some(owner),
                        status: RepairStatus::Planned,
                        detail: None,
                    });
                }
            }
        }

        if dry_run {
            return Ok(RepairOutcome {
                repairs,
                applied: false,
            });
        }

        for action in &mut repairs {
            let outcome = match action.kind {
                RepairKind::MoveRow => self.apply_move(action).await,
                RepairKind::DeleteDuplicate => self.apply_delete(action).await,
            };
            match outcome {
                Ok(()) => action.status = RepairStatus::Applied,
                Err(err) => {
                    tracing::warn!(
                        table = %action.table,
                        id = %action.id,
                        error = %err,
                        "repair failed"
                    );
                    action.status = RepairStatus::Failed;
                    action.detail = Some(err.to_string());
                }
            }
        }

        Ok(RepairOutcome {
            repairs,
            applied: true,
        })
    }

    async fn sample_ids(&self) -> Vec<SampledId> {
        let mut samples = Vec::new();
        for table in &self.config.tables {
            let sql = format!("SELECT id FROM {table} LIMIT ?");
            let outcomes = self
                .router
                .query_all(|conn| {
                    let sql = sql.clone();
                    let limit = Value::from(self.config.sample_limit as u64);
                    async move { conn.all(&sql, &[limit]).await }
                })
                .await;

            for (shard_id, outcome) in outcomes {
                match outcome {
                    Ok(rows) => {
                        for row in rows {
                            if let Some(id) = row.get("id").and_then(Value::as_str) {
                                samples.push(SampledId {
                                    table: table.clone(),
                                    shard_id: shard_id.clone(),
                                    id: id.to_string(),
                                });
                            }
                        }
                    }
                    Err(err) => {
                        // A table may legitimately be absent on a shard.
                        tracing::debug!(
                            shard = %shard_id,
                            table = %table,
                            error = %err,
                            "id sampling skipped"
                        );
                    }
                }
            }
        }
        samples
    }

    fn check_id_ownership(&self, samples: &[SampledId]) -> ConsistencyIssue {
        let codec = self.router.codec();
        let mut problems = Vec::new();

        for sample in samples {
            match codec.decode(&sample.id) {
                Err(_) => problems.push(format!(
                    "{}:{} on {} does not decode",
                    sample.table, sample.id, sample.shard_id
                )),
                Ok(decoded) => {
                    if self.router.connection(&decoded.shard_id).is_none() {
                        problems.push(format!(
                            "{}:{} names unregistered shard {}",
                            sample.table, sample.id, decoded.shard_id
                        ));
                    } else if decoded.shard_id != sample.shard_id {
                        problems.push(format!(
                            "{}:{} lives on {} but names {}",
                            sample.table, sample.id, sample.shard_id, decoded.shard_id
                        ));
                    }
                }
            }
        }

        if problems.is_empty() {
            ConsistencyIssue {
                check: "id-ownership".into(),
                status: CheckStatus::Passed,
                detail: format!("{} sampled ids decode to their holding shard", samples.len()),
            }
        } else {
            ConsistencyIssue {
                check: "id-ownership".into(),
                status: CheckStatus::Failed,
                detail: problems.join("; "),
            }
        }
    }

    fn check_id_collisions(&self, samples: &[SampledId]) -> ConsistencyIssue {
        let mut shards_by_id: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for sample in samples {
            shards_by_id
                .entry(&sample.id)
                .or_default()
                .insert(&sample.shard_id);
        }

        let collisions: Vec<String> = shards_by_id
            .iter()
            .filter(|(_, shards)| shards.len() > 1)
            .map(|(id, shards)| {
                format!(
                    "{id} on {}",
                    shards.iter().copied().collect::<Vec<_>>().join(", ")
                )
            })
            .collect();

        if collisions.is_empty() {
            ConsistencyIssue {
                check: "id-collision".into(),
                status: CheckStatus::Passed,
                detail: "no identifier appears on more than one shard".into(),
            }
        } else {
            ConsistencyIssue {
                check: "id-collision".into(),
                status: CheckStatus::Failed,
                detail: collisions.join("; "),
            }
        }
    }

    async fn apply_move(&self, action: &RepairAction) -> Result<()> {
        let source = self
            .router
            .connection(&action.shard_id)
            .ok_or_else(|| ShardError::UnknownShard(action.shard_id.clone()))?;
        let target_id = action
            .target_shard
            .as_deref()
            .ok_or_else(|| ShardError::Validation("move repair has no target shard".into()))?;
        let target = self
            .router
            .connection(target_id)
            .ok_or_else(|| ShardError::UnknownShard(target_id.to_string()))?;

        let select_sql = format!("SELECT * FROM {} WHERE id = ?", action.table);
        let row = source
            .first(&select_sql, &[Value::from(action.id.clone())])
            .await?
            .ok_or_else(|| {
                ShardError::Execution(format!(
                    "row {} vanished from {} before repair",
                    action.id, action.shard_id
                ))
            })?;

        let columns: Vec<&String> = row.keys().collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            action.table,
            columns
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            placeholders
        );
        let params: Vec<Value> = row.values().cloned().collect();
        target.run(&insert_sql, &params).await?;

        let delete_sql = format!("DELETE FROM {} WHERE id = ?", action.table);
        source
            .run(&delete_sql, &[Value::from(action.id.clone())])
            .await?;
        Ok(())
    }

    async fn apply_delete(&self, action: &RepairAction) -> Result<()> {
        let conn = self
            .router
            .connection(&action.shard_id)
            .ok_or_else(|| ShardError::UnknownShard(action.shard_id.clone()))?;
        let delete_sql = format!("DELETE FROM {} WHERE id = ?", action.table);
        conn.run(&delete_sql, &[Value::from(action.id.clone())])
            .await?;
        Ok(())
    }
}
