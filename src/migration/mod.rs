//! One-time migration from a single source database into the shards
//!
//! Copies tables batch by batch, minting a sharded identifier for every
//! row and recording an old id → new id mapping on the source database.
//! Foreign key columns are rewritten afterwards from those mappings.
//! The migration is resumable only by re-running it against a clean
//! target; partially migrated rows are reported, not rolled back.

use crate::connection::{ShardConnection, Statement};
use crate::core::{Result, Row, ShardError};
use crate::id::IdRequest;
use crate::router::ShardRouter;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

const MAPPING_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS shard_migration_mappings (\
     old_id TEXT NOT NULL, \
     new_id TEXT NOT NULL, \
     table_name TEXT NOT NULL, \
     PRIMARY KEY (old_id, table_name))";

/// A foreign key column whose values must be rewritten to new ids.
#[derive(Debug, Clone)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
    /// Table whose ids the column references.
    pub references: String,
}

impl ForeignKeyRef {
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        references: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            references: references.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub batch_size: usize,
    /// Tables in dependency order: referenced tables first.
    pub tables: Vec<String>,
    pub id_column: String,
    /// Reuse each row's `created_at` as the id timestamp so ids sort
    /// like the original data.
    pub preserve_timestamps: bool,
    pub foreign_keys: Vec<ForeignKeyRef>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            tables: vec![
                "users".to_string(),
                "projects".to_string(),
                "tasks".to_string(),
                "items".to_string(),
            ],
            id_column: "id".to_string(),
            preserve_timestamps: true,
            foreign_keys: vec![
                ForeignKeyRef::new("projects", "owner_id", "users"),
                ForeignKeyRef::new("tasks", "project_id", "projects"),
                ForeignKeyRef::new("tasks", "assigned_to", "users"),
            ],
        }
    }
}

impl MigrationConfig {
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn tables(mut self, tables: &[&str]) -> Self {
        self.tables = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn preserve_timestamps(mut self, preserve: bool) -> Self {
        self.preserve_timestamps = preserve;
        self
    }

    pub fn foreign_keys(mut self, foreign_keys: Vec<ForeignKeyRef>) -> Self {
        self.foreign_keys = foreign_keys;
        self
    }
}

/// A row that could not be migrated.
#[derive(Debug, Clone, Serialize)]
pub struct RowError {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct TableMigration {
    pub table_name: String,
    pub total_records: u64,
    pub migrated_records: u64,
    pub errors: Vec<RowError>,
}

#[derive(Debug, Serialize)]
pub struct MigrationReport {
    pub tables: Vec<TableMigration>,
    pub foreign_keys_updated: u64,
    pub success: bool,
}

/// Copies a monolithic source database into the shard fleet.
pub struct ShardMigration {
    source: Arc<dyn ShardConnection>,
    router: Arc<ShardRouter>,
    config: MigrationConfig,
}

impl ShardMigration {
    pub fn new(
        source: Arc<dyn ShardConnection>,
        router: Arc<ShardRouter>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            source,
            router,
            config,
        }
    }

    /// Migrate every configured table, then rewrite foreign keys from
    /// the recorded id mappings. `success` is false when any row failed.
    pub async fn run_full_migration(&self) -> Result<MigrationReport> {
        self.ensure_shard_schemas().await?;

        let mut tables = Vec::with_capacity(self.config.tables.len());
        for table in self.config.tables.clone() {
            let outcome = self.migrate_table(&table).await?;
            tracing::info!(
                table = %table,
                migrated = outcome.migrated_records,
                failed = outcome.errors.len(),
                "table migration finished"
            );
            tables.push(outcome);
        }

        let mut foreign_keys_updated = 0u64;
        for fk in &self.config.foreign_keys {
            foreign_keys_updated += self
                .update_foreign_key_references(&fk.table, &fk.column, &fk.references)
                .await?;
        }

        let success = tables.iter().all(|t| t.errors.is_empty());
        Ok(MigrationReport {
            tables,
            foreign_keys_updated,
            success,
        })
    }

    /// Copy one table in `batch_size` pages. Each row gets a freshly
    /// minted id naming the shard it lands on; the old id → new id pair
    /// is recorded on the source database. Row failures are collected,
    /// never abort the table.
    pub async fn migrate_table(&self, table: &str) -> Result<TableMigration> {
        let count_sql = format!("SELECT COUNT(*) AS count FROM {table}");
        let total_records = self
            .source
            .first(&count_sql, &[])
            .await?
            .and_then(|row| row.get("count").and_then(Value::as_u64))
            .unwrap_or(0);

        let columns = self.table_columns(table).await?;
        if !columns.iter().any(|c| *c == self.config.id_column) {
            return Err(ShardError::Validation(format!(
                "table '{table}' has no '{}' column",
                self.config.id_column
            )));
        }

        self.source.run(MAPPING_TABLE_DDL, &[]).await?;

        let select_sql = format!("SELECT * FROM {table} LIMIT ? OFFSET ?");
        let insert_sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        );

        let mut migrated_records = 0u64;
        let mut errors = Vec::new();
        let mut offset = 0usize;

        loop {
            let batch = self
                .source
                .all(
                    &select_sql,
                    &[
                        Value::from(self.config.batch_size as u64),
                        Value::from(offset as u64),
                    ],
                )
                .await?;
            if batch.is_empty() {
                break;
            }
            offset += self.config.batch_size;

            for row in batch {
                let old_id = row
                    .get(&self.config.id_column)
                    .map(display_id)
                    .unwrap_or_default();
                let outcome = match self.migrate_row(table, &columns, &insert_sql, &row).await {
                    Ok(new_id) => self
                        .record_mapping(table, &old_id, &new_id)
                        .await
                        .map_err(|err| {
                            // The row is already on its shard; only the
                            // old->new mapping is missing.
                            ShardError::Execution(format!(
                                "row inserted but id mapping not recorded: {err}"
                            ))
                        }),
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(()) => migrated_records += 1,
                    Err(err) => {
                        tracing::warn!(
                            table = %table,
                            id = %old_id,
                            error = %err,
                            "row migration failed"
                        );
                        errors.push(RowError {
                            id: old_id,
                            error: err.to_string(),
                        });
                    }
                }
            }
        }

        Ok(TableMigration {
            table_name: table.to_string(),
            total_records,
            migrated_records,
            errors,
        })
    }

    /// Rewrite one foreign key column from the mappings recorded for
    /// the referenced table: updates are grouped by the new id's
    /// decoded shard and applied as one atomic batch per shard.
    pub async fn update_foreign_key_references(
        &self,
        table: &str,
        column: &str,
        referenced_table: &str,
    ) -> Result<u64> {
        let codec = self.router.codec();
        let mappings = self
            .source
            .all(
                "SELECT old_id, new_id FROM shard_migration_mappings WHERE table_name = ?",
                &[Value::from(referenced_table.to_string())],
            )
            .await?;

        let update_sql = format!("UPDATE {table} SET {column} = ? WHERE {column} = ?");
        let mut per_shard: BTreeMap<String, Vec<Statement>> = BTreeMap::new();

        for mapping in &mappings {
            let Some(old_id) = mapping.get("old_id").map(display_id) else {
                continue;
            };
            let Some(new_id) = mapping.get("new_id").and_then(Value::as_str) else {
                continue;
            };
            let decoded = codec.decode(new_id)?;
            per_shard.entry(decoded.shard_id).or_default().push(Statement::new(
                update_sql.clone(),
                vec![Value::from(new_id.to_string()), Value::from(old_id.clone())],
            ));
        }

        let mut updated = 0u64;
        for (shard_id, statements) in per_shard {
            let conn = self
                .router
                .connection(&shard_id)
                .ok_or_else(|| ShardError::UnknownShard(shard_id.clone()))?;
            let metas = conn.batch(&statements).await?;
            updated += metas.iter().map(|m| m.changes).sum::<u64>();
        }

        Ok(updated)
    }

    /// Replay the source's table DDL on every shard so inserts have a
    /// schema to land in.
    async fn ensure_shard_schemas(&self) -> Result<()> {
        for table in &self.config.tables {
            let row = self
                .source
                .first(
                    "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?",
                    &[Value::from(table.clone())],
                )
                .await?;
            let Some(ddl) = row.as_ref().and_then(|r| r.get("sql")).and_then(Value::as_str)
            else {
                return Err(ShardError::Validation(format!(
                    "source database has no table '{table}'"
                )));
            };
            let ddl = ddl.replacen("CREATE TABLE", "CREATE TABLE IF NOT EXISTS", 1);

            for (shard_id, outcome) in self
                .router
                .query_all(|conn| {
                    let ddl = ddl.clone();
                    async move { conn.run(&ddl, &[]).await }
                })
                .await
            {
                outcome.map_err(|err| {
                    ShardError::Execution(format!(
                        "schema replay for '{table}' failed on shard '{shard_id}': {err}"
                    ))
                })?;
            }
        }
        Ok(())
    }

    async fn migrate_row(
        &self,
        table: &str,
        columns: &[String],
        insert_sql: &str,
        row: &Row,
    ) -> Result<String> {
        let target = self.router.active_shard_for_write().await?;

        let mut request = IdRequest::new(&target.shard_id, table);
        if self.config.preserve_timestamps {
            if let Some(ts) = row.get("created_at").and_then(timestamp_millis) {
                request = request.with_timestamp(ts);
            }
        }
        let new_id = self.router.codec().generate(&request)?;

        let params: Vec<Value> = columns
            .iter()
            .map(|column| {
                if *column == self.config.id_column {
                    Value::from(new_id.clone())
                } else {
                    row.get(column).cloned().unwrap_or(Value::Null)
                }
            })
            .collect();
        target.connection.run(insert_sql, &params).await?;
        Ok(new_id)
    }

    async fn record_mapping(&self, table: &str, old_id: &str, new_id: &str) -> Result<()> {
        self.source
            .run(
                "INSERT OR REPLACE INTO shard_migration_mappings \
                 (old_id, new_id, table_name) VALUES (?, ?, ?)",
                &[
                    Value::from(old_id.to_string()),
                    Value::from(new_id.to_string()),
                    Value::from(table.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let sql = format!("PRAGMA table_info({table})");
        let rows = self.source.all(&sql, &[]).await?;
        let columns: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        if columns.is_empty() {
            return Err(ShardError::Validation(format!(
                "table '{table}' has no columns in the source database"
            )));
        }
        Ok(columns)
    }
}

fn display_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `created_at` stored either as epoch milliseconds or RFC 3339 text.
fn timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .ok()
            .or_else(|| {
                chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .map(|dt| dt.and_utc().timestamp_millis())
                    .ok()
            }),
        _ => None,
    }
}
