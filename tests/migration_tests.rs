mod common;

use common::{MockShard, router_with, row};
use serde_json::json;
use std::sync::Arc;
use volshard::migration::{MigrationConfig, ShardMigration};

fn source_with_users(total: usize, batch_size: usize) -> Arc<MockShard> {
    let source = MockShard::new();
    source.queue_rows(
        "SELECT COUNT(*) AS count FROM users",
        vec![row(&[("count", json!(total))])],
    );
    source.queue_rows(
        "PRAGMA table_info(users)",
        vec![
            row(&[("name", json!("id"))]),
            row(&[("name", json!("email"))]),
            row(&[("name", json!("created_at"))]),
        ],
    );

    for start in (0..total).step_by(batch_size) {
        let end = (start + batch_size).min(total);
        let page = (start..end)
            .map(|n| {
                row(&[
                    ("id", json!(format!("legacy-{n}"))),
                    ("email", json!(format!("user{n}@example.com"))),
                    ("created_at", json!("2024-03-01T00:00:00Z")),
                ])
            })
            .collect();
        source.queue_rows("SELECT * FROM users LIMIT", page);
    }
    source
}

#[tokio::test]
async fn migrates_a_table_in_batches() {
    let source = source_with_users(2500, 1000);
    let shard_a = MockShard::new();
    let shard_b = MockShard::new();
    let router = router_with(vec![
        ("DB_VOL_001_aaa111", shard_a.clone()),
        ("DB_VOL_002_bbb222", shard_b.clone()),
    ]);

    let config = MigrationConfig::default().tables(&["users"]);
    let migration = ShardMigration::new(source.clone(), router, config);

    let outcome = migration.migrate_table("users").await.unwrap();
    assert_eq!(outcome.table_name, "users");
    assert_eq!(outcome.total_records, 2500);
    assert_eq!(outcome.migrated_records, 2500);
    assert!(outcome.errors.is_empty());

    // 3 pages of 1000 plus the empty page that ends the loop
    assert_eq!(source.calls_matching("SELECT * FROM users LIMIT"), 4);
    // every migrated row leaves an id mapping on the source
    assert_eq!(
        source.calls_matching("INSERT OR REPLACE INTO shard_migration_mappings"),
        2500
    );
    // all inserts land on the active (highest ordinal) shard
    assert_eq!(shard_a.calls_matching("INSERT INTO users"), 0);
    assert_eq!(shard_b.calls_matching("INSERT INTO users"), 2500);
}

#[tokio::test]
async fn migrated_ids_preserve_the_row_timestamp() {
    let source = source_with_users(1, 1000);
    let shard = MockShard::new();
    let router = router_with(vec![("DB_VOL_001_aaa111", shard.clone())]);
    let codec = router.codec().clone();

    let config = MigrationConfig::default().tables(&["users"]);
    let migration = ShardMigration::new(source, router, config);
    migration.migrate_table("users").await.unwrap();

    let params = shard.last_params("INSERT INTO users").unwrap();
    // columns are inserted in schema order: id, email, created_at
    let new_id = params[0].as_str().unwrap();
    let decoded = codec.decode(new_id).unwrap();
    assert_eq!(decoded.shard_id, "VOL_001_aaa111");
    assert_eq!(decoded.record_type, "users");
    assert_eq!(
        decoded.timestamp,
        chrono::DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
            .unwrap()
            .timestamp_millis()
    );
}

#[tokio::test]
async fn failed_rows_are_reported_not_fatal() {
    let source = source_with_users(3, 1000);
    let shard = MockShard::new();
    shard.queue_error("INSERT INTO users", "constraint failed");

    let router = router_with(vec![("DB_VOL_001_aaa111", shard)]);
    let config = MigrationConfig::default().tables(&["users"]);
    let migration = ShardMigration::new(source, router, config);

    let outcome = migration.migrate_table("users").await.unwrap();
    assert_eq!(outcome.total_records, 3);
    assert_eq!(outcome.migrated_records, 2);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].id, "legacy-0");
    assert!(outcome.errors[0].error.contains("constraint failed"));
}

#[tokio::test]
async fn failed_mapping_insert_is_a_row_error_not_fatal() {
    let source = source_with_users(2, 1000);
    source.queue_error(
        "INSERT OR REPLACE INTO shard_migration_mappings",
        "disk I/O error",
    );

    let router = router_with(vec![("DB_VOL_001_aaa111", MockShard::new())]);
    let config = MigrationConfig::default().tables(&["users"]);
    let migration = ShardMigration::new(source, router, config);

    let outcome = migration.migrate_table("users").await.unwrap();
    assert_eq!(outcome.total_records, 2);
    assert_eq!(outcome.migrated_records, 1);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].id, "legacy-0");
    assert!(outcome.errors[0].error.contains("mapping not recorded"));
}

#[tokio::test]
async fn foreign_keys_are_rewritten_from_mappings() {
    let source = MockShard::new();
    let shard_a = MockShard::new();
    let shard_b = MockShard::new();
    let router = router_with(vec![
        ("DB_VOL_001_aaa111", shard_a.clone()),
        ("DB_VOL_002_bbb222", shard_b.clone()),
    ]);

    let new_id = router
        .codec()
        .generate(&volshard::IdRequest::new("VOL_001_aaa111", "users"))
        .unwrap();
    source.queue_rows(
        "FROM shard_migration_mappings WHERE table_name",
        vec![row(&[
            ("old_id", json!("legacy-7")),
            ("new_id", json!(new_id.clone())),
        ])],
    );

    let config = MigrationConfig::default().tables(&["projects"]);
    let migration = ShardMigration::new(source, router, config);

    let updated = migration
        .update_foreign_key_references("projects", "owner_id", "users")
        .await
        .unwrap();

    // the rewrite lands on the shard the new id decodes to
    assert_eq!(updated, 1);
    assert_eq!(shard_a.calls_matching("UPDATE projects SET owner_id"), 1);
    assert_eq!(shard_b.calls_matching("UPDATE projects SET owner_id"), 0);

    let params = shard_a.last_params("UPDATE projects SET owner_id").unwrap();
    assert_eq!(params, vec![json!(new_id.clone()), json!("legacy-7")]);
}

#[tokio::test]
async fn full_migration_replays_schemas_and_reports_success() {
    let source = source_with_users(2, 1000);
    source.queue_rows(
        "FROM sqlite_master",
        vec![row(&[(
            "sql",
            json!("CREATE TABLE users (id TEXT PRIMARY KEY, email TEXT, created_at TEXT)"),
        )])],
    );

    let shard = MockShard::new();
    let router = router_with(vec![("DB_VOL_001_aaa111", shard.clone())]);

    let config = MigrationConfig::default()
        .tables(&["users"])
        .foreign_keys(vec![]);
    let migration = ShardMigration::new(source, router, config);

    let report = migration.run_full_migration().await.unwrap();
    assert!(report.success);
    assert_eq!(report.tables.len(), 1);
    assert_eq!(report.tables[0].migrated_records, 2);

    assert_eq!(shard.calls_matching("CREATE TABLE IF NOT EXISTS users"), 1);
}

#[tokio::test]
async fn missing_source_table_aborts_the_migration() {
    let source = MockShard::new();
    let router = router_with(vec![("DB_VOL_001_aaa111", MockShard::new())]);

    let config = MigrationConfig::default().tables(&["users"]);
    let migration = ShardMigration::new(source, router, config);

    assert!(migration.run_full_migration().await.is_err());
}
