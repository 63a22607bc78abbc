use warden_db::{create_pool, migration_names, run_migrations, DbRuntimeSettings};

fn file_pool(dir: &tempfile::TempDir) -> warden_db::DbPool {
    let path = dir.path().join("warden.db");
    create_pool(path.to_str().expect("utf-8 path"), DbRuntimeSettings::default())
        .expect("failed to create pool")
}

fn insert_event(
    conn: &rusqlite::Connection,
    aggregate_id: &str,
    sequence: i64,
    position: i64,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO events (instance_id, aggregate_type, aggregate_id, sequence, owner,
                             event_type, creator, payload, position, in_tx_order, created_at)
         VALUES ('inst', 'user', ?1, ?2, 'org', 'user.added', 'admin', NULL, ?3, 0,
                 '2024-01-01T00:00:00.000000Z')",
        rusqlite::params![aggregate_id, sequence, position],
    )
}

#[test]
fn db_initialization_works() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let pool = file_pool(&dir);
    let conn = pool.get().expect("failed to get connection");
    let applied = run_migrations(&conn).expect("failed to run migrations");
    assert_eq!(applied, migration_names().count());

    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .expect("failed to prepare table query");
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .expect("failed to execute table query")
        .map(|r| r.expect("failed to read table name"))
        .collect();

    assert_eq!(
        tables,
        vec!["_warden_migrations", "events", "fields", "locks", "unique_constraints"]
    );
}

#[test]
fn pooled_connections_share_the_schema() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let pool = file_pool(&dir);
    {
        let conn = pool.get().expect("failed to get connection");
        run_migrations(&conn).expect("failed to run migrations");
    }
    let a = pool.get().expect("failed to get first connection");
    let b = pool.get().expect("failed to get second connection");
    insert_event(&a, "u1", 1, 100).expect("insert should succeed");

    let count: i64 = b
        .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
        .expect("count should succeed");
    assert_eq!(count, 1);
    assert_eq!(run_migrations(&b).expect("rerun should succeed"), 0);
}

#[test]
fn event_log_rejects_duplicate_sequence_and_position() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let pool = file_pool(&dir);
    let conn = pool.get().expect("failed to get connection");
    run_migrations(&conn).expect("failed to run migrations");

    insert_event(&conn, "u1", 1, 100).expect("first insert should succeed");
    assert!(insert_event(&conn, "u1", 1, 200).is_err(), "duplicate sequence");
    assert!(insert_event(&conn, "u2", 1, 100).is_err(), "duplicate position");
    assert!(insert_event(&conn, "u2", 0, 300).is_err(), "sequence starts at 1");
    insert_event(&conn, "u1", 2, 200).expect("next sequence should succeed");
}
