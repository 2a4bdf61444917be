use trail_db::{create_pool, run_migrations, DbRuntimeSettings};

#[test]
fn db_initialization_works() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("trails.db");
    let pool = create_pool(
        path.to_str().expect("temp path should be utf-8"),
        DbRuntimeSettings::default(),
    )
    .expect("failed to create pool");

    let conn = pool.get().expect("failed to get connection");
    let applied = run_migrations(&conn).expect("failed to run migrations");
    assert_eq!(applied, 2);

    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
        .expect("failed to prepare table query");
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .expect("failed to execute table query")
        .map(|r| r.expect("failed to read table name"))
        .collect();

    assert_eq!(tables, vec!["_trail_migrations", "trails"]);

    // A second pooled connection sees the migrated schema.
    let other = pool.get().expect("failed to get second connection");
    let count: i64 = other
        .query_row("SELECT COUNT(*) FROM trails", [], |row| row.get(0))
        .expect("trails table should be visible from every connection");
    assert_eq!(count, 0);
}
