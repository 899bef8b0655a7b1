use shop_api::db::MIGRATOR;
use shop_api::test_support::{TestDatabase, TestDatabaseError};

async fn table_count(pool: &sqlx::PgPool, name: &str) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public' AND table_name = $1",
    )
    .bind(name)
    .fetch_one(pool)
    .await
    .expect("lookup succeeded")
}

#[tokio::test]
async fn migrations_apply_and_revert_cleanly() {
    let test_db = match TestDatabase::new().await {
        Ok(db) => db,
        Err(TestDatabaseError::Container(err)) => {
            eprintln!("skipping migration revert test: no container runtime ({err})");
            return;
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    };

    let pool = test_db.pool_clone();

    MIGRATOR.run(&pool).await.expect("migrations run");
    MIGRATOR.undo(&pool, 0).await.expect("migrations revert");

    for table in ["users", "revoked_tokens", "verification_codes"] {
        assert_eq!(table_count(&pool, table).await, 0, "{table} should be dropped after revert");
    }

    MIGRATOR.run(&pool).await.expect("migrations rerun");

    for table in ["users", "revoked_tokens", "verification_codes"] {
        assert_eq!(table_count(&pool, table).await, 1, "{table} should exist again");
    }

    test_db.close().await.expect("failed to stop test database");
}
