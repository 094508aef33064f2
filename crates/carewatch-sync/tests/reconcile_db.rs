//! Reconciliation and aggregation invariants against a live PostgreSQL.
//!
//! Ignored by default: point `DATABASE_URL` at a scratch database and run
//! `cargo test -p carewatch-sync -- --ignored`.

use std::path::PathBuf;

use carewatch_adapters::adapter_for_dataset;
use carewatch_core::DatasetKind;
use carewatch_storage::run_migrations;
use carewatch_sync::{
    recalculate_aggregates, reconcile_page, PageOutcome, SyncConfig, SyncContext,
};
use chrono::NaiveDate;
use serde_json::json;
use sqlx::Row;
use uuid::Uuid;

fn test_config(database_url: String) -> SyncConfig {
    SyncConfig {
        api_base_url: "http://localhost:1".to_string(),
        app_token: None,
        database_url,
        batch_size: 100,
        request_delay_ms: 0,
        max_records: 10_000,
        max_fetch_retries: 0,
        http_timeout_secs: 5,
        user_agent: "carewatch-tests".to_string(),
        max_db_connections: 5,
        registry_path: PathBuf::from("datasets.yaml"),
        reports_dir: std::env::temp_dir().join("carewatch-test-reports"),
        artifacts_dir: None,
        scheduler_enabled: false,
        sync_cron: "0 0 5 * * *".to_string(),
    }
}

async fn test_context() -> SyncContext {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a scratch database");
    let ctx = SyncContext::new(test_config(database_url))
        .await
        .expect("context");
    run_migrations(&ctx.pool).await.expect("migrations");
    ctx
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires a provisioned DATABASE_URL"]
async fn resyncing_an_unchanged_page_writes_nothing() {
    let ctx = test_context().await;
    let adapter = adapter_for_dataset(DatasetKind::Facilities);
    let op_a = unique("op");
    let op_b = unique("op");
    let page = vec![
        json!({"operation_number": op_a, "operation_name": "A", "city": "Austin"}),
        json!({"operation_number": op_b, "operation_name": "B"}),
    ];

    let PageOutcome::Committed(first) = reconcile_page(&ctx, adapter, &page, 0).await else {
        panic!("first pass abandoned");
    };
    assert_eq!(first.inserted, 2);
    assert!(first.failed.is_empty());

    let PageOutcome::Committed(second) = reconcile_page(&ctx, adapter, &page, 0).await else {
        panic!("second pass abandoned");
    };
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.unchanged, 2);

    let row = sqlx::query("SELECT COUNT(*) AS n FROM facilities WHERE operation_number = ANY($1)")
        .bind(vec![op_a.clone(), op_b.clone()])
        .fetch_one(&ctx.pool)
        .await
        .expect("count");
    assert_eq!(row.get::<i64, _>("n"), 2);

    let row = sqlx::query("SELECT operation_name FROM facilities WHERE operation_number = $1")
        .bind(&op_a)
        .fetch_one(&ctx.pool)
        .await
        .expect("fetch facility");
    assert_eq!(row.get::<Option<String>, _>("operation_name").as_deref(), Some("A"));
}

#[tokio::test]
#[ignore = "requires a provisioned DATABASE_URL"]
async fn sparse_second_payload_preserves_untouched_fields() {
    let ctx = test_context().await;
    let adapter = adapter_for_dataset(DatasetKind::Facilities);
    let op = unique("op");

    let first_page = vec![json!({
        "operation_number": op,
        "operation_name": "First Name",
        "city": "Austin",
    })];
    let PageOutcome::Committed(_) = reconcile_page(&ctx, adapter, &first_page, 0).await else {
        panic!("first pass abandoned");
    };

    let second_page = vec![json!({
        "operation_number": op,
        "total_capacity": "24",
    })];
    let PageOutcome::Committed(second) = reconcile_page(&ctx, adapter, &second_page, 0).await
    else {
        panic!("second pass abandoned");
    };
    assert_eq!(second.updated, 1);

    let row = sqlx::query(
        "SELECT operation_name, city, capacity FROM facilities WHERE operation_number = $1",
    )
    .bind(&op)
    .fetch_one(&ctx.pool)
    .await
    .expect("fetch facility");
    assert_eq!(
        row.get::<Option<String>, _>("operation_name").as_deref(),
        Some("First Name")
    );
    assert_eq!(row.get::<Option<String>, _>("city").as_deref(), Some("Austin"));
    assert_eq!(row.get::<Option<i64>, _>("capacity"), Some(24));

    let third_page = vec![json!({
        "operation_number": op,
        "city": "Dallas",
    })];
    let PageOutcome::Committed(_) = reconcile_page(&ctx, adapter, &third_page, 0).await else {
        panic!("third pass abandoned");
    };
    let row = sqlx::query(
        "SELECT operation_name, city, capacity FROM facilities WHERE operation_number = $1",
    )
    .bind(&op)
    .fetch_one(&ctx.pool)
    .await
    .expect("fetch facility");
    assert_eq!(row.get::<Option<String>, _>("city").as_deref(), Some("Dallas"));
    assert_eq!(
        row.get::<Option<String>, _>("operation_name").as_deref(),
        Some("First Name")
    );
    assert_eq!(row.get::<Option<i64>, _>("capacity"), Some(24));
}

#[tokio::test]
#[ignore = "requires a provisioned DATABASE_URL"]
async fn one_bad_record_does_not_block_its_page() {
    let ctx = test_context().await;
    let adapter = adapter_for_dataset(DatasetKind::Facilities);

    sqlx::query("ALTER TABLE facilities DROP CONSTRAINT IF EXISTS facilities_capacity_non_negative")
        .execute(&ctx.pool)
        .await
        .expect("drop constraint");
    sqlx::query(
        "ALTER TABLE facilities ADD CONSTRAINT facilities_capacity_non_negative \
         CHECK (capacity IS NULL OR capacity >= 0)",
    )
    .execute(&ctx.pool)
    .await
    .expect("add constraint");

    let op_bad = unique("op");
    let op_good = unique("op");
    let page = vec![
        json!({"operation_number": op_bad, "total_capacity": "-5"}),
        json!({"operation_name": "no natural key"}),
        json!({"operation_number": op_good, "total_capacity": "30"}),
    ];

    let PageOutcome::Committed(report) = reconcile_page(&ctx, adapter, &page, 0).await else {
        panic!("page abandoned");
    };
    assert_eq!(report.inserted, 1);
    assert_eq!(report.failed.len(), 2);

    let row = sqlx::query("SELECT COUNT(*) AS n FROM facilities WHERE operation_number = $1")
        .bind(&op_good)
        .fetch_one(&ctx.pool)
        .await
        .expect("count good");
    assert_eq!(row.get::<i64, _>("n"), 1);

    let row = sqlx::query("SELECT COUNT(*) AS n FROM facilities WHERE operation_number = $1")
        .bind(&op_bad)
        .fetch_one(&ctx.pool)
        .await
        .expect("count bad");
    assert_eq!(row.get::<i64, _>("n"), 0);
}

#[tokio::test]
#[ignore = "requires a provisioned DATABASE_URL"]
async fn aggregation_rebuilds_buckets_and_is_idempotent() {
    let ctx = test_context().await;
    let op = unique("op");

    let facilities = adapter_for_dataset(DatasetKind::Facilities);
    let page = vec![json!({"operation_number": op, "operation_name": "Agg Test"})];
    let PageOutcome::Committed(_) = reconcile_page(&ctx, facilities, &page, 0).await else {
        panic!("facility page abandoned");
    };

    let inspections = adapter_for_dataset(DatasetKind::Inspections);
    let page = vec![json!({
        "activity_id": unique("act"),
        "operation_id": op,
        "activity_date": "2024-03-07T00:00:00.000",
        "activity_type": "Monitoring",
    })];
    let PageOutcome::Committed(_) = reconcile_page(&ctx, inspections, &page, 0).await else {
        panic!("inspection page abandoned");
    };

    let violations = adapter_for_dataset(DatasetKind::Violations);
    let page = vec![
        json!({
            "non_compliance_id": unique("nc"),
            "operation_id": op,
            "standard_risk_level": "High",
        }),
        json!({
            "non_compliance_id": unique("nc"),
            "operation_id": op,
            "standard_risk_level": "High",
        }),
        json!({
            "non_compliance_id": unique("nc"),
            "operation_id": op,
            "standard_risk_level": "Medium Low",
        }),
        json!({
            "non_compliance_id": unique("nc"),
            "operation_id": op,
            "standard_risk_level": "Unheard Of",
        }),
    ];
    let PageOutcome::Committed(report) = reconcile_page(&ctx, violations, &page, 0).await else {
        panic!("violation page abandoned");
    };
    assert_eq!(report.inserted, 4);

    let summary = recalculate_aggregates(&ctx.pool).await.expect("aggregate");
    assert!(summary.facilities_updated >= 1);

    let row = sqlx::query(
        "SELECT high_risk_violations, medium_low_risk_violations, low_risk_violations, \
                total_violations, last_inspection_date, updated_at \
         FROM facilities WHERE operation_number = $1",
    )
    .bind(&op)
    .fetch_one(&ctx.pool)
    .await
    .expect("fetch facility");
    assert_eq!(row.get::<i64, _>("high_risk_violations"), 2);
    assert_eq!(row.get::<i64, _>("medium_low_risk_violations"), 1);
    assert_eq!(row.get::<i64, _>("low_risk_violations"), 0);
    assert_eq!(row.get::<i64, _>("total_violations"), 4);
    assert_eq!(
        row.get::<Option<NaiveDate>, _>("last_inspection_date"),
        NaiveDate::from_ymd_opt(2024, 3, 7)
    );

    let violation_count =
        sqlx::query("SELECT COUNT(*) AS n FROM violation_records WHERE operation_id = $1")
            .bind(&op)
            .fetch_one(&ctx.pool)
            .await
            .expect("count violations")
            .get::<i64, _>("n");
    assert_eq!(row.get::<i64, _>("total_violations"), violation_count);

    let updated_at_before: chrono::DateTime<chrono::Utc> = row.get("updated_at");
    recalculate_aggregates(&ctx.pool).await.expect("second aggregate");
    let row = sqlx::query("SELECT updated_at FROM facilities WHERE operation_number = $1")
        .bind(&op)
        .fetch_one(&ctx.pool)
        .await
        .expect("fetch facility again");
    assert_eq!(
        row.get::<chrono::DateTime<chrono::Utc>, _>("updated_at"),
        updated_at_before
    );
}
