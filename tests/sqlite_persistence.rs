#![cfg(feature = "store-sqlite")]

use std::sync::Arc;

use keyledger::store::DayRange;
use keyledger::test_support::fast_cipher;
use keyledger::{
    AppendOutcome, Authorizer, CurrentUser, KeyService, KeySource, ManualClock,
    OverrideConditions, OverrideConfig, ProfileStore, Role, SqliteStore, UsageLimits, UsageReport,
};

const NOW: u64 = 1_700_000_000_000;
const USER_KEY: &str = "AIzaSyUserOwnedKey0000000000000000000";

fn service(store: SqliteStore, clock: &ManualClock) -> KeyService {
    KeyService::builder(Arc::new(store), fast_cipher("master"))
        .clock(Arc::new(clock.clone()))
        .build()
}

fn usage(request_id: &str) -> UsageReport {
    UsageReport {
        model: "gemini-1.5-flash".to_string(),
        prompt_tokens: 100,
        completion_tokens: 50,
        request_id: Some(request_id.to_string()),
        ..UsageReport::default()
    }
}

#[tokio::test]
async fn profile_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("keyledger.sqlite");
    let clock = ManualClock::new(NOW);
    let admin = CurrentUser::new("admin-1").with_role(Role::Admin);
    let grant = Authorizer::default().require_admin(&admin).expect("grant");

    {
        let store = SqliteStore::open(&path).await.expect("open");
        let service = service(store, &clock);
        service
            .set_key("u1", USER_KEY, Some(NOW + 3_600_000))
            .await
            .expect("set key");
        service
            .log_usage("u1", usage("r1"))
            .await
            .expect("log usage");
        service
            .set_override(
                "u1",
                OverrideConfig {
                    is_active: true,
                    reason: Some("quota incident".to_string()),
                    conditions: OverrideConditions {
                        on_rate_limit_exceeded: true,
                        ..OverrideConditions::default()
                    },
                    ..OverrideConfig::default()
                },
                &grant,
            )
            .await
            .expect("override");
        service
            .set_usage_limits(
                "u1",
                UsageLimits {
                    daily_tokens: Some(10_000),
                    ..UsageLimits::default()
                },
                &grant,
            )
            .await
            .expect("limits");
    }

    let store = SqliteStore::open(&path).await.expect("reopen");
    let limits = store.usage_limits("u1").await.expect("limits");
    assert_eq!(limits.and_then(|l| l.daily_tokens), Some(10_000));

    let service = service(store, &clock);
    let key = service.resolve_key_for_use("u1").await.expect("resolve");
    assert_eq!(key.source(), KeySource::User);
    assert_eq!(key.expose(), USER_KEY);

    let status = service.key_status("u1").await.expect("status");
    assert_eq!(status.expires_at_ms, Some(NOW + 3_600_000));

    let stored = service
        .get_override("u1", &grant)
        .await
        .expect("get override")
        .expect("override present");
    assert_eq!(stored.reason.as_deref(), Some("quota incident"));
    assert_eq!(stored.activated_by, "admin-1");
    assert!(stored.conditions.on_rate_limit_exceeded);
    assert!(!stored.conditions.on_missing_key);

    let outcome = service.log_usage("u1", usage("r1")).await.expect("replay");
    assert_eq!(outcome, AppendOutcome::Duplicate);

    let metrics = service.usage_metrics("u1").await.expect("metrics");
    assert_eq!(metrics.totals.all_time_requests, 1);
    assert_eq!(metrics.totals.all_time_tokens, 150);
    assert_eq!(metrics.daily[0].model_breakdown["gemini-1.5-flash"].total_tokens, 150);
}

#[tokio::test]
async fn concurrent_appends_are_all_counted() {
    const TASKS: usize = 8;
    const PER_TASK: usize = 20;

    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::open(dir.path().join("ledger.sqlite"))
        .await
        .expect("open");
    let clock = ManualClock::new(NOW);
    let service = Arc::new(service(store, &clock));

    let mut handles = Vec::new();
    for task in 0..TASKS {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..PER_TASK {
                let request_id = format!("t{task}-r{i}");
                service
                    .log_usage("u1", usage(&request_id))
                    .await
                    .expect("log usage");
            }
            // Replay the task's first id once.
            let outcome = service
                .log_usage("u1", usage(&format!("t{task}-r0")))
                .await
                .expect("replay");
            assert_eq!(outcome, AppendOutcome::Duplicate);
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }

    let expected = (TASKS * PER_TASK) as u64;
    let events = service.usage("u1", &DayRange::all()).await.expect("events");
    assert_eq!(events.len() as u64, expected);

    let metrics = service.usage_metrics("u1").await.expect("metrics");
    assert_eq!(metrics.totals.all_time_requests, expected);
    assert_eq!(metrics.totals.all_time_tokens, expected * 150);
    assert_eq!(metrics.totals.all_time_cost_usd_micros, expected * 23);
    assert_eq!(metrics.monthly[0].request_count, expected);
}

#[tokio::test]
async fn removed_records_leave_no_user_behind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::open(dir.path().join("ledger.sqlite"))
        .await
        .expect("open");
    let clock = ManualClock::new(NOW);
    let service = service(store.clone(), &clock);

    service.set_key("u1", USER_KEY, None).await.expect("set");
    service.set_key("u2", USER_KEY, None).await.expect("set");
    assert_eq!(store.user_ids().await.expect("ids"), ["u1", "u2"]);

    assert!(service.remove_key("u1").await.expect("remove"));
    assert!(!service.remove_key("u1").await.expect("remove again"));
    assert_eq!(store.user_ids().await.expect("ids"), ["u2"]);
}
