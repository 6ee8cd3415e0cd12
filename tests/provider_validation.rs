use std::sync::Arc;
use std::time::Duration;

use httpmock::{Method::GET, MockServer};
use keyledger::test_support::{fast_cipher, should_skip_httpmock};
use keyledger::{
    CredentialError, GeminiKeyValidator, KeyCheck, KeyService, KeyValidator, KeyledgerError,
    ManualClock, MemoryStore,
};

const NOW: u64 = 1_700_000_000_000;
const GOOD_KEY: &str = "AIzaSyGoodKey000000000000000000000000";
const REVOKED_KEY: &str = "AIzaSyRevokedKey00000000000000000000";
const FLAKY_KEY: &str = "AIzaSyFlakyKey0000000000000000000000";

fn validator(server: &MockServer) -> GeminiKeyValidator {
    GeminiKeyValidator::new(Duration::from_secs(5)).with_base_url(server.url("/v1beta"))
}

#[tokio::test]
async fn validator_classifies_provider_answers() {
    if should_skip_httpmock() {
        return;
    }

    let server = MockServer::start_async().await;
    let good = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1beta/models")
                .query_param("pageSize", "1")
                .header("x-goog-api-key", GOOD_KEY);
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"models":[{"name":"models/gemini-2.0-flash"}]}"#);
        })
        .await;
    let revoked = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1beta/models")
                .header("x-goog-api-key", REVOKED_KEY);
            then.status(403)
                .header("content-type", "application/json")
                .body(r#"{"error":{"code":403,"status":"PERMISSION_DENIED"}}"#);
        })
        .await;
    let flaky = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1beta/models")
                .header("x-goog-api-key", FLAKY_KEY);
            then.status(500).body("upstream error");
        })
        .await;

    let validator = validator(&server);
    assert_eq!(validator.check_key(GOOD_KEY).await, KeyCheck::Valid);
    assert_eq!(
        validator.check_key(REVOKED_KEY).await,
        KeyCheck::Rejected { status: 403 }
    );
    assert!(matches!(
        validator.check_key(FLAKY_KEY).await,
        KeyCheck::Unreachable { .. }
    ));

    good.assert_async().await;
    revoked.assert_async().await;
    flaky.assert_async().await;
}

#[tokio::test]
async fn live_validation_gates_key_submission() {
    if should_skip_httpmock() {
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1beta/models")
                .header("x-goog-api-key", GOOD_KEY);
            then.status(200).body("{}");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1beta/models")
                .header("x-goog-api-key", REVOKED_KEY);
            then.status(401).body("{}");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1beta/models")
                .header("x-goog-api-key", FLAKY_KEY);
            then.status(503).body("{}");
        })
        .await;

    let service = KeyService::builder(Arc::new(MemoryStore::new()), fast_cipher("master"))
        .clock(Arc::new(ManualClock::new(NOW)))
        .live_validation(Arc::new(validator(&server)))
        .build();

    let status = service.set_key("u1", GOOD_KEY, None).await.expect("valid key");
    assert_eq!(status.last_validated_at_ms, Some(NOW));

    let err = service.set_key("u2", REVOKED_KEY, None).await.unwrap_err();
    assert!(matches!(
        err,
        KeyledgerError::Credential(CredentialError::Validation(_))
    ));
    assert!(!service.key_status("u2").await.expect("status").has_key);

    // Provider outage falls back to the format check.
    let status = service.set_key("u3", FLAKY_KEY, None).await.expect("fallback");
    assert!(status.has_key);
    assert_eq!(status.last_validated_at_ms, None);
}
