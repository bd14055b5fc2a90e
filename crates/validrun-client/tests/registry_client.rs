//! Integration tests for RegistryClient.
//!
//! Uses wiremock for HTTP mocking. Tests cover descriptor lookup, status
//! mapping (400/401/403/404/429/5xx), retry and backoff, and credential refresh.

use std::time::{Duration, Instant};

use uuid::Uuid;
use validrun_client::{
    AuthSession, ClientCredentials, EntityKind, Registry, RegistryClient, RegistryConfig,
    RegistryError, ScoreResult, SubmitRequest,
};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(5);

fn test_config(mock_server: &MockServer) -> RegistryConfig {
    RegistryConfig::default()
        .with_url(mock_server.uri())
        .with_retry_base_delay_ms(1)
        .with_jitter(false)
}

fn create_test_client(mock_server: &MockServer) -> RegistryClient {
    RegistryClient::new(test_config(mock_server), AuthSession::static_token("test-token"))
        .expect("failed to create client")
}

fn model_json(id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": "resnet-baseline",
        "owner": "vision-team",
        "version": "3.1.0",
        "alias": "baseline",
        "metadata": {"framework": "onnx"}
    })
}

fn submit_request() -> SubmitRequest {
    SubmitRequest {
        run_id: Uuid::new_v4(),
        model_id: "m-1".into(),
        test_id: "t-1".into(),
        score: ScoreResult::numeric("ZScore", 1.25),
        idempotency_key: "key-1".into(),
    }
}

#[tokio::test]
async fn test_fetch_model_success() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models/m-1"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(model_json("m-1")))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let model = client.fetch_model("m-1", TIMEOUT).await.expect("fetch failed");

    assert_eq!(model.id, "m-1");
    assert_eq!(model.owner, "vision-team");
    assert_eq!(model.alias.as_deref(), Some("baseline"));
    assert_eq!(model.metadata["framework"], "onnx");
}

#[tokio::test]
async fn test_fetch_test_success() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/tests/t-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "t-1",
            "name": "imagenet-top1",
            "input_format": "image/png",
            "scoring_method": "z_score",
            "version": "2"
        })))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let test = client.fetch_test("t-1", TIMEOUT).await.expect("fetch failed");

    assert_eq!(test.scoring_method, "z_score");
    assert!(test.alias.is_none());
    assert!(test.metadata.is_empty());
}

fn test_json(id: &str, version: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": "cell density",
        "input_format": "json",
        "scoring_method": "z_score",
        "version": version,
        "alias": "CDT-5"
    })
}

#[tokio::test]
async fn test_fetch_test_by_alias_and_version() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/tests"))
        .and(query_param("alias", "CDT-5"))
        .and(query_param("version", "5.0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            test_json("t-7", "5.0")
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let test = client
        .fetch_test_by_alias("CDT-5", "5.0", TIMEOUT)
        .await
        .expect("fetch failed");

    assert_eq!(test.id, "t-7");
    assert_eq!(test.version, "5.0");
}

#[tokio::test]
async fn test_fetch_test_by_alias_without_match_is_not_found() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/tests"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client.fetch_test_by_alias("CDT-5", "9.9", TIMEOUT).await;

    match result {
        Err(RegistryError::NotFound { kind, id }) => {
            assert_eq!(kind, EntityKind::Test);
            assert_eq!(id, "CDT-5@9.9");
        }
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fetch_test_by_alias_rejects_ambiguous_match() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/tests"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            test_json("t-7", "5.0"),
            test_json("t-8", "5.0")
        ])))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client.fetch_test_by_alias("CDT-5", "5.0", TIMEOUT).await;

    assert!(
        matches!(result, Err(RegistryError::InvalidResponse { .. })),
        "expected InvalidResponse, got {:?}",
        result
    );
}

#[tokio::test]
async fn test_fetch_model_by_alias() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models"))
        .and(query_param("alias", "baseline"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!([model_json("m-1")])),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let model = client
        .fetch_model_by_alias("baseline", TIMEOUT)
        .await
        .expect("fetch failed");

    assert_eq!(model.id, "m-1");
}

#[tokio::test]
async fn test_list_results_for_test() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/results"))
        .and(query_param("testId", "t-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {
                "submissionId": "sub-1",
                "modelId": "m-1",
                "testId": "t-1",
                "score": {"score_type": "ZScore", "value": {"type": "numeric", "value": 0.5}}
            },
            {
                "submissionId": "sub-2",
                "modelId": "m-2",
                "testId": "t-1",
                "score": {"score_type": "ZScore", "value": {"type": "numeric", "value": -1.0}},
                "createdAt": "2026-01-05T10:00:00Z"
            }
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let results = client
        .list_results("t-1", TIMEOUT)
        .await
        .expect("list failed");

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].submission_id, "sub-1");
    assert_eq!(results[0].score, ScoreResult::numeric("ZScore", 0.5));
    assert!(results[0].created_at.is_none());
    assert_eq!(results[1].model_id, "m-2");
    assert!(results[1].created_at.is_some());
}

#[tokio::test]
async fn test_list_results_empty() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/results"))
        .and(query_param("testId", "t-unscored"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let results = client
        .list_results("t-unscored", TIMEOUT)
        .await
        .expect("list failed");

    assert!(results.is_empty());
}

#[tokio::test]
async fn test_fetch_model_not_found_is_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models/nonexistent"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client.fetch_model("nonexistent", TIMEOUT).await;

    match result {
        Err(RegistryError::NotFound { kind, id }) => {
            assert_eq!(kind, EntityKind::Model);
            assert_eq!(id, "nonexistent");
        }
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn test_submit_validation_error_is_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/results"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(serde_json::json!({"detail": "score_type not accepted"})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client.submit_result(&submit_request(), TIMEOUT).await;

    match result {
        Err(RegistryError::Validation { message }) => {
            assert_eq!(message, "score_type not accepted");
        }
        other => panic!("expected Validation, got {:?}", other),
    }
    assert_eq!(client.attempts(), 1);
}

#[tokio::test]
async fn test_rate_limited_then_success() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models/m-1"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/models/m-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(model_json("m-1")))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let model = client.fetch_model("m-1", TIMEOUT).await.expect("fetch failed");

    assert_eq!(model.id, "m-1");
    assert_eq!(client.attempts(), 3);
}

#[tokio::test]
async fn test_retry_after_is_honored() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models/m-1"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/models/m-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(model_json("m-1")))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let started = Instant::now();
    client.fetch_model("m-1", TIMEOUT).await.expect("fetch failed");

    assert!(
        started.elapsed() >= Duration::from_secs(1),
        "retried before Retry-After elapsed: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_server_errors_exhaust_into_transient() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/results"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client.submit_result(&submit_request(), TIMEOUT).await;

    match result {
        Err(RegistryError::Transient { attempts, last }) => {
            assert_eq!(attempts, 3);
            assert!(last.contains("503"), "last error: {}", last);
        }
        other => panic!("expected Transient, got {:?}", other),
    }
}

#[tokio::test]
async fn test_slow_responses_time_out_and_exhaust() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/tests/t-1"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .expect(2)
        .mount(&mock_server)
        .await;

    let config = test_config(&mock_server).with_max_attempts(2);
    let client = RegistryClient::new(config, AuthSession::static_token("test-token"))
        .expect("failed to create client");

    let result = client.fetch_test("t-1", Duration::from_millis(200)).await;
    assert!(
        matches!(result, Err(RegistryError::Transient { attempts: 2, .. })),
        "expected Transient after 2 attempts, got {:?}",
        result
    );
}

#[tokio::test]
async fn test_forbidden_is_auth_error_without_retry() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models/private"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client.fetch_model("private", TIMEOUT).await;

    assert!(matches!(
        result,
        Err(RegistryError::Auth {
            rejected: false,
            ..
        })
    ));
}

#[tokio::test]
async fn test_unauthorized_refreshes_credential_once() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "tok-1",
            "expires_in": 3600,
            "token_type": "Bearer"
        })))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "tok-2",
            "expires_in": 3600
        })))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/models/m-1"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/models/m-1"))
        .and(header("authorization", "Bearer tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(model_json("m-1")))
        .expect(1)
        .mount(&mock_server)
        .await;

    let exchange = ClientCredentials::new(
        format!("{}/oauth/token", mock_server.uri()),
        "ci-runner",
        "s3cret",
    );
    let auth = AuthSession::new(std::sync::Arc::new(exchange));
    let client =
        RegistryClient::new(test_config(&mock_server), auth).expect("failed to create client");

    let model = client.fetch_model("m-1", TIMEOUT).await.expect("fetch failed");

    assert_eq!(model.id, "m-1");
    assert_eq!(client.auth().exchange_count(), 2);
    assert_eq!(client.attempts(), 2);
}

#[tokio::test]
async fn test_second_unauthorized_is_auth_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models/m-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client.fetch_model("m-1", TIMEOUT).await;

    assert!(
        matches!(result, Err(RegistryError::Auth { rejected: true, .. })),
        "expected rejected Auth, got {:?}",
        result
    );
}

#[tokio::test]
async fn test_identity_provider_rejection_is_auth_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/models/m-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(model_json("m-1")))
        .expect(0)
        .mount(&mock_server)
        .await;

    let exchange = ClientCredentials::new(
        format!("{}/oauth/token", mock_server.uri()),
        "ci-runner",
        "wrong",
    );
    let client = RegistryClient::new(
        test_config(&mock_server),
        AuthSession::new(std::sync::Arc::new(exchange)),
    )
    .expect("failed to create client");

    let result = client.fetch_model("m-1", TIMEOUT).await;
    assert!(matches!(
        result,
        Err(RegistryError::Auth { rejected: true, .. })
    ));
}
