use axum::body::Body;
use common::{body_bytes, json_body, request, setup_gateway, setup_gateway_with};
use http::StatusCode;
use serde_json::json;
use std::sync::atomic::Ordering;
use switchyard_core::gateway::GatewayConfig;

mod common;

#[tokio::test]
async fn test_rest_get_binds_path_variables() {
    let gw = setup_gateway();

    let response = gw.send(request("GET", "/v1/users/42", None, Body::empty())).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(json_body(response).await, json!({"name": "Ann"}));
    assert_eq!(gw.probe.last_user_id.load(Ordering::SeqCst), 42);
}

#[tokio::test]
async fn test_rest_backend_errors_are_translated() {
    let gw = setup_gateway();

    let response = gw.send(request("GET", "/v1/users/0", None, Body::empty())).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        json_body(response).await,
        json!({"code": 5, "message": "user 0 not found"})
    );

    let response = gw
        .send(request(
            "POST",
            "/v1/echo",
            Some("application/json"),
            r#"{"message": "denied"}"#,
        ))
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["code"], 7);
}

#[tokio::test]
async fn test_rest_unknown_routes_never_reach_the_backend() {
    let gw = setup_gateway();

    let response = gw.send(request("GET", "/v1/accounts/1", None, Body::empty())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["code"], 5);

    // Right path, wrong verb.
    let response = gw.send(request("DELETE", "/v1/users/1", None, Body::empty())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    assert_eq!(gw.probe.calls(), 0);
}

#[tokio::test]
async fn test_rest_query_parameters_bind_to_fields() {
    let gw = setup_gateway();

    let response = gw
        .send(request(
            "GET",
            "/v1/users?tags=a&tags=b&role=ROLE_ADMIN&pageSize=5",
            None,
            Body::empty(),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({"users": [{"id": "1", "name": "Ann", "tags": ["a", "b"], "role": "ROLE_ADMIN"}]})
    );
}

#[tokio::test]
async fn test_rest_additional_bindings_are_routed() {
    let gw = setup_gateway();

    let response = gw
        .send(request("GET", "/v1/teams/core%20team/users", None, Body::empty()))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["users"][0]["address"]["city"], "core team");
}

#[tokio::test]
async fn test_rest_bad_input_is_bad_request() {
    let gw = setup_gateway();

    let response = gw
        .send(request("GET", "/v1/users?colour=blue", None, Body::empty()))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], 3);

    let response = gw
        .send(request("GET", "/v1/users/forty-two", None, Body::empty()))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = gw
        .send(request("POST", "/v1/echo", Some("application/json"), "{not json"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(gw.probe.calls(), 0);
}

#[tokio::test]
async fn test_rest_body_field_merges_with_path() {
    let gw = setup_gateway();

    let response = gw
        .send(request(
            "PATCH",
            "/v1/users/7",
            Some("application/json"),
            r#"{"name": "Bo", "tags": ["x"]}"#,
        ))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({"id": "7", "name": "Bo", "tags": ["x"]})
    );
}

#[tokio::test]
async fn test_rest_whole_body() {
    let gw = setup_gateway();

    let response = gw
        .send(request(
            "POST",
            "/v1/echo",
            Some("application/json"),
            r#"{"message": "hello"}"#,
        ))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"message": "hello"}));
}

#[tokio::test]
async fn test_rest_server_streaming_is_ndjson() {
    let gw = setup_gateway();

    let response = gw
        .send(request("GET", "/v1/echo/hello:stream", None, Body::empty()))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/x-ndjson");

    let body = body_bytes(response).await;
    let lines: Vec<serde_json::Value> = std::str::from_utf8(&body)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(
        lines,
        vec![
            json!({"message": "hello - seq 0"}),
            json!({"message": "hello - seq 1"}),
            json!({"message": "hello - seq 2"}),
        ]
    );
}

#[tokio::test]
async fn test_rest_synthesized_bindings() {
    let gw = setup_gateway();

    // Client streaming has a synthesized route, but REST cannot carry it.
    let response = gw
        .send(request(
            "POST",
            "/echo.EchoService/ClientStreamingEcho",
            Some("application/json"),
            "{}",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    assert_eq!(gw.probe.calls(), 0);

    let gw = setup_gateway_with(GatewayConfig {
        synthesize_rest: false,
        ..common::config()
    });
    let response = gw
        .send(request(
            "POST",
            "/echo.EchoService/ClientStreamingEcho",
            Some("application/json"),
            "{}",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rest_idempotent_calls_are_retried() {
    let gw = setup_gateway();
    gw.probe.fail_next(2);

    let response = gw.send(request("GET", "/v1/users/5", None, Body::empty())).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(gw.probe.calls(), 3);
}

#[tokio::test]
async fn test_rest_exhausted_retries_are_unavailable() {
    let gw = setup_gateway();
    gw.probe.fail_next(10);

    let response = gw.send(request("GET", "/v1/users/5", None, Body::empty())).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["code"], 14);
    assert_eq!(gw.probe.calls(), 3);
}

#[tokio::test]
async fn test_rest_non_idempotent_calls_are_not_retried() {
    let gw = setup_gateway();
    gw.probe.fail_next(1);

    let response = gw
        .send(request(
            "PATCH",
            "/v1/users/7",
            Some("application/json"),
            r#"{"name": "Bo"}"#,
        ))
        .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(gw.probe.calls(), 1);
}

#[tokio::test]
async fn test_healthz_reports_readiness() {
    let gw = setup_gateway();

    let response = gw.send(request("GET", "/healthz", None, Body::empty())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, "ok");

    let idle = switchyard_core::gateway::Gateway::new(
        common::config(),
        common::registry(),
        echo_service::Backend::new(),
    );
    let response = tower::ServiceExt::oneshot(
        idle.into_router(),
        request("GET", "/healthz", None, Body::empty()),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
