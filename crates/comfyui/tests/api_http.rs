//! HTTP-level tests for [`ComfyUIApi`] against a mock ComfyUI server.

use assert_matches::assert_matches;
use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use indus_comfyui::api::{ComfyUIApi, ComfyUIApiError, SubmitOutcome};
use indus_comfyui::history::{ExecutionState, OutputDescriptor};

async fn api_for(server: &MockServer) -> ComfyUIApi {
    ComfyUIApi::new(server.uri())
}

// ---------------------------------------------------------------------------
// Health probe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn system_stats_ok_is_healthy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/system_stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"system": {}})))
        .expect(1)
        .mount(&server)
        .await;

    api_for(&server).await.system_stats().await.unwrap();
}

#[tokio::test]
async fn system_stats_error_status_is_unhealthy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/system_stats"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = api_for(&server).await.system_stats().await.unwrap_err();
    assert_matches!(err, ComfyUIApiError::ApiError { status: 503, .. });
}

#[tokio::test]
async fn unreachable_server_is_a_request_error() {
    // Nothing listens on port 9 on the loopback interface.
    let api = ComfyUIApi::new("http://127.0.0.1:9".into());
    let err = api.system_stats().await.unwrap_err();
    assert_matches!(err, ComfyUIApiError::Request(_));
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_wraps_workflow_in_prompt() {
    let server = MockServer::start().await;
    let workflow = json!({"3": {"class_type": "KSampler", "inputs": {}}});
    Mock::given(method("POST"))
        .and(path("/prompt"))
        .and(body_partial_json(json!({"prompt": workflow.clone(), "client_id": "client-1"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"prompt_id": "p1", "number": 0, "node_errors": {}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let outcome = api_for(&server)
        .await
        .submit(&workflow, "client-1")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SubmitOutcome::Accepted {
            prompt_id: "p1".into(),
            number: Some(0),
        }
    );
}

#[tokio::test]
async fn submit_reads_error_body_on_400() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/prompt"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"type": "invalid_prompt", "message": "Cannot execute because node X does not exist."},
            "node_errors": {}
        })))
        .mount(&server)
        .await;

    let outcome = api_for(&server)
        .await
        .submit(&json!({"1": {}}), "c")
        .await
        .unwrap();
    assert_matches!(outcome, SubmitOutcome::Rejected { detail } if detail.contains("invalid_prompt"));
}

#[tokio::test]
async fn submit_non_json_body_is_an_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/prompt"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
        .mount(&server)
        .await;

    let err = api_for(&server)
        .await
        .submit(&json!({"1": {}}), "c")
        .await
        .unwrap_err();
    assert_matches!(err, ComfyUIApiError::ApiError { status: 500, body } if body == "Internal Server Error");
}

// ---------------------------------------------------------------------------
// History, view, queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_is_parsed_and_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/history/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "p1": {
                "prompt": [0, "p1", {}, {}, ["9"]],
                "status": {"status_str": "success", "completed": true, "messages": []},
                "outputs": {"9": {"images": [{"filename": "ComfyUI_00001_.png", "subfolder": "", "type": "output"}]}}
            }
        })))
        .mount(&server)
        .await;

    let history = api_for(&server).await.history("p1").await.unwrap();
    assert_matches!(
        history.state_of("p1"),
        ExecutionState::Completed { images } if images[0].filename == "ComfyUI_00001_.png"
    );
}

#[tokio::test]
async fn download_passes_locator_as_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/view"))
        .and(query_param("filename", "out.png"))
        .and(query_param("subfolder", "faces"))
        .and(query_param("type", "temp"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x89PNG\r\n".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let descriptor = OutputDescriptor {
        filename: "out.png".into(),
        subfolder: "faces".into(),
        kind: "temp".into(),
    };
    let data = api_for(&server).await.download(&descriptor).await.unwrap();
    assert_eq!(&data[..], b"\x89PNG\r\n");
}

#[tokio::test]
async fn cancel_deletes_from_queue() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/queue"))
        .and(body_json(json!({"delete": ["p1"]})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    api_for(&server).await.cancel("p1").await.unwrap();
}
