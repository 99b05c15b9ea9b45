//! HTTP test helpers for intervene-server tests.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use intervene_core::events::RunEvent;

/// Parse an SSE response body into run events.
pub fn parse_sse_events(body: &str) -> Vec<RunEvent> {
    body.split("\n\n")
        .filter(|s| !s.is_empty())
        .filter_map(|chunk| {
            chunk
                .strip_prefix("data: ")
                .and_then(|data| serde_json::from_str(data).ok())
        })
        .collect()
}

/// Send a request and return the status with the raw body.
pub async fn send(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, String) {
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_owned()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

/// Post to /api/run and return every streamed event.
pub async fn post_run(app: Router, body: &str) -> Vec<RunEvent> {
    let (status, body) = send(app, "POST", "/api/run", body).await;
    assert_eq!(status, StatusCode::OK);
    parse_sse_events(&body)
}

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn spawn_fake(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}
