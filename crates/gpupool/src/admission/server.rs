//! Webhook HTTP(S) surface.
//!
//! Four POST endpoints, one per webhook registration: the pool pair and
//! the pod pair. The transport decodes the review, hands it to the
//! matching handler, and maps failures onto status codes: 400 for bodies
//! that are not JSON, 422 for JSON that is not a usable review, 500 when
//! the cluster reads behind a decision fail. Policy denials stay HTTP 200
//! with `allowed=false`.

use std::convert::Infallible;

use http::status::StatusCode;
use tracing::{debug, error};
use warp::hyper::body::Bytes;
use warp::Filter;

use crate::config::ServerConfig;

use super::review::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use super::{AdmissionError, Webhooks};

fn parse_review(body: &[u8]) -> Result<AdmissionRequest, AdmissionError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AdmissionError::BadRequest(format!("body is not JSON: {}", e)))?;
    let review: AdmissionReview = serde_json::from_value(value)
        .map_err(|e| AdmissionError::Unprocessable(format!("not an AdmissionReview: {}", e)))?;
    review
        .request
        .ok_or_else(|| AdmissionError::Unprocessable("review carries no request".to_string()))
}

fn error_reply(err: &AdmissionError) -> warp::reply::Response {
    let status = match err {
        AdmissionError::BadRequest(_) => StatusCode::BAD_REQUEST,
        AdmissionError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AdmissionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut response = warp::reply::Response::new(err.to_string().into());
    *response.status_mut() = status;
    response
}

fn review_reply(response: AdmissionResponse) -> warp::reply::Response {
    let review = response.into_review();
    match serde_json::to_vec(&review) {
        Ok(body) => {
            let mut response = warp::reply::Response::new(body.into());
            response.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => {
            error!(error = %e, "cannot encode admission review response");
            let mut response = warp::reply::Response::new("encoding failure".into());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

fn finish(
    result: Result<AdmissionResponse, AdmissionError>,
) -> Result<warp::reply::Response, Infallible> {
    match result {
        Ok(response) => {
            debug!(allowed = response.allowed, "admission decided");
            Ok(review_reply(response))
        }
        Err(e) => {
            error!(error = %e, "admission request failed");
            Ok(error_reply(&e))
        }
    }
}

async fn handle_validate_pod(
    webhooks: Webhooks,
    body: Bytes,
) -> Result<warp::reply::Response, Infallible> {
    let request = match parse_review(&body) {
        Ok(request) => request,
        Err(e) => return Ok(error_reply(&e)),
    };
    finish(webhooks.validate_pod(&request).await)
}

async fn handle_mutate_pod(
    webhooks: Webhooks,
    body: Bytes,
) -> Result<warp::reply::Response, Infallible> {
    let request = match parse_review(&body) {
        Ok(request) => request,
        Err(e) => return Ok(error_reply(&e)),
    };
    finish(webhooks.mutate_pod(&request).await)
}

async fn handle_validate_pool(
    webhooks: Webhooks,
    body: Bytes,
) -> Result<warp::reply::Response, Infallible> {
    let request = match parse_review(&body) {
        Ok(request) => request,
        Err(e) => return Ok(error_reply(&e)),
    };
    finish(webhooks.validate_pool(&request).await)
}

async fn handle_mutate_pool(
    webhooks: Webhooks,
    body: Bytes,
) -> Result<warp::reply::Response, Infallible> {
    let request = match parse_review(&body) {
        Ok(request) => request,
        Err(e) => return Ok(error_reply(&e)),
    };
    finish(webhooks.mutate_pool(&request).await)
}

/// The webhook route tree, separated from the TLS server so tests can
/// drive it directly.
pub(crate) fn routes(
    webhooks: Webhooks,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let ctx = warp::any().map(move || webhooks.clone());

    let health = warp::get().and(warp::path("healthz")).map(|| "ok");
    let validate_pod = warp::post()
        .and(warp::path("validate-pod"))
        .and(warp::path::end())
        .and(ctx.clone())
        .and(warp::body::bytes())
        .and_then(handle_validate_pod);
    let mutate_pod = warp::post()
        .and(warp::path("mutate-pod"))
        .and(warp::path::end())
        .and(ctx.clone())
        .and(warp::body::bytes())
        .and_then(handle_mutate_pod);
    let validate_pool = warp::post()
        .and(warp::path("validate-gpupool"))
        .and(warp::path::end())
        .and(ctx.clone())
        .and(warp::body::bytes())
        .and_then(handle_validate_pool);
    let mutate_pool = warp::post()
        .and(warp::path("mutate-gpupool"))
        .and(warp::path::end())
        .and(ctx)
        .and(warp::body::bytes())
        .and_then(handle_mutate_pool);

    health
        .or(validate_pod)
        .or(mutate_pod)
        .or(validate_pool)
        .or(mutate_pool)
}

/// Starts the webhook TLS server. Runs until the process stops.
pub async fn start(webhooks: Webhooks, config: &ServerConfig) -> anyhow::Result<()> {
    warp::serve(routes(webhooks))
        .tls()
        .cert_path(&config.cert_file)
        .key_path(&config.private_key_file)
        .run((config.addr, config.port))
        .await;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::super::test_support::mock_client;
    use super::*;
    use crate::moduleconfig::SettingsStore;

    #[test]
    fn garbage_body_is_a_bad_request() {
        let err = parse_review(b"not json at all").unwrap_err();
        assert!(matches!(err, AdmissionError::BadRequest(_)));
    }

    #[test]
    fn json_that_is_no_review_is_unprocessable() {
        let err = parse_review(br#"{"kind": "Pod"}"#).unwrap_err();
        assert!(matches!(err, AdmissionError::Unprocessable(_)));
    }

    #[test]
    fn review_without_request_is_unprocessable() {
        let body = br#"{"apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview"}"#;
        let err = parse_review(body).unwrap_err();
        assert!(matches!(err, AdmissionError::Unprocessable(_)));
    }

    fn test_routes() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        routes(Webhooks::new(mock_client(), SettingsStore::default()))
    }

    fn pod_review(pod: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "uid-1",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "operation": "CREATE",
                "namespace": "ml",
                "object": pod,
            }
        })
    }

    #[tokio::test]
    async fn health_endpoint_answers() {
        let response = warp::test::request()
            .method("GET")
            .path("/healthz")
            .reply(&test_routes())
            .await;
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn non_json_body_yields_400() {
        let response = warp::test::request()
            .method("POST")
            .path("/validate-pod")
            .body("definitely not json")
            .reply(&test_routes())
            .await;
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn wrong_shape_yields_422() {
        let response = warp::test::request()
            .method("POST")
            .path("/validate-pod")
            .body(r#"{"kind": "Pod"}"#)
            .reply(&test_routes())
            .await;
        assert_eq!(response.status(), 422);
    }

    #[tokio::test]
    async fn pod_without_pool_resources_is_allowed() {
        // no cluster reads happen on this path, the mock client is inert
        let pod = serde_json::json!({
            "metadata": {"name": "plain"},
            "spec": {"containers": [{"name": "c"}]},
        });
        let response = warp::test::request()
            .method("POST")
            .path("/validate-pod")
            .json(&pod_review(pod))
            .reply(&test_routes())
            .await;
        assert_eq!(response.status(), 200);
        let review: AdmissionReview = serde_json::from_slice(response.body()).unwrap();
        assert!(review.response.unwrap().allowed);
    }

    #[tokio::test]
    async fn two_pools_are_denied_with_403_result() {
        let pod = serde_json::json!({
            "metadata": {"name": "greedy"},
            "spec": {"containers": [
                {"name": "a", "resources": {"limits": {"gpu.deckhouse.io/a": "1"}}},
                {"name": "b", "resources": {"limits": {"gpu.deckhouse.io/b": "1"}}},
            ]},
        });
        let response = warp::test::request()
            .method("POST")
            .path("/validate-pod")
            .json(&pod_review(pod))
            .reply(&test_routes())
            .await;
        assert_eq!(response.status(), 200);
        let review: AdmissionReview = serde_json::from_slice(response.body()).unwrap();
        let inner = review.response.unwrap();
        assert!(!inner.allowed);
        let status = inner.status.unwrap();
        assert_eq!(status.code, Some(403));
        assert_eq!(status.message.as_deref(), Some("multiple GPU pools requested"));
    }
}
