//! Small client-side combinators shared by the handlers.
//!
//! Every device and node mutation in the chain is a read-compute-patch
//! wrapped in conflict retry: 409 refetches and retries with capped
//! backoff, 404 counts as success (the object was removed under us), and
//! everything else surfaces to the handler.

use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Taint};
use kube::api::{Api, Patch, PatchParams};
use kube::error::ErrorResponse;
use kube::Client;
use tracing::debug;

use crate::api::{GPUDevice, GPUDeviceStatus};

const CONFLICT_RETRIES: u8 = 5;
const CONFLICT_BASE_DELAY: Duration = Duration::from_millis(100);
const CONFLICT_MAX_DELAY: Duration = Duration::from_secs(2);

/// Retries `action` while it fails with 409 Conflict, up to a bounded
/// number of attempts with doubling delay. Other results pass through on
/// first occurrence.
pub async fn with_conflict_retry<T, F, Fut>(mut action: F) -> kube::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = kube::Result<T>>,
{
    let mut delay = CONFLICT_BASE_DELAY;
    let mut attempt = 0u8;
    loop {
        attempt += 1;
        match action().await {
            Err(kube::Error::Api(ErrorResponse { code: 409, .. })) if attempt < CONFLICT_RETRIES => {
                debug!(attempt, "conflict, refetching and retrying");
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, CONFLICT_MAX_DELAY);
            }
            other => break other,
        }
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ErrorResponse { code: 404, .. }))
}

/// Read-compute-patch on a device status. Returns whether a write happened;
/// a vanished device is success with no write.
pub async fn update_device_status<M>(client: &Client, name: &str, mutate: M) -> kube::Result<bool>
where
    M: Fn(&mut GPUDeviceStatus),
{
    let api: Api<GPUDevice> = Api::all(client.clone());
    let mutate = &mutate;
    with_conflict_retry(|| {
        let api = api.clone();
        async move {
            let device = match api.get(name).await {
                Ok(device) => device,
                Err(ref e) if is_not_found(e) => return Ok(false),
                Err(e) => return Err(e),
            };
            let mut status = device.status.clone().unwrap_or_default();
            let observed = status.clone();
            mutate(&mut status);
            if status == observed {
                return Ok(false);
            }
            let patch = serde_json::json!({ "status": status });
            match api
                .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => Ok(true),
                Err(ref e) if is_not_found(e) => Ok(false),
                Err(e) => Err(e),
            }
        }
    })
    .await
}

/// Taints across the given nodes, in node order. Vanished nodes are
/// skipped. Used both when rendering workload tolerations and when the pod
/// defaulter mirrors node taints into a workload.
pub async fn collect_node_taints(client: &Client, node_names: &[String]) -> kube::Result<Vec<Taint>> {
    let api: Api<Node> = Api::all(client.clone());
    let mut taints = Vec::new();
    for name in node_names {
        let node = match api.get(name).await {
            Ok(node) => node,
            Err(ref e) if is_not_found(e) => continue,
            Err(e) => return Err(e),
        };
        if let Some(node_taints) = node.spec.as_ref().and_then(|s| s.taints.clone()) {
            taints.extend(node_taints);
        }
    }
    Ok(taints)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    fn conflict() -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        })
    }

    #[tokio::test]
    async fn conflict_is_retried_until_success() {
        let attempts = AtomicU8::new(0);
        let attempts = &attempts;
        let result: kube::Result<u8> = with_conflict_retry(|| async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(conflict())
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn conflict_retries_are_bounded() {
        let attempts = AtomicU8::new(0);
        let attempts = &attempts;
        let result: kube::Result<u8> = with_conflict_retry(|| async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(conflict())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), CONFLICT_RETRIES);
    }

    #[tokio::test]
    async fn conflicting_status_patch_is_refetched_and_retried() {
        use crate::api::DeviceState;
        use futures::pin_mut;
        use http::{Request as HttpRequest, Response as HttpResponse};
        use hyper::Body;
        use tower_test::mock;

        fn device_response() -> HttpResponse<Body> {
            let device = serde_json::json!({
                "apiVersion": "gpu.deckhouse.io/v1alpha1",
                "kind": "GPUDevice",
                "metadata": { "name": "gpu-0", "resourceVersion": "1" },
                "status": { "inventoryId": "inv-0", "nodeName": "n1", "state": "Ready" },
            });
            HttpResponse::builder()
                .body(Body::from(serde_json::to_vec(&device).unwrap()))
                .unwrap()
        }

        fn conflict_response() -> HttpResponse<Body> {
            let status = serde_json::json!({
                "kind": "Status",
                "apiVersion": "v1",
                "status": "Failure",
                "message": "the object has been modified",
                "reason": "Conflict",
                "code": 409,
            });
            HttpResponse::builder()
                .status(409)
                .body(Body::from(serde_json::to_vec(&status).unwrap()))
                .unwrap()
        }

        let (mock_service, handle) = mock::pair::<HttpRequest<Body>, HttpResponse<Body>>();
        let api_task = tokio::spawn(async move {
            pin_mut!(handle);
            // first read-compute-patch round hits a stale write
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            send.send_response(device_response());
            let (request, send) = handle.next_request().await.expect("no patch sent");
            assert_eq!(request.method(), http::Method::PATCH);
            send.send_response(conflict_response());
            // the retry refetches before patching again
            let (request, send) = handle.next_request().await.expect("no refetch after 409");
            assert_eq!(request.method(), http::Method::GET);
            send.send_response(device_response());
            let (request, send) = handle.next_request().await.expect("no second patch");
            assert_eq!(request.method(), http::Method::PATCH);
            send.send_response(device_response());
        });

        let client = Client::new(mock_service, "default");
        let changed = update_device_status(&client, "gpu-0", |status| {
            status.state = DeviceState::Assigned;
        })
        .await
        .unwrap();
        assert!(changed);
        api_task.await.unwrap();
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let attempts = AtomicU8::new(0);
        let attempts = &attempts;
        let result: kube::Result<u8> = with_conflict_retry(|| async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(kube::Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: "forbidden".into(),
                reason: "Forbidden".into(),
                code: 403,
            }))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
