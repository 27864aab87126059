use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, StatusCode};
use serde::Serialize;

use crate::network::metrics;
use crate::network::offline_queue::SyncQueue;
use crate::network::SharedSyncStatus;

/// Read-only status endpoint for the UI shell.
///
/// `GET /health`, `GET /metrics`, `GET /queue`, `GET /failed`.
pub async fn run_http_admin(
    addr: SocketAddr,
    queue: SyncQueue,
    status: SharedSyncStatus,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let queue = queue.clone();
        let status = status.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let queue = queue.clone();
                let status = status.clone();
                async move { handle(req, queue, status).await }
            }))
        }
    });

    log::info!("Admin endpoint listening on {addr}");
    hyper::Server::bind(&addr).serve(make_svc).await
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => with_body(status, "application/json", Body::from(body)),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn json_error(status: StatusCode, msg: &str) -> Response<Body> {
    let body = serde_json::json!({ "error": msg }).to_string();
    with_body(status, "application/json", Body::from(body))
}

fn with_body(status: StatusCode, content_type: &str, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    if let Ok(value) = header::HeaderValue::from_str(content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}

fn authenticate_http(req: &Request<Body>) -> Option<Response<Body>> {
    let Ok(expected) = std::env::var("ORDERLINE_ADMIN_TOKEN") else {
        return None;
    };

    let raw = match req.headers().get(header::AUTHORIZATION) {
        Some(v) => v,
        None => return Some(json_error(StatusCode::UNAUTHORIZED, "missing authorization header")),
    };
    let raw_str = match raw.to_str() {
        Ok(v) => v,
        Err(_) => return Some(json_error(StatusCode::UNAUTHORIZED, "invalid authorization header")),
    };

    match raw_str.strip_prefix("Bearer ") {
        Some(token) if token == expected => None,
        Some(_) => Some(json_error(StatusCode::UNAUTHORIZED, "invalid token")),
        None => Some(json_error(StatusCode::UNAUTHORIZED, "invalid authorization scheme")),
    }
}

async fn handle(
    req: Request<Body>,
    queue: SyncQueue,
    status: SharedSyncStatus,
) -> Result<Response<Body>, Infallible> {
    if let Some(resp) = authenticate_http(&req) {
        return Ok(resp);
    }

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => {
            let snapshot = status.lock().await.clone();
            json_response(StatusCode::OK, &snapshot)
        }
        (&Method::GET, "/metrics") => with_body(
            StatusCode::OK,
            "text/plain; version=0.0.4",
            Body::from(build_metrics()),
        ),
        (&Method::GET, "/queue") => match queue.optimistic_view() {
            Ok(records) => json_response(StatusCode::OK, &records),
            Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        (&Method::GET, "/failed") => match queue.failed_orders() {
            Ok(records) => json_response(StatusCode::OK, &records),
            Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        (_, "/health" | "/metrics" | "/queue" | "/failed") => {
            json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => with_body(StatusCode::NOT_FOUND, "text/plain", Body::empty()),
    };

    Ok(response)
}

fn build_metrics() -> String {
    let m = metrics::snapshot();
    format!(
        concat!(
            "# TYPE orderline_orders_total counter\n",
            "orderline_orders_total{{path=\"queued\"}} {}\n",
            "orderline_orders_total{{path=\"synced\"}} {}\n",
            "orderline_orders_total{{path=\"direct\"}} {}\n",
            "orderline_orders_total{{path=\"rejected\"}} {}\n",
            "# TYPE orderline_submit_transient_failures_total counter\n",
            "orderline_submit_transient_failures_total {}\n",
            "# TYPE orderline_realtime_reconnects_total counter\n",
            "orderline_realtime_reconnects_total {}\n",
            "# TYPE orderline_realtime_frames_dropped_total counter\n",
            "orderline_realtime_frames_dropped_total {}\n",
        ),
        m.orders_queued,
        m.orders_synced,
        m.orders_direct,
        m.orders_rejected,
        m.submit_transient_failures,
        m.realtime_reconnects,
        m.realtime_frames_dropped,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::client::{OrderApi, SubmitAck};
    use crate::network::offline_queue::RetryPolicy;
    use crate::network::sync_status::shared_status;
    use crate::network::{SubmitError, TEST_ENV_LOCK};
    use crate::order::{OrderItem, OrderPayload};
    use crate::storage::DurableQueueStore;
    use async_trait::async_trait;
    use hyper::body::to_bytes;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct OfflineApi;

    #[async_trait]
    impl OrderApi for OfflineApi {
        async fn submit_order(
            &self,
            _local_id: &str,
            _payload: &OrderPayload,
        ) -> Result<SubmitAck, SubmitError> {
            Err(SubmitError::Transient("offline".into()))
        }
    }

    fn queue(temp_dir: &TempDir) -> SyncQueue {
        let db = sled::open(temp_dir.path()).unwrap();
        let store = Arc::new(DurableQueueStore::open(&db).unwrap());
        SyncQueue::new(store, Arc::new(OfflineApi), RetryPolicy::default())
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn metrics_exports_expected_keys() {
        metrics::record_queued();
        let body = build_metrics();
        assert!(body.contains("orderline_orders_total{path=\"queued\"}"));
        assert!(body.contains("orderline_orders_total{path=\"synced\"}"));
        assert!(body.contains("orderline_realtime_reconnects_total"));
        assert!(body.contains("orderline_realtime_frames_dropped_total"));
    }

    #[test]
    fn queue_lists_optimistic_records() {
        let _lock = TEST_ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::remove_var("ORDERLINE_ADMIN_TOKEN");
        }

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("rt");
        rt.block_on(async {
            let temp_dir = TempDir::new().unwrap();
            let queue = queue(&temp_dir);
            let record = queue
                .enqueue(OrderPayload::new("T5", vec![OrderItem::new("x", 2u32)]))
                .await
                .unwrap();

            let resp = handle(get("/queue"), queue, shared_status())
                .await
                .expect("handle ok");
            assert_eq!(resp.status(), StatusCode::OK);

            let body = to_bytes(resp.into_body()).await.unwrap();
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(json[0]["local_id"], record.local_id.as_str());
            assert_eq!(json[0]["status"], "pending");
        });
    }

    #[test]
    fn health_reports_status_snapshot() {
        let _lock = TEST_ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::remove_var("ORDERLINE_ADMIN_TOKEN");
        }

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("rt");
        rt.block_on(async {
            let temp_dir = TempDir::new().unwrap();
            let status = shared_status();
            status.lock().await.pending_orders = 4;

            let resp = handle(get("/health"), queue(&temp_dir), status)
                .await
                .expect("handle ok");
            let body = to_bytes(resp.into_body()).await.unwrap();
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(json["pending_orders"], 4);
            assert_eq!(json["realtime"], "disconnected");
        });
    }

    #[test]
    fn admin_token_is_enforced_when_set() {
        let _lock = TEST_ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("ORDERLINE_ADMIN_TOKEN", "s3cret");
        }

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("rt");
        rt.block_on(async {
            let temp_dir = TempDir::new().unwrap();
            let queue = queue(&temp_dir);

            let resp = handle(get("/queue"), queue.clone(), shared_status())
                .await
                .expect("handle ok");
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

            let req = Request::builder()
                .method(Method::GET)
                .uri("/queue")
                .header(header::AUTHORIZATION, "Bearer s3cret")
                .body(Body::empty())
                .unwrap();
            let resp = handle(req, queue, shared_status()).await.expect("handle ok");
            assert_eq!(resp.status(), StatusCode::OK);
        });

        unsafe {
            std::env::remove_var("ORDERLINE_ADMIN_TOKEN");
        }
    }

    #[test]
    fn unknown_paths_are_not_found() {
        let _lock = TEST_ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::remove_var("ORDERLINE_ADMIN_TOKEN");
        }

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("rt");
        rt.block_on(async {
            let temp_dir = TempDir::new().unwrap();
            let resp = handle(get("/nope"), queue(&temp_dir), shared_status())
                .await
                .expect("handle ok");
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        });
    }
}
