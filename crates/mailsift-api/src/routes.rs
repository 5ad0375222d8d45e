//! API routes

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{status, worker};
use crate::state::MasterState;

/// Create the master router
pub fn create_router(state: Arc<MasterState>) -> Router {
    let worker_routes = Router::new()
        .route("/init/:worker", post(worker::init))
        .route("/auth/:worker", post(worker::auth))
        .route("/work/:worker", post(worker::work))
        .route("/submit/:worker", post(worker::submit))
        .route("/ack/:worker", post(worker::ack))
        .route("/bye/:worker", post(worker::bye));

    Router::new()
        .route("/status", get(status::status))
        .route("/metrics", get(status::metrics))
        .nest("/worker", worker_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body, Bytes};
    use axum::http::{Request, StatusCode};
    use mailsift_common::config::MasterConfig;
    use mailsift_common::{Origin, ResultRecord, SessionKey, WorkItem, WorkerId};
    use mailsift_core::pake::{self, WorkerHandshake};
    use mailsift_core::protocol::{
        decode_b64, encode_b64, AckRequest, AuthRequest, InitRequest, InitResponse, Sequenced,
        StatusResponse,
    };
    use mailsift_core::ResultSink;
    use mailsift_queue::{MemoryQueue, WorkQueue};
    use pretty_assertions::assert_eq;
    use serde::Serialize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    const SECRET: &str = "master-test-secret";

    #[derive(Default)]
    struct CollectingSink {
        records: Mutex<Vec<ResultRecord>>,
    }

    #[async_trait]
    impl ResultSink for CollectingSink {
        async fn write(&self, record: &ResultRecord) -> std::io::Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct Harness {
        router: Router,
        state: Arc<MasterState>,
        queue: Arc<MemoryQueue>,
        sink: Arc<CollectingSink>,
    }

    fn harness_with(config: MasterConfig) -> Harness {
        let queue = Arc::new(MemoryQueue::new(16));
        let sink = Arc::new(CollectingSink::default());
        let state = Arc::new(MasterState::new(&config, queue.clone(), sink.clone()).unwrap());
        Harness {
            router: create_router(state.clone()),
            state,
            queue,
            sink,
        }
    }

    fn harness() -> Harness {
        harness_with(MasterConfig {
            secret: SECRET.to_string(),
            work_wait_secs: 1,
            ..Default::default()
        })
    }

    fn item() -> WorkItem {
        WorkItem::new(
            "alice@example.com",
            vec!["bob@example.com".to_string()],
            Origin::new("mx.example.com", 25, "smtp"),
            b"Subject: hi\r\n\r\nbody".to_vec(),
        )
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Bytes) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body)
    }

    async fn post_json<T: Serialize>(
        router: &Router,
        call: &str,
        worker: WorkerId,
        body: &T,
    ) -> (StatusCode, Bytes) {
        let request = Request::builder()
            .method("POST")
            .uri(format!("/worker/{}/{}", call, worker))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap();
        send(router, request).await
    }

    async fn post_raw(router: &Router, call: &str, worker: WorkerId, body: Vec<u8>) -> (StatusCode, Bytes) {
        let request = Request::builder()
            .method("POST")
            .uri(format!("/worker/{}/{}", call, worker))
            .header("content-type", "application/octet-stream")
            .body(Body::from(body))
            .unwrap();
        send(router, request).await
    }

    fn sealed<T: Serialize>(key: &SessionKey, body: &T) -> Vec<u8> {
        key.encrypt(&serde_json::to_vec(body).unwrap()).unwrap()
    }

    /// Run both handshake legs; returns the worker's key and the auth status
    async fn handshake_with(router: &Router, worker: WorkerId, secret: &str) -> (SessionKey, StatusCode) {
        let (handshake, message) = WorkerHandshake::start(secret);
        let (status, body) = post_json(
            router,
            "init",
            worker,
            &InitRequest {
                pake: encode_b64(&message),
            },
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let reply: InitResponse = serde_json::from_slice(&body).unwrap();
        let key = handshake.finish(&decode_b64(&reply.hk).unwrap()).unwrap();
        let tag = pake::confirmation(&key, &worker).unwrap();
        let (status, _) = post_json(router, "auth", worker, &AuthRequest { hk: encode_b64(&tag) }).await;
        (key, status)
    }

    async fn handshake(router: &Router, worker: WorkerId) -> SessionKey {
        let (key, status) = handshake_with(router, worker, SECRET).await;
        assert_eq!(status, StatusCode::OK);
        key
    }

    async fn work(router: &Router, worker: WorkerId, key: &SessionKey, request_id: u64) -> (StatusCode, Bytes) {
        post_raw(router, "work", worker, sealed(key, &Sequenced { request_id })).await
    }

    #[tokio::test]
    async fn test_status() {
        let h = harness();
        let request = Request::builder().uri("/status").body(Body::empty()).unwrap();
        let (status, body) = send(&h.router, request).await;

        assert_eq!(status, StatusCode::OK);
        let response: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(response.status, "ok");
        assert_eq!(response.backend, "memory");
        assert_eq!(response.sessions, 0);
    }

    #[tokio::test]
    async fn test_handshake_installs_session() {
        let h = harness();
        handshake(&h.router, Uuid::new_v4()).await;
        assert_eq!(h.state.session_count(), 1);
        assert_eq!(h.state.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let h = harness();
        let (_, status) = handshake_with(&h.router, Uuid::new_v4(), "not the secret").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(h.state.session_count(), 0);
        assert_eq!(h.state.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_auth_without_init_rejected() {
        let h = harness();
        let (status, _) = post_json(
            &h.router,
            "auth",
            Uuid::new_v4(),
            &AuthRequest {
                hk: encode_b64(b"whatever"),
            },
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_expired_handshake_rejected() {
        let h = harness_with(MasterConfig {
            secret: SECRET.to_string(),
            handshake_ttl_secs: 0,
            ..Default::default()
        });
        let worker = Uuid::new_v4();
        let (handshake, message) = WorkerHandshake::start(SECRET);
        let (_, body) = post_json(
            &h.router,
            "init",
            worker,
            &InitRequest {
                pake: encode_b64(&message),
            },
        )
        .await;
        let reply: InitResponse = serde_json::from_slice(&body).unwrap();
        let key = handshake.finish(&decode_b64(&reply.hk).unwrap()).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.state.expire_handshakes(), 1);

        let tag = pake::confirmation(&key, &worker).unwrap();
        let (status, _) = post_json(&h.router, "auth", worker, &AuthRequest { hk: encode_b64(&tag) }).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_work_hands_out_encrypted_item() {
        let h = harness();
        let worker = Uuid::new_v4();
        let key = handshake(&h.router, worker).await;
        let queued = item();
        h.queue.push_now(queued.clone()).await.unwrap();

        let (status, body) = work(&h.router, worker, &key, 1).await;
        assert_eq!(status, StatusCode::OK);
        let received = WorkItem::decode(&key.decrypt(&body).unwrap()).unwrap();
        assert_eq!(received, queued);
    }

    #[tokio::test]
    async fn test_replayed_request_destroys_session() {
        let h = harness();
        let worker = Uuid::new_v4();
        let key = handshake(&h.router, worker).await;
        h.queue.push_now(item()).await.unwrap();
        h.queue.push_now(item()).await.unwrap();

        let first = sealed(&key, &Sequenced { request_id: 1 });
        let (status, _) = post_raw(&h.router, "work", worker, first.clone()).await;
        assert_eq!(status, StatusCode::OK);

        // An attacker replays the captured request.
        let (status, _) = post_raw(&h.router, "work", worker, first).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(h.state.session_count(), 0);

        // The legitimate next request fails too until the worker re-authenticates.
        let (status, _) = work(&h.router, worker, &key, 2).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let key = handshake(&h.router, worker).await;
        let (status, body) = work(&h.router, worker, &key, 1).await;
        assert_eq!(status, StatusCode::OK);
        assert!(WorkItem::decode(&key.decrypt(&body).unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_skipped_request_id_rejected() {
        let h = harness();
        let worker = Uuid::new_v4();
        let key = handshake(&h.router, worker).await;

        let (status, _) = work(&h.router, worker, &key, 5).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(h.state.session_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_queue_answers_500() {
        let h = harness();
        let worker = Uuid::new_v4();
        let key = handshake(&h.router, worker).await;

        let (status, _) = work(&h.router, worker, &key, 1).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        // The session survives an empty queue.
        h.queue.push_now(item()).await.unwrap();
        let (status, _) = work(&h.router, worker, &key, 2).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_undecryptable_body_destroys_session() {
        let h = harness();
        let worker = Uuid::new_v4();
        handshake(&h.router, worker).await;

        let stranger = SessionKey::from_slice(&[7u8; 32]).unwrap();
        let (status, _) = work(&h.router, worker, &stranger, 1).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(h.state.session_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_forwards_to_sink() {
        let h = harness();
        let worker = Uuid::new_v4();
        let key = handshake(&h.router, worker).await;
        let source = item();
        let mut record = ResultRecord::for_item(&source, serde_json::json!({"subject": "hi"}));
        record.worker = Some(worker);

        let (status, _) = post_raw(&h.router, "submit", worker, sealed(&key, &record)).await;
        assert_eq!(status, StatusCode::OK);

        for _ in 0..50 {
            if !h.sink.records.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*h.sink.records.lock().unwrap(), vec![record]);
        assert_eq!(h.state.metrics.results_submitted.get(), 1);
    }

    #[tokio::test]
    async fn test_repeated_submit_written_once() {
        let h = harness();
        let worker = Uuid::new_v4();
        let key = handshake(&h.router, worker).await;
        let record = ResultRecord::for_item(&item(), serde_json::json!({"subject": "hi"}));
        let body = sealed(&key, &record);

        let (first, _) = post_raw(&h.router, "submit", worker, body.clone()).await;
        let (again, _) = post_raw(&h.router, "submit", worker, body).await;
        assert_eq!((first, again), (StatusCode::OK, StatusCode::OK));

        for _ in 0..50 {
            if !h.sink.records.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*h.sink.records.lock().unwrap(), vec![record]);
        assert_eq!(h.state.metrics.results_submitted.get(), 1);
    }

    #[tokio::test]
    async fn test_submit_with_invalid_uid_is_unprocessable() {
        let h = harness();
        let worker = Uuid::new_v4();
        let key = handshake(&h.router, worker).await;
        let mut record = ResultRecord::for_item(&item(), serde_json::json!({}));
        record.uid = "not-a-uuid".to_string();

        let (status, body) = post_raw(&h.router, "submit", worker, sealed(&key, &record)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["code"], "VALIDATION_ERROR");
        assert_eq!(h.state.session_count(), 1);
        assert!(h.sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_counts_without_sink() {
        let h = harness();
        let worker = Uuid::new_v4();
        let key = handshake(&h.router, worker).await;

        let body = sealed(
            &key,
            &AckRequest {
                uid: Uuid::now_v7().to_string(),
            },
        );
        let (status, _) = post_raw(&h.router, "ack", worker, body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.state.metrics.items_acknowledged.get(), 1);
        assert!(h.sink.records.lock().unwrap().is_empty());

        let bad = sealed(&key, &AckRequest { uid: "nope".to_string() });
        let (status, _) = post_raw(&h.router, "ack", worker, bad).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bye_ends_session() {
        let h = harness();
        let worker = Uuid::new_v4();
        let key = handshake(&h.router, worker).await;

        let (status, _) = post_raw(&h.router, "bye", worker, sealed(&key, &Sequenced { request_id: 1 })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.state.session_count(), 0);

        let (status, _) = work(&h.router, worker, &key, 2).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_abandoned_pull_leaves_item_queued() {
        let h = harness_with(MasterConfig {
            secret: SECRET.to_string(),
            work_wait_secs: 30,
            ..Default::default()
        });
        let worker = Uuid::new_v4();

        let state = h.state.clone();
        let request = tokio::spawn(async move { state.pull_for(&worker).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        request.abort();
        let _ = request.await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.queue.push_now(item()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let h = harness();
        let _ = post_json(
            &h.router,
            "auth",
            Uuid::new_v4(),
            &AuthRequest {
                hk: encode_b64(b"x"),
            },
        )
        .await;

        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let (status, body) = send(&h.router, request).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("mailsift_protocol_failures_total{reason=\"no_handshake\"} 1"));
        assert!(text.contains("mailsift_active_sessions 0"));
    }
}
