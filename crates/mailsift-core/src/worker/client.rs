//! HTTP client for the master's worker API

use mailsift_common::{ResultRecord, SessionKey, WorkItem, WorkItemId, WorkerId};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::WorkerError;
use crate::pake::{self, WorkerHandshake};
use crate::protocol::{
    decode_b64, encode_b64, AckRequest, AuthRequest, InitRequest, InitResponse, Sequenced,
    OCTET_STREAM,
};

/// One worker's connection to the master
pub struct MasterClient {
    http: Client,
    base_url: String,
    worker_id: WorkerId,
    secret: String,
    key: RwLock<Option<SessionKey>>,
    /// Last request id sent on a sequenced call
    counter: AtomicU64,
}

impl MasterClient {
    pub fn new(
        base_url: &str,
        secret: &str,
        worker_id: WorkerId,
        timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            worker_id,
            secret: secret.to_string(),
            key: RwLock::new(None),
            counter: AtomicU64::new(0),
        })
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn url(&self, call: &str) -> String {
        format!("{}/worker/{}/{}", self.base_url, call, self.worker_id)
    }

    fn session_key(&self) -> Result<SessionKey, WorkerError> {
        self.key
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(WorkerError::NoSession)
    }

    fn set_session_key(&self, key: Option<SessionKey>) {
        *self.key.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = key;
    }

    pub fn has_session(&self) -> bool {
        self.session_key().is_ok()
    }

    /// Check that the master is reachable
    pub async fn status(&self) -> Result<(), WorkerError> {
        let response = self
            .http
            .get(format!("{}/status", self.base_url))
            .send()
            .await?;
        check_status(response).map(|_| ())
    }

    /// Run the handshake and install a fresh session
    pub async fn authenticate(&self) -> Result<(), WorkerError> {
        self.set_session_key(None);

        let (handshake, message) = WorkerHandshake::start(&self.secret);
        let response = self
            .http
            .post(self.url("init"))
            .json(&InitRequest {
                pake: encode_b64(&message),
            })
            .send()
            .await?;
        let reply: InitResponse = check_status(response)?.json().await?;
        let key = handshake.finish(&decode_b64(&reply.hk)?)?;

        let tag = pake::confirmation(&key, &self.worker_id)?;
        let response = self
            .http
            .post(self.url("auth"))
            .json(&AuthRequest {
                hk: encode_b64(&tag),
            })
            .send()
            .await?;
        check_status(response)?;

        self.counter.store(0, Ordering::SeqCst);
        self.set_session_key(Some(key));
        info!(worker = %self.worker_id, "Authenticated with master");
        Ok(())
    }

    async fn post_encrypted<T: Serialize>(
        &self,
        call: &str,
        body: &T,
    ) -> Result<Response, WorkerError> {
        let key = self.session_key()?;
        let ciphertext = key.encrypt(&serde_json::to_vec(body)?)?;
        let response = self
            .http
            .post(self.url(call))
            .header(CONTENT_TYPE, OCTET_STREAM)
            .body(ciphertext)
            .send()
            .await?;
        Ok(response)
    }

    fn next_request_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Ask for one work item. `None` means the master had nothing to hand out.
    pub async fn work(&self) -> Result<Option<WorkItem>, WorkerError> {
        let request_id = self.next_request_id();
        let response = self
            .post_encrypted("work", &Sequenced { request_id })
            .await?;

        if response.status() == StatusCode::INTERNAL_SERVER_ERROR {
            debug!(request_id, "No work available");
            return Ok(None);
        }
        let body = check_status(response)?.bytes().await?;
        let plain = self.session_key()?.decrypt(&body)?;
        Ok(Some(WorkItem::decode(&plain)?))
    }

    /// Report a parsed result
    pub async fn submit(&self, record: &ResultRecord) -> Result<(), WorkerError> {
        let response = self.post_encrypted("submit", record).await?;
        check_status(response).map(|_| ())
    }

    /// Release an item that could not be parsed
    pub async fn ack(&self, id: WorkItemId) -> Result<(), WorkerError> {
        let response = self
            .post_encrypted("ack", &AckRequest { uid: id.to_string() })
            .await?;
        check_status(response).map(|_| ())
    }

    /// End the session
    pub async fn bye(&self) -> Result<(), WorkerError> {
        let request_id = self.next_request_id();
        let response = self
            .post_encrypted("bye", &Sequenced { request_id })
            .await?;
        self.set_session_key(None);
        check_status(response).map(|_| ())
    }
}

fn check_status(response: Response) -> Result<Response, WorkerError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED => Err(WorkerError::Unauthorized),
        status => Err(WorkerError::Status(status)),
    }
}
