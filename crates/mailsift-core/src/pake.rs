//! SPAKE2 handshake between worker and master
//!
//! Both sides run symmetric SPAKE2 over Ed25519 with the shared secret as
//! password. The worker proves it derived the same key by sending an
//! HMAC-SHA256 confirmation bound to its worker id.

use hmac::{Hmac, Mac};
use mailsift_common::{SessionKey, WorkerId};
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};
use thiserror::Error;

const IDENTITY: &[u8] = b"mailsift-worker";
const CONFIRMATION_LABEL: &[u8] = b"mailsift-auth";

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PakeError {
    #[error("malformed handshake message: {0}")]
    Protocol(String),

    #[error("derived key unusable: {0}")]
    Key(String),
}

fn start(secret: &str) -> (Spake2<Ed25519Group>, Vec<u8>) {
    Spake2::<Ed25519Group>::start_symmetric(
        &Password::new(secret.as_bytes()),
        &Identity::new(IDENTITY),
    )
}

fn finish(state: Spake2<Ed25519Group>, peer_message: &[u8]) -> Result<SessionKey, PakeError> {
    let key = state
        .finish(peer_message)
        .map_err(|e| PakeError::Protocol(format!("{:?}", e)))?;
    SessionKey::from_slice(&key).map_err(|e| PakeError::Key(e.to_string()))
}

/// Worker side of an in-progress handshake
pub struct WorkerHandshake {
    state: Spake2<Ed25519Group>,
}

impl WorkerHandshake {
    /// Start a handshake; the returned message goes to the master's `init`
    pub fn start(secret: &str) -> (Self, Vec<u8>) {
        let (state, message) = start(secret);
        (Self { state }, message)
    }

    /// Derive the session key from the master's reply
    pub fn finish(self, master_message: &[u8]) -> Result<SessionKey, PakeError> {
        finish(self.state, master_message)
    }
}

/// Master side: answer a worker's handshake message.
///
/// Returns the candidate session key and the message to send back.
pub fn respond(secret: &str, worker_message: &[u8]) -> Result<(SessionKey, Vec<u8>), PakeError> {
    let (state, reply) = start(secret);
    let key = finish(state, worker_message)?;
    Ok((key, reply))
}

fn confirmation_mac(key: &SessionKey, worker: &WorkerId) -> Result<HmacSha256, PakeError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map_err(|e| PakeError::Key(e.to_string()))?;
    mac.update(CONFIRMATION_LABEL);
    mac.update(worker.as_bytes());
    Ok(mac)
}

/// Key confirmation the worker sends to `auth`
pub fn confirmation(key: &SessionKey, worker: &WorkerId) -> Result<Vec<u8>, PakeError> {
    Ok(confirmation_mac(key, worker)?
        .finalize()
        .into_bytes()
        .to_vec())
}

/// Constant-time check of a worker's key confirmation
pub fn verify_confirmation(key: &SessionKey, worker: &WorkerId, tag: &[u8]) -> bool {
    confirmation_mac(key, worker)
        .map(|mac| mac.verify_slice(tag).is_ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    #[test]
    fn test_equal_secrets_agree() {
        let (worker, message) = WorkerHandshake::start("correct horse");
        let (master_key, reply) = respond("correct horse", &message).unwrap();
        let worker_key = worker.finish(&reply).unwrap();

        assert_eq!(worker_key, master_key);

        let ciphertext = worker_key.encrypt(b"hello master").unwrap();
        assert_eq!(master_key.decrypt(&ciphertext).unwrap(), b"hello master");
    }

    #[test]
    fn test_different_secrets_disagree() {
        let (worker, message) = WorkerHandshake::start("correct horse");
        let (master_key, reply) = respond("battery staple", &message).unwrap();
        let worker_key = worker.finish(&reply).unwrap();

        assert_ne!(worker_key, master_key);
        let ciphertext = worker_key.encrypt(b"hello master").unwrap();
        assert!(master_key.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_confirmation_bound_to_key_and_worker() {
        let (worker, message) = WorkerHandshake::start("s3cret");
        let (master_key, reply) = respond("s3cret", &message).unwrap();
        let worker_key = worker.finish(&reply).unwrap();
        let id = Uuid::new_v4();

        let tag = confirmation(&worker_key, &id).unwrap();
        assert!(verify_confirmation(&master_key, &id, &tag));
        assert!(!verify_confirmation(&master_key, &Uuid::new_v4(), &tag));

        let (_, other_message) = WorkerHandshake::start("wrong");
        let (other_key, _) = respond("s3cret", &other_message).unwrap();
        assert!(!verify_confirmation(&other_key, &id, &tag));
    }

    #[test]
    fn test_malformed_message_rejected() {
        assert!(matches!(
            respond("s3cret", b"short"),
            Err(PakeError::Protocol(_))
        ));
    }
}
