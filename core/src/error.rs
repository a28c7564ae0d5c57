//! Cross-cutting error taxonomy (spec §7). Every public operation on the
//! secret module, durable state, board client, DKG engine, and signing engine
//! returns `Result<T, CustodyError>`; the CLI binary is the only place that
//! wraps these in `anyhow` for operator-facing display.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CustodyError {
	#[error("nonce reuse attempted for request {request_id}: {detail}")]
	NonceReuseAttempted { request_id: String, detail: &'static str },

	#[error("secret extraction forbidden in production mode: {0}")]
	SecretExtractionForbidden(&'static str),

	#[error("DKG share verification failed for round {round_id}: {detail}")]
	DKGVerificationFailed { round_id: String, detail: String },

	#[error("signature verification failed for request {request_id}")]
	SignatureVerificationFailed { request_id: String },

	#[error("participant parameters mismatch: {0}")]
	ParticipantMismatch(String),

	#[error("not in signing session for request {0}")]
	NotInSession(String),

	#[error("not an approver of request {0}")]
	NotApproved(String),

	#[error("transient transport error after {attempts} attempts: {source}")]
	TransientTransportError { attempts: u32, source: String },

	#[error("local state corruption detected: {0}")]
	StateCorruption(String),

	#[error("secret module counter exhausted")]
	CounterExhausted,

	#[error("object already exists under label {0}")]
	ObjectAlreadyExists(String),

	#[error("no object exists under label {0}")]
	ObjectNotFound(String),

	#[error("ceremony phase error: {0}")]
	PhaseError(String),

	#[error("malformed board content at {path}: {detail}")]
	MalformedContent { path: String, detail: String },

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CustodyError>;
