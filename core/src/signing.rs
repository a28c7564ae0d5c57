//! Threshold Schnorr signing engine (component C7, spec §4.7).
//!
//! Three board-driven phases per request: `request` (post the message to be
//! signed), `approve` (each willing signer pre-checks, derives its
//! deterministic nonce, backs it up to the secret module, and posts its
//! commitment `R_i`), and `finalize` (once `threshold` commitments are
//! visible, the first-write-wins session lock is established over the first
//! `threshold` commitment-posters ordered by timestamp; each locked signer
//! then computes the shared challenge and posts a response, and the first
//! caller to see every response combines and verifies the aggregate
//! signature).
//!
//! Grounded on `engine/multisig/src/client/signing/signing_detail.rs`
//! (Lagrange-coefficient-at-0, aggregate-nonce-then-response structure,
//! signature combination) simplified from the teacher's two-nonce (d, e)
//! binding-value protocol down to spec.md's single deterministic nonce per
//! signer (component C3), plus a board-mediated session lock the teacher
//! has no need for since its ceremonies run live among already-coordinated
//! parties.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
	board::BoardClient,
	crypto::{lagrange_coefficient_at_zero, Point, Scalar},
	dkg, nonce,
	error::{CustodyError, Result},
	secret_module::SecretModule,
	state::StateManager,
};

fn unix_timestamp() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
enum Phase {
	Idle,
	RequestCreated,
	Committed,
	Locked,
	Combined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SigningRequest {
	request_id: String,
	round_id: String,
	message_hex: String,
	message_digest_hex: String,
	requester: String,
	threshold: u32,
	created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionLock {
	participants: Vec<String>,
	locked_by: String,
	timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NonceCommitment {
	node_id: String,
	r_hex: String,
	message_digest_hex: String,
	counter: u64,
	timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Response {
	node_id: String,
	s_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signature {
	pub r_hex: String,
	pub s_hex: String,
}

fn request_path(request_id: &str) -> String {
	format!("signing/{request_id}/request.json")
}

fn commitment_path(request_id: &str, node_id: &str) -> String {
	format!("signing/{request_id}/commitments/{node_id}.json")
}

fn session_path(request_id: &str) -> String {
	format!("signing/{request_id}/session.json")
}

fn response_path(request_id: &str, node_id: &str) -> String {
	format!("signing/{request_id}/responses/{node_id}.json")
}

fn signature_path(request_id: &str) -> String {
	format!("signing/{request_id}/signature.json")
}

fn phase_key(request_id: &str) -> String {
	format!("signing/{request_id}/phase")
}

fn nonce_seed_label() -> &'static str {
	"NONCE_MASTER_SEED"
}

fn nonce_counter_label() -> &'static str {
	"NONCE_COUNTER"
}

fn nonce_commit_label(request_id: &str) -> String {
	format!("NONCE_COMMIT_{request_id}")
}

pub struct SigningEngine<'a> {
	pub node_id: String,
	pub participants: Vec<String>,
	pub threshold: u32,
	pub board: &'a dyn BoardClient,
	pub module: &'a SecretModule,
	pub state: &'a StateManager,
}

impl<'a> SigningEngine<'a> {
	fn participant_index(&self, node_id: &str) -> Result<u32> {
		let mut sorted = self.participants.clone();
		sorted.sort();
		sorted
			.iter()
			.position(|p| p == node_id)
			.map(|i| i as u32 + 1)
			.ok_or_else(|| CustodyError::ParticipantMismatch(format!("{node_id} is not a participant")))
	}

	fn phase(&self, request_id: &str) -> Result<Phase> {
		Ok(self.state.get::<Phase>(&phase_key(request_id))?.unwrap_or(Phase::Idle))
	}

	fn set_phase(&self, request_id: &str, phase: Phase) -> Result<()> {
		self.state.set(&phase_key(request_id), &phase)
	}

	/// Post a new signing request. Idempotent on identical content.
	pub fn request(&self, request_id: &str, round_id: &str, message: &[u8], requester: &str) -> Result<()> {
		if self.phase(request_id)? >= Phase::RequestCreated {
			return Ok(())
		}
		let message_digest: [u8; 32] = Sha256::digest(message).into();
		let record = SigningRequest {
			request_id: request_id.to_string(),
			round_id: round_id.to_string(),
			message_hex: hex::encode(message),
			message_digest_hex: hex::encode(message_digest),
			requester: requester.to_string(),
			threshold: self.threshold,
			created_at: unix_timestamp(),
		};
		self.board
			.post(&request_path(request_id), &serde_json::to_vec(&record).map_err(CustodyError::Json)?)?;
		self.set_phase(request_id, Phase::RequestCreated)
	}

	fn load_request(&self, request_id: &str) -> Result<SigningRequest> {
		let bytes = self
			.board
			.read(&request_path(request_id))?
			.ok_or_else(|| CustodyError::ObjectNotFound(request_path(request_id)))?;
		serde_json::from_slice(&bytes).map_err(CustodyError::Json)
	}

	/// The spec's single "approve" operation (§4.7): pre-check against all
	/// three persistence layers in order (local durable state, the secret
	/// module's `NONCE_COMMIT_{request_id}` backup, the board), derive this
	/// node's deterministic nonce, back its commitment counter up to the
	/// secret module, record it in local state, and post the `R`
	/// commitment to the board — in that exact order, so a crash at any
	/// point leaves at least as strong a reuse guard as the step before it.
	pub fn approve(&self, request_id: &str) -> Result<()> {
		let phase = self.phase(request_id)?;
		if phase < Phase::RequestCreated {
			return Err(CustodyError::PhaseError(format!("request {request_id} has not been created")))
		}
		if phase >= Phase::Committed {
			return Ok(())
		}

		let request = self.load_request(request_id)?;
		let message = hex::decode(&request.message_hex).map_err(|e| CustodyError::MalformedContent {
			path: request_path(request_id),
			detail: e.to_string(),
		})?;
		let message_digest: [u8; 32] = Sha256::digest(&message).into();

		// Pre-check 1: local durable state's nonce-audit trail.
		if self.state.has_nonce_for(request_id)? {
			return Err(CustodyError::NonceReuseAttempted {
				request_id: request_id.to_string(),
				detail: "a nonce was already derived for this request by this node (local state)",
			})
		}
		// Pre-check 2: the secret module's own backup of the commitment,
		// which survives a rollback or wipe of local state (spec §4.7 step 1b).
		let commit_label = nonce_commit_label(request_id);
		if self.module.object_exists(&commit_label)? {
			return Err(CustodyError::NonceReuseAttempted {
				request_id: request_id.to_string(),
				detail: "a nonce was already derived for this request by this node (secret module)",
			})
		}
		// Pre-check 3: the board itself, in case local state and the secret
		// module both lost the record but the commitment already went out.
		if self.board.read(&commitment_path(request_id, &self.node_id))?.is_some() {
			return Err(CustodyError::NonceReuseAttempted {
				request_id: request_id.to_string(),
				detail: "a nonce commitment was already posted for this request by this node (board)",
			})
		}

		let (k, r_point, counter) = nonce::derive_nonce(
			self.module,
			nonce_seed_label(),
			nonce_counter_label(),
			request_id,
			&message_digest,
		)?;
		let r_hex = r_point.to_compressed_hex()?;
		drop(k); // not needed again: re-derived deterministically from the stored counter during finalize.

		// Back the commitment up to the secret module before it ever touches
		// local state or the board, so it survives either being rolled back.
		self.module.create_object(&commit_label, r_hex.as_bytes())?;
		self.state.record_nonce(request_id, counter, &r_hex, &hex::encode(message_digest))?;

		self.board.post(
			&commitment_path(request_id, &self.node_id),
			&serde_json::to_vec(&NonceCommitment {
				node_id: self.node_id.clone(),
				r_hex,
				message_digest_hex: hex::encode(message_digest),
				counter,
				timestamp: unix_timestamp(),
			})
			.map_err(CustodyError::Json)?,
		)?;

		self.set_phase(request_id, Phase::Committed)
	}

	fn load_commitment(&self, request_id: &str, node_id: &str) -> Result<NonceCommitment> {
		let path = commitment_path(request_id, node_id);
		let bytes = self.board.read(&path)?.ok_or_else(|| CustodyError::PhaseError(format!(
			"request {request_id}: awaiting nonce commitment from {node_id}"
		)))?;
		serde_json::from_slice(&bytes).map_err(CustodyError::Json)
	}

	/// Establish (or join) the first-write-wins session lock: the first
	/// `threshold` commitment-posters ordered by `(timestamp, node_id)`
	/// (spec §4.7 step 2 / scenario S3 — a late approver past the first
	/// `threshold` commitments never enters the session).
	fn lock_session(&self, request_id: &str) -> Result<SessionLock> {
		if let Some(bytes) = self.board.read(&session_path(request_id))? {
			return serde_json::from_slice(&bytes).map_err(CustodyError::Json)
		}

		let mut candidates: Vec<(u64, String)> = Vec::new();
		for name in self.board.list(&format!("signing/{request_id}/commitments"))? {
			let node_id = name.trim_end_matches(".json").to_string();
			let commitment = self.load_commitment(request_id, &node_id)?;
			candidates.push((commitment.timestamp, node_id));
		}
		if candidates.len() < self.threshold as usize {
			return Err(CustodyError::PhaseError(format!(
				"request {request_id}: only {}/{} nonce commitments posted",
				candidates.len(),
				self.threshold
			)))
		}
		candidates.sort();
		let participants: Vec<String> =
			candidates.into_iter().take(self.threshold as usize).map(|(_, node_id)| node_id).collect();

		let desired =
			SessionLock { participants, locked_by: self.node_id.clone(), timestamp: unix_timestamp() };
		match self
			.board
			.post(&session_path(request_id), &serde_json::to_vec(&desired).map_err(CustodyError::Json)?)
		{
			Ok(()) => Ok(desired),
			Err(CustodyError::ObjectAlreadyExists(_)) => {
				let bytes = self
					.board
					.read(&session_path(request_id))?
					.ok_or_else(|| CustodyError::ObjectNotFound(session_path(request_id)))?;
				serde_json::from_slice(&bytes).map_err(CustodyError::Json)
			},
			Err(e) => Err(e),
		}
	}

	/// Phase: lock the signing session, compute the shared challenge, post
	/// this node's response if it is in the locked session, and — if every
	/// locked signer's response is now visible — combine and verify the
	/// aggregate signature.
	pub fn finalize(&self, request_id: &str) -> Result<Signature> {
		let phase = self.phase(request_id)?;
		if phase == Phase::Combined {
			let bytes = self
				.board
				.read(&signature_path(request_id))?
				.ok_or_else(|| CustodyError::ObjectNotFound(signature_path(request_id)))?;
			return serde_json::from_slice(&bytes).map_err(CustodyError::Json)
		}
		if phase < Phase::Committed {
			return Err(CustodyError::PhaseError(format!(
				"request {request_id} has not reached the commit phase"
			)))
		}

		let request = self.load_request(request_id)?;
		let session = self.lock_session(request_id)?;
		if !session.participants.contains(&self.node_id) {
			return Err(CustodyError::NotInSession(request_id.to_string()))
		}

		let mut r_points = Vec::new();
		for signer in &session.participants {
			let commitment = self.load_commitment(request_id, signer)?;
			r_points.push(Point::from_compressed_hex(&commitment.r_hex)?);
		}
		self.set_phase(request_id, Phase::Locked)?;

		let aggregate_r: Point = r_points.into_iter().sum();
		let message = hex::decode(&request.message_hex).map_err(|e| CustodyError::MalformedContent {
			path: request_path(request_id),
			detail: e.to_string(),
		})?;
		let message_digest: [u8; 32] = Sha256::digest(&message).into();

		let group_public_key_hex: String = self
			.state
			.get(&format!("dkg/{}/group_pubkey", request.round_id))?
			.ok_or_else(|| CustodyError::StateCorruption(format!(
				"no finalized DKG round {} locally for request {request_id}",
				request.round_id
			)))?;
		let group_public_key = Point::from_compressed_hex(&group_public_key_hex)?;

		let challenge = compute_challenge(&aggregate_r, &group_public_key, &message)?;

		if session.participants.contains(&self.node_id) {
			// Re-derive this node's own nonce from the counter it committed
			// to in `approve`, read directly off its own posted commitment
			// rather than scanned out of the local audit log — the audit
			// log can carry entries for other requests too, and "the most
			// recent entry for this request_id" is only ever the right
			// counter if this node has approved this request exactly once.
			let own_commitment = self.load_commitment(request_id, &self.node_id)?;
			let k = nonce::rederive_at_counter(
				self.module,
				nonce_seed_label(),
				own_commitment.counter,
				request_id,
				&message_digest,
			)?;

			let share = dkg::load_share(self.module, &request.round_id)?;
			let indices: BTreeSet<u32> = session
				.participants
				.iter()
				.map(|s| self.participant_index(s))
				.collect::<Result<_>>()?;
			let my_index = self.participant_index(&self.node_id)?;
			let lambda = lagrange_coefficient_at_zero(&indices, my_index);

			let response = k + challenge.clone() * lambda * share;
			self.board.post(
				&response_path(request_id, &self.node_id),
				&serde_json::to_vec(&Response { node_id: self.node_id.clone(), s_hex: response.to_hex() })
					.map_err(CustodyError::Json)?,
			)?;
		}

		let mut responses = Vec::new();
		for signer in &session.participants {
			match self.board.read(&response_path(request_id, signer))? {
				Some(bytes) => {
					let response: Response = serde_json::from_slice(&bytes).map_err(CustodyError::Json)?;
					responses.push(Scalar::from_hex(&response.s_hex)?);
				},
				None => {
					return Err(CustodyError::PhaseError(format!(
						"request {request_id}: awaiting response from {signer}"
					)))
				},
			}
		}

		let combined_s: Scalar = responses.into_iter().sum();
		let lhs = Point::from_scalar(&combined_s);
		let rhs = aggregate_r + group_public_key * challenge;
		if lhs != rhs {
			return Err(CustodyError::SignatureVerificationFailed { request_id: request_id.to_string() })
		}

		let signature =
			Signature { r_hex: aggregate_r.to_compressed_hex()?, s_hex: combined_s.to_hex() };
		self.board.post(
			&signature_path(request_id),
			&serde_json::to_vec(&signature).map_err(CustodyError::Json)?,
		)?;
		self.set_phase(request_id, Phase::Combined)?;

		Ok(signature)
	}
}

/// `e = SHA-256(R_compressed ‖ Y_compressed ‖ message)`, reduced mod the
/// group order (spec §4.7). Not BIP-340 tagged hashing by design.
fn compute_challenge(r: &Point, y: &Point, message: &[u8]) -> Result<Scalar> {
	let mut hasher = Sha256::new();
	hasher.update(r.to_compressed_bytes()?);
	hasher.update(y.to_compressed_bytes()?);
	hasher.update(message);
	Ok(Scalar::from_bytes_mod_order(&hasher.finalize()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{board::FsBoard, config::OperationMode, dkg::DkgEngine, identity::IdentityKeyPair};

	struct Node {
		_dir: tempfile::TempDir,
		module: SecretModule,
		state: StateManager,
	}

	fn setup_node(node_id: &str, board: &FsBoard) -> Node {
		let dir = tempfile::tempdir().unwrap();
		let mut module = SecretModule::init(dir.path(), OperationMode::Production, "1234").unwrap();
		module.login("1234").unwrap();

		let identity = IdentityKeyPair::generate(node_id).unwrap();
		module.create_object("IDENTITY_KEY", &identity.to_pkcs8_der().unwrap()).unwrap();
		board
			.post(
				&format!("identity/{node_id}.json"),
				&serde_json::to_vec(&identity.public_record().unwrap()).unwrap(),
			)
			.unwrap();

		let seed = format!("seed-for-{node_id}-please-be-32-bytes!!");
		module.create_object("NONCE_MASTER_SEED", seed.as_bytes()).unwrap();

		let state = StateManager::open(dir.path().join("state.json")).unwrap();
		Node { _dir: dir, module, state }
	}

	#[test]
	fn two_of_three_signing_produces_a_verifying_signature() {
		let board_dir = tempfile::tempdir().unwrap();
		let board = FsBoard::new(board_dir.path()).unwrap();
		let participants = vec!["a".to_string(), "b".to_string(), "c".to_string()];
		let nodes: Vec<Node> = participants.iter().map(|id| setup_node(id, &board)).collect();

		let dkg_engines: Vec<DkgEngine> = participants
			.iter()
			.zip(&nodes)
			.map(|(id, node)| DkgEngine {
				node_id: id.clone(),
				participants: participants.clone(),
				threshold: 2,
				board: &board,
				module: &node.module,
				state: &node.state,
			})
			.collect();
		for e in &dkg_engines {
			e.commit("round-1").unwrap();
		}
		for e in &dkg_engines {
			e.distribute("round-1").unwrap();
		}
		for e in &dkg_engines {
			e.finalize("round-1").unwrap();
		}

		let signing_engines: Vec<SigningEngine> = participants
			.iter()
			.zip(&nodes)
			.map(|(id, node)| SigningEngine {
				node_id: id.clone(),
				participants: participants.clone(),
				threshold: 2,
				board: &board,
				module: &node.module,
				state: &node.state,
			})
			.collect();

		signing_engines[0].request("req-1", "round-1", b"transfer 10 BTC", "a").unwrap();
		signing_engines[0].approve("req-1").unwrap();
		signing_engines[1].approve("req-1").unwrap();

		let sig_a = signing_engines[0].finalize("req-1").unwrap();
		let sig_b = signing_engines[1].finalize("req-1").unwrap();
		assert_eq!(sig_a, sig_b);

		// Finalizing again is idempotent and returns the same signature.
		assert_eq!(signing_engines[0].finalize("req-1").unwrap(), sig_a);
	}

	#[test]
	fn finalize_before_commit_quorum_is_refused() {
		let board_dir = tempfile::tempdir().unwrap();
		let board = FsBoard::new(board_dir.path()).unwrap();
		let participants = vec!["a".to_string(), "b".to_string()];
		let node = setup_node("a", &board);
		let engine = SigningEngine {
			node_id: "a".into(),
			participants,
			threshold: 2,
			board: &board,
			module: &node.module,
			state: &node.state,
		};
		engine.request("req-1", "round-1", b"msg", "a").unwrap();
		engine.approve("req-1").unwrap();
		assert!(matches!(engine.finalize("req-1"), Err(CustodyError::PhaseError(_))));
	}

	#[test]
	fn second_approve_on_the_same_request_is_refused_as_nonce_reuse() {
		let board_dir = tempfile::tempdir().unwrap();
		let board = FsBoard::new(board_dir.path()).unwrap();
		let participants = vec!["a".to_string(), "b".to_string()];
		let node = setup_node("a", &board);
		let engine = SigningEngine {
			node_id: "a".into(),
			participants,
			threshold: 2,
			board: &board,
			module: &node.module,
			state: &node.state,
		};
		engine.request("req-1", "round-1", b"msg", "a").unwrap();
		engine.approve("req-1").unwrap();

		// Simulate a local-state rollback: a fresh `StateManager` over a
		// wiped state file no longer remembers the nonce was derived, but
		// the secret module's `NONCE_COMMIT_req-1` backup still does.
		let fresh_state = StateManager::open(node._dir.path().join("state_fresh.json")).unwrap();
		let rolled_back = SigningEngine {
			node_id: "a".into(),
			participants: vec!["a".to_string(), "b".to_string()],
			threshold: 2,
			board: &board,
			module: &node.module,
			state: &fresh_state,
		};
		assert!(matches!(
			rolled_back.approve("req-1"),
			Err(CustodyError::NonceReuseAttempted { .. })
		));
	}
}
