//! Feldman DKG engine (component C6, spec §4.6).
//!
//! Three phases driven entirely by reads/writes against the board, so
//! participants never need to be online at the same time: `commit` posts
//! each party's polynomial commitments, `distribute` posts RSA-OAEP-encrypted
//! shares addressed to every other participant, and `finalize` decrypts and
//! Feldman-verifies incoming shares, combines the local secret share, and
//! derives the aggregate group public key.
//!
//! Grounded on `engine/multisig/src/client/keygen/keygen_detail.rs`'s
//! coefficient-commitment and share-verification logic, simplified from the
//! teacher's hash-commit-then-reveal-then-ZKP three-message round (needed
//! for its concurrent live broadcast) down to a plain commit/distribute/
//! finalize sequence, since the board's content-addressing already rules
//! out the equivocation that extra round defends against.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::{
	board::BoardClient,
	crypto::{evaluate_polynomial, Point, Scalar},
	error::{CustodyError, Result},
	identity::{IdentityKeyPair, IdentityRecord},
	secret_module::SecretModule,
	state::StateManager,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
enum Phase {
	Idle,
	Committed,
	Distributed,
	Finalized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitmentSet {
	node_id: String,
	round_id: String,
	commitments: Vec<String>,
	threshold: u32,
	total: u32,
	timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Complaint {
	accuser: String,
	accused: String,
	round_id: String,
	reason: String,
	timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FinalizedMarker {
	node_id: String,
	group_public_key_hex: String,
}

fn identity_label() -> &'static str {
	"IDENTITY_KEY"
}

fn coeffs_label(round_id: &str) -> String {
	format!("DKG_COEFFS_{round_id}")
}

fn share_label(round_id: &str) -> String {
	format!("DKG_SHARE_{round_id}")
}

fn phase_key(round_id: &str) -> String {
	format!("dkg/{round_id}/phase")
}

fn group_pubkey_key(round_id: &str) -> String {
	format!("dkg/{round_id}/group_pubkey")
}

fn unix_timestamp() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}

pub struct DkgEngine<'a> {
	pub node_id: String,
	pub participants: Vec<String>,
	pub threshold: u32,
	pub board: &'a dyn BoardClient,
	pub module: &'a SecretModule,
	pub state: &'a StateManager,
}

impl<'a> DkgEngine<'a> {
	/// 1-based index of `node_id` within the sorted participant set, used as
	/// the evaluation point of every party's polynomial.
	fn participant_index(&self, node_id: &str) -> Result<u32> {
		let mut sorted = self.participants.clone();
		sorted.sort();
		sorted
			.iter()
			.position(|p| p == node_id)
			.map(|i| i as u32 + 1)
			.ok_or_else(|| CustodyError::ParticipantMismatch(format!("{node_id} is not a participant")))
	}

	fn phase(&self, round_id: &str) -> Result<Phase> {
		Ok(self.state.get::<Phase>(&phase_key(round_id))?.unwrap_or(Phase::Idle))
	}

	fn set_phase(&self, round_id: &str, phase: Phase) -> Result<()> {
		self.state.set(&phase_key(round_id), &phase)
	}

	fn fetch_identity(&self, node_id: &str) -> Result<IdentityRecord> {
		let path = format!("identity/{node_id}.json");
		let bytes = self
			.board
			.read(&path)?
			.ok_or_else(|| CustodyError::ObjectNotFound(path.clone()))?;
		serde_json::from_slice(&bytes).map_err(CustodyError::Json)
	}

	/// Read and parse a participant's posted commitment set, rejecting any
	/// declared `threshold`/`total` that disagrees with this engine's own
	/// (spec §4.6: "the ceremony fails if they disagree").
	fn load_commitment(&self, round_id: &str, provider: &str) -> Result<CommitmentSet> {
		let path = format!("dkg/{round_id}/commitments/{provider}.json");
		let bytes = self
			.board
			.read(&path)?
			.ok_or_else(|| CustodyError::PhaseError(format!(
				"round {round_id}: still waiting on a commitment from {provider}"
			)))?;
		let record: CommitmentSet = serde_json::from_slice(&bytes).map_err(CustodyError::Json)?;
		if record.threshold != self.threshold || record.total != self.participants.len() as u32 {
			return Err(CustodyError::ParticipantMismatch(format!(
				"{provider} declared threshold={} total={} for round {round_id}, expected threshold={} total={}",
				record.threshold,
				record.total,
				self.threshold,
				self.participants.len()
			)))
		}
		Ok(record)
	}

	/// Phase 1: sample a degree-`(threshold - 1)` polynomial, publish its
	/// Feldman commitments, and keep the coefficients in the secret module.
	/// Idempotent: calling this again after a successful commit is a no-op.
	pub fn commit(&self, round_id: &str) -> Result<()> {
		if self.phase(round_id)? >= Phase::Committed {
			return Ok(())
		}

		let mut rng = OsRng;
		let coefficients: Vec<Scalar> =
			(0..self.threshold).map(|_| Scalar::random(&mut rng)).collect();
		let commitments: Vec<Point> = coefficients.iter().map(Point::from_scalar).collect();
		let commitments_hex =
			commitments.iter().map(Point::to_compressed_hex).collect::<Result<Vec<_>>>()?;

		let coeff_bytes = serde_json::to_vec(
			&coefficients.iter().map(Scalar::to_hex).collect::<Vec<_>>(),
		)
		.map_err(CustodyError::Json)?;
		self.module.create_object(&coeffs_label(round_id), &coeff_bytes)?;

		let record = CommitmentSet {
			node_id: self.node_id.clone(),
			round_id: round_id.to_string(),
			commitments: commitments_hex,
			threshold: self.threshold,
			total: self.participants.len() as u32,
			timestamp: unix_timestamp(),
		};
		self.board.post(
			&format!("dkg/{round_id}/commitments/{}.json", self.node_id),
			&serde_json::to_vec(&record).map_err(CustodyError::Json)?,
		)?;

		self.set_phase(round_id, Phase::Committed)
	}

	/// Phase 2: evaluate this node's polynomial at every participant's index
	/// and post an RSA-OAEP-encrypted share addressed to each of them
	/// (including itself, for a uniform finalize step). Requires every
	/// participant to have committed first.
	pub fn distribute(&self, round_id: &str) -> Result<()> {
		let phase = self.phase(round_id)?;
		if phase < Phase::Committed {
			return Err(CustodyError::PhaseError(format!(
				"cannot distribute round {round_id} before committing"
			)))
		}
		if phase >= Phase::Distributed {
			return Ok(())
		}

		// Every participant's commitment must be visible, and every declared
		// threshold/total must agree with this node's own, before dealing.
		for provider in &self.participants {
			self.load_commitment(round_id, provider)?;
		}

		let coefficients: Vec<Scalar> = self.module.use_object(&coeffs_label(round_id), |bytes| {
			let hexes: Vec<String> = serde_json::from_slice(bytes).map_err(CustodyError::Json)?;
			hexes.iter().map(|h| Scalar::from_hex(h)).collect()
		})?;

		for recipient in &self.participants {
			let x = self.participant_index(recipient)?;
			let share = evaluate_polynomial(&coefficients, x);
			let identity = self.fetch_identity(recipient)?;
			// Raw 32-byte big-endian scalar, RSA-OAEP-encrypted directly
			// (spec §6: no JSON envelope around the ciphertext).
			let ciphertext = identity.encrypt(&share.to_bytes())?;

			self.board.post(
				&format!("dkg/{round_id}/shares/{}_to_{recipient}.enc", self.node_id),
				&ciphertext,
			)?;
		}

		self.set_phase(round_id, Phase::Distributed)
	}

	/// Phase 3: decrypt and Feldman-verify every incoming share, combine the
	/// local secret key share, and derive the group public key. Refuses to
	/// retry finalize once this node has itself raised a complaint for the
	/// round (Open Question #1); a complaint another node raised against a
	/// shared provider does not block this node, since that provider may
	/// have dealt this node a perfectly good share.
	pub fn finalize(&self, round_id: &str) -> Result<Point> {
		let phase = self.phase(round_id)?;
		if phase < Phase::Distributed {
			return Err(CustodyError::PhaseError(format!(
				"cannot finalize round {round_id} before distributing"
			)))
		}
		if phase == Phase::Finalized {
			let hex: String = self
				.state
				.get(&group_pubkey_key(round_id))?
				.ok_or_else(|| CustodyError::StateCorruption("finalized round missing group pubkey".into()))?;
			return Point::from_compressed_hex(&hex)
		}

		// Only a complaint this node itself previously filed is informative
		// about this node's own incoming shares: another node's complaint
		// about a provider says nothing about the (possibly distinct) share
		// that same provider dealt to this node, since a dishonest dealer
		// can deal selectively. Re-checking every incoming share below is
		// what actually protects this node; this gate only short-circuits a
		// retry after this node already detected and reported a bad share.
		let own_prefix = format!("{}_vs_", self.node_id);
		let own_complaints: Vec<String> = self
			.board
			.list(&format!("dkg/{round_id}/complaints"))?
			.into_iter()
			.filter(|name| name.starts_with(&own_prefix))
			.collect();
		if !own_complaints.is_empty() {
			return Err(CustodyError::DKGVerificationFailed {
				round_id: round_id.to_string(),
				detail: format!(
					"this node has an outstanding complaint against a provider of its own shares: {}",
					own_complaints.join(", ")
				),
			})
		}

		let mut all_commitments = Vec::new();
		for provider in &self.participants {
			let record = self.load_commitment(round_id, provider)?;
			let commitments = record
				.commitments
				.iter()
				.map(|h| Point::from_compressed_hex(h))
				.collect::<Result<Vec<_>>>()?;
			all_commitments.push((provider.clone(), commitments));
		}

		let my_index = self.participant_index(&self.node_id)?;
		let mut local_share = Scalar::zero();
		let mut any_complaint_raised = false;

		for (provider, commitments) in &all_commitments {
			let path = format!("dkg/{round_id}/shares/{provider}_to_{}.enc", self.node_id);
			let ciphertext = self
				.board
				.read(&path)?
				.ok_or_else(|| CustodyError::ObjectNotFound(path.clone()))?;

			let plaintext = self.module.use_object(identity_label(), |der| {
				IdentityKeyPair::from_pkcs8_der(&self.node_id, der)?.decrypt(&ciphertext)
			})?;
			let share_bytes: [u8; crate::crypto::SCALAR_SIZE] =
				plaintext.try_into().map_err(|_| CustodyError::MalformedContent {
					path: path.clone(),
					detail: "decrypted share is not 32 bytes".into(),
				})?;
			let share = Scalar::from_bytes(&share_bytes)?;

			let expected: Point = commitments
				.iter()
				.enumerate()
				.map(|(k, c)| *c * pow_scalar(my_index, k as u32))
				.sum();

			if Point::from_scalar(&share) != expected {
				self.board.post(
					&format!("dkg/{round_id}/complaints/{}_vs_{provider}.json", self.node_id),
					&serde_json::to_vec(&Complaint {
						accuser: self.node_id.clone(),
						accused: provider.clone(),
						round_id: round_id.to_string(),
						reason: "Feldman commitment check failed".to_string(),
						timestamp: unix_timestamp(),
					})
					.map_err(CustodyError::Json)?,
				)?;
				any_complaint_raised = true;
				continue
			}

			local_share = local_share + share;
		}

		if any_complaint_raised {
			return Err(CustodyError::DKGVerificationFailed {
				round_id: round_id.to_string(),
				detail: "this node raised a complaint during verification; ceremony must restart".into(),
			})
		}

		let group_public_key: Point =
			all_commitments.iter().map(|(_, commitments)| commitments[0]).sum();
		let group_public_key_hex = group_public_key.to_compressed_hex()?;

		self.module.create_object(&share_label(round_id), local_share.to_hex().as_bytes())?;
		self.board.post(
			&format!("dkg/{round_id}/finalized/{}.json", self.node_id),
			&serde_json::to_vec(&FinalizedMarker {
				node_id: self.node_id.clone(),
				group_public_key_hex: group_public_key_hex.clone(),
			})
			.map_err(CustodyError::Json)?,
		)?;

		self.state.set(&group_pubkey_key(round_id), &group_public_key_hex)?;
		self.set_phase(round_id, Phase::Finalized)?;

		Ok(group_public_key)
	}
}

fn pow_scalar(base: u32, exponent: u32) -> Scalar {
	let mut result = Scalar::from_u32(1);
	let base = Scalar::from_u32(base);
	for _ in 0..exponent {
		result = result * base.clone();
	}
	result
}

/// A quorum's worth of Feldman shares held locally, used by [`crate::signing`]
/// to produce partial signatures. `round_id` and `threshold` indices are
/// only meaningful relative to the same [`DkgEngine`] that finalized them.
pub fn load_share(module: &SecretModule, round_id: &str) -> Result<Scalar> {
	let bytes = module.use_object(&share_label(round_id), |bytes| Ok(bytes.to_vec()))?;
	let hex = String::from_utf8(bytes)
		.map_err(|e| CustodyError::StateCorruption(format!("corrupt DKG share bytes: {e}")))?;
	Scalar::from_hex(&hex)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{board::FsBoard, config::OperationMode};

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
		module.create_object(identity_label(), &identity.to_pkcs8_der().unwrap()).unwrap();
		board
			.post(
				&format!("identity/{node_id}.json"),
				&serde_json::to_vec(&identity.public_record().unwrap()).unwrap(),
			)
			.unwrap();

		let state = StateManager::open(dir.path().join("state.json")).unwrap();
		Node { _dir: dir, module, state }
	}

	#[test]
	fn three_party_two_of_three_dkg_finalizes_with_matching_group_key() {
		let board_dir = tempfile::tempdir().unwrap();
		let board = FsBoard::new(board_dir.path()).unwrap();
		let participants = vec!["a".to_string(), "b".to_string(), "c".to_string()];

		let nodes: Vec<Node> =
			participants.iter().map(|id| setup_node(id, &board)).collect();

		let engines: Vec<DkgEngine> = participants
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

		for e in &engines {
			e.commit("round-1").unwrap();
		}
		for e in &engines {
			e.distribute("round-1").unwrap();
		}

		let mut group_keys = Vec::new();
		for e in &engines {
			group_keys.push(e.finalize("round-1").unwrap());
		}
		for w in group_keys.windows(2) {
			assert_eq!(w[0], w[1]);
		}

		// Finalizing again is idempotent.
		assert_eq!(engines[0].finalize("round-1").unwrap(), group_keys[0]);
	}

	#[test]
	fn distribute_before_commit_is_refused() {
		let board_dir = tempfile::tempdir().unwrap();
		let board = FsBoard::new(board_dir.path()).unwrap();
		let participants = vec!["a".to_string()];
		let node = setup_node("a", &board);
		let engine = DkgEngine {
			node_id: "a".into(),
			participants,
			threshold: 1,
			board: &board,
			module: &node.module,
			state: &node.state,
		};
		assert!(matches!(engine.distribute("round-1"), Err(CustodyError::PhaseError(_))));
	}
}
