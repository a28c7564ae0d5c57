//! Deterministic nonce derivator (component C3, spec §4.3).
//!
//! Nonces are never sampled at random: they are derived from a per-node
//! seed held in the secret module, bound to a monotonic counter that can
//! only move forward. This defeats nonce reuse even if the bulletin board
//! or local state is rolled back to a stale snapshot, since the counter
//! lives in the secret module rather than in board/state data an attacker
//! could replay.
//!
//! Grounded loosely on the teacher's `client/signing/signing_detail.rs`
//! (`SecretNoncePair` generation, immediate zeroization of nonce material);
//! the HMAC-SHA512-over-a-monotonic-counter construction itself is specific
//! to spec.md, since the teacher derives nonces per live ceremony round
//! rather than from a persisted counter.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha512;

use crate::{
	crypto::{Point, Scalar},
	error::{CustodyError, Result},
	secret_module::SecretModule,
};

type HmacSha512 = Hmac<Sha512>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NonceDerivationRecord {
	request_id: String,
	counter: u64,
	r_hex: String,
	message_digest_hex: String,
}

/// Derive a per-request nonce scalar `k` and its public commitment `R = kG`.
///
/// `mac = HMAC-SHA512(seed, 0x00 ‖ BE8(counter) ‖ request_id ‖ message_digest)`,
/// reduced mod the group order. On the vanishingly unlikely event the
/// reduction yields zero, the counter is advanced again and the derivation
/// retried — a zero nonce is never returned. The chosen counter value is
/// persisted under `NONCE_DERIV_{counter}` for later audit by [`crate::state`].
pub fn derive_nonce(
	module: &SecretModule,
	seed_label: &str,
	counter_label: &str,
	request_id: &str,
	message_digest: &[u8; 32],
) -> Result<(Scalar, Point, u64)> {
	loop {
		let counter = module.counter_increment_and_get(counter_label)?;
		let scalar = mac_scalar(module, seed_label, counter, request_id, message_digest)?;

		if scalar.is_zero() {
			continue
		}

		let point = Point::from_scalar(&scalar);
		let record = NonceDerivationRecord {
			request_id: request_id.to_string(),
			counter,
			r_hex: point.to_compressed_hex()?,
			message_digest_hex: hex::encode(message_digest),
		};
		module.create_object(
			&format!("NONCE_DERIV_{counter}"),
			&serde_json::to_vec(&record).map_err(CustodyError::Json)?,
		)?;

		return Ok((scalar, point, counter))
	}
}

fn mac_scalar(
	module: &SecretModule,
	seed_label: &str,
	counter: u64,
	request_id: &str,
	message_digest: &[u8; 32],
) -> Result<Scalar> {
	module.use_object(seed_label, |seed| {
		let mut mac = HmacSha512::new_from_slice(seed)
			.map_err(|e| CustodyError::StateCorruption(format!("HMAC key setup failed: {e}")))?;
		mac.update(&[0x00]);
		mac.update(&counter.to_be_bytes());
		mac.update(request_id.as_bytes());
		mac.update(message_digest);
		let output = mac.finalize().into_bytes();
		Ok(Scalar::from_bytes_mod_order(&output))
	})
}

/// Recompute the nonce scalar for a counter value this node already
/// committed to earlier in the same signing ceremony (spec §4.7's second
/// round needs the same `k` the first round committed `R = kG` for, without
/// advancing the counter again — advancing it would derive a different,
/// uncommitted nonce). Callers must only ever pass a counter this node
/// itself previously derived and recorded via [`crate::state::StateManager::record_nonce`].
pub fn rederive_at_counter(
	module: &SecretModule,
	seed_label: &str,
	counter: u64,
	request_id: &str,
	message_digest: &[u8; 32],
) -> Result<Scalar> {
	mac_scalar(module, seed_label, counter, request_id, message_digest)
}
