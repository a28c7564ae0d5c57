//! Node identity and RSA transport encryption.
//!
//! Each node holds one RSA-2048 keypair, published on the board at
//! `identity/{node_id}.json` so peers can address DKG shares to it.
//! Shares posted during the DKG distribute phase (spec §4.6) are wrapped
//! with RSA-OAEP-SHA256 under the recipient's public key before they are
//! written to the board, since the board itself provides no confidentiality
//! (spec §1: the transport is untrusted for secrecy, only for integrity via
//! content-addressing).

use rand::rngs::OsRng;
use rsa::{
	pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey, LineEnding},
	pkcs8::{DecodePrivateKey, EncodePrivateKey},
	Oaep, RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{CustodyError, Result};

const RSA_KEY_BITS: usize = 2048;

fn unix_timestamp() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}

/// The board-published record at `identity/{node_id}.json` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
	pub node_id: String,
	/// PKCS#1 PEM-encoded RSA public key.
	pub public_key_pem: String,
	pub created_at: u64,
}

/// A node's RSA identity keypair. The private half never leaves the process
/// except as DER bytes handed to the secret module for storage.
pub struct IdentityKeyPair {
	node_id: String,
	private_key: RsaPrivateKey,
	public_key: RsaPublicKey,
}

impl IdentityKeyPair {
	pub fn generate(node_id: impl Into<String>) -> Result<Self> {
		let mut rng = OsRng;
		let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
			.map_err(|e| CustodyError::StateCorruption(format!("RSA keygen failed: {e}")))?;
		let public_key = RsaPublicKey::from(&private_key);
		Ok(IdentityKeyPair { node_id: node_id.into(), private_key, public_key })
	}

	/// Reconstruct from PKCS#8 DER bytes as returned by the secret module.
	pub fn from_pkcs8_der(node_id: impl Into<String>, der: &[u8]) -> Result<Self> {
		let private_key = RsaPrivateKey::from_pkcs8_der(der)
			.map_err(|e| CustodyError::StateCorruption(format!("malformed RSA private key: {e}")))?;
		let public_key = RsaPublicKey::from(&private_key);
		Ok(IdentityKeyPair { node_id: node_id.into(), private_key, public_key })
	}

	/// PKCS#8 DER encoding for storage under a secret-module label.
	pub fn to_pkcs8_der(&self) -> Result<Vec<u8>> {
		self.private_key
			.to_pkcs8_der()
			.map(|doc| doc.as_bytes().to_vec())
			.map_err(|e| CustodyError::StateCorruption(format!("failed to encode RSA private key: {e}")))
	}

	pub fn public_record(&self) -> Result<IdentityRecord> {
		let pem = self
			.public_key
			.to_pkcs1_pem(LineEnding::LF)
			.map_err(|e| CustodyError::StateCorruption(format!("failed to encode RSA public key: {e}")))?;
		Ok(IdentityRecord {
			node_id: self.node_id.clone(),
			public_key_pem: pem.to_string(),
			created_at: unix_timestamp(),
		})
	}

	/// Decrypt a share addressed to this node.
	pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
		self.private_key
			.decrypt(Oaep::new::<Sha256>(), ciphertext)
			.map_err(|e| CustodyError::MalformedContent {
				path: format!("identity/{}", self.node_id),
				detail: format!("RSA-OAEP decryption failed: {e}"),
			})
	}
}

impl IdentityRecord {
	pub fn public_key(&self) -> Result<RsaPublicKey> {
		RsaPublicKey::from_pkcs1_pem(&self.public_key_pem).map_err(|e| CustodyError::MalformedContent {
			path: format!("identity/{}", self.node_id),
			detail: format!("malformed RSA public key: {e}"),
		})
	}

	/// Encrypt a plaintext (a DKG share) for this node under RSA-OAEP-SHA256.
	pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
		let mut rng = OsRng;
		let public_key = self.public_key()?;
		public_key
			.encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
			.map_err(|e| CustodyError::MalformedContent {
				path: format!("identity/{}", self.node_id),
				detail: format!("RSA-OAEP encryption failed: {e}"),
			})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encrypt_decrypt_round_trip() {
		let keypair = IdentityKeyPair::generate("node-1").unwrap();
		let record = keypair.public_record().unwrap();

		let plaintext = b"a feldman share, 32 bytes long!";
		let ciphertext = record.encrypt(plaintext).unwrap();
		assert_ne!(ciphertext, plaintext);

		let decrypted = keypair.decrypt(&ciphertext).unwrap();
		assert_eq!(decrypted, plaintext);
	}

	#[test]
	fn private_key_der_round_trips_through_storage() {
		let keypair = IdentityKeyPair::generate("node-2").unwrap();
		let der = keypair.to_pkcs8_der().unwrap();
		let restored = IdentityKeyPair::from_pkcs8_der("node-2", &der).unwrap();

		let plaintext = b"share bytes";
		let ciphertext = restored.public_record().unwrap().encrypt(plaintext).unwrap();
		assert_eq!(restored.decrypt(&ciphertext).unwrap(), plaintext);
	}

	#[test]
	fn public_record_round_trips_through_board_json() {
		let keypair = IdentityKeyPair::generate("node-3").unwrap();
		let record = keypair.public_record().unwrap();
		let json = serde_json::to_string(&record).unwrap();
		let parsed: IdentityRecord = serde_json::from_str(&json).unwrap();
		assert_eq!(parsed.node_id, "node-3");
		assert!(parsed.public_key().is_ok());
	}
}
