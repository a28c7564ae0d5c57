//! Secret module adapter (component C2, spec §4.2).
//!
//! Models a PKCS#11-class secure element: callers address objects by label,
//! never by raw key material. In `Production` mode, objects are created
//! non-extractable — `get_object` refuses to hand back their bytes, and
//! callers must go through [`SecretModule::use_object`], which runs a
//! closure against the bytes without ever returning them. In `Demo` mode
//! objects are extractable, which is what lets the CLI and integration
//! tests inspect key material directly.
//!
//! This file ships the filesystem-backed reference implementation spec.md
//! asks for (§1: the secret module's contract matters, not a specific
//! vendor's PKCS#11 library); it is not grounded on any single teacher file
//! since no pack example implements non-extractability, but follows the
//! teacher's general `KeyStoreAPI`-over-a-durable-store shape from
//! `engine/src/db/mod.rs` and `engine/multisig/src/client/key_store_api.rs`.

use std::{
	collections::HashMap,
	fs,
	io::Write,
	path::{Path, PathBuf},
};

use fs4::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
	config::OperationMode,
	error::{CustodyError, Result},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredObject {
	value_hex: String,
	extractable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Document {
	pin_hash_hex: String,
	objects: HashMap<String, StoredObject>,
	counters: HashMap<String, u64>,
}

pub struct SecretModule {
	mode: OperationMode,
	store_path: PathBuf,
	lock_path: PathBuf,
	logged_in: bool,
}

impl SecretModule {
	/// Initialise a fresh module backing file under `data_dir`, setting the
	/// login PIN. Fails if a module already exists there.
	pub fn init(data_dir: &Path, mode: OperationMode, pin: &str) -> Result<Self> {
		fs::create_dir_all(data_dir)?;
		let store_path = data_dir.join("secret_module.json");
		if store_path.exists() {
			return Err(CustodyError::ObjectAlreadyExists(store_path.display().to_string()))
		}
		let document = Document { pin_hash_hex: hash_pin(pin), ..Default::default() };
		write_document(&store_path, &document)?;
		Ok(SecretModule {
			mode,
			store_path,
			lock_path: data_dir.join("secret_module.lock"),
			logged_in: false,
		})
	}

	/// Open an already-initialised module backing file. Not yet logged in.
	pub fn open(data_dir: &Path, mode: OperationMode) -> Result<Self> {
		let store_path = data_dir.join("secret_module.json");
		if !store_path.exists() {
			return Err(CustodyError::ObjectNotFound(store_path.display().to_string()))
		}
		Ok(SecretModule { mode, store_path, lock_path: data_dir.join("secret_module.lock"), logged_in: false })
	}

	pub fn login(&mut self, pin: &str) -> Result<()> {
		let document = read_document(&self.store_path)?;
		if document.pin_hash_hex != hash_pin(pin) {
			return Err(CustodyError::PhaseError("incorrect secret module PIN".into()))
		}
		self.logged_in = true;
		Ok(())
	}

	pub fn logout(&mut self) {
		self.logged_in = false;
	}

	fn require_login(&self) -> Result<()> {
		if self.logged_in {
			Ok(())
		} else {
			Err(CustodyError::PhaseError("secret module not logged in".into()))
		}
	}

	pub fn object_exists(&self, label: &str) -> Result<bool> {
		let document = read_document(&self.store_path)?;
		Ok(document.objects.contains_key(label))
	}

	/// Create a new object under `label`. Idempotent: re-creating with
	/// identical bytes succeeds silently; creating with different bytes
	/// under an existing label is refused.
	pub fn create_object(&self, label: &str, bytes: &[u8]) -> Result<()> {
		self.require_login()?;
		let result = self.mutate(|document| {
			let extractable = matches!(self.mode, OperationMode::Demo);
			if let Some(existing) = document.objects.get(label) {
				return if existing.value_hex == hex::encode(bytes) {
					Ok(())
				} else {
					Err(CustodyError::ObjectAlreadyExists(label.to_string()))
				}
			}
			document
				.objects
				.insert(label.to_string(), StoredObject { value_hex: hex::encode(bytes), extractable });
			Ok(())
		});
		match &result {
			Ok(()) => debug!(label, extractable = matches!(self.mode, OperationMode::Demo), "secret object created"),
			Err(e) => warn!(label, error = %e, "secret object creation refused"),
		}
		result
	}

	/// Overwrite an object under `label` unconditionally, creating it if absent.
	pub fn replace_object(&self, label: &str, bytes: &[u8]) -> Result<()> {
		self.require_login()?;
		self.mutate(|document| {
			let extractable = matches!(self.mode, OperationMode::Demo);
			document
				.objects
				.insert(label.to_string(), StoredObject { value_hex: hex::encode(bytes), extractable });
			Ok(())
		})
	}

	/// Export an object's raw bytes. Forbidden in `Production` mode.
	pub fn get_object(&self, label: &str) -> Result<Vec<u8>> {
		self.require_login()?;
		let document = read_document(&self.store_path)?;
		let object = document
			.objects
			.get(label)
			.ok_or_else(|| CustodyError::ObjectNotFound(label.to_string()))?;
		if !object.extractable {
			return Err(CustodyError::SecretExtractionForbidden(
				"object is non-extractable in production mode",
			))
		}
		hex::decode(&object.value_hex)
			.map_err(|e| CustodyError::MalformedContent { path: label.to_string(), detail: e.to_string() })
	}

	/// Run `f` against an object's raw bytes without ever returning them to
	/// the caller. Permitted regardless of extractability, mirroring the way
	/// a real secure element lets you *use* a non-extractable key without
	/// exporting it.
	pub fn use_object<R>(&self, label: &str, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
		self.require_login()?;
		let document = read_document(&self.store_path)?;
		let object = document
			.objects
			.get(label)
			.ok_or_else(|| CustodyError::ObjectNotFound(label.to_string()))?;
		let bytes = hex::decode(&object.value_hex)
			.map_err(|e| CustodyError::MalformedContent { path: label.to_string(), detail: e.to_string() })?;
		f(&bytes)
	}

	pub fn counter_get(&self, label: &str) -> Result<u64> {
		self.require_login()?;
		let document = read_document(&self.store_path)?;
		Ok(*document.counters.get(label).unwrap_or(&0))
	}

	/// Atomically increment and return the new counter value. Never
	/// decrements or resets: the only way forward is up (spec §4.3's
	/// anti-rollback discipline for nonce derivation).
	pub fn counter_increment_and_get(&self, label: &str) -> Result<u64> {
		self.require_login()?;
		let next = self.mutate(|document| {
			let counter = document.counters.entry(label.to_string()).or_insert(0);
			*counter = counter.checked_add(1).ok_or(CustodyError::CounterExhausted)?;
			Ok(*counter)
		})?;
		debug!(label, counter = next, "secret module counter advanced");
		Ok(next)
	}

	fn mutate<R>(&self, f: impl FnOnce(&mut Document) -> Result<R>) -> Result<R> {
		let lock_file = fs::OpenOptions::new()
			.create(true)
			.write(true)
			.truncate(false)
			.open(&self.lock_path)?;
		lock_file.lock_exclusive().map_err(CustodyError::Io)?;
		let result = (|| {
			let mut document = read_document(&self.store_path)?;
			let r = f(&mut document)?;
			write_document(&self.store_path, &document)?;
			Ok(r)
		})();
		fs4::FileExt::unlock(&lock_file).ok();
		result
	}
}

fn hash_pin(pin: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(pin.as_bytes());
	hex::encode(hasher.finalize())
}

fn read_document(path: &Path) -> Result<Document> {
	let bytes = fs::read(path)?;
	serde_json::from_slice(&bytes).map_err(CustodyError::Json)
}

fn write_document(path: &Path, document: &Document) -> Result<()> {
	let tmp_path = path.with_extension("json.tmp");
	{
		let mut tmp = fs::File::create(&tmp_path)?;
		tmp.write_all(&serde_json::to_vec_pretty(document)?)?;
		tmp.sync_all()?;
	}
	fs::rename(&tmp_path, path)?;
	Ok(())
}
