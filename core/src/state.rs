//! Durable state manager (component C4, spec §4.4).
//!
//! A single JSON document per node, guarded by an `fs4` advisory file lock
//! and replaced atomically via write-to-tmp-then-rename — the same
//! replace-via-rename idiom as the teacher's `engine/src/db/persistent.rs`,
//! reworked from a rocksdb column-family store onto one JSON file, since
//! spec.md's durable-state contract is a small document with audit queries
//! rather than a multi-column embedded database.
//!
//! [`StateManager::update`] takes its own lock and reads the document
//! itself; it never calls through [`StateManager::read`], since that would
//! try to take the (non-reentrant) lock a second time and deadlock.

use std::{
	collections::HashMap,
	fs,
	io::Write as _,
	path::{Path, PathBuf},
};

use fs4::FileExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
	error::{CustodyError, Result},
	secret_module::SecretModule,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NonceAuditEntry {
	pub request_id: String,
	pub counter: u64,
	pub r_hex: String,
	pub message_digest_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateDocument {
	pub nonce_audit: Vec<NonceAuditEntry>,
	/// Free-form typed slots keyed by name, used by the DKG and signing
	/// engines to persist their ceremony state machines without each
	/// needing a bespoke document shape.
	pub entries: HashMap<String, serde_json::Value>,
}

pub struct StateManager {
	path: PathBuf,
	lock_path: PathBuf,
}

impl StateManager {
	pub fn open(path: PathBuf) -> Result<Self> {
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}
		let lock_path = path.with_extension("json.lock");
		if !path.exists() {
			write_document(&path, &StateDocument::default())?;
		}
		Ok(StateManager { path, lock_path })
	}

	pub fn read(&self) -> Result<StateDocument> {
		let lock_file = self.open_lock_file()?;
		lock_file.lock_shared().map_err(CustodyError::Io)?;
		let document = read_document(&self.path);
		fs4::FileExt::unlock(&lock_file).ok();
		document
	}

	/// Atomically read-modify-write the document. `f` must not call
	/// [`StateManager::read`] or [`StateManager::update`] again: the lock
	/// held here is not reentrant.
	pub fn update<R>(&self, f: impl FnOnce(&mut StateDocument) -> Result<R>) -> Result<R> {
		let lock_file = self.open_lock_file()?;
		lock_file.lock_exclusive().map_err(CustodyError::Io)?;
		let result = (|| {
			let mut document = read_document(&self.path)?;
			let r = f(&mut document)?;
			write_document(&self.path, &document)?;
			Ok(r)
		})();
		fs4::FileExt::unlock(&lock_file).ok();
		result
	}

	fn open_lock_file(&self) -> Result<fs::File> {
		Ok(fs::OpenOptions::new().create(true).write(true).truncate(false).open(&self.lock_path)?)
	}

	pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
		let document = self.read()?;
		document
			.entries
			.get(key)
			.map(|v| serde_json::from_value(v.clone()).map_err(CustodyError::Json))
			.transpose()
	}

	pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
		self.update(|document| {
			document.entries.insert(key.to_string(), serde_json::to_value(value).map_err(CustodyError::Json)?);
			Ok(())
		})
	}

	pub fn record_nonce(
		&self,
		request_id: &str,
		counter: u64,
		r_hex: &str,
		message_digest_hex: &str,
	) -> Result<()> {
		self.update(|document| {
			document.nonce_audit.push(NonceAuditEntry {
				request_id: request_id.to_string(),
				counter,
				r_hex: r_hex.to_string(),
				message_digest_hex: message_digest_hex.to_string(),
			});
			Ok(())
		})?;
		debug!(request_id, counter, "nonce derivation recorded in local state");
		Ok(())
	}

	pub fn has_nonce_for(&self, request_id: &str) -> Result<bool> {
		let document = self.read()?;
		Ok(document.nonce_audit.iter().any(|e| e.request_id == request_id))
	}

	pub fn list_nonce_audit(&self) -> Result<Vec<NonceAuditEntry>> {
		Ok(self.read()?.nonce_audit)
	}

	/// Cross-check the local audit trail against the secret module's
	/// `NONCE_DERIV_{counter}` records, returning a description of any
	/// mismatch: an audited counter with no corresponding module record (a
	/// sign the module was restored from an older backup than local state),
	/// or vice versa.
	pub fn cross_check_against_module(&self, module: &SecretModule) -> Result<Vec<String>> {
		let document = self.read()?;
		let mut problems = Vec::new();
		for entry in &document.nonce_audit {
			let label = format!("NONCE_DERIV_{}", entry.counter);
			if !module.object_exists(&label)? {
				problems.push(format!(
					"local state records counter {} for request {} but the secret module has no {label}",
					entry.counter, entry.request_id
				));
			}
		}
		if !problems.is_empty() {
			warn!(count = problems.len(), "nonce audit cross-check found discrepancies");
		}
		Ok(problems)
	}
}

fn read_document(path: &Path) -> Result<StateDocument> {
	let bytes = fs::read(path)?;
	serde_json::from_slice(&bytes).map_err(CustodyError::Json)
}

fn write_document(path: &Path, document: &StateDocument) -> Result<()> {
	let tmp_path = path.with_extension("json.tmp");
	{
		let mut tmp = fs::File::create(&tmp_path)?;
		tmp.write_all(&serde_json::to_vec_pretty(document).map_err(CustodyError::Json)?)?;
		tmp.sync_all()?;
	}
	fs::rename(&tmp_path, path)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::OperationMode;

	#[test]
	fn nonce_audit_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let state = StateManager::open(dir.path().join("state.json")).unwrap();

		assert!(!state.has_nonce_for("req-1").unwrap());
		state.record_nonce("req-1", 1, "02aa", "deadbeef").unwrap();
		assert!(state.has_nonce_for("req-1").unwrap());

		let entries = state.list_nonce_audit().unwrap();
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].request_id, "req-1");
	}

	#[test]
	fn typed_entries_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let state = StateManager::open(dir.path().join("state.json")).unwrap();

		#[derive(Serialize, Deserialize, PartialEq, Debug)]
		struct Phase(String);

		state.set("dkg/round-1", &Phase("committed".into())).unwrap();
		let loaded: Option<Phase> = state.get("dkg/round-1").unwrap();
		assert_eq!(loaded, Some(Phase("committed".into())));
	}

	#[test]
	fn cross_check_flags_missing_module_record() {
		let dir = tempfile::tempdir().unwrap();
		let state = StateManager::open(dir.path().join("state.json")).unwrap();
		let mut module = SecretModule::init(dir.path(), OperationMode::Demo, "1234").unwrap();
		module.login("1234").unwrap();

		state.record_nonce("req-1", 3, "02aa", "deadbeef").unwrap();
		let problems = state.cross_check_against_module(&module).unwrap();
		assert_eq!(problems.len(), 1);

		module.create_object("NONCE_DERIV_3", b"{}").unwrap();
		assert!(state.cross_check_against_module(&module).unwrap().is_empty());
	}

	#[test]
	fn update_does_not_deadlock_on_repeated_calls() {
		let dir = tempfile::tempdir().unwrap();
		let state = StateManager::open(dir.path().join("state.json")).unwrap();
		state.update(|doc| {
			doc.entries.insert("a".into(), serde_json::json!(1));
			Ok(())
		}).unwrap();
		state.update(|doc| {
			doc.entries.insert("b".into(), serde_json::json!(2));
			Ok(())
		}).unwrap();
		let doc = state.read().unwrap();
		assert_eq!(doc.entries.len(), 2);
	}
}
