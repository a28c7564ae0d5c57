//! Bulletin-board client (component C5, spec §4.5).
//!
//! The board is a versioned, content-addressed object store: every path is
//! write-once (posting identical content twice is a no-op; posting
//! different content to an already-occupied path is refused outright,
//! never silently overwritten) and reads/lists never need coordination.
//! Transport itself is out of scope (spec §1) — `FsBoard` is the shipped
//! filesystem-backed reference implementation behind the [`BoardClient`]
//! trait, the same way the teacher keeps its ceremony logic behind a
//! `KeyStoreAPI`/`KeyDB` trait with exactly one production implementation.

use std::{
	fs,
	io::{ErrorKind, Write as _},
	path::PathBuf,
};

use fs4::FileExt;
use tracing::{debug, warn};

use crate::error::{CustodyError, Result};

const MAX_POST_ATTEMPTS: u32 = 3;

pub trait BoardClient {
	/// Write `content` at `path`. Idempotent if `path` already holds the same
	/// bytes; refuses (does not overwrite) if it holds different bytes.
	fn post(&self, path: &str, content: &[u8]) -> Result<()>;

	/// Read the content at `path`, or `None` if nothing has been posted there.
	fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

	/// List all paths directly under `prefix` (non-recursive segment names).
	fn list(&self, prefix: &str) -> Result<Vec<String>>;

	/// Reconcile any buffered local view with the backing store. A no-op for
	/// the filesystem reference implementation, but present so a future
	/// networked client has somewhere to put a pull-before-read step.
	fn sync(&self) -> Result<()> {
		Ok(())
	}
}

pub struct FsBoard {
	root: PathBuf,
}

impl FsBoard {
	pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
		let root = root.into();
		fs::create_dir_all(&root)?;
		Ok(FsBoard { root })
	}

	fn resolve(&self, path: &str) -> PathBuf {
		self.root.join(path)
	}
}

impl BoardClient for FsBoard {
	fn post(&self, path: &str, content: &[u8]) -> Result<()> {
		let full_path = self.resolve(path);
		if let Some(parent) = full_path.parent() {
			fs::create_dir_all(parent)?;
		}

		let mut attempts = 0;
		loop {
			attempts += 1;
			let lock_path = full_path.with_extension("lock");
			let lock_file =
				fs::OpenOptions::new().create(true).write(true).truncate(false).open(&lock_path)?;

			let outcome = (|| -> Result<bool> {
				lock_file.lock_exclusive().map_err(CustodyError::Io)?;
				let result = match fs::OpenOptions::new().write(true).create_new(true).open(&full_path) {
					Ok(mut file) => {
						file.write_all(content)?;
						file.sync_all()?;
						Ok(true)
					},
					Err(e) if e.kind() == ErrorKind::AlreadyExists => {
						let existing = fs::read(&full_path)?;
						if existing == content {
							Ok(true)
						} else {
							Err(CustodyError::ObjectAlreadyExists(path.to_string()))
						}
					},
					Err(e) => Err(CustodyError::Io(e)),
				};
				fs4::FileExt::unlock(&lock_file).ok();
				result
			})();

			match outcome {
				Ok(true) => {
					debug!(path, attempts, "board post committed");
					return Ok(())
				},
				Ok(false) => unreachable!(),
				Err(CustodyError::ObjectAlreadyExists(p)) => return Err(CustodyError::ObjectAlreadyExists(p)),
				Err(e) =>
					if attempts >= MAX_POST_ATTEMPTS {
						warn!(path, attempts, error = %e, "board post exhausted retries");
						return Err(CustodyError::TransientTransportError {
							attempts,
							source: e.to_string(),
						})
					} else {
						warn!(path, attempts, error = %e, "board post retrying after transient error");
					},
			}
		}
	}

	fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
		let full_path = self.resolve(path);
		match fs::read(&full_path) {
			Ok(bytes) => Ok(Some(bytes)),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
			Err(e) => Err(CustodyError::Io(e)),
		}
	}

	fn list(&self, prefix: &str) -> Result<Vec<String>> {
		let dir = self.resolve(prefix);
		if !dir.exists() {
			return Ok(Vec::new())
		}
		let mut names = Vec::new();
		for entry in fs::read_dir(&dir)? {
			let entry = entry?;
			let name = entry.file_name().to_string_lossy().into_owned();
			if name.ends_with(".lock") || name.ends_with(".tmp") {
				continue
			}
			names.push(name);
		}
		names.sort();
		Ok(names)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn post_then_read_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let board = FsBoard::new(dir.path()).unwrap();
		board.post("identity/node-1.json", b"{\"node_id\":\"node-1\"}").unwrap();
		assert_eq!(board.read("identity/node-1.json").unwrap().unwrap(), b"{\"node_id\":\"node-1\"}");
	}

	#[test]
	fn missing_path_reads_as_none() {
		let dir = tempfile::tempdir().unwrap();
		let board = FsBoard::new(dir.path()).unwrap();
		assert!(board.read("nothing/here.json").unwrap().is_none());
	}

	#[test]
	fn reposting_identical_content_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let board = FsBoard::new(dir.path()).unwrap();
		board.post("a.json", b"x").unwrap();
		board.post("a.json", b"x").unwrap();
	}

	#[test]
	fn reposting_different_content_is_refused() {
		let dir = tempfile::tempdir().unwrap();
		let board = FsBoard::new(dir.path()).unwrap();
		board.post("a.json", b"x").unwrap();
		assert!(matches!(board.post("a.json", b"y"), Err(CustodyError::ObjectAlreadyExists(_))));
		// The original content must survive the refused overwrite attempt.
		assert_eq!(board.read("a.json").unwrap().unwrap(), b"x");
	}

	#[test]
	fn list_returns_sorted_entries_without_lockfiles() {
		let dir = tempfile::tempdir().unwrap();
		let board = FsBoard::new(dir.path()).unwrap();
		board.post("dkg/round-1/b.json", b"1").unwrap();
		board.post("dkg/round-1/a.json", b"2").unwrap();
		let listed = board.list("dkg/round-1").unwrap();
		assert_eq!(listed, vec!["a.json".to_string(), "b.json".to_string()]);
	}
}
