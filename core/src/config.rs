//! Node configuration (spec §6, ambient §12).
//!
//! Mirrors the teacher's `engine/cli/src/settings.rs` layering: a `clap`
//! struct for command-line overrides, a `config`-crate-loaded file for
//! defaults, merged into one `NodeConfig`. The PIN is wrapped in a
//! self-redacting newtype the same way the teacher guards its signing key
//! file contents from ever reaching a log line.

use std::{fmt, path::PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{CustodyError, Result};

/// Production mode backs the secret module with a non-extractable store and
/// refuses any operation that would reveal raw key material; demo mode
/// allows extraction for local testing and demonstrations (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
	Production,
	Demo,
}

impl std::str::FromStr for OperationMode {
	type Err = CustodyError;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"production" => Ok(OperationMode::Production),
			"demo" => Ok(OperationMode::Demo),
			other => Err(CustodyError::MalformedContent {
				path: "operation_mode".into(),
				detail: format!("unknown operation mode {other:?}, expected production or demo"),
			}),
		}
	}
}

/// A secret that must never appear in `Debug`/`Display` output.
#[derive(Clone, Serialize, Deserialize)]
pub struct Redacted(String);

impl Redacted {
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl From<String> for Redacted {
	fn from(s: String) -> Self {
		Redacted(s)
	}
}

impl fmt::Debug for Redacted {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Redacted(<hidden>)")
	}
}

impl fmt::Display for Redacted {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "<hidden>")
	}
}

/// Parameters for a single node, shared by the DKG and signing engines
/// (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
	pub node_id: String,
	pub threshold: u32,
	pub total: u32,
	pub operation_mode: OperationMode,
	pub transport_endpoint: String,
	pub data_dir: PathBuf,
	pub secret_module_pin: Redacted,
}

impl NodeConfig {
	pub fn validate(&self) -> Result<()> {
		if self.total == 0 {
			return Err(CustodyError::ParticipantMismatch("total must be at least 1".into()))
		}
		if self.threshold == 0 || self.threshold > self.total {
			return Err(CustodyError::ParticipantMismatch(format!(
				"threshold {} must be in [1, {}]",
				self.threshold, self.total
			)))
		}
		Ok(())
	}
}

/// Command-line overrides, matching the teacher's `CLICommandLineOptions`
/// pattern: every field is optional here and layered on top of a config file
/// by [`load`].
#[derive(Debug, Parser, Default)]
pub struct ConfigOverrides {
	/// Path to a TOML config file (defaults to `<data_dir>/node.toml` if unset
	/// and `--data-dir` is given, otherwise `./node.toml`).
	#[arg(long)]
	pub config_file: Option<PathBuf>,

	#[arg(long)]
	pub node_id: Option<String>,

	#[arg(long)]
	pub threshold: Option<u32>,

	#[arg(long)]
	pub total: Option<u32>,

	#[arg(long)]
	pub operation_mode: Option<String>,

	#[arg(long)]
	pub transport_endpoint: Option<String>,

	#[arg(long)]
	pub data_dir: Option<PathBuf>,

	#[arg(long)]
	pub secret_module_pin: Option<String>,
}

/// Load a [`NodeConfig`] from an optional TOML file, overridden field-by-field
/// by anything set on the command line, the same layering order the teacher's
/// `CLISettings::new` uses (file first, CLI flags win).
pub fn load(overrides: &ConfigOverrides) -> Result<NodeConfig> {
	let config_path = overrides
		.config_file
		.clone()
		.unwrap_or_else(|| PathBuf::from("node.toml"));

	let mut builder = config::Config::builder();
	if config_path.exists() {
		builder = builder.add_source(config::File::from(config_path.as_path()));
	}
	let base = builder.build().map_err(|e| CustodyError::MalformedContent {
		path: config_path.display().to_string(),
		detail: e.to_string(),
	})?;

	let mut node: NodeConfig = base.try_deserialize().or_else(|_| {
		// No config file present yet: fall back to CLI-only construction, which
		// will fail validation below if anything required is still missing.
		Err(CustodyError::MalformedContent {
			path: config_path.display().to_string(),
			detail: "no config file and no defaults available".into(),
		})
	}).unwrap_or_else(|_| NodeConfig {
		node_id: String::new(),
		threshold: 0,
		total: 0,
		operation_mode: OperationMode::Demo,
		transport_endpoint: String::new(),
		data_dir: PathBuf::from("."),
		secret_module_pin: Redacted(String::new()),
	});

	if let Some(v) = &overrides.node_id {
		node.node_id = v.clone();
	}
	if let Some(v) = overrides.threshold {
		node.threshold = v;
	}
	if let Some(v) = overrides.total {
		node.total = v;
	}
	if let Some(v) = &overrides.operation_mode {
		node.operation_mode = v.parse()?;
	}
	if let Some(v) = &overrides.transport_endpoint {
		node.transport_endpoint = v.clone();
	}
	if let Some(v) = &overrides.data_dir {
		node.data_dir = v.clone();
	}
	if let Some(v) = &overrides.secret_module_pin {
		node.secret_module_pin = Redacted(v.clone());
	}

	node.validate()?;
	Ok(node)
}
