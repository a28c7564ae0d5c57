//! Operator CLI for the threshold custody core.
//!
//! Mirrors the teacher's `engine/cli/src/main.rs`: a `clap`-derived
//! subcommand dispatcher, a `tracing_subscriber` bootstrap before anything
//! else runs, and `anyhow::Result` at this binary's boundary wrapping the
//! library's typed `CustodyError`s for operator-facing display.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use custody_core::{
	config::{self, ConfigOverrides},
	node::NodeContext,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "custody", about = "Threshold custody core operator CLI")]
struct Cli {
	#[command(flatten)]
	config: ConfigOverrides,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Initialise a new node: secret module, state file, RSA identity, nonce seed.
	Init {
		/// Directory backing the shared bulletin board.
		#[arg(long)]
		board_dir: std::path::PathBuf,
	},
	/// Start a DKG round: sample and publish this node's polynomial commitments.
	DkgStart {
		#[arg(long)]
		board_dir: std::path::PathBuf,
		#[arg(long)]
		round_id: String,
		#[arg(long, value_delimiter = ',')]
		participants: Vec<String>,
		#[arg(long)]
		threshold: u32,
	},
	/// Distribute encrypted shares for a DKG round already committed to.
	DkgDistribute {
		#[arg(long)]
		board_dir: std::path::PathBuf,
		#[arg(long)]
		round_id: String,
		#[arg(long, value_delimiter = ',')]
		participants: Vec<String>,
		#[arg(long)]
		threshold: u32,
	},
	/// Verify incoming shares and finalize a DKG round.
	DkgFinalize {
		#[arg(long)]
		board_dir: std::path::PathBuf,
		#[arg(long)]
		round_id: String,
		#[arg(long, value_delimiter = ',')]
		participants: Vec<String>,
		#[arg(long)]
		threshold: u32,
	},
	/// Post a new signing request.
	SignRequest {
		#[arg(long)]
		board_dir: std::path::PathBuf,
		#[arg(long)]
		request_id: String,
		#[arg(long)]
		round_id: String,
		#[arg(long, value_delimiter = ',')]
		participants: Vec<String>,
		#[arg(long)]
		threshold: u32,
		/// Hex-encoded message to sign.
		#[arg(long)]
		message_hex: String,
		/// Node identifier of whoever is requesting the signature.
		#[arg(long)]
		requester: String,
	},
	/// Pre-check, derive and back up this node's nonce, and post its
	/// commitment for a pending signing request.
	SignApprove {
		#[arg(long)]
		board_dir: std::path::PathBuf,
		#[arg(long)]
		request_id: String,
		#[arg(long, value_delimiter = ',')]
		participants: Vec<String>,
		#[arg(long)]
		threshold: u32,
	},
	/// Post this node's response and, once complete, combine and verify the signature.
	SignFinalize {
		#[arg(long)]
		board_dir: std::path::PathBuf,
		#[arg(long)]
		request_id: String,
		#[arg(long, value_delimiter = ',')]
		participants: Vec<String>,
		#[arg(long)]
		threshold: u32,
	},
	/// Print the local nonce-derivation audit trail and cross-check it
	/// against the secret module's own records.
	Audit {
		#[arg(long)]
		board_dir: std::path::PathBuf,
	},
}

fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let cli = Cli::parse();
	let node_config = config::load(&cli.config).context("loading node configuration")?;

	match cli.command {
		Command::Init { board_dir } => {
			let ctx = NodeContext::init(node_config, &board_dir).context("initialising node")?;
			tracing::info!(node_id = %ctx.config.node_id, "node initialised");
		},
		Command::DkgStart { board_dir, round_id, participants, threshold } => {
			let ctx = NodeContext::open(node_config, &board_dir).context("opening node")?;
			ctx.dkg(participants, threshold).commit(&round_id).context("dkg commit")?;
			tracing::info!(round_id, "dkg commitments published");
		},
		Command::DkgDistribute { board_dir, round_id, participants, threshold } => {
			let ctx = NodeContext::open(node_config, &board_dir).context("opening node")?;
			ctx.dkg(participants, threshold).distribute(&round_id).context("dkg distribute")?;
			tracing::info!(round_id, "dkg shares distributed");
		},
		Command::DkgFinalize { board_dir, round_id, participants, threshold } => {
			let ctx = NodeContext::open(node_config, &board_dir).context("opening node")?;
			let group_pubkey =
				ctx.dkg(participants, threshold).finalize(&round_id).context("dkg finalize")?;
			let group_pubkey_hex = group_pubkey.to_compressed_hex().context("encoding group public key")?;
			println!("{group_pubkey_hex}");
		},
		Command::SignRequest {
			board_dir,
			request_id,
			round_id,
			participants,
			threshold,
			message_hex,
			requester,
		} => {
			let ctx = NodeContext::open(node_config, &board_dir).context("opening node")?;
			let message = hex::decode(&message_hex).context("decoding --message-hex")?;
			ctx.signing(participants, threshold)
				.request(&request_id, &round_id, &message, &requester)
				.context("sign request")?;
			tracing::info!(request_id, "signing request posted");
		},
		Command::SignApprove { board_dir, request_id, participants, threshold } => {
			let ctx = NodeContext::open(node_config, &board_dir).context("opening node")?;
			ctx.signing(participants, threshold).approve(&request_id).context("sign approve")?;
			tracing::info!(request_id, "nonce commitment posted");
		},
		Command::SignFinalize { board_dir, request_id, participants, threshold } => {
			let ctx = NodeContext::open(node_config, &board_dir).context("opening node")?;
			let signature =
				ctx.signing(participants, threshold).finalize(&request_id).context("sign finalize")?;
			println!("{}", serde_json::to_string_pretty(&signature)?);
		},
		Command::Audit { board_dir } => {
			let ctx = NodeContext::open(node_config, &board_dir).context("opening node")?;
			let entries = ctx.state.list_nonce_audit().context("reading nonce audit trail")?;
			let problems =
				ctx.state.cross_check_against_module(&ctx.module).context("cross-checking secret module")?;
			for entry in &entries {
				println!("{entry:?}");
			}
			if problems.is_empty() {
				println!("no discrepancies between local state and the secret module");
			} else {
				for problem in &problems {
					println!("WARNING: {problem}");
				}
			}
		},
	}

	Ok(())
}
