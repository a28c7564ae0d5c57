//! Node context: wires C1-C7 together for one running node.
//!
//! Spec §9 explicitly calls out that implementations should avoid
//! process-wide singletons for the secret module, board client, and state
//! manager, so ceremonies stay testable with multiple independent node
//! contexts in the same process (see the multi-node tests in
//! [`crate::dkg`]/[`crate::signing`]). `NodeContext` is that explicit handle
//! — there is no global state anywhere in this crate.

use std::path::Path;

use crate::{
	board::{BoardClient, FsBoard},
	config::{NodeConfig, OperationMode},
	dkg::DkgEngine,
	error::Result,
	identity::IdentityKeyPair,
	secret_module::SecretModule,
	signing::SigningEngine,
	state::StateManager,
};

const IDENTITY_LABEL: &str = "IDENTITY_KEY";
const NONCE_SEED_LABEL: &str = "NONCE_MASTER_SEED";

pub struct NodeContext {
	pub config: NodeConfig,
	pub module: SecretModule,
	pub state: StateManager,
	pub board: FsBoard,
}

impl NodeContext {
	/// Initialise a brand-new node: a fresh secret module, state file, and
	/// board directory, plus a freshly generated RSA identity and nonce
	/// seed. Fails if the secret module already exists at `config.data_dir`.
	pub fn init(config: NodeConfig, board_root: impl AsRef<Path>) -> Result<Self> {
		let mut module = SecretModule::init(
			&config.data_dir,
			config.operation_mode,
			config.secret_module_pin.expose(),
		)?;
		module.login(config.secret_module_pin.expose())?;

		let state = StateManager::open(config.data_dir.join("state.json"))?;
		let board = FsBoard::new(board_root)?;

		let identity = IdentityKeyPair::generate(config.node_id.clone())?;
		module.create_object(IDENTITY_LABEL, &identity.to_pkcs8_der()?)?;
		board.post(
			&format!("identity/{}.json", config.node_id),
			&serde_json::to_vec(&identity.public_record()?)?,
		)?;

		use rand::RngCore;
		let mut seed = [0u8; 32];
		rand::rngs::OsRng.fill_bytes(&mut seed);
		module.create_object(NONCE_SEED_LABEL, &seed)?;
		use zeroize::Zeroize;
		seed.zeroize();

		Ok(NodeContext { config, module, state, board })
	}

	/// Reopen a node whose secret module and state already exist on disk.
	pub fn open(config: NodeConfig, board_root: impl AsRef<Path>) -> Result<Self> {
		let mut module = SecretModule::open(&config.data_dir, config.operation_mode)?;
		module.login(config.secret_module_pin.expose())?;
		let state = StateManager::open(config.data_dir.join("state.json"))?;
		let board = FsBoard::new(board_root)?;
		Ok(NodeContext { config, module, state, board })
	}

	pub fn is_production(&self) -> bool {
		matches!(self.config.operation_mode, OperationMode::Production)
	}

	pub fn dkg(&self, round_participants: Vec<String>, threshold: u32) -> DkgEngine<'_> {
		DkgEngine {
			node_id: self.config.node_id.clone(),
			participants: round_participants,
			threshold,
			board: &self.board as &dyn BoardClient,
			module: &self.module,
			state: &self.state,
		}
	}

	pub fn signing(&self, round_participants: Vec<String>, threshold: u32) -> SigningEngine<'_> {
		SigningEngine {
			node_id: self.config.node_id.clone(),
			participants: round_participants,
			threshold,
			board: &self.board as &dyn BoardClient,
			module: &self.module,
			state: &self.state,
		}
	}
}
