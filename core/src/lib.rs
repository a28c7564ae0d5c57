//! Asynchronous threshold custody core: Feldman DKG and threshold Schnorr
//! signing over a versioned, content-addressed bulletin board. Nodes never
//! need to be online at the same time — every interaction between
//! participants happens as a read or a write against [`board`].

pub mod board;
pub mod config;
pub mod crypto;
pub mod dkg;
pub mod error;
pub mod identity;
pub mod node;
pub mod nonce;
pub mod secret_module;
pub mod signing;
pub mod state;
