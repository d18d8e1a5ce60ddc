//! Vault initialization, unsealing and the scheduler's token provisioning.

pub mod client;
pub mod init;

pub use client::{SealStatus, TokenRequest, VaultApi, VaultClient};
pub use init::{InitTranscript, VaultInitResult, initialize_vault, parse_init_transcript};
