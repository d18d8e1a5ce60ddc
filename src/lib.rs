pub mod ansible;
pub mod certs;
pub mod cloudflare;
pub mod config;
pub mod consul;
pub mod credentials;
pub mod envrc;
pub mod error;
pub mod fs_util;
pub mod htpasswd;
pub mod inventory;
pub mod layout;
pub mod nomad;
pub mod observability;
pub mod orchestrator;
pub mod render;
pub mod runtime;
pub mod status;
pub mod templates;
pub mod terraform;
pub mod vault;

pub use config::Settings;
pub use error::Error;
pub use layout::Layout;
