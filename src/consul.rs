//! Consul ACL bootstrap and catalog registration.

pub mod acl;
pub mod client;

pub use acl::{AclBootstrapResult, AclState, RoleToken, bootstrap_acl, write_policy_files};
pub use client::{ConsulApi, ConsulCli, parse_secret_id};
