use std::path::PathBuf;

/// Failures callers may want to match on. Everything else travels as
/// `anyhow::Error` with context attached.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse {artifact}: {reason}")]
    Parse { artifact: String, reason: String },

    #[error("expected 1 or 4 observability hosts, found {0}")]
    ObservabilityHostCount(usize),

    #[error("missing required environment variables: {}", .0.join(", "))]
    MissingEnv(Vec<String>),

    #[error("inventory group {0} has no hosts")]
    EmptyGroup(&'static str),

    #[error("`{command}` failed with status: {status}")]
    CommandFailed { command: String, status: String },

    #[error(
        "found {} without an init transcript; a previous vault initialization was interrupted \
         and needs manual recovery",
        .0.display()
    )]
    InterruptedInit(PathBuf),

    #[error("Vault API error ({status}): {body}")]
    VaultStatus { status: u16, body: String },

    #[error("{0} is not a supported cloud provider")]
    UnsupportedProvider(String),
}

impl Error {
    pub(crate) fn parse(artifact: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            artifact: artifact.into(),
            reason: reason.into(),
        }
    }
}
