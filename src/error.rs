//! Unified error handling for banip.
//!
//! Centralizes the error hierarchy: fine-grained per-module errors for
//! callers who care about the kind of failure, composed into a top-level
//! [`AppError`] for `main`'s `anyhow::Result`.

use thiserror::Error;

/// Errors from the LIST decision engine (whitelist/blacklist tables).
#[derive(Debug, Error)]
pub enum ListError {
    #[error("invalid IP or CIDR: {0}")]
    InvalidAddress(String),

    #[error("cannot blacklist a network: {0}")]
    NetworkNotBlacklistable(String),
}

/// Errors from rule-file (TOML) loading and compilation.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("not a .toml file: {0}")]
    NotTomlFile(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("rule {name} is missing the {{{{.Ipv4}}}} placeholder in pattern: {pattern}")]
    MissingIpv4Placeholder { name: String, pattern: String },

    #[error("rule {name} has an invalid pattern {pattern}: {source}")]
    InvalidPattern {
        name: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Errors from the NFQUEUE packet-inspection path.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to open nfqueue: {0}")]
    Open(#[source] std::io::Error),

    #[error("failed to set verdict: {0}")]
    Verdict(#[source] std::io::Error),

    #[error("malformed packet payload")]
    MalformedPacket,
}

/// Errors from shelling out to the `nft` binary.
#[derive(Debug, Error)]
pub enum NftError {
    #[error("nft {args:?} failed: {stderr}")]
    CommandFailed { args: Vec<String>, stderr: String },

    #[error("failed to spawn nft: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Top-level error type, used at the `main` boundary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    List(#[from] ListError),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Nft(#[from] NftError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_error_messages() {
        assert_eq!(
            ListError::InvalidAddress("nope".into()).to_string(),
            "invalid IP or CIDR: nope"
        );
    }

    #[test]
    fn app_error_wraps_list_error() {
        let e: AppError = ListError::NetworkNotBlacklistable("10.0.0.0/8".into()).into();
        assert!(e.to_string().contains("10.0.0.0/8"));
    }
}
