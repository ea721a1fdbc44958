use std::{path::PathBuf, time::Duration};

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error kinds surfaced by the backup/restore core.
///
/// Actions convert these into [`miette::Report`]s at the CLI boundary; the
/// process exit code is recovered from the original error via
/// [`Error::exit_code`].
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
	#[error("invalid configuration: {reason}")]
	#[diagnostic(code(dbbak::config))]
	ConfigInvalid { reason: String },

	#[error("connecting to {engine} at {target}")]
	#[diagnostic(code(dbbak::connect))]
	ConnectFailed {
		engine: String,
		target: String,
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},

	#[error("required tool not found on PATH: {0}")]
	#[diagnostic(
		code(dbbak::missing_tool),
		help("install the database client tools or add them to PATH")
	)]
	MissingTool(String),

	#[error("failed to spawn {tool}")]
	#[diagnostic(code(dbbak::spawn))]
	ToolSpawnFailed {
		tool: String,
		#[source]
		source: std::io::Error,
	},

	#[error("{tool} exited with status {status}")]
	#[diagnostic(code(dbbak::tool_exited))]
	ToolExited {
		tool: String,
		status: i32,
		stderr_tail: String,
	},

	#[error("cannot determine archive format of {}", path.display())]
	#[diagnostic(code(dbbak::format_unknown))]
	FormatUnknown { path: PathBuf },

	#[error("checksum mismatch for {}: sidecar has {expected}, file is {actual}", path.display())]
	#[diagnostic(code(dbbak::checksum_mismatch))]
	ChecksumMismatch {
		path: PathBuf,
		expected: String,
		actual: String,
	},

	#[error("size mismatch for {}: sidecar has {expected} bytes, file is {actual} bytes", path.display())]
	#[diagnostic(code(dbbak::size_mismatch))]
	SizeMismatch {
		path: PathBuf,
		expected: u64,
		actual: u64,
	},

	#[error("no metadata sidecar for {}", path.display())]
	#[diagnostic(code(dbbak::sidecar_missing))]
	SidecarMissing { path: PathBuf },

	#[error("encryption failure: {reason}")]
	#[diagnostic(code(dbbak::crypto))]
	Crypto { reason: String },

	#[error("compressor failure")]
	#[diagnostic(code(dbbak::compressor))]
	Compressor {
		#[source]
		source: std::io::Error,
	},

	#[error("sink I/O failure at {}", path.display())]
	#[diagnostic(code(dbbak::sink))]
	SinkIo {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("exactly one recovery target must be given")]
	#[diagnostic(
		code(dbbak::recovery_target),
		help("pass one of --target-time, --target-xid, --target-lsn, --target-name, --immediate")
	)]
	AmbiguousRecoveryTarget,

	#[error("WAL segment {name} is already archived with different contents")]
	#[diagnostic(code(dbbak::wal_conflict))]
	WalArchiveConflict { name: String },

	#[error("cluster backup failed for: {}", failed.join(", "))]
	#[diagnostic(code(dbbak::partial_cluster))]
	PartialClusterFailure { failed: Vec<String> },

	#[error("not enough disk space at {}: need {needed} bytes, {available} available", path.display())]
	#[diagnostic(code(dbbak::disk_space))]
	DiskSpaceInsufficient {
		path: PathBuf,
		needed: u64,
		available: u64,
	},

	#[error("pre-flight check failed")]
	#[diagnostic(code(dbbak::preflight))]
	Preflight {
		#[source]
		source: Box<Error>,
	},

	#[error("operation cancelled")]
	#[diagnostic(code(dbbak::cancelled))]
	Cancelled,

	#[error("operation timed out after {0:?}")]
	#[diagnostic(code(dbbak::timeout))]
	Timeout(Duration),

	#[error("{context}")]
	#[diagnostic(code(dbbak::io))]
	Io {
		context: String,
		#[source]
		source: std::io::Error,
	},

	#[error("{context}")]
	#[diagnostic(code(dbbak::query))]
	Query {
		context: String,
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},

	#[error("{context}")]
	#[diagnostic(code(dbbak::cloud))]
	Cloud {
		context: String,
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},
}

impl Error {
	/// Wrap an I/O error with a short human context.
	pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
		Self::Io {
			context: context.into(),
			source,
		}
	}

	/// Wrap a driver/query error with a short human context.
	pub fn query(
		context: impl Into<String>,
		source: impl std::error::Error + Send + Sync + 'static,
	) -> Self {
		Self::Query {
			context: context.into(),
			source: Box::new(source),
		}
	}

	/// Wrap a cloud SDK error with a short human context.
	pub fn cloud(
		context: impl Into<String>,
		source: impl std::error::Error + Send + Sync + 'static,
	) -> Self {
		Self::Cloud {
			context: context.into(),
			source: Box::new(source),
		}
	}

	/// Promote a hard pre-flight failure so callers exit with code 3.
	pub fn preflight(source: Error) -> Self {
		Self::Preflight {
			source: Box::new(source),
		}
	}

	pub fn config(reason: impl Into<String>) -> Self {
		Self::ConfigInvalid {
			reason: reason.into(),
		}
	}

	pub fn crypto(reason: impl Into<String>) -> Self {
		Self::Crypto {
			reason: reason.into(),
		}
	}

	/// Process exit code for this error (stable interface to callers).
	pub fn exit_code(&self) -> u8 {
		match self {
			Self::ConfigInvalid { .. } => 2,
			Self::Preflight { .. } => 3,
			Self::PartialClusterFailure { .. } => 4,
			Self::Cancelled => 5,
			_ => 1,
		}
	}

	/// Whether this error is the cancellation sentinel (or wraps one).
	pub fn is_cancelled(&self) -> bool {
		match self {
			Self::Cancelled => true,
			Self::Preflight { source } => source.is_cancelled(),
			_ => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exit_codes_match_interface() {
		assert_eq!(Error::config("nope").exit_code(), 2);
		assert_eq!(
			Error::preflight(Error::FormatUnknown {
				path: "x".into()
			})
			.exit_code(),
			3
		);
		assert_eq!(
			Error::PartialClusterFailure {
				failed: vec!["b".into()]
			}
			.exit_code(),
			4
		);
		assert_eq!(Error::Cancelled.exit_code(), 5);
		assert_eq!(Error::MissingTool("pg_dump".into()).exit_code(), 1);
	}

	#[test]
	fn preflight_wraps_cancellation() {
		assert!(Error::preflight(Error::Cancelled).is_cancelled());
		assert!(!Error::MissingTool("mysql".into()).is_cancelled());
	}
}
