//! Database drivers: one capability set, two engines.
//!
//! Each driver owns its connection pool, knows how to discover databases and
//! tables, and builds the deterministic argv for the dump/restore tools. The
//! shared plumbing lives in [`BaseDriver`]; engine behaviour is composed on
//! top, not inherited.

use std::{
	ffi::OsString,
	path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
	config::{Config, SampleStrategy},
	error::{Error, Result},
	format::Engine,
	pipeline::ToolInvocation,
};

pub mod mysql;
pub mod postgres;

/// Budget for connectivity pings.
pub(crate) const PING_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// How a dump should be produced.
#[derive(Debug, Clone)]
pub struct DumpOptions {
	pub database: String,
	/// PostgreSQL custom format (`pg_dump -Fc`). Ignored by MySQL.
	pub custom_format: bool,
	pub compression_level: u32,
	/// When set, the tool writes this file itself (custom format); when
	/// `None` the dump goes to stdout for the pipeline to capture.
	pub output: Option<PathBuf>,
	/// Dump DDL only (the schema section of sample backups).
	pub schema_only: bool,
}

/// How a restore should be executed.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
	pub database: String,
	pub archive: PathBuf,
	/// Drop objects before recreating them (`--clean --if-exists`).
	pub clean: bool,
	/// Create the database first (`--create`).
	pub create: bool,
	pub jobs: usize,
	pub single_transaction: bool,
}

/// The per-engine capability set.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
	fn engine(&self) -> Engine;

	/// Cheap connectivity check through the pool.
	async fn ping(&self) -> Result<()>;

	/// Tear the pool down.
	async fn close(&self);

	async fn server_version(&self) -> Result<String>;

	/// User databases, excluding templates and system schemata. The
	/// maintenance database (`postgres`) is included; callers filter.
	async fn list_databases(&self) -> Result<Vec<String>>;

	/// Quoted, schema-qualified user tables of a database.
	async fn list_tables(&self, database: &str) -> Result<Vec<String>>;

	async fn database_exists(&self, database: &str) -> Result<bool>;

	async fn create_database(&self, database: &str) -> Result<()>;

	/// Drop a database; `force` terminates connected sessions where the
	/// server supports it.
	async fn drop_database(&self, database: &str, force: bool) -> Result<()>;

	/// argv for a full dump of one database.
	fn build_dump_argv(&self, opts: &DumpOptions) -> ToolInvocation;

	/// argv for restoring a custom-format archive.
	fn build_restore_argv(&self, opts: &RestoreOptions) -> Result<ToolInvocation>;

	/// argv for the SQL shell that consumes plain-text archives on stdin.
	fn build_sql_shell(&self, database: &str, single_transaction: bool) -> ToolInvocation;

	/// argv for dumping instance-global objects (roles, tablespaces).
	/// `None` where the engine has no such concept.
	fn build_globals_dump_argv(&self) -> Option<ToolInvocation> {
		None
	}

	/// Stream a sampled data section (one `COPY`/`INSERT` block per table)
	/// into `out`. The schema section is dumped separately by the caller.
	async fn sample_dump(
		&self,
		database: &str,
		strategy: SampleStrategy,
		value: u64,
		out: mpsc::Sender<Bytes>,
		cancel: &CancellationToken,
	) -> Result<()>;

	/// Fail fast if any required executable is missing or broken.
	fn validate_tools(&self) -> Result<()> {
		for tool in self.engine().required_tools() {
			let path = find_tool(tool)?;
			probe_tool(&path)?;
		}
		Ok(())
	}
}

/// Build the driver matching the configured engine.
pub fn driver_for(config: &Config) -> Result<Box<dyn DatabaseDriver>> {
	Ok(match config.engine {
		Engine::Postgres => Box::new(postgres::PgDriver::new(config.clone())?),
		Engine::Mysql | Engine::Mariadb => Box::new(mysql::MysqlDriver::new(config.clone())),
	})
}

/// Shared connection plumbing for both drivers.
#[derive(Debug, Clone)]
pub struct BaseDriver {
	pub config: Config,
}

impl BaseDriver {
	pub fn new(config: Config) -> Self {
		Self { config }
	}

	/// Connection target for error messages: never includes the password.
	pub fn target(&self) -> String {
		format!(
			"{}@{}:{}",
			self.config.connection.user,
			self.config.connection.host,
			self.config.port(),
		)
	}

	pub fn connect_failed(
		&self,
		source: impl std::error::Error + Send + Sync + 'static,
	) -> Error {
		Error::ConnectFailed {
			engine: self.config.engine.to_string(),
			target: self.target(),
			source: Box::new(source),
		}
	}
}

/// Program path for argv building: the resolved location when one is
/// found, else the bare name (spawning will surface the real error).
pub(crate) fn tool_path(name: &str) -> OsString {
	find_tool(name)
		.map(PathBuf::into_os_string)
		.unwrap_or_else(|_| name.into())
}

/// Resolve a tool on PATH, with the Debian PostgreSQL layout as a fallback
/// (Ubuntu hides the versioned binaries from PATH).
pub fn find_tool(name: &str) -> Result<PathBuf> {
	if Path::new(name).is_absolute() {
		return Ok(name.into());
	}

	if let Some(found) = search_path(name) {
		return Ok(found);
	}

	#[cfg(unix)]
	if name.starts_with("pg_") || name == "psql" {
		if let Some(found) = newest_postgres_installation("/usr/lib/postgresql", name) {
			return Ok(found);
		}
	}

	Err(Error::MissingTool(name.into()))
}

fn search_path(name: &str) -> Option<PathBuf> {
	let path = std::env::var_os("PATH")?;
	std::env::split_paths(&path)
		.map(|dir| dir.join(name))
		.find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn newest_postgres_installation(root: &str, name: &str) -> Option<PathBuf> {
	let version = std::fs::read_dir(root)
		.ok()?
		.filter_map(|entry| {
			entry
				.ok()
				.and_then(|dir| dir.file_name().into_string().ok())
				.filter(|name| name.parse::<u32>().is_ok())
		})
		.max_by_key(|name| name.parse::<u32>().unwrap_or(0))?;

	let candidate = Path::new(root).join(version).join("bin").join(name);
	is_executable(&candidate).then_some(candidate)
}

fn is_executable(path: &Path) -> bool {
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		path.metadata()
			.map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
			.unwrap_or(false)
	}
	#[cfg(not(unix))]
	{
		path.is_file()
	}
}

/// Confirm a resolved tool actually runs (`--version`), logging the version.
pub fn probe_tool(path: &Path) -> Result<String> {
	let name = path
		.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.unwrap_or_default();
	let out = duct::cmd(path, ["--version"])
		.stderr_to_stdout()
		.unchecked()
		.read()
		.map_err(|_| Error::MissingTool(name.clone()))?;
	let version = out.lines().next().unwrap_or_default().to_string();
	debug!(tool = %name, %version, "tool probe");
	Ok(version)
}

/// Chunk accumulator used by the sample dumps: flushes to the pipeline in
/// pipeline-sized pieces so one giant table cannot balloon memory.
pub(crate) struct SqlChunker {
	out: mpsc::Sender<Bytes>,
	buf: Vec<u8>,
}

impl SqlChunker {
	const FLUSH_AT: usize = 256 * 1024;

	pub fn new(out: mpsc::Sender<Bytes>) -> Self {
		Self {
			out,
			buf: Vec::with_capacity(Self::FLUSH_AT),
		}
	}

	pub async fn push(&mut self, text: impl AsRef<[u8]>) -> Result<()> {
		self.buf.extend_from_slice(text.as_ref());
		if self.buf.len() >= Self::FLUSH_AT {
			self.flush().await?;
		}
		Ok(())
	}

	pub async fn flush(&mut self) -> Result<()> {
		if self.buf.is_empty() {
			return Ok(());
		}
		let chunk = Bytes::from(std::mem::take(&mut self.buf));
		self.out
			.send(chunk)
			.await
			.map_err(|_| Error::Cancelled)?;
		Ok(())
	}
}

/// Env var name → value pairs that must never be logged.
pub(crate) fn secret_env(key: &str, value: Option<&str>) -> Vec<(OsString, OsString)> {
	value
		.map(|v| vec![(OsString::from(key), OsString::from(v))])
		.unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[cfg(unix)]
	#[test]
	fn find_tool_resolves_sh() {
		// `sh` exists on any unix PATH.
		let path = find_tool("sh").unwrap();
		assert!(path.ends_with("sh"));
	}

	#[test]
	fn missing_tool_is_structured() {
		match find_tool("definitely-not-a-real-tool-xyz") {
			Err(Error::MissingTool(name)) => {
				assert_eq!(name, "definitely-not-a-real-tool-xyz")
			}
			other => panic!("expected MissingTool, got {other:?}"),
		}
	}

	#[test]
	fn target_hides_password() {
		let mut config = Config::default();
		config.connection.password = Some("hunter2".into());
		let base = BaseDriver::new(config);
		assert!(!base.target().contains("hunter2"));
	}
}
