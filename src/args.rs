use std::path::PathBuf;

use chrono::Utc;
use clap::{ArgAction, Parser, ValueEnum, ValueHint};
use miette::{IntoDiagnostic, Result};
use tracing::{debug, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::{
	config::{Config, SampleStrategy, SslMode},
	format::Engine,
};

/// Database backup and recovery orchestrator
#[derive(Debug, Clone, Parser)]
#[command(
	author,
	version,
	after_help = "Want more detail? Try the long '--help' flag!",
	after_long_help = "Didn't expect this much output? Use the short '-h' flag to get short help.",
)]
#[cfg_attr(debug_assertions, command(before_help = "⚠ DEBUG BUILD ⚠"))]
pub struct Args {
	/// When to use terminal colours
	#[arg(long, default_value = "auto", value_name = "MODE", alias = "colour")]
	pub color: ColourMode,

	/// Set diagnostic log level
	///
	/// This enables diagnostic logging, which is useful for investigating bugs. Use multiple
	/// times to increase verbosity. Goes up to '-vvvv'.
	///
	/// Setting $RUST_LOG also works, and takes precedence, but is not recommended unless you
	/// know what you're doing.
	#[arg(
		long,
		short,
		action = ArgAction::Count,
		num_args = 0,
	)]
	pub verbose: Option<u8>,

	/// Write diagnostic logs to a file
	///
	/// This writes diagnostic logs to a file, instead of the terminal, in JSON format. If a log
	/// level was not already specified, this will set it to '-vvv'.
	///
	/// If the path provided is a directory, a file will be created in that directory. The file
	/// name will be the current date and time, in the format 'dbbak.YYYY-MM-DDTHH-MM-SSZ.log'.
	#[arg(
		long,
		num_args = 0..=1,
		default_missing_value = ".",
		value_hint = ValueHint::AnyPath,
		value_name = "PATH",
	)]
	pub log_file: Option<PathBuf>,

	#[command(flatten)]
	pub globals: GlobalArgs,

	/// What to do
	#[command(subcommand)]
	pub action: crate::actions::Action,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ColourMode {
	Auto,
	Always,
	Never,
}

/// The configuration surface of the core, exposed as global options so
/// every subcommand takes the same set. Anything not given falls back to
/// the `--config` file, then to defaults.
#[derive(Debug, Clone, Parser)]
pub struct GlobalArgs {
	/// Path to a JSON5 configuration file
	#[arg(long, global = true, value_hint = ValueHint::FilePath)]
	pub config: Option<PathBuf>,

	/// Database engine
	#[arg(long, global = true, value_enum)]
	pub engine: Option<Engine>,

	/// Database server host (or socket directory)
	#[arg(long, global = true)]
	pub host: Option<String>,

	/// Database server port (defaults per engine)
	#[arg(long, global = true)]
	pub port: Option<u16>,

	/// Database user
	#[arg(long, short = 'U', global = true)]
	pub user: Option<String>,

	/// Database password
	///
	/// Prefer $DBBAK_PASSWORD over the flag so the password stays out of
	/// shell history and process listings.
	#[arg(long, global = true, env = "DBBAK_PASSWORD", hide_env_values = true)]
	pub password: Option<String>,

	/// Default database for connections
	#[arg(long, short = 'd', global = true)]
	pub database: Option<String>,

	/// TLS mode for server connections
	#[arg(long, global = true, value_enum)]
	pub ssl_mode: Option<SslMode>,

	/// Disable TLS entirely
	#[arg(long, global = true)]
	pub insecure: bool,

	/// Where archives land
	#[arg(long, global = true, value_hint = ValueHint::DirPath)]
	pub backup_dir: Option<PathBuf>,

	/// gzip level 0-9; 0 stores uncompressed
	#[arg(long, global = true)]
	pub compression: Option<u32>,

	/// Tool-internal parallelism (pg_restore --jobs)
	#[arg(long, global = true)]
	pub jobs: Option<usize>,

	/// Databases dumped in parallel during cluster backups
	#[arg(long, global = true)]
	pub dump_jobs: Option<usize>,

	/// Cap on total parallelism
	#[arg(long, global = true)]
	pub max_cores: Option<usize>,

	/// Sample reduction strategy
	#[arg(long, global = true, value_enum)]
	pub sample_strategy: Option<SampleStrategy>,

	/// Sample reduction value (ratio N, percent P, or count K)
	#[arg(long, global = true)]
	pub sample_value: Option<u64>,

	/// Wall-clock budget for cluster backups, in minutes
	#[arg(long, global = true)]
	pub cluster_timeout_minutes: Option<u64>,

	/// File holding the encryption key (32 raw bytes, 64 hex chars, or a
	/// passphrase)
	#[arg(long, global = true, value_hint = ValueHint::FilePath)]
	pub key_file: Option<PathBuf>,

	/// Environment variable holding the encryption key
	#[arg(long, global = true, value_name = "VAR")]
	pub key_env: Option<String>,

	/// Delete archives older than this many days (after each backup)
	#[arg(long, global = true)]
	pub retention_days: Option<u32>,

	/// Never retain fewer than this many archives
	#[arg(long, global = true)]
	pub min_backups: Option<u32>,

	/// Cloud region
	#[arg(long, global = true)]
	pub cloud_region: Option<String>,

	/// Cloud endpoint URL (required for minio and b2)
	#[arg(long, global = true)]
	pub cloud_endpoint: Option<String>,

	/// Cloud access key (account name on Azure)
	#[arg(long, global = true, env = "DBBAK_CLOUD_ACCESS_KEY", hide_env_values = true)]
	pub cloud_access_key: Option<String>,

	/// Cloud secret key (account key on Azure)
	#[arg(long, global = true, env = "DBBAK_CLOUD_SECRET_KEY", hide_env_values = true)]
	pub cloud_secret_key: Option<String>,
}

impl GlobalArgs {
	/// Layer: defaults ← config file ← command line.
	pub fn into_config(self) -> Result<Config, crate::error::Error> {
		let mut config = Config::load(self.config.as_deref())?;

		if let Some(engine) = self.engine {
			config.engine = engine;
		}
		if let Some(host) = self.host {
			config.connection.host = host;
		}
		if let Some(port) = self.port {
			config.connection.port = Some(port);
		}
		if let Some(user) = self.user {
			config.connection.user = user;
		}
		if let Some(password) = self.password {
			config.connection.password = Some(password);
		}
		if let Some(database) = self.database {
			config.connection.database = Some(database);
		}
		if let Some(ssl_mode) = self.ssl_mode {
			config.connection.ssl_mode = ssl_mode;
		}
		if self.insecure {
			config.connection.insecure = true;
		}
		if let Some(dir) = self.backup_dir {
			config.backup_dir = dir;
		}
		if let Some(level) = self.compression {
			config.compression_level = level;
		}
		if let Some(jobs) = self.jobs {
			config.jobs = jobs;
		}
		if let Some(dump_jobs) = self.dump_jobs {
			config.dump_jobs = dump_jobs;
		}
		if let Some(max_cores) = self.max_cores {
			config.max_cores = max_cores;
		}
		if let Some(strategy) = self.sample_strategy {
			config.sample_strategy = Some(strategy);
		}
		if let Some(value) = self.sample_value {
			config.sample_value = Some(value);
		}
		if let Some(minutes) = self.cluster_timeout_minutes {
			config.cluster_timeout_minutes = minutes;
		}
		if let Some(path) = self.key_file {
			config.encryption_key_file = Some(path);
		}
		if let Some(var) = self.key_env {
			config.encryption_key_env = Some(var);
		}
		if let Some(days) = self.retention_days {
			config.retention_days = Some(days);
		}
		if let Some(min) = self.min_backups {
			config.min_backups = min;
		}
		if let Some(region) = self.cloud_region {
			config.cloud.cloud_region = Some(region);
		}
		if let Some(endpoint) = self.cloud_endpoint {
			config.cloud.cloud_endpoint = Some(endpoint);
		}
		if let Some(access) = self.cloud_access_key {
			config.cloud.cloud_access_key = Some(access);
		}
		if let Some(secret) = self.cloud_secret_key {
			config.cloud.cloud_secret_key = Some(secret);
		}

		config.validate()?;
		Ok(config)
	}
}

/// Parse arguments and initialise logging; the guard must be held for the
/// process lifetime so file logs flush.
pub fn get_args() -> Result<(Args, Option<WorkerGuard>)> {
	if std::env::var("RUST_LOG").is_ok() {
		warn!("⚠ RUST_LOG environment variable set, logging options have no effect");
	}

	let args = Args::parse();

	let verbosity = args
		.verbose
		.unwrap_or(if args.log_file.is_some() { 3 } else { 0 });
	let filter = if std::env::var("RUST_LOG").is_ok() {
		EnvFilter::try_from_default_env().into_diagnostic()?
	} else {
		EnvFilter::new(match verbosity {
			0 => "warn",
			1 => "info",
			2 => "debug",
			_ => "trace",
		})
	};

	let guard = match &args.log_file {
		Some(path) => {
			let path = if path.is_dir() {
				path.join(format!(
					"dbbak.{}.log",
					Utc::now().format("%Y-%m-%dT%H-%M-%SZ")
				))
			} else {
				path.clone()
			};
			let file = std::fs::File::create(&path).into_diagnostic()?;
			let (writer, guard) = tracing_appender::non_blocking(file);
			tracing_subscriber::fmt()
				.json()
				.with_env_filter(filter)
				.with_writer(writer)
				.init();
			Some(guard)
		}
		None => {
			let ansi = match args.color {
				ColourMode::Auto => {
					use std::io::IsTerminal;
					std::io::stderr().is_terminal()
				}
				ColourMode::Always => true,
				ColourMode::Never => false,
			};
			tracing_subscriber::fmt()
				.with_env_filter(filter)
				.with_ansi(ansi)
				.with_writer(std::io::stderr)
				.init();
			None
		}
	};

	debug!(?args, "got arguments");
	Ok((args, guard))
}

#[test]
fn verify_cli() {
	use clap::CommandFactory;
	Args::command().debug_assert()
}
