//! PostgreSQL driver: pooled connections, discovery queries, dump/restore
//! argv assembly and sampled COPY dumps.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use mobc::Pool;
use mobc_postgres::PgConnectionManager;
use tokio::sync::mpsc;
use tokio_postgres::config::SslMode as PgSslMode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
	config::{Config, SampleStrategy, SslMode},
	engine::{secret_env, BaseDriver, DatabaseDriver, DumpOptions, RestoreOptions, SqlChunker},
	error::{Error, Result},
	format::Engine,
	pipeline::ToolInvocation,
};

use tokio_postgres_rustls::MakeRustlsConnect;

/// Databases that must never be dropped by cluster operations.
pub const SYSTEM_DATABASES: &[&str] = &["postgres", "template0", "template1"];

pub struct PgDriver {
	base: BaseDriver,
	pool: Pool<PgConnectionManager<MakeRustlsConnect>>,
}

impl PgDriver {
	pub fn new(config: Config) -> Result<Self> {
		let pg_config = pg_config(&config, "postgres");
		let manager = PgConnectionManager::new(pg_config, tls_connector()?);
		let pool = Pool::builder().max_open(4).build(manager);

		Ok(Self {
			base: BaseDriver::new(config),
			pool,
		})
	}

	/// One-off connection to a specific database (COPY streams, per-DB
	/// discovery); admin queries go through the pool instead.
	async fn connect_db(&self, database: &str) -> Result<tokio_postgres::Client> {
		let config = pg_config(&self.base.config, database);
		let (client, connection) = config
			.connect(tls_connector()?)
			.await
			.map_err(|e| self.base.connect_failed(e))?;
		tokio::spawn(async move {
			if let Err(e) = connection.await {
				debug!("connection task ended: {e}");
			}
		});
		Ok(client)
	}

	async fn admin(
		&self,
	) -> Result<mobc::Connection<PgConnectionManager<MakeRustlsConnect>>> {
		self.pool
			.get()
			.await
			.map_err(|e| self.base.connect_failed(e))
	}

	fn conn_args(&self) -> Vec<String> {
		let conn = &self.base.config.connection;
		vec![
			"--host".into(),
			effective_host(&self.base.config),
			"--port".into(),
			self.base.config.port().to_string(),
			"--username".into(),
			conn.user.clone(),
			"--no-password".into(),
		]
	}

	fn password_env(&self) -> Vec<(std::ffi::OsString, std::ffi::OsString)> {
		secret_env(
			"PGPASSWORD",
			self.base.config.connection.password.as_deref(),
		)
	}
}

#[async_trait]
impl DatabaseDriver for PgDriver {
	fn engine(&self) -> Engine {
		Engine::Postgres
	}

	async fn ping(&self) -> Result<()> {
		let ping = async {
			let conn = self.admin().await?;
			conn.simple_query("SELECT 1")
				.await
				.map_err(|e| self.base.connect_failed(e))?;
			Ok(())
		};
		tokio::time::timeout(crate::engine::PING_TIMEOUT, ping)
			.await
			.map_err(|_| Error::Timeout(crate::engine::PING_TIMEOUT))?
	}

	async fn close(&self) {
		// mobc drains idle connections on drop; nothing to do eagerly.
	}

	async fn server_version(&self) -> Result<String> {
		let conn = self.admin().await?;
		let row = conn
			.query_one("SHOW server_version", &[])
			.await
			.map_err(|e| Error::query("querying server version", e))?;
		Ok(row.get::<_, String>(0))
	}

	async fn list_databases(&self) -> Result<Vec<String>> {
		let conn = self.admin().await?;
		let rows = conn
			.query(
				"SELECT datname FROM pg_database WHERE NOT datistemplate ORDER BY datname",
				&[],
			)
			.await
			.map_err(|e| Error::query("listing databases", e))?;
		Ok(rows.iter().map(|r| r.get(0)).collect())
	}

	async fn list_tables(&self, database: &str) -> Result<Vec<String>> {
		let client = self.connect_db(database).await?;
		let rows = client
			.query(
				"SELECT quote_ident(schemaname) || '.' || quote_ident(tablename) \
				 FROM pg_tables \
				 WHERE schemaname NOT IN ('pg_catalog', 'information_schema') \
				 ORDER BY 1",
				&[],
			)
			.await
			.map_err(|e| Error::query(format!("listing tables of {database}"), e))?;
		Ok(rows.iter().map(|r| r.get(0)).collect())
	}

	async fn database_exists(&self, database: &str) -> Result<bool> {
		let conn = self.admin().await?;
		let row = conn
			.query_one(
				"SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)",
				&[&database],
			)
			.await
			.map_err(|e| Error::query("checking database existence", e))?;
		Ok(row.get(0))
	}

	async fn create_database(&self, database: &str) -> Result<()> {
		let conn = self.admin().await?;
		let sql = format!("CREATE DATABASE {}", quote_ident(database));
		conn.execute(sql.as_str(), &[])
			.await
			.map_err(|e| Error::query(format!("creating database {database}"), e))?;
		Ok(())
	}

	async fn drop_database(&self, database: &str, force: bool) -> Result<()> {
		if SYSTEM_DATABASES.contains(&database) {
			return Err(Error::config(format!(
				"refusing to drop system database {database}"
			)));
		}

		let conn = self.admin().await?;
		let force = force && {
			let version = self.server_version().await?;
			let supported = major_version(&version) >= 13;
			if !supported {
				warn!(%version, "server too old for DROP DATABASE WITH (FORCE)");
			}
			supported
		};

		let sql = if force {
			format!(
				"DROP DATABASE IF EXISTS {} WITH (FORCE)",
				quote_ident(database)
			)
		} else {
			format!("DROP DATABASE IF EXISTS {}", quote_ident(database))
		};
		conn.execute(sql.as_str(), &[])
			.await
			.map_err(|e| Error::query(format!("dropping database {database}"), e))?;
		Ok(())
	}

	fn build_dump_argv(&self, opts: &DumpOptions) -> ToolInvocation {
		let mut tool = ToolInvocation::new(crate::engine::tool_path("pg_dump"))
			.args(self.conn_args())
			.arg("--dbname")
			.arg(&opts.database);

		if opts.custom_format {
			tool = tool
				.arg("--format")
				.arg("custom")
				.arg("--compress")
				.arg(opts.compression_level.to_string());
			if let Some(output) = &opts.output {
				tool = tool.arg("--file").arg(output);
			}
		} else {
			// Plain format goes to stdout; the pipeline owns compression.
			tool = tool.arg("--format").arg("plain");
		}
		if opts.schema_only {
			tool = tool.arg("--schema-only");
		}

		for (k, v) in self.password_env() {
			tool = tool.env(k, v);
		}
		tool
	}

	fn build_restore_argv(&self, opts: &RestoreOptions) -> Result<ToolInvocation> {
		if opts.single_transaction && opts.jobs > 1 {
			return Err(Error::config(
				"--jobs and --single-transaction are mutually exclusive",
			));
		}

		let mut tool = ToolInvocation::new(crate::engine::tool_path("pg_restore"))
			.args(self.conn_args())
			.arg("--exit-on-error")
			.arg("--no-data-for-failed-tables");

		if opts.create {
			// With --create, pg_restore connects to the maintenance DB and
			// issues CREATE DATABASE itself.
			tool = tool.arg("--create").arg("--dbname").arg("postgres");
		} else {
			tool = tool.arg("--dbname").arg(&opts.database);
		}

		if opts.clean {
			tool = tool.arg("--clean").arg("--if-exists");
		}
		if opts.single_transaction {
			tool = tool.arg("--single-transaction");
		} else if opts.jobs > 1 {
			tool = tool.arg("--jobs").arg(opts.jobs.to_string());
		}

		tool = tool.arg(&opts.archive);
		for (k, v) in self.password_env() {
			tool = tool.env(k, v);
		}
		Ok(tool)
	}

	fn build_globals_dump_argv(&self) -> Option<ToolInvocation> {
		let mut tool = ToolInvocation::new(crate::engine::tool_path("pg_dumpall"))
			.args(self.conn_args())
			.arg("--globals-only");
		for (k, v) in self.password_env() {
			tool = tool.env(k, v);
		}
		Some(tool)
	}

	fn build_sql_shell(&self, database: &str, single_transaction: bool) -> ToolInvocation {
		let mut tool = ToolInvocation::new(crate::engine::tool_path("psql"))
			.args(self.conn_args())
			.arg("--quiet")
			.arg("--dbname")
			.arg(database)
			.arg("-v")
			.arg("ON_ERROR_STOP=1");
		if single_transaction {
			tool = tool.arg("--single-transaction");
		}
		for (k, v) in self.password_env() {
			tool = tool.env(k, v);
		}
		tool
	}

	#[instrument(level = "debug", skip(self, out, cancel))]
	async fn sample_dump(
		&self,
		database: &str,
		strategy: SampleStrategy,
		value: u64,
		out: mpsc::Sender<Bytes>,
		cancel: &CancellationToken,
	) -> Result<()> {
		let client = self.connect_db(database).await?;
		let tables = self.list_tables(database).await?;
		let mut chunker = SqlChunker::new(out);

		for table in tables {
			if cancel.is_cancelled() {
				return Err(Error::Cancelled);
			}

			chunker.push(format!("COPY {table} FROM stdin;\n")).await?;
			chunker.flush().await?;

			let sql = sample_copy_sql(&table, strategy, value);
			let stream = client
				.copy_out(sql.as_str())
				.await
				.map_err(|e| Error::query(format!("sampling {table}"), e))?;
			futures::pin_mut!(stream);

			while let Some(chunk) = stream.next().await {
				if cancel.is_cancelled() {
					return Err(Error::Cancelled);
				}
				let chunk =
					chunk.map_err(|e| Error::query(format!("sampling {table}"), e))?;
				chunker.push(chunk).await?;
			}

			chunker.push("\\.\n\n").await?;
		}

		chunker.flush().await
	}
}

/// Sampling query per strategy, over a quoted table name.
pub fn sample_copy_sql(table: &str, strategy: SampleStrategy, value: u64) -> String {
	match strategy {
		SampleStrategy::Ratio => format!(
			"COPY (SELECT (s.r).* FROM \
			 (SELECT t AS r, row_number() OVER () AS rn FROM {table} t) s \
			 WHERE s.rn % {value} = 0) TO STDOUT"
		),
		SampleStrategy::Percent => format!(
			"COPY (SELECT * FROM {table} TABLESAMPLE BERNOULLI ({value})) TO STDOUT"
		),
		SampleStrategy::Count => {
			format!("COPY (SELECT * FROM {table} LIMIT {value}) TO STDOUT")
		}
	}
}

/// Double-quote an identifier, doubling embedded quotes.
fn quote_ident(name: &str) -> String {
	format!("\"{}\"", name.replace('"', "\"\""))
}

fn major_version(version: &str) -> u32 {
	version
		.split('.')
		.next()
		.and_then(|major| major.trim().parse().ok())
		.unwrap_or(0)
}

/// Build the tokio-postgres config, preferring the Unix socket for local
/// passwordless connections (peer auth) and disabling TLS over sockets.
fn pg_config(config: &Config, database: &str) -> tokio_postgres::Config {
	let conn = &config.connection;
	let mut pg = tokio_postgres::Config::new();
	pg.user(&conn.user);
	pg.dbname(database);
	pg.port(config.port());
	pg.application_name(crate::APP_NAME);

	if let Some(password) = &conn.password {
		pg.password(password);
	}

	match local_socket_dir(config) {
		Some(dir) => {
			pg.host_path(&dir);
			pg.ssl_mode(PgSslMode::Disable);
		}
		None => {
			pg.host(&conn.host);
			pg.ssl_mode(if !config.tls_enabled() {
				PgSslMode::Disable
			} else if conn.ssl_mode == SslMode::Require {
				PgSslMode::Require
			} else {
				PgSslMode::Prefer
			});
		}
	}

	pg
}

/// Host value for tool argv; mirrors [`pg_config`]'s socket preference.
fn effective_host(config: &Config) -> String {
	local_socket_dir(config)
		.map(|dir| dir.display().to_string())
		.unwrap_or_else(|| config.connection.host.clone())
}

fn local_socket_dir(config: &Config) -> Option<PathBuf> {
	let conn = &config.connection;
	if !cfg!(unix)
		|| conn.password.is_some()
		|| !matches!(conn.host.as_str(), "localhost" | "127.0.0.1" | "::1")
	{
		return None;
	}

	["/var/run/postgresql", "/run/postgresql", "/tmp"]
		.iter()
		.map(PathBuf::from)
		.find(|dir| dir.join(format!(".s.PGSQL.{}", config.port())).exists())
}

fn tls_connector() -> Result<MakeRustlsConnect> {
	let mut roots = rustls::RootCertStore::empty();
	for cert in rustls_native_certs::load_native_certs().certs {
		let _ = roots.add(cert);
	}
	let tls_config = rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	Ok(MakeRustlsConnect::new(tls_config))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn driver() -> PgDriver {
		let mut config = Config::default();
		config.connection.host = "db.internal".into();
		config.connection.password = Some("sekrit".into());
		PgDriver::new(config).unwrap()
	}

	fn args_of(tool: &ToolInvocation) -> Vec<String> {
		tool.args
			.iter()
			.map(|a| a.to_string_lossy().into_owned())
			.collect()
	}

	#[test]
	fn custom_dump_argv_writes_its_own_file() {
		let tool = driver().build_dump_argv(&DumpOptions {
			database: "mydb".into(),
			custom_format: true,
			compression_level: 6,
			output: Some("/b/out.dump".into()),
			schema_only: false,
		});
		let args = args_of(&tool);
		assert_eq!(tool.name(), "pg_dump");
		assert!(args.windows(2).any(|w| w == ["--format", "custom"]));
		assert!(args.windows(2).any(|w| w == ["--compress", "6"]));
		assert!(args.windows(2).any(|w| w == ["--file", "/b/out.dump"]));
	}

	#[test]
	fn plain_dump_argv_streams_to_stdout() {
		let tool = driver().build_dump_argv(&DumpOptions {
			database: "mydb".into(),
			custom_format: false,
			compression_level: 0,
			output: None,
			schema_only: false,
		});
		let args = args_of(&tool);
		assert!(args.windows(2).any(|w| w == ["--format", "plain"]));
		assert!(!args.contains(&"--file".to_string()));
		// Password travels via the environment, never argv.
		assert!(args.iter().all(|a| !a.contains("sekrit")));
		assert!(tool
			.env
			.iter()
			.any(|(k, _)| k == &std::ffi::OsString::from("PGPASSWORD")));
	}

	#[test]
	fn restore_argv_invariants() {
		let tool = driver()
			.build_restore_argv(&RestoreOptions {
				database: "mydb".into(),
				archive: "/b/a.dump".into(),
				clean: true,
				create: false,
				jobs: 4,
				single_transaction: false,
			})
			.unwrap();
		let args = args_of(&tool);
		assert!(args.contains(&"--exit-on-error".to_string()));
		assert!(args.contains(&"--no-data-for-failed-tables".to_string()));
		assert!(args.contains(&"--if-exists".to_string()));
		assert!(args.windows(2).any(|w| w == ["--jobs", "4"]));
	}

	#[test]
	fn jobs_and_single_transaction_are_exclusive() {
		let err = driver()
			.build_restore_argv(&RestoreOptions {
				database: "mydb".into(),
				archive: "/b/a.dump".into(),
				clean: false,
				create: false,
				jobs: 4,
				single_transaction: true,
			})
			.unwrap_err();
		assert!(matches!(err, Error::ConfigInvalid { .. }));
	}

	#[test]
	fn create_targets_maintenance_db() {
		let tool = driver()
			.build_restore_argv(&RestoreOptions {
				database: "mydb".into(),
				archive: "/b/a.dump".into(),
				clean: false,
				create: true,
				jobs: 1,
				single_transaction: false,
			})
			.unwrap();
		let args = args_of(&tool);
		assert!(args.contains(&"--create".to_string()));
		assert!(args.windows(2).any(|w| w == ["--dbname", "postgres"]));
	}

	#[test]
	fn sampling_queries() {
		assert_eq!(
			sample_copy_sql("\"public\".\"users\"", SampleStrategy::Count, 10),
			"COPY (SELECT * FROM \"public\".\"users\" LIMIT 10) TO STDOUT"
		);
		assert!(sample_copy_sql("t", SampleStrategy::Percent, 5)
			.contains("TABLESAMPLE BERNOULLI (5)"));
		assert!(
			sample_copy_sql("t", SampleStrategy::Ratio, 7).contains("rn % 7 = 0")
		);
	}

	#[test]
	fn quoting_doubles_embedded_quotes() {
		assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
	}

	#[test]
	fn version_major_parse() {
		assert_eq!(major_version("16.2"), 16);
		assert_eq!(major_version("12.18 (Ubuntu)"), 12);
	}
}
