//! MySQL/MariaDB driver. One implementation covers both engines; only the
//! reported engine name differs.

use async_trait::async_trait;
use bytes::Bytes;
use mysql_async::{prelude::*, Opts, OptsBuilder, Pool, Row, SslOpts};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
	config::{Config, SampleStrategy, SslMode},
	engine::{secret_env, BaseDriver, DatabaseDriver, DumpOptions, RestoreOptions, SqlChunker},
	error::{Error, Result},
	format::Engine,
	pipeline::ToolInvocation,
};

/// Schemata that are never user data.
const SYSTEM_SCHEMATA: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

/// Rows per generated INSERT statement in sample dumps.
const INSERT_BATCH: usize = 500;

pub struct MysqlDriver {
	base: BaseDriver,
	pool: Pool,
}

impl MysqlDriver {
	pub fn new(config: Config) -> Self {
		let conn = &config.connection;
		let mut opts = OptsBuilder::default()
			.ip_or_hostname(conn.host.clone())
			.tcp_port(config.port())
			.user(Some(conn.user.clone()))
			.pass(conn.password.clone());

		// mysql_async has no "prefer with fallback"; TLS is on only when
		// required and not overridden by --insecure.
		if config.tls_enabled() && conn.ssl_mode == SslMode::Require {
			opts = opts.ssl_opts(Some(SslOpts::default()));
		}

		let pool = Pool::new(Opts::from(opts));
		Self {
			base: BaseDriver::new(config),
			pool,
		}
	}

	async fn conn(&self) -> Result<mysql_async::Conn> {
		self.pool
			.get_conn()
			.await
			.map_err(|e| self.base.connect_failed(e))
	}

	fn conn_args(&self) -> Vec<String> {
		let conn = &self.base.config.connection;
		vec![
			"--host".into(),
			conn.host.clone(),
			"--port".into(),
			self.base.config.port().to_string(),
			"--user".into(),
			conn.user.clone(),
		]
	}

	fn password_env(&self) -> Vec<(std::ffi::OsString, std::ffi::OsString)> {
		secret_env(
			"MYSQL_PWD",
			self.base.config.connection.password.as_deref(),
		)
	}
}

#[async_trait]
impl DatabaseDriver for MysqlDriver {
	fn engine(&self) -> Engine {
		self.base.config.engine
	}

	async fn ping(&self) -> Result<()> {
		let ping = async {
			let mut conn = self.conn().await?;
			conn.query_drop("SELECT 1")
				.await
				.map_err(|e| self.base.connect_failed(e))
		};
		tokio::time::timeout(crate::engine::PING_TIMEOUT, ping)
			.await
			.map_err(|_| Error::Timeout(crate::engine::PING_TIMEOUT))?
	}

	async fn close(&self) {
		let _ = self.pool.clone().disconnect().await;
	}

	async fn server_version(&self) -> Result<String> {
		let mut conn = self.conn().await?;
		let version: Option<String> = conn
			.query_first("SELECT VERSION()")
			.await
			.map_err(|e| Error::query("querying server version", e))?;
		version.ok_or_else(|| Error::query(
			"querying server version",
			std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "empty result"),
		))
	}

	async fn list_databases(&self) -> Result<Vec<String>> {
		let mut conn = self.conn().await?;
		let all: Vec<String> = conn
			.query("SHOW DATABASES")
			.await
			.map_err(|e| Error::query("listing databases", e))?;
		Ok(all
			.into_iter()
			.filter(|db| !SYSTEM_SCHEMATA.contains(&db.as_str()))
			.collect())
	}

	async fn list_tables(&self, database: &str) -> Result<Vec<String>> {
		let mut conn = self.conn().await?;
		let tables: Vec<String> = conn
			.exec(
				"SELECT table_name FROM information_schema.tables \
				 WHERE table_schema = ? AND table_type = 'BASE TABLE' \
				 ORDER BY table_name",
				(database,),
			)
			.await
			.map_err(|e| Error::query(format!("listing tables of {database}"), e))?;
		Ok(tables.iter().map(|t| quote_ident(t)).collect())
	}

	async fn database_exists(&self, database: &str) -> Result<bool> {
		let mut conn = self.conn().await?;
		let found: Option<String> = conn
			.exec_first(
				"SELECT schema_name FROM information_schema.schemata WHERE schema_name = ?",
				(database,),
			)
			.await
			.map_err(|e| Error::query("checking database existence", e))?;
		Ok(found.is_some())
	}

	async fn create_database(&self, database: &str) -> Result<()> {
		let mut conn = self.conn().await?;
		conn.query_drop(format!("CREATE DATABASE {}", quote_ident(database)))
			.await
			.map_err(|e| Error::query(format!("creating database {database}"), e))
	}

	async fn drop_database(&self, database: &str, _force: bool) -> Result<()> {
		let mut conn = self.conn().await?;
		conn.query_drop(format!("DROP DATABASE IF EXISTS {}", quote_ident(database)))
			.await
			.map_err(|e| Error::query(format!("dropping database {database}"), e))
	}

	fn build_dump_argv(&self, opts: &DumpOptions) -> ToolInvocation {
		// mysqldump always writes SQL text to stdout; compression and
		// file placement belong to the pipeline.
		let mut tool = ToolInvocation::new(crate::engine::tool_path("mysqldump"))
			.args(self.conn_args())
			.arg("--single-transaction")
			.arg("--routines")
			.arg("--triggers")
			.arg("--events");
		if opts.schema_only {
			tool = tool.arg("--no-data");
		}
		tool = tool.arg(&opts.database);

		for (k, v) in self.password_env() {
			tool = tool.env(k, v);
		}
		tool
	}

	fn build_restore_argv(&self, _opts: &RestoreOptions) -> Result<ToolInvocation> {
		// There is no custom-format archive on MySQL; plain SQL goes
		// through the shell instead.
		Err(Error::config(
			"mysql archives are SQL text; restore feeds the mysql client",
		))
	}

	fn build_sql_shell(&self, database: &str, _single_transaction: bool) -> ToolInvocation {
		let mut tool = ToolInvocation::new(crate::engine::tool_path("mysql"))
			.args(self.conn_args())
			.arg(database);
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
		let mut conn = self.conn().await?;
		let tables = self.list_tables(database).await?;
		let mut chunker = SqlChunker::new(out);

		for table in tables {
			if cancel.is_cancelled() {
				return Err(Error::Cancelled);
			}

			let qualified = format!("{}.{table}", quote_ident(database));
			let (sql, drop_last_column) = sample_select_sql(&qualified, strategy, value);

			let mut result = conn
				.query_iter(sql)
				.await
				.map_err(|e| Error::query(format!("sampling {qualified}"), e))?;

			let mut batch: Vec<String> = Vec::with_capacity(INSERT_BATCH);
			while let Some(row) = result
				.next()
				.await
				.map_err(|e| Error::query(format!("sampling {qualified}"), e))?
			{
				if cancel.is_cancelled() {
					return Err(Error::Cancelled);
				}
				batch.push(render_row(row, drop_last_column));
				if batch.len() == INSERT_BATCH {
					chunker
						.push(render_insert(&table, &batch))
						.await?;
					batch.clear();
				}
			}
			if !batch.is_empty() {
				chunker.push(render_insert(&table, &batch)).await?;
			}
			chunker.push("\n").await?;
		}

		chunker.flush().await
	}
}

/// Sampling query per strategy. The boolean says whether a synthetic
/// trailing column (`__rn`) must be dropped when rendering rows.
pub fn sample_select_sql(table: &str, strategy: SampleStrategy, value: u64) -> (String, bool) {
	match strategy {
		SampleStrategy::Ratio => (
			format!(
				"SELECT * FROM \
				 (SELECT t0.*, ROW_NUMBER() OVER () AS __rn FROM {table} t0) s \
				 WHERE s.__rn % {value} = 0"
			),
			true,
		),
		// Statistically, not deterministically, reproducible.
		SampleStrategy::Percent => (
			format!(
				"SELECT * FROM {table} WHERE RAND() <= {}",
				value as f64 / 100.0
			),
			false,
		),
		SampleStrategy::Count => (format!("SELECT * FROM {table} LIMIT {value}"), false),
	}
}

fn render_row(row: Row, drop_last_column: bool) -> String {
	let mut values = row.unwrap();
	if drop_last_column {
		values.pop();
	}
	let literals: Vec<String> = values.iter().map(|v| v.as_sql(false)).collect();
	format!("({})", literals.join(","))
}

fn render_insert(table: &str, rows: &[String]) -> String {
	format!("INSERT INTO {table} VALUES\n{};\n", rows.join(",\n"))
}

fn quote_ident(name: &str) -> String {
	format!("`{}`", name.replace('`', "``"))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn driver() -> MysqlDriver {
		let mut config = Config::default();
		config.engine = Engine::Mysql;
		config.connection.password = Some("sekrit".into());
		MysqlDriver::new(config)
	}

	#[test]
	fn dump_argv_streams_sql_text() {
		let tool = driver().build_dump_argv(&DumpOptions {
			database: "shop".into(),
			custom_format: false,
			compression_level: 6,
			output: None,
			schema_only: false,
		});
		let args: Vec<String> = tool
			.args
			.iter()
			.map(|a| a.to_string_lossy().into_owned())
			.collect();
		assert_eq!(tool.name(), "mysqldump");
		assert!(args.contains(&"--single-transaction".to_string()));
		assert_eq!(args.last().unwrap(), "shop");
		assert!(args.iter().all(|a| !a.contains("sekrit")));
		assert!(tool
			.env
			.iter()
			.any(|(k, _)| k == &std::ffi::OsString::from("MYSQL_PWD")));
	}

	#[test]
	fn schema_only_dump() {
		let tool = driver().build_dump_argv(&DumpOptions {
			database: "shop".into(),
			custom_format: false,
			compression_level: 0,
			output: None,
			schema_only: true,
		});
		let args: Vec<String> = tool
			.args
			.iter()
			.map(|a| a.to_string_lossy().into_owned())
			.collect();
		assert!(args.contains(&"--no-data".to_string()));
	}

	#[test]
	fn sampling_queries() {
		let (sql, drop) = sample_select_sql("`shop`.`users`", SampleStrategy::Count, 5);
		assert_eq!(sql, "SELECT * FROM `shop`.`users` LIMIT 5");
		assert!(!drop);

		let (sql, drop) = sample_select_sql("`t`", SampleStrategy::Ratio, 4);
		assert!(sql.contains("ROW_NUMBER() OVER ()"));
		assert!(sql.contains("% 4 = 0"));
		assert!(drop);

		let (sql, _) = sample_select_sql("`t`", SampleStrategy::Percent, 25);
		assert!(sql.contains("RAND() <= 0.25"));
	}

	#[test]
	fn insert_rendering() {
		let rows = vec!["(1,'a')".to_string(), "(2,'b')".to_string()];
		assert_eq!(
			render_insert("`users`", &rows),
			"INSERT INTO `users` VALUES\n(1,'a'),\n(2,'b');\n"
		);
	}

	#[test]
	fn backtick_quoting() {
		assert_eq!(quote_ident("we`ird"), "`we``ird`");
	}
}
