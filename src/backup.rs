//! The backup engine: single and sampled backups, and the post-success
//! steps (encrypt-in-place, retention) whose failures never destroy the
//! archive they follow.

use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
	config::Config,
	crypto,
	engine::{DatabaseDriver, DumpOptions},
	error::{Error, Result},
	format::{single_archive_name, ArchiveFormat},
	metadata::{hash_file, Sidecar},
	pipeline::{self, StreamSink},
	retention,
};

/// What kind of backup produced an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
	Cluster,
	Single,
	Sample,
}

/// A committed archive: the file plus its bound sidecar.
#[derive(Debug, Clone)]
pub struct Archive {
	pub path: PathBuf,
	pub sidecar: Sidecar,
	pub kind: BackupKind,
}

pub struct BackupEngine {
	config: Config,
	driver: Arc<dyn DatabaseDriver>,
	cancel: CancellationToken,
}

impl BackupEngine {
	pub fn new(
		config: Config,
		driver: Arc<dyn DatabaseDriver>,
		cancel: CancellationToken,
	) -> Self {
		Self {
			config,
			driver,
			cancel,
		}
	}

	/// Back up one database into `backup_dir`.
	///
	/// PostgreSQL defaults to the custom format (`.dump`, internally
	/// compressed); `plain_sql` forces SQL text through the pipeline
	/// instead. MySQL always produces SQL text.
	#[instrument(skip(self))]
	pub async fn backup_single(&self, database: &str, plain_sql: bool) -> Result<Archive> {
		self.driver.validate_tools().map_err(Error::preflight)?;
		if !self.driver.database_exists(database).await? {
			return Err(Error::config(format!("database {database} does not exist")));
		}

		fs::create_dir_all(&self.config.backup_dir)
			.await
			.map_err(|e| Error::io("creating backup dir", e))?;

		let custom = !self.driver.engine().is_mysql_family() && !plain_sql;
		let level = self.config.compression_level;
		let format = if custom {
			ArchiveFormat::PgDumpCustom
		} else if level > 0 {
			if self.driver.engine().is_mysql_family() {
				ArchiveFormat::MysqlSqlGz
			} else {
				ArchiveFormat::PgSqlGz
			}
		} else if self.driver.engine().is_mysql_family() {
			ArchiveFormat::MysqlSql
		} else {
			ArchiveFormat::PgSql
		};

		let (dest, stamp) = self.fresh_archive_path(|at| {
			single_archive_name(database, at, format)
		})?;
		info!(archive = %dest.display(), %format, "starting backup");

		let report = if custom {
			// The tool writes (a temp sibling of) the file itself; the
			// pipeline supervises and hashes afterwards.
			let part = dest.with_extension("dump.part");
			let tool = self.driver.build_dump_argv(&DumpOptions {
				database: database.into(),
				custom_format: true,
				compression_level: level,
				output: Some(part.clone()),
				schema_only: false,
			});
			if let Err(e) = pipeline::run_tool(&tool, &self.cancel).await {
				let _ = fs::remove_file(&part).await;
				return Err(e);
			}
			commit_file(&part, &dest).await?;
			let (sha256, size_bytes) = hash_file(&dest).await?;
			pipeline::PipelineReport {
				sha256,
				size_bytes,
				bytes_read: size_bytes,
			}
		} else {
			let tool = self.driver.build_dump_argv(&DumpOptions {
				database: database.into(),
				custom_format: false,
				compression_level: level,
				output: None,
				schema_only: false,
			});
			let gzip = (level > 0).then_some(level);
			pipeline::dump_to_file(&tool, gzip, &dest, &self.cancel).await?
		};

		let sidecar = self.bind_sidecar(&dest, stamp, database, format, report).await?;
		Ok(Archive {
			path: dest,
			sidecar,
			kind: BackupKind::Single,
		})
	}

	/// Produce a reduced, SQL-text backup: schema first, then a sampled
	/// data section per user table.
	///
	/// Sampling may break referential integrity; the archive says so in
	/// its header comment.
	#[instrument(skip(self))]
	pub async fn backup_sample(&self, database: &str) -> Result<Archive> {
		let (strategy, value) = match (self.config.sample_strategy, self.config.sample_value)
		{
			(Some(s), Some(v)) => (s, v),
			_ => {
				return Err(Error::config(
					"sample backups need sample_strategy and sample_value",
				))
			}
		};

		self.driver.validate_tools().map_err(Error::preflight)?;
		if !self.driver.database_exists(database).await? {
			return Err(Error::config(format!("database {database} does not exist")));
		}

		fs::create_dir_all(&self.config.backup_dir)
			.await
			.map_err(|e| Error::io("creating backup dir", e))?;

		let level = self.config.compression_level;
		let format = if self.driver.engine().is_mysql_family() {
			if level > 0 {
				ArchiveFormat::MysqlSqlGz
			} else {
				ArchiveFormat::MysqlSql
			}
		} else if level > 0 {
			ArchiveFormat::PgSqlGz
		} else {
			ArchiveFormat::PgSql
		};

		let (dest, stamp) = self.fresh_archive_path(|at| {
			single_archive_name(database, at, format)
		})?;
		info!(archive = %dest.display(), ?strategy, value, "starting sample backup");

		let sink = StreamSink::new((level > 0).then_some(level), &dest, &self.cancel);
		let tx = sink.tx.clone();

		let feed = async {
			let header = format!(
				"--\n-- {database} sampled with {strategy:?} {value}\n\
				 -- row subsets may violate referential integrity\n--\n\n",
			);
			tx.send(Bytes::from(header))
				.await
				.map_err(|_| Error::Cancelled)?;

			let schema = self.driver.build_dump_argv(&DumpOptions {
				database: database.into(),
				custom_format: false,
				compression_level: 0,
				output: None,
				schema_only: true,
			});
			pipeline::tool_into_stream(&schema, tx.clone(), &self.cancel).await?;

			self.driver
				.sample_dump(database, strategy, value, tx.clone(), &self.cancel)
				.await
		};
		let upstream = feed.await;
		drop(tx);
		let report = sink.finish(upstream).await?;

		let sidecar = self.bind_sidecar(&dest, stamp, database, format, report).await?;
		Ok(Archive {
			path: dest,
			sidecar,
			kind: BackupKind::Sample,
		})
	}

	/// Post-success steps. Failures here are warnings: the archive is
	/// committed and stays committed.
	pub async fn finalize(&self, archive: &mut Archive) -> Vec<Error> {
		let mut warnings = Vec::new();

		match self.config.key_material() {
			Ok(Some(key)) => match crypto::encrypt_in_place(&archive.path, &key).await {
				Ok(new_size) => {
					// The sidecar keeps the plaintext digest and gains the
					// encrypted size.
					archive.sidecar.encrypted = true;
					archive.sidecar.size_bytes = new_size;
					if let Err(e) = archive.sidecar.write(&archive.path).await {
						warnings.push(e);
					}
				}
				Err(e) => warnings.push(e),
			},
			Ok(None) => {}
			Err(e) => warnings.push(e),
		}

		if let Some(days) = self.config.retention_days {
			let params = retention::RetentionParams {
				retention_days: days,
				min_backups: self.config.min_backups,
				pattern: None,
			};
			match retention::sweep_dir(
				&self.config.backup_dir,
				&params,
				Utc::now(),
				Some(&archive.path),
			)
			.await
			{
				Ok(report) => {
					debug!(deleted = report.deleted, freed = report.space_freed, "retention swept");
					warnings.extend(report.errors);
				}
				Err(e) => warnings.push(e),
			}
		}

		for w in &warnings {
			warn!(archive = %archive.path.display(), "post-backup step failed: {w}");
		}
		warnings
	}

	/// Pick a timestamped path that does not exist yet; collisions within
	/// one second advance the stamp instead of mangling the grammar.
	fn fresh_archive_path(
		&self,
		name_for: impl Fn(DateTime<Utc>) -> String,
	) -> Result<(PathBuf, DateTime<Utc>)> {
		let mut stamp = Utc::now();
		for _ in 0..10 {
			let path = self.config.backup_dir.join(name_for(stamp));
			if !path.exists() {
				return Ok((path, stamp));
			}
			stamp += Duration::seconds(1);
		}
		Err(Error::config(
			"could not find a free archive name; backup_dir churns too fast",
		))
	}

	async fn bind_sidecar(
		&self,
		dest: &Path,
		stamp: DateTime<Utc>,
		database: &str,
		format: ArchiveFormat,
		report: pipeline::PipelineReport,
	) -> Result<Sidecar> {
		let sidecar = Sidecar {
			sha256: report.sha256,
			size_bytes: report.size_bytes,
			timestamp: stamp,
			engine: self.config.engine,
			database: Some(database.to_string()),
			format,
			compression_level: self.config.compression_level,
			encrypted: false,
		};
		sidecar.write(dest).await?;
		info!(archive = %dest.display(), size = sidecar.size_bytes, "backup committed");
		Ok(sidecar)
	}
}

/// fsync then rename a finished `.part` file into place.
pub(crate) async fn commit_file(part: &Path, dest: &Path) -> Result<()> {
	let file = fs::File::open(part).await.map_err(|e| Error::SinkIo {
		path: part.into(),
		source: e,
	})?;
	file.sync_all().await.map_err(|e| Error::SinkIo {
		path: part.into(),
		source: e,
	})?;
	drop(file);
	fs::rename(part, dest).await.map_err(|e| Error::SinkIo {
		path: dest.into(),
		source: e,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn commit_renames_into_place() {
		let dir = tempfile::tempdir().unwrap();
		let part = dir.path().join("a.dump.part");
		let dest = dir.path().join("a.dump");
		fs::write(&part, b"PGDMP").await.unwrap();

		commit_file(&part, &dest).await.unwrap();
		assert!(!part.exists());
		assert_eq!(fs::read(&dest).await.unwrap(), b"PGDMP");
	}
}
