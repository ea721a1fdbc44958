//! The cluster coordinator: globals dump, bounded per-database fan-out,
//! tar assembly, and the clean-cluster restore path.
//!
//! Ordering inside a backup: globals complete before any per-database dump
//! starts; the tarball is fsynced and renamed before the sidecar is bound.
//! A single failing member means nothing is published.

use std::{
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use chrono::Utc;
use tokio::{fs, sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
	backup::{commit_file, Archive, BackupKind},
	config::Config,
	engine::{DatabaseDriver, DumpOptions, RestoreOptions},
	error::{Error, Result},
	format::{cluster_archive_name, ArchiveFormat, Engine},
	metadata::{hash_file, Sidecar},
	pipeline,
};

/// Name of the global-objects member inside a cluster archive.
const GLOBALS_MEMBER: &str = "globals.sql";

/// Result of a clean-cluster restore; per-database failures accumulate.
#[derive(Debug, Default)]
pub struct ClusterRestoreReport {
	pub restored: Vec<String>,
	pub errors: Vec<(String, Error)>,
}

pub struct ClusterCoordinator {
	config: Config,
	driver: Arc<dyn DatabaseDriver>,
	cancel: CancellationToken,
}

impl std::fmt::Debug for ClusterCoordinator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClusterCoordinator").finish_non_exhaustive()
	}
}

impl ClusterCoordinator {
	pub fn new(
		config: Config,
		driver: Arc<dyn DatabaseDriver>,
		cancel: CancellationToken,
	) -> Result<Self> {
		if config.engine != Engine::Postgres {
			return Err(Error::config("cluster backups are PostgreSQL-only"));
		}
		Ok(Self {
			config,
			driver,
			cancel,
		})
	}

	/// Back up the whole cluster into one tarball.
	#[instrument(skip(self))]
	pub async fn backup(&self, include_postgres: bool) -> Result<Archive> {
		let budget = Duration::from_secs(self.config.cluster_timeout_minutes * 60);
		match tokio::time::timeout(budget, self.backup_inner(include_postgres)).await {
			Ok(result) => result,
			Err(_) => Err(Error::Timeout(budget)),
		}
	}

	async fn backup_inner(&self, include_postgres: bool) -> Result<Archive> {
		self.driver.validate_tools().map_err(Error::preflight)?;
		fs::create_dir_all(&self.config.backup_dir)
			.await
			.map_err(|e| Error::io("creating backup dir", e))?;

		let stamp = Utc::now();
		let dest = self.config.backup_dir.join(cluster_archive_name(stamp));
		let prefix = format!("cluster_{}", stamp.format(crate::format::FILENAME_TS));

		// Staging lives under the target directory and dies with this guard.
		let staging = tempfile::Builder::new()
			.prefix(".cluster-staging-")
			.tempdir_in(&self.config.backup_dir)
			.map_err(|e| Error::io("creating staging dir", e))?;
		fs::create_dir_all(staging.path().join("databases"))
			.await
			.map_err(|e| Error::io("creating staging dir", e))?;

		// Globals strictly first.
		let globals = self
			.driver
			.build_globals_dump_argv()
			.ok_or_else(|| Error::config("engine cannot dump global objects"))?;
		info!("dumping global objects");
		pipeline::dump_to_file(
			&globals,
			None,
			&staging.path().join(GLOBALS_MEMBER),
			&self.cancel,
		)
		.await?;

		let databases: Vec<String> = self
			.driver
			.list_databases()
			.await?
			.into_iter()
			.filter(|db| include_postgres || db != "postgres")
			.collect();
		info!(count = databases.len(), "dumping databases");

		let outer = self.config.dump_jobs.min(databases.len().max(1));
		let gate = Arc::new(Semaphore::new(outer));
		let mut tasks = JoinSet::new();

		for database in &databases {
			let database = database.clone();
			let gate = gate.clone();
			let driver = self.driver.clone();
			let cancel = self.cancel.clone();
			let out = staging.path().join("databases").join(format!("{database}.dump"));
			let level = self.config.compression_level;

			tasks.spawn(async move {
				let _permit = gate.acquire_owned().await.expect("BUG: gate closed");
				let tool = driver.build_dump_argv(&DumpOptions {
					database: database.clone(),
					custom_format: true,
					compression_level: level,
					output: Some(out),
					schema_only: false,
				});
				let result = pipeline::run_tool(&tool, &cancel).await;
				(database, result)
			});
		}

		let mut failed = Vec::new();
		while let Some(joined) = tasks.join_next().await {
			let (database, result) = joined.expect("BUG: dump task panicked");
			match result {
				Ok(()) => debug!(%database, "member dumped"),
				Err(Error::Cancelled) => return Err(Error::Cancelled),
				Err(e) => {
					warn!(%database, "member dump failed: {e}");
					failed.push(database);
				}
			}
		}
		if !failed.is_empty() {
			failed.sort();
			// Staging is dropped; nothing was published.
			return Err(Error::PartialClusterFailure { failed });
		}

		// Assemble, commit, then bind the sidecar.
		let part = tar_staging(staging.path(), &prefix, &dest).await?;
		commit_file(&part, &dest).await?;
		let (sha256, size_bytes) = hash_file(&dest).await?;

		let sidecar = Sidecar {
			sha256,
			size_bytes,
			timestamp: stamp,
			engine: Engine::Postgres,
			database: None,
			format: ArchiveFormat::ClusterTarGz,
			compression_level: self.config.compression_level,
			encrypted: false,
		};
		sidecar.write(&dest).await?;
		info!(archive = %dest.display(), members = databases.len(), "cluster backup committed");

		Ok(Archive {
			path: dest,
			sidecar,
			kind: BackupKind::Cluster,
		})
	}

	/// Restore a cluster archive: optionally drop user databases first,
	/// then globals, then each member serially.
	#[instrument(skip(self))]
	pub async fn restore(
		&self,
		archive: &Path,
		clean_cluster: bool,
	) -> Result<ClusterRestoreReport> {
		self.driver.validate_tools().map_err(Error::preflight)?;

		let staging = tempfile::Builder::new()
			.prefix(".cluster-restore-")
			.tempdir_in(archive.parent().unwrap_or(Path::new(".")))
			.map_err(|e| Error::io("creating extraction dir", e))?;
		extract_tar(archive, staging.path()).await?;
		let root = locate_root(staging.path()).await?;

		if self.cancel.is_cancelled() {
			return Err(Error::Cancelled);
		}

		if clean_cluster {
			for database in self.driver.list_databases().await? {
				if crate::engine::postgres::SYSTEM_DATABASES.contains(&database.as_str()) {
					continue;
				}
				info!(%database, "dropping before cluster restore");
				self.driver.drop_database(&database, true).await?;
			}
		}

		// Globals before any member.
		let globals = root.join(GLOBALS_MEMBER);
		if !globals.exists() {
			return Err(Error::FormatUnknown {
				path: archive.into(),
			});
		}
		info!("restoring global objects");
		let shell = self.driver.build_sql_shell("postgres", false);
		pipeline::file_to_tool(&globals, false, &shell, &self.cancel).await?;

		let mut report = ClusterRestoreReport::default();
		let mut members = Vec::new();
		let mut entries = fs::read_dir(root.join("databases"))
			.await
			.map_err(|e| Error::io("reading extracted members", e))?;
		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| Error::io("reading extracted members", e))?
		{
			let path = entry.path();
			if path.extension().is_some_and(|e| e == "dump") {
				members.push(path);
			}
		}
		members.sort();

		for member in members {
			if self.cancel.is_cancelled() {
				return Err(Error::Cancelled);
			}
			let database = member
				.file_stem()
				.map(|s| s.to_string_lossy().into_owned())
				.unwrap_or_default();

			let tool = self.driver.build_restore_argv(&RestoreOptions {
				database: database.clone(),
				archive: member.clone(),
				clean: false,
				create: true,
				jobs: 1,
				single_transaction: false,
			})?;
			info!(%database, "restoring member");
			match pipeline::run_tool(&tool, &self.cancel).await {
				Ok(()) => report.restored.push(database),
				Err(Error::Cancelled) => return Err(Error::Cancelled),
				Err(e) => {
					warn!(%database, "member restore failed: {e}");
					report.errors.push((database, e));
				}
			}
		}

		Ok(report)
	}
}

/// Build `<dest>.part` as `prefix/…` over the staging tree.
async fn tar_staging(staging: &Path, prefix: &str, dest: &Path) -> Result<PathBuf> {
	let part = {
		let mut name = dest.as_os_str().to_owned();
		name.push(".part");
		PathBuf::from(name)
	};

	let staging = staging.to_path_buf();
	let prefix = prefix.to_string();
	let out = part.clone();
	tokio::task::spawn_blocking(move || -> Result<()> {
		let sink_err = |e| Error::SinkIo {
			path: out.clone(),
			source: e,
		};
		let file = std::fs::File::create(&out).map_err(&sink_err)?;
		let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::new(6));
		let mut builder = tar::Builder::new(encoder);
		builder.append_dir_all(&prefix, &staging).map_err(&sink_err)?;
		let encoder = builder.into_inner().map_err(&sink_err)?;
		encoder.finish().map_err(&sink_err)?;
		Ok(())
	})
	.await
	.expect("BUG: tar task panicked")
	.inspect_err(|_| {
		let _ = std::fs::remove_file(&part);
	})?;

	Ok(part)
}

async fn extract_tar(archive: &Path, dest: &Path) -> Result<()> {
	let archive = archive.to_path_buf();
	let dest = dest.to_path_buf();
	tokio::task::spawn_blocking(move || -> Result<()> {
		let file = std::fs::File::open(&archive)
			.map_err(|e| Error::io(format!("opening {}", archive.display()), e))?;
		let decoder = flate2::read::GzDecoder::new(file);
		let mut tar = tar::Archive::new(decoder);
		tar.unpack(&dest)
			.map_err(|e| Error::io(format!("extracting {}", archive.display()), e))?;
		Ok(())
	})
	.await
	.expect("BUG: untar task panicked")
}

/// Find the `cluster_*/` directory inside an extraction, tolerating flat
/// layouts from foreign producers.
async fn locate_root(staging: &Path) -> Result<PathBuf> {
	if staging.join(GLOBALS_MEMBER).exists() {
		return Ok(staging.to_path_buf());
	}

	let mut entries = fs::read_dir(staging)
		.await
		.map_err(|e| Error::io("reading extraction dir", e))?;
	while let Some(entry) = entries
		.next_entry()
		.await
		.map_err(|e| Error::io("reading extraction dir", e))?
	{
		let path = entry.path();
		if path.is_dir() && path.join(GLOBALS_MEMBER).exists() {
			return Ok(path);
		}
	}

	Err(Error::FormatUnknown {
		path: staging.into(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn tar_round_trip_preserves_layout() {
		let dir = tempfile::tempdir().unwrap();

		let staging = dir.path().join("staging");
		std::fs::create_dir_all(staging.join("databases")).unwrap();
		std::fs::write(staging.join(GLOBALS_MEMBER), b"CREATE ROLE app;\n").unwrap();
		std::fs::write(staging.join("databases/a.dump"), b"PGDMP-a").unwrap();
		std::fs::write(staging.join("databases/b.dump"), b"PGDMP-b").unwrap();

		let dest = dir.path().join("cluster_20260115_120000.tar.gz");
		let part = tar_staging(&staging, "cluster_20260115_120000", &dest)
			.await
			.unwrap();
		commit_file(&part, &dest).await.unwrap();

		let extracted = dir.path().join("out");
		extract_tar(&dest, &extracted).await.unwrap();
		let root = locate_root(&extracted).await.unwrap();

		assert!(root.ends_with("cluster_20260115_120000"));
		assert_eq!(
			std::fs::read(root.join(GLOBALS_MEMBER)).unwrap(),
			b"CREATE ROLE app;\n"
		);
		assert_eq!(
			std::fs::read(root.join("databases/a.dump")).unwrap(),
			b"PGDMP-a"
		);
		assert_eq!(
			std::fs::read(root.join("databases/b.dump")).unwrap(),
			b"PGDMP-b"
		);
	}

	#[tokio::test]
	async fn flat_archives_are_tolerated() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join(GLOBALS_MEMBER), b"--").unwrap();
		let root = locate_root(dir.path()).await.unwrap();
		assert_eq!(root, dir.path());
	}

	#[test]
	fn mysql_cannot_coordinate_clusters() {
		let mut config = Config::default();
		config.engine = Engine::Mysql;
		let driver: Arc<dyn DatabaseDriver> =
			Arc::new(crate::engine::mysql::MysqlDriver::new(config.clone()));
		let err =
			ClusterCoordinator::new(config, driver, CancellationToken::new()).unwrap_err();
		assert!(matches!(err, Error::ConfigInvalid { .. }));
	}
}
