//! The restore engine: ordered pre-flight gate, then format-dispatched
//! execution.

use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
	config::Config,
	crypto::{self, KeyMaterial},
	engine::{DatabaseDriver, RestoreOptions},
	error::{Error, Result},
	format::{detect_from_file, ArchiveFormat},
	metadata::Sidecar,
	pipeline,
};

/// Smallest plausible archive; anything below this is a hard failure.
const MIN_ARCHIVE_SIZE: u64 = 100;

/// Required free space, as a multiple of the archive size.
const DISK_MULTIPLIER_SINGLE: f64 = 3.0;
const DISK_MULTIPLIER_CLUSTER: f64 = 4.0;

/// What the restore should do, beyond what the archive dictates.
#[derive(Debug, Clone)]
pub struct RestorePlan {
	pub database: String,
	/// Drop existing objects (or, for SQL text, the database) first.
	pub clean: bool,
	/// Create the database before restoring.
	pub create: bool,
	pub jobs: usize,
	pub single_transaction: bool,
}

/// Outcome of the pre-flight gate.
#[derive(Debug)]
pub struct Preflight {
	pub format: ArchiveFormat,
	pub archive_size: u64,
	pub encrypted: bool,
	/// `None` when the filesystem could not be measured (soft check).
	pub disk_checked: Option<u64>,
	/// Informational; `None` when the lookup failed.
	pub target_exists: Option<bool>,
}

pub struct RestoreEngine {
	config: Config,
	driver: Arc<dyn DatabaseDriver>,
	cancel: CancellationToken,
}

impl RestoreEngine {
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

	/// Run every gate check in order; the first hard failure aborts.
	#[instrument(skip(self, target))]
	pub async fn preflight(
		&self,
		archive: &Path,
		target: Option<&str>,
		cluster: bool,
	) -> Result<Preflight> {
		// 1. Archive exists and is at least plausible.
		let meta = fs::metadata(archive).await.map_err(|e| {
			Error::preflight(Error::io(
				format!("archive {} not readable", archive.display()),
				e,
			))
		})?;
		if meta.len() < MIN_ARCHIVE_SIZE {
			return Err(Error::preflight(Error::io(
				format!(
					"archive {} is {} bytes; not a plausible backup",
					archive.display(),
					meta.len()
				),
				std::io::Error::from(std::io::ErrorKind::InvalidData),
			)));
		}

		// 2. Format. Encrypted archives hide their content; trust the
		// sidecar first, the name second.
		let encrypted = crypto::is_encrypted_file(archive)?;
		let format = if encrypted {
			match Sidecar::load(archive).await {
				Ok(sidecar) => sidecar.format,
				Err(_) => crate::format::detect_from_name(
					&archive.file_name().unwrap_or_default().to_string_lossy(),
				)
				.map_err(Error::preflight)?,
			}
		} else {
			detect_from_file(archive).map_err(Error::preflight)?
		};

		// 3. Disk space at the target directory (soft when unmeasurable).
		let multiplier = if cluster || format.is_cluster() {
			DISK_MULTIPLIER_CLUSTER
		} else {
			DISK_MULTIPLIER_SINGLE
		};
		let needed = (meta.len() as f64 * multiplier) as u64;
		let disk_checked = match fs4::available_space(&self.config.backup_dir) {
			Ok(available) => {
				if available < needed {
					return Err(Error::preflight(Error::DiskSpaceInsufficient {
						path: self.config.backup_dir.clone(),
						needed,
						available,
					}));
				}
				Some(available)
			}
			Err(e) => {
				warn!("cannot measure free space, continuing: {e}");
				None
			}
		};

		// 4. Tools.
		self.driver.validate_tools().map_err(Error::preflight)?;

		// 5. Target existence, informational only.
		let target_exists = match target {
			Some(db) => match self.driver.database_exists(db).await {
				Ok(exists) => Some(exists),
				Err(e) => {
					warn!("cannot check target database: {e}");
					None
				}
			},
			None => None,
		};

		debug!(?format, encrypted, ?disk_checked, ?target_exists, "pre-flight passed");
		Ok(Preflight {
			format,
			archive_size: meta.len(),
			encrypted,
			disk_checked,
			target_exists,
		})
	}

	/// Restore a single-database archive according to `plan`.
	#[instrument(skip(self, plan), fields(database = %plan.database))]
	pub async fn restore_single(&self, archive: &Path, plan: &RestorePlan) -> Result<()> {
		let gate = self
			.preflight(archive, Some(&plan.database), false)
			.await?;
		if gate.format.is_cluster() {
			return Err(Error::config(
				"this is a cluster archive; use the cluster restore",
			));
		}

		// Decrypt next to the archive, never over it.
		let (source, _plain_guard) = if gate.encrypted {
			let key = self.require_key()?;
			let plain = scratch_path(archive);
			crypto::decrypt_to(archive, &plain, &key).await?;
			let guard = RemoveOnDrop(plain.clone());
			(plain, Some(guard))
		} else {
			(archive.to_path_buf(), None)
		};

		let result = self.execute_single(&source, gate.format, plan, gate.target_exists).await;
		if result.is_ok() {
			info!(archive = %archive.display(), database = %plan.database, "restore complete");
		}
		result
	}

	async fn execute_single(
		&self,
		source: &Path,
		format: ArchiveFormat,
		plan: &RestorePlan,
		target_exists: Option<bool>,
	) -> Result<()> {
		match format {
			ArchiveFormat::PgDumpCustom | ArchiveFormat::PgDumpCustomGz => {
				// pg_restore reads the file itself; an outer gzip layer has
				// to come off first.
				let (file, _gz_guard) = if format.is_compressed() {
					let gunzipped = gunzip_to_scratch(source).await?;
					let guard = RemoveOnDrop(gunzipped.clone());
					(gunzipped, Some(guard))
				} else {
					(source.to_path_buf(), None)
				};

				let tool = self.driver.build_restore_argv(&RestoreOptions {
					database: plan.database.clone(),
					archive: file.clone(),
					clean: plan.clean,
					create: plan.create,
					jobs: plan.jobs,
					single_transaction: plan.single_transaction,
				})?;
				pipeline::run_tool(&tool, &self.cancel).await
			}

			ArchiveFormat::PgSql
			| ArchiveFormat::PgSqlGz
			| ArchiveFormat::MysqlSql
			| ArchiveFormat::MysqlSqlGz => {
				// SQL text cannot drop/create itself; compose the plan here.
				if plan.clean && target_exists == Some(true) {
					info!(database = %plan.database, "dropping before restore");
					self.driver.drop_database(&plan.database, true).await?;
				}
				if plan.create || plan.clean {
					let exists = if plan.clean {
						false
					} else {
						target_exists.unwrap_or(false)
					};
					if !exists {
						info!(database = %plan.database, "creating before restore");
						self.driver.create_database(&plan.database).await?;
					}
				}

				let shell = self
					.driver
					.build_sql_shell(&plan.database, plan.single_transaction);
				pipeline::file_to_tool(source, format.is_compressed(), &shell, &self.cancel)
					.await
			}

			ArchiveFormat::ClusterTarGz => unreachable!("gated above"),
		}
	}

	fn require_key(&self) -> Result<KeyMaterial> {
		self.config.key_material()?.ok_or_else(|| {
			Error::crypto("archive is encrypted but no key is configured")
		})
	}
}

/// Temp sibling for decrypted/gunzipped scratch copies.
fn scratch_path(archive: &Path) -> PathBuf {
	let mut name = archive.as_os_str().to_owned();
	name.push(".plain");
	name.into()
}

async fn gunzip_to_scratch(source: &Path) -> Result<PathBuf> {
	let dest = scratch_path(source);
	let source = source.to_path_buf();
	let out = dest.clone();
	tokio::task::spawn_blocking(move || -> Result<()> {
		let input = std::fs::File::open(&source)
			.map_err(|e| Error::io(format!("opening {}", source.display()), e))?;
		let mut decoder = flate2::read::GzDecoder::new(input);
		let mut output = std::fs::File::create(&out).map_err(|e| Error::SinkIo {
			path: out.clone(),
			source: e,
		})?;
		std::io::copy(&mut decoder, &mut output)
			.map_err(|e| Error::Compressor { source: e })?;
		Ok(())
	})
	.await
	.expect("BUG: gunzip task panicked")?;
	Ok(dest)
}

/// Removes the scratch file when the restore is done with it.
struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
	fn drop(&mut self) {
		let _ = std::fs::remove_file(&self.0);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::{config::Config, engine::mysql::MysqlDriver};

	fn engine_with_dir(dir: &Path) -> RestoreEngine {
		let mut config = Config::default();
		config.engine = crate::format::Engine::Mysql;
		config.backup_dir = dir.to_path_buf();
		let driver = Arc::new(MysqlDriver::new(config.clone()));
		RestoreEngine::new(config, driver, CancellationToken::new())
	}

	#[tokio::test]
	async fn gate_rejects_missing_archive() {
		let dir = tempfile::tempdir().unwrap();
		let engine = engine_with_dir(dir.path());

		let err = engine
			.preflight(&dir.path().join("nope.dump"), None, false)
			.await
			.unwrap_err();
		assert!(matches!(err, Error::Preflight { .. }));
		assert_eq!(err.exit_code(), 3);
	}

	#[tokio::test]
	async fn gate_rejects_implausibly_small_archive() {
		let dir = tempfile::tempdir().unwrap();
		let engine = engine_with_dir(dir.path());

		let tiny = dir.path().join("db_a_20260115_120000.dump");
		fs::write(&tiny, b"PGDMP").await.unwrap();

		let err = engine.preflight(&tiny, None, false).await.unwrap_err();
		assert!(matches!(err, Error::Preflight { .. }));
	}

	#[tokio::test]
	async fn scratch_cleanup_on_drop() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("scratch");
		fs::write(&path, b"x").await.unwrap();
		{
			let _guard = RemoveOnDrop(path.clone());
		}
		assert!(!path.exists());
	}
}
