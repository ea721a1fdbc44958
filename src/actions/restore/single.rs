use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use miette::Result;
use tracing::info;

use crate::{
	actions::{restore::RestoreArgs, Context},
	engine::{driver_for, DatabaseDriver},
	restore::{RestoreEngine, RestorePlan},
};

/// Restore a single-database archive.
///
/// The target database is taken from -d/--database, falling back to the
/// name encoded in the archive filename. The archive format is detected
/// from its content. Custom-format dumps go through pg_restore (parallel
/// with --jobs, or all-or-nothing with --single-transaction); SQL text is
/// streamed into psql/mysql. Encrypted archives are decrypted to a scratch
/// sibling first and the scratch is removed afterwards.
#[derive(Debug, Clone, Parser)]
pub struct SingleArgs {
	/// Archive file to restore from
	pub archive: PathBuf,

	/// Drop existing objects (or the database, for SQL text) first
	#[arg(long)]
	pub clean: bool,

	/// Create the target database before restoring
	#[arg(long)]
	pub create: bool,

	/// Run the whole restore in one transaction (conflicts with --jobs)
	#[arg(long)]
	pub single_transaction: bool,

	/// Verify the archive against its sidecar before restoring
	#[arg(long)]
	pub verify: bool,
}

pub async fn run(ctx: Context<RestoreArgs, SingleArgs>) -> Result<()> {
	let driver: Arc<dyn DatabaseDriver> = Arc::from(driver_for(&ctx.config)?);
	let engine = RestoreEngine::new(ctx.config.clone(), driver.clone(), ctx.cancel.clone());

	let result = async {
		// The target comes from the global -d/--database option.
		let database = ctx
			.config
			.connection
			.database
			.clone()
			.or_else(|| crate::format::parse_database_name(
				&ctx.args_sub.archive.file_name().unwrap_or_default().to_string_lossy(),
			))
			.ok_or_else(|| {
				crate::error::Error::config("pass --database to name the restore target")
			})?;

		if ctx.args_sub.verify {
			let sidecar = crate::metadata::Sidecar::load(&ctx.args_sub.archive).await?;
			let key = ctx.config.key_material()?;
			sidecar.verify(&ctx.args_sub.archive, key.as_ref()).await?;
			info!("sidecar checksum verified");
		}

		let plan = RestorePlan {
			database,
			clean: ctx.args_sub.clean,
			create: ctx.args_sub.create,
			jobs: ctx.config.jobs,
			single_transaction: ctx.args_sub.single_transaction,
		};
		engine.restore_single(&ctx.args_sub.archive, &plan).await?;
		Ok(())
	}
	.await;

	driver.close().await;
	result
}
