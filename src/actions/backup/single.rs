use clap::Parser;
use miette::Result;
use std::sync::Arc;
use tracing::info;

use crate::{
	actions::{backup::BackupArgs, Context},
	backup::BackupEngine,
	engine::{driver_for, DatabaseDriver},
};

/// Back up one database to a single archive.
///
/// PostgreSQL databases default to the custom format (".dump", internally
/// compressed, restorable in parallel); MySQL and MariaDB always produce
/// SQL text, gzipped unless the compression level is 0.
///
/// With an encryption key configured, the committed archive is sealed in
/// place afterwards; the sidecar keeps the plaintext checksum. With
/// retention configured, a sweep of the backup directory follows. Failures
/// in either never delete the new archive.
#[derive(Debug, Clone, Parser)]
pub struct SingleArgs {
	/// Database to back up
	#[arg(value_name = "DATABASE")]
	pub target: String,

	/// Force plain SQL text instead of the custom format (PostgreSQL)
	#[arg(long)]
	pub plain: bool,

	/// Also upload the archive (and sidecar) to this cloud URI
	#[arg(long, value_name = "URI")]
	pub upload: Option<String>,
}

pub async fn run(ctx: Context<BackupArgs, SingleArgs>) -> Result<()> {
	let driver: Arc<dyn DatabaseDriver> = Arc::from(driver_for(&ctx.config)?);
	let engine = BackupEngine::new(ctx.config.clone(), driver.clone(), ctx.cancel.clone());

	let result = async {
		let mut archive = engine
			.backup_single(&ctx.args_sub.target, ctx.args_sub.plain)
			.await?;
		engine.finalize(&mut archive).await;

		if let Some(uri) = &ctx.args_sub.upload {
			crate::actions::cloud::upload_archive(&ctx, &archive.path, uri).await?;
		}

		info!(archive = %archive.path.display(), "done");
		Ok(())
	}
	.await;

	driver.close().await;
	result
}
