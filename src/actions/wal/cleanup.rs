use std::path::PathBuf;

use chrono::Utc;
use clap::Parser;
use miette::Result;
use tracing::warn;

use crate::{
	actions::{wal::WalArgs, Context},
	wal::WalManager,
};

/// Delete archived WAL segments past their retention.
///
/// The newest segment is always kept: it may still be the only link between
/// the latest base backup and the end of the archived timeline.
#[derive(Debug, Clone, Parser)]
pub struct CleanupArgs {
	/// Directory the archive lives in
	#[arg(long, value_name = "DIR")]
	pub archive_dir: PathBuf,
}

pub async fn run(ctx: Context<WalArgs, CleanupArgs>) -> Result<()> {
	let Some(days) = ctx.config.retention_days else {
		return Err(crate::error::Error::config("WAL cleanup needs --retention-days").into());
	};
	let manager = WalManager::new(
		ctx.args_sub.archive_dir.clone(),
		ctx.config.key_material()?,
		ctx.cancel.clone(),
	);

	let report = manager.cleanup(days, Utc::now()).await?;
	for error in &report.errors {
		warn!("cleanup: {error}");
	}
	println!(
		"deleted {} segments, freed {} bytes",
		report.deleted, report.space_freed
	);
	Ok(())
}
