use std::path::PathBuf;

use clap::Parser;
use miette::Result;

use crate::{
	actions::{wal::WalArgs, Context},
	wal::WalManager,
};

/// Archive one WAL segment (PostgreSQL archive_command).
///
/// Wire it up as:
///
/// ```plain
/// archive_command = 'dbbak wal archive %p %f --archive-dir /wal'
/// ```
///
/// Re-archiving an identical segment succeeds without a second copy;
/// a segment with the same name but different contents is rejected.
#[derive(Debug, Clone, Parser)]
pub struct ArchiveArgs {
	/// Path to the segment file (%p)
	pub wal_path: PathBuf,

	/// Segment file name (%f)
	pub wal_name: String,

	/// Directory the archive lives in
	#[arg(long, value_name = "DIR")]
	pub archive_dir: PathBuf,

	/// gzip the archived segment
	#[arg(long)]
	pub compress: bool,
}

pub async fn run(ctx: Context<WalArgs, ArchiveArgs>) -> Result<()> {
	let manager = WalManager::new(
		ctx.args_sub.archive_dir.clone(),
		ctx.config.key_material()?,
		ctx.cancel.clone(),
	);
	manager
		.archive(
			&ctx.args_sub.wal_path,
			&ctx.args_sub.wal_name,
			ctx.args_sub.compress,
		)
		.await?;
	Ok(())
}
