use std::path::PathBuf;

use clap::Parser;
use miette::Result;

use crate::{
	actions::{wal::WalArgs, Context},
	wal::WalManager,
};

/// Fetch one archived WAL segment (PostgreSQL restore_command).
///
/// This is the command the recovery driver file references:
///
/// ```plain
/// restore_command = 'dbbak wal fetch %f %p --archive-dir /wal'
/// ```
///
/// Compression and encryption are reversed on the way out.
#[derive(Debug, Clone, Parser)]
pub struct FetchArgs {
	/// Segment file name (%f)
	pub wal_name: String,

	/// Where to place the segment (%p)
	pub destination: PathBuf,

	/// Directory the archive lives in
	#[arg(long, value_name = "DIR")]
	pub archive_dir: PathBuf,
}

pub async fn run(ctx: Context<WalArgs, FetchArgs>) -> Result<()> {
	let manager = WalManager::new(
		ctx.args_sub.archive_dir.clone(),
		ctx.config.key_material()?,
		ctx.cancel.clone(),
	);
	manager
		.fetch(&ctx.args_sub.wal_name, &ctx.args_sub.destination)
		.await?;
	Ok(())
}
