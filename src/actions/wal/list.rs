use std::path::PathBuf;

use clap::Parser;
use miette::Result;

use crate::{
	actions::{wal::WalArgs, Context},
	wal::WalManager,
};

/// List archived WAL segments in replay order.
#[derive(Debug, Clone, Parser)]
pub struct ListArgs {
	/// Directory the archive lives in
	#[arg(long, value_name = "DIR")]
	pub archive_dir: PathBuf,
}

pub async fn run(ctx: Context<WalArgs, ListArgs>) -> Result<()> {
	let manager = WalManager::new(
		ctx.args_sub.archive_dir.clone(),
		ctx.config.key_material()?,
		ctx.cancel.clone(),
	);

	for segment in manager.list().await? {
		let flags = match (segment.compressed, segment.encrypted) {
			(true, true) => " (gz, enc)",
			(true, false) => " (gz)",
			(false, true) => " (enc)",
			(false, false) => "",
		};
		match segment.parsed {
			Some(parsed) => println!(
				"{}  timeline {}  segment {:#x}  {} bytes{flags}",
				segment.name, parsed.timeline, parsed.segment, segment.size,
			),
			None => println!("{}  {} bytes{flags}", segment.name, segment.size),
		}
	}
	Ok(())
}
