use std::path::PathBuf;

use clap::Parser;
use miette::Result;
use tracing::info;

use crate::{
	actions::{restore::RestoreArgs, Context},
	wal::{RecoveryAction, RecoveryTarget, WalManager},
};

/// Prepare a data directory for Point-in-Time Recovery.
///
/// Writes a recovery driver file (restore_command and recovery_target_*
/// settings) into the data directory and touches recovery.signal. Restore a
/// base backup into the data directory first; PostgreSQL replays archived
/// WAL up to the target on next start. Include the driver file from
/// postgresql.conf, e.g.: include 'dbbak.recovery.conf'
#[derive(Debug, Clone, Parser)]
pub struct PitrArgs {
	/// PostgreSQL data directory to prepare
	#[arg(long, value_name = "DIR")]
	pub data_dir: PathBuf,

	/// Directory holding archived WAL segments
	#[arg(long, value_name = "DIR")]
	pub archive_dir: PathBuf,

	/// Recover to this timestamp (e.g. '2026-01-15 14:30:00')
	#[arg(long, value_name = "TIME")]
	pub target_time: Option<String>,

	/// Recover to this transaction ID
	#[arg(long, value_name = "XID")]
	pub target_xid: Option<String>,

	/// Recover to this log sequence number
	#[arg(long, value_name = "LSN")]
	pub target_lsn: Option<String>,

	/// Recover to this named restore point
	#[arg(long, value_name = "NAME")]
	pub target_name: Option<String>,

	/// Stop as soon as a consistent state is reached
	#[arg(long)]
	pub immediate: bool,

	/// Stop just before the target instead of just after it
	#[arg(long)]
	pub exclusive: bool,

	/// What to do once the target is reached
	#[arg(long, value_enum, default_value = "promote")]
	pub target_action: RecoveryAction,

	/// Timeline to follow: 'latest' or a timeline number
	#[arg(long, value_name = "TL")]
	pub timeline: Option<String>,
}

pub async fn run(ctx: Context<RestoreArgs, PitrArgs>) -> Result<()> {
	let args = &ctx.args_sub;
	let target = RecoveryTarget::from_options(
		args.target_time.clone(),
		args.target_xid.clone(),
		args.target_lsn.clone(),
		args.target_name.clone(),
		args.immediate,
		!args.exclusive,
		args.target_action,
		args.timeline.clone(),
	)?;

	let manager = WalManager::new(
		args.archive_dir.clone(),
		ctx.config.key_material()?,
		ctx.cancel.clone(),
	);
	let driver = manager.write_recovery_driver(&args.data_dir, &target).await?;

	info!(driver = %driver.display(), "PITR prepared; start PostgreSQL to begin replay");
	Ok(())
}
