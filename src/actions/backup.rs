use clap::{Parser, Subcommand};
use miette::Result;

use super::Context;

pub mod cluster;
pub mod sample;
pub mod single;

/// Take backups.
#[derive(Debug, Clone, Parser)]
pub struct BackupArgs {
	/// Backup subcommand
	#[command(subcommand)]
	pub action: BackupAction,
}

#[derive(Debug, Clone, Subcommand)]
pub enum BackupAction {
	Single(single::SingleArgs),
	Sample(sample::SampleArgs),
	Cluster(cluster::ClusterArgs),
}

pub async fn run(ctx: Context<BackupArgs>) -> Result<()> {
	match ctx.args_top.action.clone() {
		BackupAction::Single(subargs) => single::run(ctx.with_sub(subargs)).await,
		BackupAction::Sample(subargs) => sample::run(ctx.with_sub(subargs)).await,
		BackupAction::Cluster(subargs) => cluster::run(ctx.with_sub(subargs)).await,
	}
}
