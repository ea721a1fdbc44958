use clap::{Parser, Subcommand};
use miette::Result;

use super::Context;

pub mod cluster;
pub mod pitr;
pub mod single;

/// Restore from backups.
#[derive(Debug, Clone, Parser)]
pub struct RestoreArgs {
	/// Restore subcommand
	#[command(subcommand)]
	pub action: RestoreAction,
}

#[derive(Debug, Clone, Subcommand)]
pub enum RestoreAction {
	Single(single::SingleArgs),
	Cluster(cluster::ClusterArgs),
	Pitr(pitr::PitrArgs),
}

pub async fn run(ctx: Context<RestoreArgs>) -> Result<()> {
	match ctx.args_top.action.clone() {
		RestoreAction::Single(subargs) => single::run(ctx.with_sub(subargs)).await,
		RestoreAction::Cluster(subargs) => cluster::run(ctx.with_sub(subargs)).await,
		RestoreAction::Pitr(subargs) => pitr::run(ctx.with_sub(subargs)).await,
	}
}
