use clap::{Parser, Subcommand};
use miette::Result;

use super::Context;

pub mod archive;
pub mod cleanup;
pub mod fetch;
pub mod list;

/// Manage the WAL archive for Point-in-Time Recovery.
#[derive(Debug, Clone, Parser)]
pub struct WalArgs {
	/// WAL subcommand
	#[command(subcommand)]
	pub action: WalAction,
}

#[derive(Debug, Clone, Subcommand)]
pub enum WalAction {
	Archive(archive::ArchiveArgs),
	Fetch(fetch::FetchArgs),
	List(list::ListArgs),
	Cleanup(cleanup::CleanupArgs),
}

pub async fn run(ctx: Context<WalArgs>) -> Result<()> {
	match ctx.args_top.action.clone() {
		WalAction::Archive(subargs) => archive::run(ctx.with_sub(subargs)).await,
		WalAction::Fetch(subargs) => fetch::run(ctx.with_sub(subargs)).await,
		WalAction::List(subargs) => list::run(ctx.with_sub(subargs)).await,
		WalAction::Cleanup(subargs) => cleanup::run(ctx.with_sub(subargs)).await,
	}
}
