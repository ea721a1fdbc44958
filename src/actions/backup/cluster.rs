use clap::Parser;
use miette::Result;
use std::sync::Arc;
use tracing::info;

use crate::{
	actions::{backup::BackupArgs, Context},
	backup::BackupEngine,
	cluster::ClusterCoordinator,
	engine::{driver_for, DatabaseDriver},
};

/// Back up an entire PostgreSQL cluster into one tarball.
///
/// Global objects (roles, tablespaces) are dumped first, then every
/// non-template database in parallel (bounded by --dump-jobs). If any
/// member fails, nothing is published and the exit code is 4.
#[derive(Debug, Clone, Parser)]
pub struct ClusterArgs {
	/// Also include the "postgres" maintenance database
	#[arg(long)]
	pub include_postgres: bool,
}

pub async fn run(ctx: Context<BackupArgs, ClusterArgs>) -> Result<()> {
	let driver: Arc<dyn DatabaseDriver> = Arc::from(driver_for(&ctx.config)?);
	let coordinator =
		ClusterCoordinator::new(ctx.config.clone(), driver.clone(), ctx.cancel.clone())?;
	let engine = BackupEngine::new(ctx.config.clone(), driver.clone(), ctx.cancel.clone());

	let result = async {
		let mut archive = coordinator.backup(ctx.args_sub.include_postgres).await?;
		engine.finalize(&mut archive).await;
		info!(archive = %archive.path.display(), "done");
		Ok(())
	}
	.await;

	driver.close().await;
	result
}
