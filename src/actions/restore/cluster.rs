use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use miette::Result;
use tracing::{info, warn};

use crate::{
	actions::{restore::RestoreArgs, Context},
	cluster::ClusterCoordinator,
	engine::{driver_for, DatabaseDriver},
	error::Error,
	restore::RestoreEngine,
};

/// Restore a whole-cluster tarball.
///
/// Global objects replay first, then every member database serially via
/// pg_restore --create. With --clean-cluster, all non-system user databases
/// are dropped (force-terminating sessions) before the restore; the system
/// databases postgres, template0 and template1 are never dropped.
#[derive(Debug, Clone, Parser)]
pub struct ClusterArgs {
	/// Cluster archive (cluster_*.tar.gz)
	pub archive: PathBuf,

	/// Drop all user databases first
	#[arg(long)]
	pub clean_cluster: bool,
}

pub async fn run(ctx: Context<RestoreArgs, ClusterArgs>) -> Result<()> {
	let driver: Arc<dyn DatabaseDriver> = Arc::from(driver_for(&ctx.config)?);
	let engine = RestoreEngine::new(ctx.config.clone(), driver.clone(), ctx.cancel.clone());
	let coordinator =
		ClusterCoordinator::new(ctx.config.clone(), driver.clone(), ctx.cancel.clone())?;

	let result = async {
		engine.preflight(&ctx.args_sub.archive, None, true).await?;

		let report = coordinator
			.restore(&ctx.args_sub.archive, ctx.args_sub.clean_cluster)
			.await?;

		info!(restored = report.restored.len(), "cluster restore finished");
		if !report.errors.is_empty() {
			for (database, error) in &report.errors {
				warn!(%database, "member failed: {error}");
			}
			return Err(Error::PartialClusterFailure {
				failed: report.errors.into_iter().map(|(db, _)| db).collect(),
			}
			.into());
		}
		Ok(())
	}
	.await;

	driver.close().await;
	result
}
