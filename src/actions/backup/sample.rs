use clap::Parser;
use miette::Result;
use std::sync::Arc;
use tracing::info;

use crate::{
	actions::{backup::BackupArgs, Context},
	backup::BackupEngine,
	config::SampleStrategy,
	engine::{driver_for, DatabaseDriver},
};

/// Take a reduced, SQL-text backup for analysis and development.
///
/// The archive carries the full schema and a per-table subset of rows:
/// every Nth row (ratio), a statistical percentage (percent), or the first
/// K rows (count). Row subsets may violate referential integrity; sample
/// backups are not a recovery tool.
#[derive(Debug, Clone, Parser)]
pub struct SampleArgs {
	/// Database to sample
	#[arg(value_name = "DATABASE")]
	pub target: String,

	/// Reduction strategy (overrides configuration)
	#[arg(long, value_enum)]
	pub strategy: Option<SampleStrategy>,

	/// Reduction value: ratio N (every Nth row), percent 1-100, or count K
	#[arg(long)]
	pub value: Option<u64>,
}

pub async fn run(ctx: Context<BackupArgs, SampleArgs>) -> Result<()> {
	let mut config = ctx.config.clone();
	if let Some(strategy) = ctx.args_sub.strategy {
		config.sample_strategy = Some(strategy);
	}
	if let Some(value) = ctx.args_sub.value {
		config.sample_value = Some(value);
	}
	config.validate()?;

	let driver: Arc<dyn DatabaseDriver> = Arc::from(driver_for(&config)?);
	let engine = BackupEngine::new(config, driver.clone(), ctx.cancel.clone());

	let result = async {
		let mut archive = engine.backup_sample(&ctx.args_sub.target).await?;
		engine.finalize(&mut archive).await;
		info!(archive = %archive.path.display(), "done");
		Ok(())
	}
	.await;

	driver.close().await;
	result
}
