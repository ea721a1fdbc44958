use std::path::PathBuf;

use chrono::Utc;
use clap::Parser;
use miette::Result;
use tracing::warn;

use super::Context;
use crate::{
	cloud::{backend_for, CloudUri},
	error::Error,
	retention::{sweep_cloud, sweep_dir, RetentionParams},
};

/// Apply the retention policy to a directory or a cloud prefix.
///
/// The newest --min-backups archives are always kept, regardless of age;
/// of the rest, archives older than --retention-days are deleted along
/// with their sidecars. With --pattern, only matching names are
/// considered at all.
#[derive(Debug, Clone, Parser)]
pub struct RetentionArgs {
	/// Local directory to sweep (defaults to the backup directory)
	#[arg(long, value_name = "DIR", conflicts_with = "uri")]
	pub dir: Option<PathBuf>,

	/// Cloud prefix to sweep instead (s3://bucket/prefix/)
	#[arg(long)]
	pub uri: Option<String>,

	/// Restrict the sweep to names matching this glob
	#[arg(long, value_name = "GLOB")]
	pub pattern: Option<String>,
}

pub async fn run(ctx: Context<RetentionArgs>) -> Result<()> {
	let Some(days) = ctx.config.retention_days else {
		return Err(Error::config("retention needs --retention-days").into());
	};
	let params = RetentionParams {
		retention_days: days,
		min_backups: ctx.config.min_backups,
		pattern: ctx
			.args_top
			.pattern
			.as_deref()
			.map(glob::Pattern::new)
			.transpose()
			.map_err(|e| Error::config(format!("bad pattern: {e}")))?,
	};

	let report = match &ctx.args_top.uri {
		Some(uri) => {
			let uri = CloudUri::parse(uri)?;
			let backend = backend_for(&uri, &ctx.config.cloud).await?;
			sweep_cloud(backend.as_ref(), &uri.key, &params, Utc::now()).await?
		}
		None => {
			let dir = ctx
				.args_top
				.dir
				.clone()
				.unwrap_or_else(|| ctx.config.backup_dir.clone());
			sweep_dir(&dir, &params, Utc::now(), None).await?
		}
	};

	for error in &report.errors {
		warn!("retention: {error}");
	}
	println!(
		"{} candidates: kept {}, deleted {}, freed {} bytes",
		report.total, report.kept, report.deleted, report.space_freed
	);
	Ok(())
}
