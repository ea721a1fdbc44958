use clap::Parser;
use miette::Result;
use tracing::info;

use crate::{
	actions::{cloud::CloudArgs, Context},
	cloud::{backend_for, CloudUri},
};

/// Delete an object and its sidecar from object storage.
#[derive(Debug, Clone, Parser)]
pub struct DeleteArgs {
	/// Object URI (s3://bucket/key)
	pub uri: String,
}

pub async fn run(ctx: Context<CloudArgs, DeleteArgs>) -> Result<()> {
	let uri = CloudUri::parse(&ctx.args_sub.uri)?;
	let backend = backend_for(&uri, &ctx.config.cloud).await?;

	backend.delete(&uri.key).await?;
	// Companion sidecar: best effort.
	let _ = backend.delete(&format!("{}.meta.json", uri.key)).await;

	info!(uri = %ctx.args_sub.uri, "deleted");
	Ok(())
}
