use clap::Parser;
use miette::Result;

use crate::{
	actions::{cloud::CloudArgs, Context},
	cloud::{backend_for, CloudUri},
};

/// List objects under a cloud prefix.
#[derive(Debug, Clone, Parser)]
pub struct ListArgs {
	/// Prefix URI (s3://bucket/prefix/)
	pub uri: String,
}

pub async fn run(ctx: Context<CloudArgs, ListArgs>) -> Result<()> {
	let uri = CloudUri::parse(&ctx.args_sub.uri)?;
	let backend = backend_for(&uri, &ctx.config.cloud).await?;

	for object in backend.list(&uri.key).await? {
		println!(
			"{}  {} bytes  {}",
			object.key,
			object.size,
			object.modified.format("%Y-%m-%d %H:%M:%S"),
		);
	}
	Ok(())
}
