use std::path::PathBuf;

use clap::Parser;
use miette::Result;
use tracing::info;

use crate::actions::{cloud::CloudArgs, Context};

/// Upload a file (and its sidecar) to object storage.
///
/// The URI names the provider, bucket and key: s3://bucket/key,
/// minio://bucket/key (requires --cloud-endpoint), b2://bucket/key
/// (likewise), gs://bucket/key, azure://container/key. A URI ending in '/'
/// takes the file's name as the final key segment.
///
/// Large objects stream as multipart uploads; nothing is held in memory.
#[derive(Debug, Clone, Parser)]
pub struct UploadArgs {
	/// Local file to upload
	pub file: PathBuf,

	/// Destination URI
	pub uri: String,
}

pub async fn run(ctx: Context<CloudArgs, UploadArgs>) -> Result<()> {
	crate::actions::cloud::upload_archive(&ctx, &ctx.args_sub.file, &ctx.args_sub.uri)
		.await?;
	info!(file = %ctx.args_sub.file.display(), uri = %ctx.args_sub.uri, "uploaded");
	Ok(())
}
