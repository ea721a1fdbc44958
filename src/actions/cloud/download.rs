use std::path::PathBuf;

use clap::Parser;
use miette::Result;
use tracing::{debug, info};

use crate::{
	actions::{cloud::CloudArgs, Context},
	cloud::{backend_for, CloudUri, Progress},
};

/// Download an object (and its sidecar, if present) from object storage.
#[derive(Debug, Clone, Parser)]
pub struct DownloadArgs {
	/// Source URI (s3://bucket/key, azure://container/key, ...)
	pub uri: String,

	/// Local destination file
	pub file: PathBuf,
}

pub async fn run(ctx: Context<CloudArgs, DownloadArgs>) -> Result<()> {
	let uri = CloudUri::parse(&ctx.args_sub.uri)?;
	let backend = backend_for(&uri, &ctx.config.cloud).await?;

	let total = backend.size(&uri.key).await.unwrap_or(0);
	let bar = ctx.data_bar(total);
	bar.set_message(uri.key.clone());
	let progress = {
		let bar = bar.clone();
		Progress::new(move |transferred, _| bar.set_position(transferred))
	};

	backend
		.download(&uri.key, &ctx.args_sub.file, &progress, &ctx.cancel)
		.await?;
	bar.abandon();

	let sidecar_key = format!("{}.meta.json", uri.key);
	if backend.exists(&sidecar_key).await.unwrap_or(false) {
		let sidecar_dest = crate::metadata::sidecar_path(&ctx.args_sub.file);
		backend
			.download(&sidecar_key, &sidecar_dest, &Progress::none(), &ctx.cancel)
			.await?;
		debug!("sidecar downloaded alongside");
	}

	info!(file = %ctx.args_sub.file.display(), "downloaded");
	Ok(())
}
