use std::path::Path;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing::warn;

use super::Context;
use crate::{
	cloud::{backend_for, CloudUri, Progress},
	metadata::sidecar_path,
};

pub mod delete;
pub mod download;
pub mod list;
pub mod upload;

/// Move archives to and from object storage.
#[derive(Debug, Clone, Parser)]
pub struct CloudArgs {
	/// Cloud subcommand
	#[command(subcommand)]
	pub action: CloudAction,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CloudAction {
	Upload(upload::UploadArgs),
	Download(download::DownloadArgs),
	List(list::ListArgs),
	Delete(delete::DeleteArgs),
}

pub async fn run(ctx: Context<CloudArgs>) -> Result<()> {
	match ctx.args_top.action.clone() {
		CloudAction::Upload(subargs) => upload::run(ctx.with_sub(subargs)).await,
		CloudAction::Download(subargs) => download::run(ctx.with_sub(subargs)).await,
		CloudAction::List(subargs) => list::run(ctx.with_sub(subargs)).await,
		CloudAction::Delete(subargs) => delete::run(ctx.with_sub(subargs)).await,
	}
}

/// Upload an archive plus its sidecar; used by `cloud upload` and by the
/// backup actions' `--upload` flag.
pub(crate) async fn upload_archive<A, B>(
	ctx: &Context<A, B>,
	file: &Path,
	uri: &str,
) -> Result<(), crate::error::Error> {
	let uri = CloudUri::parse(uri)?;
	let backend = backend_for(&uri, &ctx.config.cloud).await?;
	let key = uri.key_for(file);

	let size = std::fs::metadata(file)
		.map_err(|e| crate::error::Error::io(format!("stat {}", file.display()), e))?
		.len();
	let bar = ctx.data_bar(size);
	bar.set_message(file.display().to_string());
	let progress = {
		let bar = bar.clone();
		Progress::new(move |transferred, _| bar.set_position(transferred))
	};

	backend.upload(file, &key, &progress, &ctx.cancel).await?;
	bar.abandon();

	// The sidecar rides along; its absence is not an error.
	let sidecar = sidecar_path(file);
	if sidecar.exists() {
		backend
			.upload(
				&sidecar,
				&format!("{key}.meta.json"),
				&Progress::none(),
				&ctx.cancel,
			)
			.await?;
	} else {
		warn!(archive = %file.display(), "no sidecar to upload");
	}

	Ok(())
}
