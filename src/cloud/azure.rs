//! Azure Blob Storage backend.
//!
//! Credential mapping: `cloud_access_key` is the storage account name and
//! `cloud_secret_key` its access key. Every upload is staged as uncommitted
//! blocks and committed with a block list, so only one block is ever held
//! in memory regardless of object size.

use std::path::Path;

use async_trait::async_trait;
use azure_core::request_options::Metadata;
use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::{
	fs,
	io::{AsyncReadExt, AsyncWriteExt},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
	cloud::{CloudUri, ObjectBackend, ObjectInfo, Progress},
	config::CloudConfig,
	error::{Error, Result},
};

const BLOCK_SIZE: u64 = 8 * 1024 * 1024;

pub struct AzureBackend {
	container: ContainerClient,
}

impl AzureBackend {
	pub fn new(uri: &CloudUri, config: &CloudConfig) -> Result<Self> {
		let account = config
			.cloud_access_key
			.clone()
			.ok_or_else(|| Error::config("azure needs cloud_access_key (account name)"))?;
		let key = config
			.cloud_secret_key
			.clone()
			.ok_or_else(|| Error::config("azure needs cloud_secret_key (account key)"))?;

		let credentials = StorageCredentials::access_key(account.clone(), key);
		let service = BlobServiceClient::new(account, credentials);
		Ok(Self {
			container: service.container_client(&uri.bucket),
		})
	}

	async fn block_upload(
		&self,
		file: &Path,
		key: &str,
		size: u64,
		progress: &Progress,
		cancel: &CancellationToken,
	) -> Result<String> {
		let blob = self.container.blob_client(key);
		let mut reader = fs::File::open(file)
			.await
			.map_err(|e| Error::io(format!("opening {}", file.display()), e))?;

		let mut hasher = Sha256::new();
		let mut blocks = Vec::new();
		let mut transferred = 0u64;
		let mut block_no = 0u32;

		loop {
			if cancel.is_cancelled() {
				return Err(Error::Cancelled);
			}

			let mut buf = Vec::with_capacity(BLOCK_SIZE as usize);
			let n = (&mut reader)
				.take(BLOCK_SIZE)
				.read_to_end(&mut buf)
				.await
				.map_err(|e| Error::io(format!("reading {}", file.display()), e))?;
			if n == 0 {
				break;
			}
			hasher.update(&buf);

			// Fixed-width ids: Azure requires equal-length block ids.
			let block_id = format!("{block_no:08}");
			blob.put_block(block_id.clone(), buf)
				.await
				.map_err(|e| Error::cloud(format!("staging block {block_no}"), e))?;

			blocks.push(BlobBlockType::Uncommitted(block_id.into()));
			block_no += 1;
			transferred += n as u64;
			progress.emit(transferred, size);
		}

		blob.put_block_list(BlockList { blocks })
			.await
			.map_err(|e| Error::cloud("committing block list", e))?;

		Ok(hex::encode(hasher.finalize()))
	}
}

#[async_trait]
impl ObjectBackend for AzureBackend {
	async fn upload(
		&self,
		file: &Path,
		key: &str,
		progress: &Progress,
		cancel: &CancellationToken,
	) -> Result<()> {
		let size = fs::metadata(file)
			.await
			.map_err(|e| Error::io(format!("stat {}", file.display()), e))?
			.len();
		info!(file = %file.display(), key, size, "uploading to azure container");

		let sha256 = self.block_upload(file, key, size, progress, cancel).await?;

		// Best-effort: the sidecar stays the checksum authority.
		let mut metadata = Metadata::new();
		metadata.insert("sha256", sha256);
		if let Err(e) = self
			.container
			.blob_client(key)
			.set_metadata()
			.metadata(metadata)
			.await
		{
			warn!("could not bind sha256 metadata to azure blob: {e}");
		}

		Ok(())
	}

	async fn download(
		&self,
		key: &str,
		file: &Path,
		progress: &Progress,
		cancel: &CancellationToken,
	) -> Result<()> {
		let blob = self.container.blob_client(key);
		let total = self.size(key).await.unwrap_or(0);

		let tmp = {
			let mut name = file.as_os_str().to_owned();
			name.push(".part");
			std::path::PathBuf::from(name)
		};
		let result = async {
			let mut out = fs::File::create(&tmp).await.map_err(|e| Error::SinkIo {
				path: tmp.clone(),
				source: e,
			})?;

			let mut stream = blob.get().into_stream();
			let mut transferred = 0u64;
			while let Some(chunk) = stream.next().await {
				if cancel.is_cancelled() {
					return Err(Error::Cancelled);
				}
				let chunk =
					chunk.map_err(|e| Error::cloud(format!("downloading {key}"), e))?;
				let data = chunk
					.data
					.collect()
					.await
					.map_err(|e| Error::cloud(format!("downloading {key}"), e))?;
				out.write_all(&data).await.map_err(|e| Error::SinkIo {
					path: tmp.clone(),
					source: e,
				})?;
				transferred += data.len() as u64;
				progress.emit(transferred, total);
			}
			out.sync_all().await.map_err(|e| Error::SinkIo {
				path: tmp.clone(),
				source: e,
			})?;
			fs::rename(&tmp, file).await.map_err(|e| Error::SinkIo {
				path: file.into(),
				source: e,
			})
		}
		.await;

		if result.is_err() {
			let _ = fs::remove_file(&tmp).await;
		}
		result
	}

	async fn delete(&self, key: &str) -> Result<()> {
		self.container
			.blob_client(key)
			.delete()
			.await
			.map_err(|e| Error::cloud(format!("deleting {key}"), e))?;
		Ok(())
	}

	async fn exists(&self, key: &str) -> Result<bool> {
		self.container
			.blob_client(key)
			.exists()
			.await
			.map_err(|e| Error::cloud(format!("checking {key}"), e))
	}

	async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
		let mut pages = self
			.container
			.list_blobs()
			.prefix(prefix.to_string())
			.into_stream();

		let mut objects = Vec::new();
		while let Some(page) = pages.next().await {
			let page = page.map_err(|e| Error::cloud(format!("listing {prefix}"), e))?;
			for blob in page.blobs.blobs() {
				let modified = {
					let at = blob.properties.last_modified;
					DateTime::<Utc>::from_timestamp(at.unix_timestamp(), at.nanosecond())
						.unwrap_or_else(Utc::now)
				};
				objects.push(ObjectInfo {
					key: blob.name.clone(),
					size: blob.properties.content_length,
					modified,
				});
			}
		}
		Ok(objects)
	}

	async fn size(&self, key: &str) -> Result<u64> {
		let properties = self
			.container
			.blob_client(key)
			.get_properties()
			.await
			.map_err(|e| Error::cloud(format!("stat {key}"), e))?;
		Ok(properties.blob.properties.content_length)
	}
}
