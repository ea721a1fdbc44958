//! S3-family backend: AWS, plus any S3-compatible endpoint (MinIO,
//! Backblaze B2, GCS interop). Large objects go up as multipart uploads
//! with the SHA-256 computed on the way through.

use std::path::Path;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
	config::Credentials,
	primitives::ByteStream,
	types::{CompletedMultipartUpload, CompletedPart, MetadataDirective},
	Client,
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::{
	fs,
	io::{AsyncReadExt, AsyncWriteExt},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
	cloud::{CloudScheme, CloudUri, ObjectBackend, ObjectInfo, Progress},
	config::CloudConfig,
	error::{Error, Result},
};

/// Objects above this size go multipart.
const MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;

/// S3 rejects parts under ~5 MiB; in practice a little more is needed.
const MIN_PART_SIZE: u64 = 6 * 1024 * 1024;

const GCS_INTEROP_ENDPOINT: &str = "https://storage.googleapis.com";

pub struct S3Backend {
	client: Client,
	bucket: String,
}

impl S3Backend {
	pub async fn new(uri: &CloudUri, config: &CloudConfig) -> Result<Self> {
		let region = config
			.cloud_region
			.clone()
			.or_else(|| uri.region_hint.clone())
			.unwrap_or_else(|| "us-east-1".into());

		let mut loader = aws_config::defaults(BehaviorVersion::v2023_11_09())
			.region(Region::new(region));
		if let (Some(access), Some(secret)) =
			(&config.cloud_access_key, &config.cloud_secret_key)
		{
			loader = loader.credentials_provider(Credentials::from_keys(
				access.clone(),
				secret.clone(),
				None,
			));
		}
		let sdk = loader.load().await;

		let endpoint = config.cloud_endpoint.clone().or_else(|| {
			matches!(uri.scheme, CloudScheme::Gs | CloudScheme::Gcs)
				.then(|| GCS_INTEROP_ENDPOINT.into())
		});

		let client = match endpoint {
			Some(url) => {
				// Path-style addressing: compatible endpoints rarely do
				// virtual hosting.
				let conf = aws_sdk_s3::config::Builder::from(&sdk)
					.endpoint_url(url)
					.force_path_style(true)
					.build();
				Client::from_conf(conf)
			}
			None => Client::new(&sdk),
		};

		Ok(Self {
			client,
			bucket: uri.bucket.clone(),
		})
	}

	async fn multipart_upload(
		&self,
		file: &Path,
		key: &str,
		size: u64,
		progress: &Progress,
		cancel: &CancellationToken,
	) -> Result<()> {
		let part_size = (size / 1000).max(MIN_PART_SIZE);
		debug!(part_size, "creating multipart upload");

		let mp = self
			.client
			.create_multipart_upload()
			.bucket(&self.bucket)
			.key(key)
			.metadata("uploader", crate::APP_NAME)
			.send()
			.await
			.map_err(|e| Error::cloud("creating multipart upload", e))?;
		let upload_id = mp
			.upload_id
			.ok_or_else(|| Error::config("no upload ID returned from S3"))?;

		let result = self
			.upload_parts(file, key, size, part_size, &upload_id, progress, cancel)
			.await;

		match result {
			Ok(sha256) => {
				// Metadata can only be replaced by self-copy once the
				// digest is known; a failure leaves the sidecar as the
				// authority.
				if let Err(e) = self
					.client
					.copy_object()
					.bucket(&self.bucket)
					.key(key)
					.copy_source(format!("{}/{key}", self.bucket))
					.metadata_directive(MetadataDirective::Replace)
					.metadata("sha256", &sha256)
					.metadata("uploader", crate::APP_NAME)
					.send()
					.await
				{
					warn!("could not bind sha256 metadata to s3 object: {e}");
				}
				Ok(())
			}
			Err(e) => {
				debug!("aborting multipart upload");
				let _ = self
					.client
					.abort_multipart_upload()
					.bucket(&self.bucket)
					.key(key)
					.upload_id(&upload_id)
					.send()
					.await;
				Err(e)
			}
		}
	}

	#[allow(clippy::too_many_arguments)]
	async fn upload_parts(
		&self,
		file: &Path,
		key: &str,
		size: u64,
		part_size: u64,
		upload_id: &str,
		progress: &Progress,
		cancel: &CancellationToken,
	) -> Result<String> {
		let mut reader = fs::File::open(file)
			.await
			.map_err(|e| Error::io(format!("opening {}", file.display()), e))?;

		let mut hasher = Sha256::new();
		let mut parts = Vec::new();
		let mut transferred = 0u64;
		let mut part_no = 1i32;

		loop {
			if cancel.is_cancelled() {
				return Err(Error::Cancelled);
			}

			let mut buf = Vec::with_capacity(part_size as usize);
			let n = (&mut reader)
				.take(part_size)
				.read_to_end(&mut buf)
				.await
				.map_err(|e| Error::io(format!("reading {}", file.display()), e))?;
			if n == 0 {
				break;
			}
			hasher.update(&buf);

			let uploaded = self
				.client
				.upload_part()
				.bucket(&self.bucket)
				.key(key)
				.upload_id(upload_id)
				.part_number(part_no)
				.body(ByteStream::from(buf))
				.send()
				.await
				.map_err(|e| Error::cloud(format!("uploading part {part_no}"), e))?;

			parts.push(
				CompletedPart::builder()
					.set_e_tag(uploaded.e_tag)
					.part_number(part_no)
					.build(),
			);
			part_no += 1;
			transferred += n as u64;
			progress.emit(transferred, size);
		}

		self.client
			.complete_multipart_upload()
			.bucket(&self.bucket)
			.key(key)
			.upload_id(upload_id)
			.multipart_upload(
				CompletedMultipartUpload::builder()
					.set_parts(Some(parts))
					.build(),
			)
			.send()
			.await
			.map_err(|e| Error::cloud("completing multipart upload", e))?;

		Ok(hex::encode(hasher.finalize()))
	}
}

#[async_trait]
impl ObjectBackend for S3Backend {
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
		info!(file = %file.display(), key, size, "uploading to s3://{}", self.bucket);

		if size > MULTIPART_THRESHOLD {
			return self.multipart_upload(file, key, size, progress, cancel).await;
		}

		let (sha256, _) = crate::metadata::hash_file(file).await?;
		let body = ByteStream::from_path(file)
			.await
			.map_err(|e| Error::cloud(format!("opening {}", file.display()), e))?;
		self.client
			.put_object()
			.bucket(&self.bucket)
			.key(key)
			.body(body)
			.metadata("sha256", sha256)
			.metadata("uploader", crate::APP_NAME)
			.send()
			.await
			.map_err(|e| Error::cloud(format!("uploading {key}"), e))?;
		progress.emit(size, size);
		Ok(())
	}

	async fn download(
		&self,
		key: &str,
		file: &Path,
		progress: &Progress,
		cancel: &CancellationToken,
	) -> Result<()> {
		let object = self
			.client
			.get_object()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
			.map_err(|e| Error::cloud(format!("downloading {key}"), e))?;
		let total = object.content_length().unwrap_or_default().max(0) as u64;

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

			let mut body = object.body;
			let mut transferred = 0u64;
			while let Some(chunk) = body
				.try_next()
				.await
				.map_err(|e| Error::cloud(format!("downloading {key}"), e))?
			{
				if cancel.is_cancelled() {
					return Err(Error::Cancelled);
				}
				out.write_all(&chunk).await.map_err(|e| Error::SinkIo {
					path: tmp.clone(),
					source: e,
				})?;
				transferred += chunk.len() as u64;
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
		self.client
			.delete_object()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
			.map_err(|e| Error::cloud(format!("deleting {key}"), e))?;
		Ok(())
	}

	async fn exists(&self, key: &str) -> Result<bool> {
		match self
			.client
			.head_object()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
		{
			Ok(_) => Ok(true),
			Err(e) => {
				let service = e.into_service_error();
				if service.is_not_found() {
					Ok(false)
				} else {
					Err(Error::cloud(format!("checking {key}"), service))
				}
			}
		}
	}

	async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
		let mut pages = self
			.client
			.list_objects_v2()
			.bucket(&self.bucket)
			.prefix(prefix)
			.into_paginator()
			.send();

		let mut objects = Vec::new();
		while let Some(page) = pages.next().await {
			let page = page.map_err(|e| Error::cloud(format!("listing {prefix}"), e))?;
			for object in page.contents() {
				let Some(key) = object.key() else { continue };
				objects.push(ObjectInfo {
					key: key.to_string(),
					size: object.size().unwrap_or_default().max(0) as u64,
					modified: object
						.last_modified()
						.and_then(|t| {
							DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())
						})
						.unwrap_or_else(Utc::now),
				});
			}
		}
		Ok(objects)
	}

	async fn size(&self, key: &str) -> Result<u64> {
		let head = self
			.client
			.head_object()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
			.map_err(|e| Error::cloud(format!("stat {key}"), e))?;
		Ok(head.content_length().unwrap_or_default().max(0) as u64)
	}
}
