//! Provider-agnostic object storage: streaming upload/download over the
//! S3 family (AWS, MinIO, Backblaze B2, GCS via its S3 interop endpoint)
//! and Azure Blob Storage.
//!
//! No operation buffers a whole object in memory.

use std::{
	path::Path,
	sync::Mutex,
	time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
	config::CloudConfig,
	error::{Error, Result},
};

pub mod azure;
pub mod s3;

/// Progress callbacks fire at most every 100 ms, plus once at completion.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudScheme {
	S3,
	Minio,
	Azure,
	Gs,
	Gcs,
	B2,
}

impl CloudScheme {
	fn parse(scheme: &str) -> Option<Self> {
		Some(match scheme {
			"s3" => Self::S3,
			"minio" => Self::Minio,
			"azure" => Self::Azure,
			"gs" => Self::Gs,
			"gcs" => Self::Gcs,
			"b2" => Self::B2,
			_ => return None,
		})
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::S3 => "s3",
			Self::Minio => "minio",
			Self::Azure => "azure",
			Self::Gs => "gs",
			Self::Gcs => "gcs",
			Self::B2 => "b2",
		}
	}

	/// Schemes served by the S3 wire protocol.
	pub fn is_s3_family(self) -> bool {
		!matches!(self, Self::Azure)
	}

	/// Schemes that cannot guess an endpoint.
	pub fn requires_endpoint(self) -> bool {
		matches!(self, Self::Minio | Self::B2)
	}
}

impl std::fmt::Display for CloudScheme {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// `<scheme>://<bucket>/<key>` with AWS virtual-hosted bucket names
/// normalised down to the bare bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudUri {
	pub scheme: CloudScheme,
	pub bucket: String,
	pub key: String,
	/// Region recovered from a virtual-hosted AWS name, if any.
	pub region_hint: Option<String>,
}

impl CloudUri {
	pub fn parse(uri: &str) -> Result<Self> {
		let (scheme, rest) = uri
			.split_once("://")
			.ok_or_else(|| Error::config(format!("not a cloud URI: {uri}")))?;
		let scheme = CloudScheme::parse(scheme)
			.ok_or_else(|| Error::config(format!("unknown cloud scheme: {scheme}")))?;

		let (host, key) = match rest.split_once('/') {
			Some((host, key)) => (host, key),
			None => (rest, ""),
		};
		if host.is_empty() {
			return Err(Error::config(format!("missing bucket in {uri}")));
		}

		// bucket.s3.<region>.amazonaws.com and bucket.s3.amazonaws.com
		let (bucket, region_hint) = match host.find(".s3.") {
			Some(dot) if host.ends_with(".amazonaws.com") => {
				let bucket = &host[..dot];
				let middle = &host[dot + 4..host.len() - ".amazonaws.com".len()];
				let region = (!middle.is_empty()).then(|| middle.to_string());
				(bucket.to_string(), region)
			}
			_ => (host.to_string(), None),
		};

		Ok(Self {
			scheme,
			bucket,
			key: key.to_string(),
			region_hint,
		})
	}

	/// Key with a trailing-slash URI resolved against a local file name,
	/// bestool-style: `s3://bucket/backups/` + `/b/x.dump` → `backups/x.dump`.
	pub fn key_for(&self, file: &Path) -> String {
		if self.key.is_empty() || self.key.ends_with('/') {
			let name = file
				.file_name()
				.map(|n| n.to_string_lossy().into_owned())
				.unwrap_or_default();
			format!("{}{name}", self.key)
		} else {
			self.key.clone()
		}
	}
}

impl std::fmt::Display for CloudUri {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
	}
}

/// A remote object as reported by `list`.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
	pub key: String,
	pub size: u64,
	pub modified: DateTime<Utc>,
}

/// Throttled `(transferred, total)` progress reporting.
pub struct Progress {
	callback: Option<Box<dyn Fn(u64, u64) + Send + Sync>>,
	last: Mutex<Option<Instant>>,
}

impl Progress {
	pub fn none() -> Self {
		Self {
			callback: None,
			last: Mutex::new(None),
		}
	}

	pub fn new(callback: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
		Self {
			callback: Some(Box::new(callback)),
			last: Mutex::new(None),
		}
	}

	pub fn emit(&self, transferred: u64, total: u64) {
		let Some(callback) = &self.callback else {
			return;
		};
		let mut last = self.last.lock().expect("BUG: progress lock poisoned");
		let due = last.map_or(true, |at| at.elapsed() >= PROGRESS_INTERVAL);
		if due || transferred >= total {
			*last = Some(Instant::now());
			callback(transferred, total);
		}
	}
}

/// The uniform capability over providers.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
	async fn upload(
		&self,
		file: &Path,
		key: &str,
		progress: &Progress,
		cancel: &CancellationToken,
	) -> Result<()>;

	async fn download(
		&self,
		key: &str,
		file: &Path,
		progress: &Progress,
		cancel: &CancellationToken,
	) -> Result<()>;

	async fn delete(&self, key: &str) -> Result<()>;

	async fn exists(&self, key: &str) -> Result<bool>;

	async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

	async fn size(&self, key: &str) -> Result<u64>;
}

/// Build the backend for a parsed URI.
pub async fn backend_for(
	uri: &CloudUri,
	config: &CloudConfig,
) -> Result<Box<dyn ObjectBackend>> {
	if uri.scheme.requires_endpoint() && config.cloud_endpoint.is_none() {
		return Err(Error::config(format!(
			"{} requires an explicit cloud_endpoint",
			uri.scheme
		)));
	}

	Ok(if uri.scheme.is_s3_family() {
		Box::new(s3::S3Backend::new(uri, config).await?)
	} else {
		Box::new(azure::AzureBackend::new(uri, config)?)
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn uri_grammar() {
		let uri = CloudUri::parse("s3://bucket/backups/db.dump").unwrap();
		assert_eq!(uri.scheme, CloudScheme::S3);
		assert_eq!(uri.bucket, "bucket");
		assert_eq!(uri.key, "backups/db.dump");

		let uri = CloudUri::parse("minio://archive/").unwrap();
		assert_eq!(uri.scheme, CloudScheme::Minio);
		assert_eq!(uri.key, "");

		assert!(CloudUri::parse("ftp://x/y").is_err());
		assert!(CloudUri::parse("no-scheme").is_err());
		assert!(CloudUri::parse("s3:///key").is_err());
	}

	#[test]
	fn virtual_hosted_names_are_normalised() {
		let uri =
			CloudUri::parse("s3://mybucket.s3.eu-central-1.amazonaws.com/backups/a.dump")
				.unwrap();
		assert_eq!(uri.bucket, "mybucket");
		assert_eq!(uri.region_hint.as_deref(), Some("eu-central-1"));

		let uri = CloudUri::parse("s3://legacy.s3.amazonaws.com/a").unwrap();
		assert_eq!(uri.bucket, "legacy");
		assert_eq!(uri.region_hint, None);
	}

	#[test]
	fn trailing_slash_takes_file_name() {
		let uri = CloudUri::parse("s3://bucket/backups/").unwrap();
		assert_eq!(
			uri.key_for(Path::new("/b/db_mydb_20260115_120000.dump")),
			"backups/db_mydb_20260115_120000.dump"
		);

		let uri = CloudUri::parse("s3://bucket/exact/name.dump").unwrap();
		assert_eq!(uri.key_for(Path::new("/b/x.dump")), "exact/name.dump");
	}

	#[test]
	fn progress_throttles() {
		use std::sync::atomic::{AtomicUsize, Ordering};
		use std::sync::Arc;

		let count = Arc::new(AtomicUsize::new(0));
		let seen = count.clone();
		let progress = Progress::new(move |_, _| {
			seen.fetch_add(1, Ordering::SeqCst);
		});

		for i in 0..1000 {
			progress.emit(i, 2000);
		}
		// First emit goes through, the burst is swallowed.
		assert!(count.load(Ordering::SeqCst) < 5);

		progress.emit(2000, 2000);
		let after_final = count.load(Ordering::SeqCst);
		assert!(after_final >= 2);
	}
}
