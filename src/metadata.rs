//! Metadata sidecars: every archive `<file>` is advertised by a
//! `<file>.meta.json` written only after the archive itself is committed.
//!
//! Sidecars are never encrypted, and they are written atomically (temp file
//! then rename) so a crash cannot leave a half-written advertisement.

use std::{
	ffi::OsString,
	path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{
	fs,
	io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;

use crate::{
	crypto::{self, KeyMaterial},
	error::{Error, Result},
	format::{ArchiveFormat, Engine},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sidecar {
	/// Hex SHA-256 of the archive bytes. For archives encrypted in place
	/// this remains the digest of the plaintext archive.
	pub sha256: String,
	pub size_bytes: u64,
	pub timestamp: DateTime<Utc>,
	pub engine: Engine,
	/// `None` for cluster archives.
	pub database: Option<String>,
	pub format: ArchiveFormat,
	pub compression_level: u32,
	pub encrypted: bool,
}

/// Path of the sidecar belonging to an archive.
pub fn sidecar_path(archive: &Path) -> PathBuf {
	let mut name: OsString = archive.as_os_str().to_owned();
	name.push(".meta.json");
	name.into()
}

impl Sidecar {
	/// Bind this sidecar to `archive`, atomically.
	pub async fn write(&self, archive: &Path) -> Result<()> {
		let dest = sidecar_path(archive);
		let mut tmp: OsString = dest.as_os_str().to_owned();
		tmp.push(".tmp");
		let tmp = PathBuf::from(tmp);

		let body = serde_json::to_vec_pretty(self)
			.map_err(|e| Error::io("encoding sidecar", e.into()))?;

		let write = async {
			let mut file = fs::File::create(&tmp).await?;
			file.write_all(&body).await?;
			file.sync_all().await?;
			fs::rename(&tmp, &dest).await
		};
		if let Err(source) = write.await {
			let _ = fs::remove_file(&tmp).await;
			return Err(Error::SinkIo {
				path: dest,
				source,
			});
		}

		debug!(sidecar = %dest.display(), "sidecar bound");
		Ok(())
	}

	/// Load the sidecar of an archive.
	pub async fn load(archive: &Path) -> Result<Self> {
		let path = sidecar_path(archive);
		let body = match fs::read(&path).await {
			Ok(body) => body,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(Error::SidecarMissing {
					path: archive.into(),
				})
			}
			Err(source) => {
				return Err(Error::io(format!("reading {}", path.display()), source))
			}
		};

		serde_json::from_slice(&body)
			.map_err(|e| Error::io(format!("parsing {}", path.display()), e.into()))
	}

	/// Verify `archive` against this sidecar: size first (cheap), then the
	/// full checksum.
	///
	/// For archives encrypted in place the sidecar's digest is the
	/// plaintext digest while `size_bytes` is the encrypted size, so the
	/// envelope is opened with `key` and the plaintext hashed.
	pub async fn verify(&self, archive: &Path, key: Option<&KeyMaterial>) -> Result<()> {
		let meta = fs::metadata(archive)
			.await
			.map_err(|e| Error::io(format!("stat {}", archive.display()), e))?;
		if meta.len() != self.size_bytes {
			return Err(Error::SizeMismatch {
				path: archive.into(),
				expected: self.size_bytes,
				actual: meta.len(),
			});
		}

		let actual = if self.encrypted {
			let key = key.ok_or_else(|| {
				Error::crypto("archive is encrypted but no key is configured")
			})?;
			let frame = fs::read(archive)
				.await
				.map_err(|e| Error::io(format!("reading {}", archive.display()), e))?;
			let plaintext = crypto::open(&frame, key)?;
			hex::encode(Sha256::digest(&plaintext))
		} else {
			hash_file(archive).await?.0
		};

		if actual != self.sha256 {
			return Err(Error::ChecksumMismatch {
				path: archive.into(),
				expected: self.sha256.clone(),
				actual,
			});
		}

		Ok(())
	}
}

/// Stream a file through SHA-256, returning `(hex digest, length)`.
pub async fn hash_file(path: &Path) -> Result<(String, u64)> {
	let mut file = fs::File::open(path)
		.await
		.map_err(|e| Error::io(format!("opening {}", path.display()), e))?;

	let mut hasher = Sha256::new();
	let mut buf = vec![0u8; 256 * 1024];
	let mut total = 0u64;
	loop {
		let n = file
			.read(&mut buf)
			.await
			.map_err(|e| Error::io(format!("hashing {}", path.display()), e))?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
		total += n as u64;
	}

	Ok((hex::encode(hasher.finalize()), total))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample(sha: &str, size: u64) -> Sidecar {
		Sidecar {
			sha256: sha.into(),
			size_bytes: size,
			timestamp: Utc::now(),
			engine: Engine::Postgres,
			database: Some("mydb".into()),
			format: ArchiveFormat::PgDumpCustom,
			compression_level: 6,
			encrypted: false,
		}
	}

	#[tokio::test]
	async fn write_load_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let archive = dir.path().join("db_mydb_20260115_120000.dump");
		fs::write(&archive, b"PGDMP-body").await.unwrap();

		let (sha, size) = hash_file(&archive).await.unwrap();
		let sidecar = sample(&sha, size);
		sidecar.write(&archive).await.unwrap();

		// No naked temp file may survive a successful bind.
		let leftovers: Vec<_> = std::fs::read_dir(dir.path())
			.unwrap()
			.filter_map(|e| e.ok())
			.filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
			.collect();
		assert!(leftovers.is_empty());

		let loaded = Sidecar::load(&archive).await.unwrap();
		assert_eq!(loaded, sidecar);
		loaded.verify(&archive, None).await.unwrap();
	}

	#[tokio::test]
	async fn verify_catches_divergence() {
		let dir = tempfile::tempdir().unwrap();
		let archive = dir.path().join("a.dump");
		fs::write(&archive, b"original").await.unwrap();

		let (sha, size) = hash_file(&archive).await.unwrap();
		let sidecar = sample(&sha, size);
		sidecar.write(&archive).await.unwrap();

		// Same-size corruption is only caught by the checksum.
		fs::write(&archive, b"0riginal").await.unwrap();
		match sidecar.verify(&archive, None).await {
			Err(Error::ChecksumMismatch { .. }) => {}
			other => panic!("expected checksum mismatch, got {other:?}"),
		}

		fs::write(&archive, b"truncated-to-other-size").await.unwrap();
		match sidecar.verify(&archive, None).await {
			Err(Error::SizeMismatch { .. }) => {}
			other => panic!("expected size mismatch, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn verify_opens_encrypted_archives() {
		let dir = tempfile::tempdir().unwrap();
		let archive = dir.path().join("db_mydb_20260115_120000.dump");
		fs::write(&archive, b"PGDMP plaintext body").await.unwrap();

		let (sha, size) = hash_file(&archive).await.unwrap();
		let mut sidecar = sample(&sha, size);

		// Encrypt in place the way the backup engine does: the digest
		// stays the plaintext one, the size becomes the encrypted size.
		let key = KeyMaterial::Raw([7u8; 32]);
		let encrypted_size = crypto::encrypt_in_place(&archive, &key).await.unwrap();
		sidecar.encrypted = true;
		sidecar.size_bytes = encrypted_size;
		sidecar.write(&archive).await.unwrap();

		sidecar.verify(&archive, Some(&key)).await.unwrap();

		match sidecar.verify(&archive, None).await {
			Err(Error::Crypto { .. }) => {}
			other => panic!("expected missing-key crypto error, got {other:?}"),
		}
		match sidecar.verify(&archive, Some(&KeyMaterial::Raw([8u8; 32]))).await {
			Err(Error::Crypto { .. }) => {}
			other => panic!("expected wrong-key crypto error, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn missing_sidecar_is_structured() {
		let dir = tempfile::tempdir().unwrap();
		let archive = dir.path().join("a.dump");
		fs::write(&archive, b"x").await.unwrap();

		match Sidecar::load(&archive).await {
			Err(Error::SidecarMissing { .. }) => {}
			other => panic!("expected SidecarMissing, got {other:?}"),
		}
	}
}
