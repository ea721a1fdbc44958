//! The encryption envelope around archives and WAL segments.
//!
//! Framing, bit-exact: `magic(16) | version(1) | salt(16) | nonce(12) |
//! ciphertext | tag(16)` with AES-256-GCM. The key is either a 32-byte raw
//! key or a passphrase run through Argon2id with the salt stored in the
//! header; raw keys leave the salt zeroed.
//!
//! Sealing is a single AEAD invocation: the whole archive transits memory.
//! Decryption writes a sibling temp file and only renames over the target
//! after the authentication tag verifies, so a plaintext is never replaced
//! by data that cannot be read back.

use std::{
	io::Read,
	path::{Path, PathBuf},
};

use aes_gcm::{
	aead::{Aead, KeyInit},
	Aes256Gcm, Key, Nonce,
};
use argon2::Argon2;
use rand::{rngs::OsRng, RngCore};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, instrument};

use crate::error::{Error, Result};

/// First 16 bytes of every encrypted file.
pub const MAGIC: [u8; 16] = *b"DBBAK1\0ENCRYPTED";

pub const VERSION: u8 = 1;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes before the ciphertext begins.
pub const HEADER_LEN: usize = MAGIC.len() + 1 + SALT_LEN + NONCE_LEN;

/// Key material resolved from configuration.
#[derive(Clone)]
pub enum KeyMaterial {
	/// A raw 32-byte key. Preferred; no KDF is applied.
	Raw([u8; 32]),
	/// A passphrase, to be derived with Argon2id and a per-file salt.
	Passphrase(String),
}

impl std::fmt::Debug for KeyMaterial {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		// Key material must never reach logs.
		match self {
			Self::Raw(_) => f.write_str("KeyMaterial::Raw(..)"),
			Self::Passphrase(_) => f.write_str("KeyMaterial::Passphrase(..)"),
		}
	}
}

impl KeyMaterial {
	/// Load key material from a file: exactly 32 raw bytes, or 64 hex
	/// characters, otherwise the trimmed content is used as a passphrase.
	pub fn from_file(path: &Path) -> Result<Self> {
		let body = std::fs::read(path)
			.map_err(|e| Error::io(format!("reading key file {}", path.display()), e))?;
		Ok(Self::from_bytes(&body))
	}

	/// Load key material from an environment variable, same rules as
	/// [`KeyMaterial::from_file`].
	pub fn from_env(name: &str) -> Result<Self> {
		let value = std::env::var(name)
			.map_err(|_| Error::config(format!("environment variable {name} is not set")))?;
		Ok(Self::from_bytes(value.as_bytes()))
	}

	fn from_bytes(body: &[u8]) -> Self {
		if body.len() == 32 {
			let mut key = [0u8; 32];
			key.copy_from_slice(body);
			return Self::Raw(key);
		}

		let text = String::from_utf8_lossy(body);
		let trimmed = text.trim();
		if trimmed.len() == 64 {
			if let Ok(bytes) = hex::decode(trimmed) {
				let mut key = [0u8; 32];
				key.copy_from_slice(&bytes);
				return Self::Raw(key);
			}
		}

		Self::Passphrase(trimmed.to_string())
	}

	/// Derive the AEAD key for a given header salt.
	fn derive(&self, salt: &[u8; SALT_LEN]) -> Result<[u8; 32]> {
		match self {
			Self::Raw(key) => Ok(*key),
			Self::Passphrase(pass) => {
				let mut key = [0u8; 32];
				Argon2::default()
					.hash_password_into(pass.as_bytes(), salt, &mut key)
					.map_err(|e| Error::crypto(format!("key derivation: {e}")))?;
				Ok(key)
			}
		}
	}

	fn fresh_salt(&self) -> [u8; SALT_LEN] {
		match self {
			Self::Raw(_) => [0u8; SALT_LEN],
			Self::Passphrase(_) => {
				let mut salt = [0u8; SALT_LEN];
				OsRng.fill_bytes(&mut salt);
				salt
			}
		}
	}
}

/// Whether the file at `path` starts with the envelope magic.
pub fn is_encrypted_file(path: &Path) -> Result<bool> {
	let mut head = [0u8; MAGIC.len()];
	let n = std::fs::File::open(path)
		.and_then(|mut f| f.read(&mut head))
		.map_err(|e| Error::io(format!("probing {}", path.display()), e))?;
	Ok(n == MAGIC.len() && head == MAGIC)
}

/// Seal `plaintext` into an envelope frame.
pub fn seal(plaintext: &[u8], key: &KeyMaterial) -> Result<Vec<u8>> {
	let salt = key.fresh_salt();
	let mut nonce = [0u8; NONCE_LEN];
	OsRng.fill_bytes(&mut nonce);

	let derived = key.derive(&salt)?;
	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derived));
	let ciphertext = cipher
		.encrypt(Nonce::from_slice(&nonce), plaintext)
		.map_err(|_| Error::crypto("AEAD seal failed"))?;

	let mut frame = Vec::with_capacity(HEADER_LEN + ciphertext.len());
	frame.extend_from_slice(&MAGIC);
	frame.push(VERSION);
	frame.extend_from_slice(&salt);
	frame.extend_from_slice(&nonce);
	frame.extend_from_slice(&ciphertext);
	Ok(frame)
}

/// Open an envelope frame, verifying the tag.
pub fn open(frame: &[u8], key: &KeyMaterial) -> Result<Vec<u8>> {
	if frame.len() < HEADER_LEN + TAG_LEN || frame[..MAGIC.len()] != MAGIC {
		return Err(Error::crypto("not an encrypted envelope"));
	}
	let version = frame[MAGIC.len()];
	if version != VERSION {
		return Err(Error::crypto(format!(
			"unsupported envelope version {version}"
		)));
	}

	let mut salt = [0u8; SALT_LEN];
	salt.copy_from_slice(&frame[MAGIC.len() + 1..MAGIC.len() + 1 + SALT_LEN]);
	let nonce = &frame[MAGIC.len() + 1 + SALT_LEN..HEADER_LEN];

	let derived = key.derive(&salt)?;
	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derived));
	cipher
		.decrypt(Nonce::from_slice(nonce), &frame[HEADER_LEN..])
		.map_err(|_| Error::crypto("decryption failed: wrong key or corrupted data"))
}

/// Encrypt a file in place (temp sibling, verify, atomic rename).
///
/// Returns the encrypted size. The replacement only happens after the
/// freshly sealed envelope has been opened again successfully.
#[instrument(level = "debug", skip(key))]
pub async fn encrypt_in_place(path: &Path, key: &KeyMaterial) -> Result<u64> {
	let plaintext = fs::read(path)
		.await
		.map_err(|e| Error::io(format!("reading {}", path.display()), e))?;

	if plaintext.len() >= MAGIC.len() && plaintext[..MAGIC.len()] == MAGIC {
		return Err(Error::crypto(format!(
			"{} is already encrypted",
			path.display()
		)));
	}

	let frame = seal(&plaintext, key)?;

	// Verify-on-read before the plaintext is allowed to disappear.
	let reopened = open(&frame, key)?;
	if reopened != plaintext {
		return Err(Error::crypto("post-seal verification failed"));
	}

	let size = frame.len() as u64;
	replace_file(path, frame).await?;
	debug!(path = %path.display(), size, "encrypted in place");
	Ok(size)
}

/// Decrypt a file in place; the target is untouched unless the tag verifies.
#[instrument(level = "debug", skip(key))]
pub async fn decrypt_in_place(path: &Path, key: &KeyMaterial) -> Result<u64> {
	let frame = fs::read(path)
		.await
		.map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
	let plaintext = open(&frame, key)?;
	let size = plaintext.len() as u64;
	replace_file(path, plaintext).await?;
	debug!(path = %path.display(), size, "decrypted in place");
	Ok(size)
}

/// Decrypt `path` into `dest` (for restores that must keep the original).
pub async fn decrypt_to(path: &Path, dest: &Path, key: &KeyMaterial) -> Result<u64> {
	let frame = fs::read(path)
		.await
		.map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
	let plaintext = open(&frame, key)?;
	let size = plaintext.len() as u64;

	let mut file = fs::File::create(dest)
		.await
		.map_err(|e| Error::SinkIo {
			path: dest.into(),
			source: e,
		})?;
	file.write_all(&plaintext).await.map_err(|e| Error::SinkIo {
		path: dest.into(),
		source: e,
	})?;
	file.sync_all().await.map_err(|e| Error::SinkIo {
		path: dest.into(),
		source: e,
	})?;
	Ok(size)
}

/// Write `contents` next to `path` and rename over it.
async fn replace_file(path: &Path, contents: Vec<u8>) -> Result<()> {
	let tmp = temp_sibling(path);
	let write = async {
		let mut file = fs::File::create(&tmp).await?;
		file.write_all(&contents).await?;
		file.sync_all().await?;
		fs::rename(&tmp, path).await
	};
	if let Err(source) = write.await {
		let _ = fs::remove_file(&tmp).await;
		return Err(Error::SinkIo {
			path: path.into(),
			source,
		});
	}
	Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
	let mut name = path.as_os_str().to_owned();
	name.push(".tmp");
	name.into()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn frame_layout_is_exact() {
		let key = KeyMaterial::Raw([7u8; 32]);
		let frame = seal(b"payload", &key).unwrap();

		assert_eq!(&frame[..16], b"DBBAK1\0ENCRYPTED");
		assert_eq!(frame[16], 1);
		// Raw keys leave the salt zeroed.
		assert_eq!(&frame[17..33], &[0u8; 16]);
		assert_eq!(frame.len(), HEADER_LEN + b"payload".len() + 16);
	}

	#[test]
	fn round_trip_bit_exact() {
		let key = KeyMaterial::Passphrase("correct horse".into());
		let plaintext = (0..=255u8).cycle().take(100_000).collect::<Vec<_>>();
		let frame = seal(&plaintext, &key).unwrap();
		assert_eq!(open(&frame, &key).unwrap(), plaintext);
	}

	#[test]
	fn wrong_key_fails() {
		let frame = seal(b"secret", &KeyMaterial::Raw([1u8; 32])).unwrap();
		match open(&frame, &KeyMaterial::Raw([2u8; 32])) {
			Err(Error::Crypto { .. }) => {}
			other => panic!("expected crypto error, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn decrypt_with_wrong_key_leaves_file_untouched() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("a.dump");
		fs::write(&path, b"plaintext archive").await.unwrap();

		let key = KeyMaterial::Raw([3u8; 32]);
		encrypt_in_place(&path, &key).await.unwrap();
		let (sha_before, _) = crate::metadata::hash_file(&path).await.unwrap();

		let wrong = KeyMaterial::Raw([4u8; 32]);
		assert!(decrypt_in_place(&path, &wrong).await.is_err());

		let (sha_after, _) = crate::metadata::hash_file(&path).await.unwrap();
		assert_eq!(sha_before, sha_after);

		decrypt_in_place(&path, &key).await.unwrap();
		assert_eq!(fs::read(&path).await.unwrap(), b"plaintext archive");
	}

	#[tokio::test]
	async fn magic_probe() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("a.dump");
		fs::write(&path, b"PGDMP plain").await.unwrap();
		assert!(!is_encrypted_file(&path).unwrap());

		encrypt_in_place(&path, &KeyMaterial::Raw([5u8; 32]))
			.await
			.unwrap();
		assert!(is_encrypted_file(&path).unwrap());
	}

	#[test]
	fn key_file_rules() {
		let dir = tempfile::tempdir().unwrap();

		let raw = dir.path().join("raw.key");
		std::fs::write(&raw, [9u8; 32]).unwrap();
		assert!(matches!(
			KeyMaterial::from_file(&raw).unwrap(),
			KeyMaterial::Raw(_)
		));

		let hexfile = dir.path().join("hex.key");
		std::fs::write(&hexfile, "0b".repeat(32)).unwrap();
		assert!(matches!(
			KeyMaterial::from_file(&hexfile).unwrap(),
			KeyMaterial::Raw(k) if k == [0x0b; 32]
		));

		let pass = dir.path().join("pass.key");
		std::fs::write(&pass, "a passphrase\n").unwrap();
		assert!(matches!(
			KeyMaterial::from_file(&pass).unwrap(),
			KeyMaterial::Passphrase(p) if p == "a passphrase"
		));
	}
}
