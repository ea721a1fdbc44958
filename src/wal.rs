//! WAL archiving and Point-in-Time Recovery support.
//!
//! Archived segments are write-once: a re-archive with identical bytes is
//! an idempotent success, a re-archive with different bytes is a conflict.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tokio::{
	fs,
	io::AsyncWriteExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
	crypto::{self, KeyMaterial},
	error::{Error, Result},
	metadata::hash_file,
	pipeline,
};

/// A parsed 24-hex-character WAL segment name.
///
/// The first 8 characters are the timeline, the remaining 16 the segment
/// number. Lexicographic order of the original names agrees with
/// chronological order within a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WalSegmentName {
	pub timeline: u32,
	pub segment: u64,
}

impl WalSegmentName {
	pub fn parse(name: &str) -> Option<Self> {
		if name.len() != 24 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
			return None;
		}
		let timeline = u32::from_str_radix(&name[..8], 16).ok()?;
		let segment = u64::from_str_radix(&name[8..], 16).ok()?;
		Some(Self { timeline, segment })
	}
}

impl std::fmt::Display for WalSegmentName {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:08X}{:016X}", self.timeline, self.segment)
	}
}

/// An archived segment file as found on disk.
#[derive(Debug, Clone)]
pub struct ArchivedSegment {
	pub name: String,
	pub parsed: Option<WalSegmentName>,
	pub path: PathBuf,
	pub compressed: bool,
	pub encrypted: bool,
	pub size: u64,
	pub modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct WalCleanupReport {
	pub deleted: usize,
	pub space_freed: u64,
	pub errors: Vec<Error>,
}

/// The end condition for WAL replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryTargetKind {
	Time(String),
	Xid(String),
	Lsn(String),
	Name(String),
	Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RecoveryAction {
	Promote,
	Pause,
	Shutdown,
}

impl RecoveryAction {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Promote => "promote",
			Self::Pause => "pause",
			Self::Shutdown => "shutdown",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryTimeline {
	Latest,
	Id(u32),
}

#[derive(Debug, Clone)]
pub struct RecoveryTarget {
	pub kind: RecoveryTargetKind,
	pub inclusive: bool,
	pub action: RecoveryAction,
	pub timeline: RecoveryTimeline,
}

impl RecoveryTarget {
	/// Exactly one end condition must be present.
	#[allow(clippy::too_many_arguments)]
	pub fn from_options(
		time: Option<String>,
		xid: Option<String>,
		lsn: Option<String>,
		name: Option<String>,
		immediate: bool,
		inclusive: bool,
		action: RecoveryAction,
		timeline: Option<String>,
	) -> Result<Self> {
		let mut kinds = Vec::new();
		if let Some(t) = time {
			kinds.push(RecoveryTargetKind::Time(t));
		}
		if let Some(x) = xid {
			kinds.push(RecoveryTargetKind::Xid(x));
		}
		if let Some(l) = lsn {
			kinds.push(RecoveryTargetKind::Lsn(l));
		}
		if let Some(n) = name {
			kinds.push(RecoveryTargetKind::Name(n));
		}
		if immediate {
			kinds.push(RecoveryTargetKind::Immediate);
		}
		if kinds.len() != 1 {
			return Err(Error::AmbiguousRecoveryTarget);
		}

		let timeline = match timeline.as_deref() {
			None | Some("latest") => RecoveryTimeline::Latest,
			Some(id) => RecoveryTimeline::Id(id.parse().map_err(|_| {
				Error::config(format!("timeline must be 'latest' or a number, got {id}"))
			})?),
		};

		Ok(Self {
			kind: kinds.remove(0),
			inclusive,
			action,
			timeline,
		})
	}
}

pub struct WalManager {
	archive_dir: PathBuf,
	key: Option<KeyMaterial>,
	cancel: CancellationToken,
}

impl WalManager {
	pub fn new(
		archive_dir: PathBuf,
		key: Option<KeyMaterial>,
		cancel: CancellationToken,
	) -> Self {
		Self {
			archive_dir,
			key,
			cancel,
		}
	}

	/// Archive one segment as `<name>[.gz][.enc]`, write-once.
	#[instrument(skip(self, source))]
	pub async fn archive(&self, source: &Path, wal_name: &str, compress: bool) -> Result<PathBuf> {
		if WalSegmentName::parse(wal_name).is_none() {
			// History and backup-label files come through the same
			// archive_command; they are archived but not segments.
			debug!(%wal_name, "archiving non-segment WAL file");
		}
		fs::create_dir_all(&self.archive_dir)
			.await
			.map_err(|e| Error::io("creating WAL archive dir", e))?;

		// Idempotency against whichever variant already exists.
		if let Some(existing) = self.find_variant(wal_name).await {
			let theirs = self.plaintext_sha(&existing).await?;
			let (ours, _) = hash_file(source).await?;
			return if theirs == ours {
				debug!(%wal_name, "segment already archived, identical");
				Ok(existing)
			} else {
				Err(Error::WalArchiveConflict {
					name: wal_name.into(),
				})
			};
		}

		let mut dest_name = wal_name.to_string();
		if compress {
			dest_name.push_str(".gz");
		}
		if self.key.is_some() {
			dest_name.push_str(".enc");
		}
		let dest = self.archive_dir.join(&dest_name);

		match &self.key {
			None => {
				let gzip = compress.then_some(6);
				pipeline::copy_to_file(source, gzip, &dest, &self.cancel).await?;
			}
			Some(key) => {
				// Segments are bounded (16 MiB by default); transform in
				// memory, then land atomically.
				let plain = fs::read(source)
					.await
					.map_err(|e| Error::io(format!("reading {}", source.display()), e))?;
				let body = if compress {
					gzip_bytes(&plain, 6)?
				} else {
					plain
				};
				let frame = crypto::seal(&body, key)?;
				write_atomically(&dest, &frame).await?;
			}
		}

		info!(%wal_name, dest = %dest.display(), "WAL segment archived");
		Ok(dest)
	}

	/// Fetch `%f` into `%p`, reversing encryption and compression.
	#[instrument(skip(self))]
	pub async fn fetch(&self, wal_name: &str, dest: &Path) -> Result<()> {
		let source = self.find_variant(wal_name).await.ok_or_else(|| {
			Error::io(
				format!("WAL segment {wal_name} not in archive"),
				std::io::Error::from(std::io::ErrorKind::NotFound),
			)
		})?;

		let name = source.file_name().unwrap_or_default().to_string_lossy();
		let encrypted = name.ends_with(".enc");
		let compressed = name.trim_end_matches(".enc").ends_with(".gz");

		let mut body = fs::read(&source)
			.await
			.map_err(|e| Error::io(format!("reading {}", source.display()), e))?;
		if encrypted {
			let key = self.key.as_ref().ok_or_else(|| {
				Error::crypto("segment is encrypted but no key is configured")
			})?;
			body = crypto::open(&body, key)?;
		}
		if compressed {
			body = gunzip_bytes(&body)?;
		}

		write_atomically(dest, &body).await?;
		debug!(%wal_name, dest = %dest.display(), "WAL segment fetched");
		Ok(())
	}

	/// All archived files, segments sorted by name (chronological within a
	/// timeline), non-segment files last.
	pub async fn list(&self) -> Result<Vec<ArchivedSegment>> {
		let mut entries = fs::read_dir(&self.archive_dir)
			.await
			.map_err(|e| Error::io("reading WAL archive dir", e))?;

		let mut segments = Vec::new();
		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| Error::io("reading WAL archive dir", e))?
		{
			let file_name = entry.file_name().to_string_lossy().into_owned();
			let encrypted = file_name.ends_with(".enc");
			let trimmed = file_name.trim_end_matches(".enc");
			let compressed = trimmed.ends_with(".gz");
			let name = trimmed.trim_end_matches(".gz").to_string();

			let Ok(meta) = entry.metadata().await else {
				continue;
			};
			if !meta.is_file() {
				continue;
			}

			segments.push(ArchivedSegment {
				parsed: WalSegmentName::parse(&name),
				name,
				path: entry.path(),
				compressed,
				encrypted,
				size: meta.len(),
				modified: meta
					.modified()
					.map(DateTime::<Utc>::from)
					.unwrap_or_else(|_| Utc::now()),
			});
		}

		segments.sort_by(|a, b| {
			a.parsed
				.is_none()
				.cmp(&b.parsed.is_none())
				.then_with(|| a.name.cmp(&b.name))
		});
		Ok(segments)
	}

	/// Delete segments strictly older than the cutoff, never the newest.
	#[instrument(skip(self))]
	pub async fn cleanup(&self, retention_days: u32, now: DateTime<Utc>) -> Result<WalCleanupReport> {
		let segments = self.list().await?;
		let newest = segments
			.iter()
			.filter(|s| s.parsed.is_some())
			.map(|s| s.name.clone())
			.max();

		let cutoff = now - Duration::days(i64::from(retention_days));
		let mut report = WalCleanupReport::default();

		for segment in segments {
			if segment.parsed.is_none() {
				continue;
			}
			if Some(&segment.name) == newest.as_ref() {
				continue;
			}
			if segment.modified >= cutoff {
				continue;
			}

			match fs::remove_file(&segment.path).await {
				Ok(()) => {
					report.deleted += 1;
					report.space_freed += segment.size;
				}
				Err(e) => report.errors.push(Error::io(
					format!("deleting {}", segment.path.display()),
					e,
				)),
			}
		}

		info!(deleted = report.deleted, freed = report.space_freed, "WAL cleanup done");
		Ok(report)
	}

	/// Emit the recovery driver file and `recovery.signal` into `data_dir`.
	///
	/// The driver file is not included automatically; point
	/// `postgresql.conf` at it or copy its lines into
	/// `postgresql.auto.conf`.
	#[instrument(skip(self, target))]
	pub async fn write_recovery_driver(
		&self,
		data_dir: &Path,
		target: &RecoveryTarget,
	) -> Result<PathBuf> {
		let exe = std::env::current_exe()
			.ok()
			.map(|p| p.display().to_string())
			.unwrap_or_else(|| "dbbak".into());

		let mut driver = format!(
			"restore_command = '{exe} wal fetch %f %p --archive-dir {}'\n",
			self.archive_dir.display()
		);
		match &target.kind {
			RecoveryTargetKind::Time(t) => {
				driver.push_str(&format!("recovery_target_time = '{t}'\n"));
			}
			RecoveryTargetKind::Xid(x) => {
				driver.push_str(&format!("recovery_target_xid = '{x}'\n"));
			}
			RecoveryTargetKind::Lsn(l) => {
				driver.push_str(&format!("recovery_target_lsn = '{l}'\n"));
			}
			RecoveryTargetKind::Name(n) => {
				driver.push_str(&format!("recovery_target_name = '{n}'\n"));
			}
			RecoveryTargetKind::Immediate => {
				driver.push_str("recovery_target = 'immediate'\n");
			}
		}
		driver.push_str(&format!(
			"recovery_target_inclusive = {}\n",
			if target.inclusive { "on" } else { "off" }
		));
		driver.push_str(&format!(
			"recovery_target_action = {}\n",
			target.action.as_str()
		));
		driver.push_str(&format!(
			"recovery_target_timeline = '{}'\n",
			match &target.timeline {
				RecoveryTimeline::Latest => "latest".to_string(),
				RecoveryTimeline::Id(id) => id.to_string(),
			}
		));

		let path = data_dir.join("dbbak.recovery.conf");
		write_atomically(&path, driver.as_bytes()).await?;

		let signal = data_dir.join("recovery.signal");
		if let Err(e) = fs::File::create(&signal).await {
			warn!("could not touch recovery.signal: {e}");
		}

		info!(driver = %path.display(), "recovery driver written");
		Ok(path)
	}

	/// Existing archived variant of a segment, covering all suffix
	/// combinations.
	async fn find_variant(&self, wal_name: &str) -> Option<PathBuf> {
		for suffix in ["", ".gz", ".enc", ".gz.enc"] {
			let candidate = self.archive_dir.join(format!("{wal_name}{suffix}"));
			if fs::metadata(&candidate).await.is_ok() {
				return Some(candidate);
			}
		}
		None
	}

	/// SHA-256 of an archived file after reversing its transforms.
	async fn plaintext_sha(&self, path: &Path) -> Result<String> {
		let name = path.file_name().unwrap_or_default().to_string_lossy();
		let encrypted = name.ends_with(".enc");
		let compressed = name.trim_end_matches(".enc").ends_with(".gz");

		if !encrypted && !compressed {
			return Ok(hash_file(path).await?.0);
		}

		let mut body = fs::read(path)
			.await
			.map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
		if encrypted {
			let key = self.key.as_ref().ok_or_else(|| {
				Error::crypto("segment is encrypted but no key is configured")
			})?;
			body = crypto::open(&body, key)?;
		}
		if compressed {
			body = gunzip_bytes(&body)?;
		}

		use sha2::{Digest, Sha256};
		Ok(hex::encode(Sha256::digest(&body)))
	}
}

fn gzip_bytes(data: &[u8], level: u32) -> Result<Vec<u8>> {
	use std::io::Write;
	let mut encoder =
		flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level));
	encoder
		.write_all(data)
		.and_then(|()| encoder.finish())
		.map_err(|e| Error::Compressor { source: e })
}

fn gunzip_bytes(data: &[u8]) -> Result<Vec<u8>> {
	use std::io::Read;
	let mut decoder = flate2::read::GzDecoder::new(data);
	let mut out = Vec::new();
	decoder
		.read_to_end(&mut out)
		.map_err(|e| Error::Compressor { source: e })?;
	Ok(out)
}

async fn write_atomically(dest: &Path, body: &[u8]) -> Result<()> {
	let tmp = {
		let mut name = dest.as_os_str().to_owned();
		name.push(".part");
		PathBuf::from(name)
	};
	let write = async {
		let mut file = fs::File::create(&tmp).await?;
		file.write_all(body).await?;
		file.sync_all().await?;
		fs::rename(&tmp, dest).await
	};
	if let Err(source) = write.await {
		let _ = fs::remove_file(&tmp).await;
		return Err(Error::SinkIo {
			path: dest.into(),
			source,
		});
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn manager(dir: &Path, key: Option<KeyMaterial>) -> WalManager {
		WalManager::new(dir.to_path_buf(), key, CancellationToken::new())
	}

	#[test]
	fn segment_names_round_trip() {
		let name = WalSegmentName::parse("000000010000000000000042").unwrap();
		assert_eq!(name.timeline, 1);
		assert_eq!(name.segment, 0x42);
		assert_eq!(name.to_string(), "000000010000000000000042");

		assert!(WalSegmentName::parse("too-short").is_none());
		assert!(WalSegmentName::parse("00000001000000000000004G").is_none());
	}

	#[test]
	fn lexicographic_order_is_chronological() {
		let a = WalSegmentName::parse("000000010000000000000001").unwrap();
		let b = WalSegmentName::parse("0000000100000000000000FF").unwrap();
		let c = WalSegmentName::parse("000000020000000000000001").unwrap();
		assert!(a < b && b < c);
		assert!(a.to_string() < b.to_string() && b.to_string() < c.to_string());
	}

	#[tokio::test]
	async fn archive_is_idempotent_and_conflicts_on_divergence() {
		let dir = tempfile::tempdir().unwrap();
		let wal = dir.path().join("seg");
		fs::write(&wal, vec![0x1u8; 4096]).await.unwrap();

		let archive_dir = dir.path().join("archive");
		let manager = manager(&archive_dir, None);

		let first = manager
			.archive(&wal, "000000010000000000000001", true)
			.await
			.unwrap();
		assert!(first.ends_with("000000010000000000000001.gz"));

		// Same bytes again: success, still exactly one file.
		manager
			.archive(&wal, "000000010000000000000001", true)
			.await
			.unwrap();
		assert_eq!(std::fs::read_dir(&archive_dir).unwrap().count(), 1);

		// Different bytes: conflict.
		fs::write(&wal, vec![0x2u8; 4096]).await.unwrap();
		let err = manager
			.archive(&wal, "000000010000000000000001", true)
			.await
			.unwrap_err();
		assert!(matches!(err, Error::WalArchiveConflict { .. }));
	}

	#[tokio::test]
	async fn fetch_reverses_compression_and_encryption() {
		let dir = tempfile::tempdir().unwrap();
		let wal = dir.path().join("seg");
		let payload = (0..=255u8).cycle().take(32 * 1024).collect::<Vec<_>>();
		fs::write(&wal, &payload).await.unwrap();

		let archive_dir = dir.path().join("archive");
		let key = KeyMaterial::Raw([9u8; 32]);
		let manager = manager(&archive_dir, Some(key));

		let archived = manager
			.archive(&wal, "000000010000000000000007", true)
			.await
			.unwrap();
		assert!(archived.ends_with("000000010000000000000007.gz.enc"));

		let fetched = dir.path().join("restored");
		manager
			.fetch("000000010000000000000007", &fetched)
			.await
			.unwrap();
		assert_eq!(fs::read(&fetched).await.unwrap(), payload);
	}

	#[tokio::test]
	async fn cleanup_never_touches_the_newest() {
		let dir = tempfile::tempdir().unwrap();
		let archive_dir = dir.path().join("archive");
		fs::create_dir_all(&archive_dir).await.unwrap();
		for n in 1..=3u8 {
			fs::write(
				archive_dir.join(format!("0000000100000000000000{n:02}")),
				vec![n; 128],
			)
			.await
			.unwrap();
		}

		let manager = manager(&archive_dir, None);
		// Everything is "old" relative to a far-future now.
		let report = manager
			.cleanup(1, Utc::now() + Duration::days(30))
			.await
			.unwrap();
		assert_eq!(report.deleted, 2);

		let remaining: Vec<String> = std::fs::read_dir(&archive_dir)
			.unwrap()
			.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
			.collect();
		assert_eq!(remaining, vec!["000000010000000000000003".to_string()]);
	}

	#[test]
	fn exactly_one_recovery_target() {
		let err = RecoveryTarget::from_options(
			Some("2026-01-15 14:30:00".into()),
			Some("1234".into()),
			None,
			None,
			false,
			true,
			RecoveryAction::Promote,
			None,
		)
		.unwrap_err();
		assert!(matches!(err, Error::AmbiguousRecoveryTarget));

		let err = RecoveryTarget::from_options(
			None,
			None,
			None,
			None,
			false,
			true,
			RecoveryAction::Promote,
			None,
		)
		.unwrap_err();
		assert!(matches!(err, Error::AmbiguousRecoveryTarget));
	}

	#[tokio::test]
	async fn recovery_driver_contents() {
		let dir = tempfile::tempdir().unwrap();
		let archive_dir = dir.path().join("walarchive");
		let data_dir = dir.path().join("data");
		fs::create_dir_all(&data_dir).await.unwrap();

		let target = RecoveryTarget::from_options(
			Some("2026-01-15 14:30:00".into()),
			None,
			None,
			None,
			false,
			true,
			RecoveryAction::Promote,
			Some("latest".into()),
		)
		.unwrap();

		let manager = manager(&archive_dir, None);
		let path = manager
			.write_recovery_driver(&data_dir, &target)
			.await
			.unwrap();

		let driver = std::fs::read_to_string(&path).unwrap();
		assert!(driver.contains("recovery_target_time = '2026-01-15 14:30:00'"));
		assert!(driver.contains("recovery_target_inclusive = on"));
		assert!(driver.contains("recovery_target_action = promote"));
		assert!(driver.contains("recovery_target_timeline = 'latest'"));
		assert!(driver.contains("wal fetch %f %p --archive-dir"));
		assert!(driver.contains("%f %p"));
		assert!(data_dir.join("recovery.signal").exists());
	}
}
