//! Archive format registry: filename grammar, weak (name-based) and strong
//! (content-based) format detection.

use std::{fmt, fs::File, io::Read, path::Path};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Database engine a backup belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
	Postgres,
	Mysql,
	Mariadb,
}

impl Engine {
	pub fn default_port(self) -> u16 {
		match self {
			Self::Postgres => 5432,
			Self::Mysql | Self::Mariadb => 3306,
		}
	}

	/// MariaDB shares the MySQL wire protocol and tool set.
	pub fn is_mysql_family(self) -> bool {
		matches!(self, Self::Mysql | Self::Mariadb)
	}

	pub fn required_tools(self) -> &'static [&'static str] {
		match self {
			Self::Postgres => &["pg_dump", "pg_restore", "pg_dumpall", "psql"],
			Self::Mysql | Self::Mariadb => &["mysqldump", "mysql"],
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Postgres => "postgres",
			Self::Mysql => "mysql",
			Self::Mariadb => "mariadb",
		}
	}
}

impl fmt::Display for Engine {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The closed set of archive formats this tool produces and consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
	PgDumpCustom,
	PgDumpCustomGz,
	PgSql,
	PgSqlGz,
	MysqlSql,
	MysqlSqlGz,
	ClusterTarGz,
}

/// First bytes of a pg_dump custom-format archive.
pub const PGDMP_MAGIC: &[u8; 5] = b"PGDMP";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

impl ArchiveFormat {
	/// Canonical producer extension, without a leading dot.
	pub fn extension(self) -> &'static str {
		match self {
			Self::PgDumpCustom => "dump",
			Self::PgDumpCustomGz => "dump.gz",
			Self::PgSql | Self::MysqlSql => "sql",
			Self::PgSqlGz | Self::MysqlSqlGz => "sql.gz",
			Self::ClusterTarGz => "tar.gz",
		}
	}

	/// Whether the file carries an outer gzip layer.
	///
	/// Custom-format pg_dump archives may be internally compressed; that is
	/// not what this reports.
	pub fn is_compressed(self) -> bool {
		matches!(
			self,
			Self::PgDumpCustomGz | Self::PgSqlGz | Self::MysqlSqlGz | Self::ClusterTarGz
		)
	}

	pub fn is_cluster(self) -> bool {
		matches!(self, Self::ClusterTarGz)
	}

	pub fn engine(self) -> Engine {
		match self {
			Self::MysqlSql | Self::MysqlSqlGz => Engine::Mysql,
			_ => Engine::Postgres,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::PgDumpCustom => "pg_dump_custom",
			Self::PgDumpCustomGz => "pg_dump_custom_gz",
			Self::PgSql => "pg_sql",
			Self::PgSqlGz => "pg_sql_gz",
			Self::MysqlSql => "mysql_sql",
			Self::MysqlSqlGz => "mysql_sql_gz",
			Self::ClusterTarGz => "cluster_tar_gz",
		}
	}
}

impl fmt::Display for ArchiveFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Timestamp layout used in archive filenames, UTC, second precision.
pub const FILENAME_TS: &str = "%Y%m%d_%H%M%S";

/// Canonical filename for a single-database archive.
pub fn single_archive_name(database: &str, at: DateTime<Utc>, format: ArchiveFormat) -> String {
	format!(
		"db_{database}_{ts}.{ext}",
		ts = at.format(FILENAME_TS),
		ext = format.extension(),
	)
}

/// Canonical filename for a cluster archive.
pub fn cluster_archive_name(at: DateTime<Utc>) -> String {
	format!("cluster_{ts}.tar.gz", ts = at.format(FILENAME_TS))
}

/// Detect the archive format from the filename alone.
///
/// Suffixes are tried in priority order; the `mysql_sql` / `pg_sql`
/// ambiguity is resolved by a `mysql`/`mariadb` substring in the name and
/// defaults to PostgreSQL otherwise.
pub fn detect_from_name(name: &str) -> Result<ArchiveFormat> {
	let lower = name.to_ascii_lowercase();
	let mysql_hint = lower.contains("mysql") || lower.contains("mariadb");

	if lower.ends_with(".tar.gz") {
		Ok(ArchiveFormat::ClusterTarGz)
	} else if lower.ends_with(".dump.gz") {
		Ok(ArchiveFormat::PgDumpCustomGz)
	} else if lower.ends_with(".sql.gz") {
		Ok(if mysql_hint {
			ArchiveFormat::MysqlSqlGz
		} else {
			ArchiveFormat::PgSqlGz
		})
	} else if lower.ends_with(".dump") {
		Ok(ArchiveFormat::PgDumpCustom)
	} else if lower.ends_with(".sql") {
		Ok(if mysql_hint {
			ArchiveFormat::MysqlSql
		} else {
			ArchiveFormat::PgSql
		})
	} else {
		Err(Error::FormatUnknown { path: name.into() })
	}
}

/// Detect the archive format by reading the first bytes of the file.
///
/// Reads at most one small block; an outer gzip layer is decoded
/// transparently so that the probe sees up to 16 plaintext bytes. A `.dump`
/// (or `.dump.gz`) file that does not start with `PGDMP` is treated as SQL
/// text, which handles plain-format dumps misnamed `.dump`.
pub fn detect_from_file(path: &Path) -> Result<ArchiveFormat> {
	let name = path
		.file_name()
		.and_then(|n| n.to_str())
		.ok_or_else(|| Error::FormatUnknown { path: path.into() })?;
	let named = detect_from_name(name)?;

	if named.is_cluster() {
		return Ok(named);
	}

	let mut head = [0u8; 4096];
	let n = File::open(path)
		.and_then(|mut f| f.read(&mut head))
		.map_err(|source| Error::io(format!("probing {}", path.display()), source))?;
	let head = &head[..n];

	let mut probe = [0u8; 16];
	let probed = if head.starts_with(&GZIP_MAGIC) {
		// Decode just enough of the gzip stream to see the inner magic.
		let mut dec = flate2::read::GzDecoder::new(head);
		match dec.read(&mut probe) {
			Ok(n) => &probe[..n],
			Err(_) => &probe[..0],
		}
	} else {
		let n = head.len().min(16);
		probe[..n].copy_from_slice(&head[..n]);
		&probe[..n]
	};

	let is_custom = probed.starts_with(PGDMP_MAGIC);
	let gzipped = head.starts_with(&GZIP_MAGIC);

	Ok(match (named, is_custom, gzipped) {
		(ArchiveFormat::PgDumpCustom | ArchiveFormat::PgDumpCustomGz, true, true) => {
			ArchiveFormat::PgDumpCustomGz
		}
		(ArchiveFormat::PgDumpCustom | ArchiveFormat::PgDumpCustomGz, true, false) => {
			ArchiveFormat::PgDumpCustom
		}
		// Misnamed plain dumps: SQL text behind a .dump name.
		(ArchiveFormat::PgDumpCustom | ArchiveFormat::PgDumpCustomGz, false, true) => {
			ArchiveFormat::PgSqlGz
		}
		(ArchiveFormat::PgDumpCustom | ArchiveFormat::PgDumpCustomGz, false, false) => {
			ArchiveFormat::PgSql
		}
		(named, _, _) => named,
	})
}

/// Recover the logical database name from an archive filename.
///
/// Tolerant consumer parse: strips extensions in priority order, then
/// trailing 6- or 8-digit timestamp tokens, then the `db_` prefix. Returns
/// `None` for cluster archives and names with no database part.
pub fn parse_database_name(name: &str) -> Option<String> {
	let stem = strip_archive_extension(name);

	if stem.starts_with("cluster_") || stem == "cluster" {
		return None;
	}

	let trailing = Regex::new(r"_(\d{6}|\d{8})$").expect("BUG: filename regex invalid");
	let mut stem = stem;
	while let Some(m) = trailing.find(stem) {
		stem = &stem[..m.start()];
	}

	let stem = stem.strip_prefix("db_").unwrap_or(stem);
	if stem.is_empty() {
		None
	} else {
		Some(stem.to_string())
	}
}

/// Strip a recognised archive extension, longest first.
pub fn strip_archive_extension(name: &str) -> &str {
	for ext in [".tar.gz", ".dump.gz", ".sql.gz", ".dump", ".sql"] {
		if let Some(stem) = name.strip_suffix(ext) {
			return stem;
		}
	}
	name
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use chrono::TimeZone;

	use super::*;

	#[test]
	fn name_detection_priority() {
		assert_eq!(
			detect_from_name("cluster_20260115_120000.tar.gz").unwrap(),
			ArchiveFormat::ClusterTarGz
		);
		assert_eq!(
			detect_from_name("db_mydb_20260115_120000.dump.gz").unwrap(),
			ArchiveFormat::PgDumpCustomGz
		);
		assert_eq!(
			detect_from_name("db_mydb_20260115_120000.dump").unwrap(),
			ArchiveFormat::PgDumpCustom
		);
		assert_eq!(
			detect_from_name("db_mydb_20260115_120000.sql.gz").unwrap(),
			ArchiveFormat::PgSqlGz
		);
		assert_eq!(
			detect_from_name("db_shop_mysql_20260115_120000.sql.gz").unwrap(),
			ArchiveFormat::MysqlSqlGz
		);
		assert_eq!(
			detect_from_name("mariadb_users.sql").unwrap(),
			ArchiveFormat::MysqlSql
		);
		assert!(detect_from_name("notes.txt").is_err());
	}

	#[test]
	fn canonical_names_round_trip() {
		let at = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
		let name = single_archive_name("mydb", at, ArchiveFormat::PgDumpCustom);
		assert_eq!(name, "db_mydb_20260115_120000.dump");
		assert_eq!(parse_database_name(&name).as_deref(), Some("mydb"));

		let cluster = cluster_archive_name(at);
		assert_eq!(cluster, "cluster_20260115_120000.tar.gz");
		assert_eq!(parse_database_name(&cluster), None);
	}

	#[test]
	fn database_names_with_underscores_and_digits() {
		assert_eq!(
			parse_database_name("db_my_app_2024_20260115_120000.dump").as_deref(),
			Some("my_app_2024"),
		);
		// Tolerant of foreign names without the db_ prefix.
		assert_eq!(
			parse_database_name("legacy-export.sql").as_deref(),
			Some("legacy-export"),
		);
	}

	#[test]
	fn strong_detector_reads_pgdmp_magic() {
		let dir = tempfile::tempdir().unwrap();

		let custom = dir.path().join("a.dump");
		std::fs::write(&custom, b"PGDMP\x01\x0e\x00custom").unwrap();
		assert_eq!(
			detect_from_file(&custom).unwrap(),
			ArchiveFormat::PgDumpCustom
		);

		// Plain SQL misnamed .dump downgrades to SQL text.
		let misnamed = dir.path().join("b.dump");
		std::fs::write(&misnamed, b"--\n-- PostgreSQL database dump\n--\n").unwrap();
		assert_eq!(detect_from_file(&misnamed).unwrap(), ArchiveFormat::PgSql);
	}

	#[test]
	fn strong_detector_sees_through_gzip() {
		let dir = tempfile::tempdir().unwrap();

		let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(6));
		enc.write_all(b"PGDMP\x01\x0e\x00custom body").unwrap();
		let gz = enc.finish().unwrap();

		let path = dir.path().join("c.dump.gz");
		std::fs::write(&path, gz).unwrap();
		assert_eq!(
			detect_from_file(&path).unwrap(),
			ArchiveFormat::PgDumpCustomGz
		);

		let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(6));
		enc.write_all(b"SELECT 1;\n").unwrap();
		let gz = enc.finish().unwrap();
		let path = dir.path().join("d.dump.gz");
		std::fs::write(&path, gz).unwrap();
		assert_eq!(detect_from_file(&path).unwrap(), ArchiveFormat::PgSqlGz);
	}

	proptest::proptest! {
		// Canonicalising a name must not change what the detector sees.
		#[test]
		fn canonical_name_detection_is_stable(
			db in "[a-z][a-z0-9_]{0,24}",
			fmt_idx in 0usize..6,
		) {
			let format = [
				ArchiveFormat::PgDumpCustom,
				ArchiveFormat::PgDumpCustomGz,
				ArchiveFormat::PgSql,
				ArchiveFormat::PgSqlGz,
				ArchiveFormat::MysqlSql,
				ArchiveFormat::MysqlSqlGz,
			][fmt_idx];
			let at = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
			let name = single_archive_name(&db, at, format);
			let detected = detect_from_name(&name).unwrap();

			let canonical = single_archive_name(
				&parse_database_name(&name).unwrap(),
				at,
				detected,
			);
			proptest::prop_assert_eq!(detect_from_name(&canonical).unwrap(), detected);
		}
	}
}
