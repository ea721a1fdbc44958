//! Retention: reconcile an age limit with a floor count over local
//! directories and cloud prefixes.
//!
//! The newest `min_backups` archives are always kept, whatever their age;
//! only older-than-cutoff files beyond that floor are deleted, each with its
//! sidecar. Runs only after a successful backup commit, never concurrently
//! with one.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use tokio::fs;
use tracing::{debug, info, instrument};

use crate::{
	cloud::ObjectBackend,
	error::{Error, Result},
	format::detect_from_name,
	metadata::sidecar_path,
};

#[derive(Debug, Clone)]
pub struct RetentionParams {
	pub retention_days: u32,
	pub min_backups: u32,
	/// When set, only matching names are candidates; everything else is
	/// untouched and does not count against the floor.
	pub pattern: Option<glob::Pattern>,
}

#[derive(Debug, Default)]
pub struct RetentionReport {
	pub total: usize,
	pub kept: usize,
	pub deleted: usize,
	pub space_freed: u64,
	pub errors: Vec<Error>,
}

/// One deletion candidate, local or remote.
#[derive(Debug, Clone)]
struct Candidate {
	name: String,
	modified: DateTime<Utc>,
	size: u64,
}

/// Pure partition step: which of `candidates` fall to the age rule.
///
/// Returns indices to delete. `candidates` may arrive in any order.
fn partition(candidates: &mut Vec<Candidate>, params: &RetentionParams, now: DateTime<Utc>) -> Vec<usize> {
	candidates.sort_by(|a, b| b.modified.cmp(&a.modified).then(b.name.cmp(&a.name)));

	let cutoff = now - Duration::days(i64::from(params.retention_days));
	candidates
		.iter()
		.enumerate()
		.skip(params.min_backups as usize)
		.filter(|(_, c)| c.modified < cutoff)
		.map(|(i, _)| i)
		.collect()
}

fn is_candidate(name: &str, params: &RetentionParams) -> bool {
	if name.ends_with(".meta.json") || name.ends_with(".tmp") || name.ends_with(".part") {
		return false;
	}
	match &params.pattern {
		Some(pattern) => pattern.matches(name),
		None => detect_from_name(name).is_ok(),
	}
}

/// Sweep a local directory. `exclude` protects the archive that triggered
/// the sweep from its own retention run.
#[instrument(skip(params), fields(days = params.retention_days, min = params.min_backups))]
pub async fn sweep_dir(
	dir: &Path,
	params: &RetentionParams,
	now: DateTime<Utc>,
	exclude: Option<&Path>,
) -> Result<RetentionReport> {
	let mut entries = fs::read_dir(dir)
		.await
		.map_err(|e| Error::io(format!("reading {}", dir.display()), e))?;

	let mut candidates = Vec::new();
	while let Some(entry) = entries
		.next_entry()
		.await
		.map_err(|e| Error::io(format!("reading {}", dir.display()), e))?
	{
		let name = entry.file_name().to_string_lossy().into_owned();
		if !is_candidate(&name, params) {
			continue;
		}
		let Ok(meta) = entry.metadata().await else {
			continue;
		};
		if !meta.is_file() {
			continue;
		}
		let Ok(modified) = meta.modified() else {
			debug!(%name, "no modification time, skipping");
			continue;
		};
		candidates.push(Candidate {
			name,
			modified: DateTime::<Utc>::from(modified),
			size: meta.len(),
		});
	}

	let mut report = RetentionReport {
		total: candidates.len(),
		..Default::default()
	};

	let doomed = partition(&mut candidates, params, now);
	report.kept = report.total - doomed.len();

	for i in doomed {
		let candidate = &candidates[i];
		let path = dir.join(&candidate.name);
		if exclude.is_some_and(|keep| keep == path) {
			report.kept += 1;
			continue;
		}

		match fs::remove_file(&path).await {
			Ok(()) => {
				info!(archive = %path.display(), "retention deleted");
				report.deleted += 1;
				report.space_freed += candidate.size;
				remove_sidecar(&path, &mut report).await;
			}
			Err(e) => {
				report.kept += 1;
				report
					.errors
					.push(Error::io(format!("deleting {}", path.display()), e));
			}
		}
	}

	Ok(report)
}

async fn remove_sidecar(archive: &Path, report: &mut RetentionReport) {
	let sidecar = sidecar_path(archive);
	match fs::metadata(&sidecar).await {
		Ok(meta) => match fs::remove_file(&sidecar).await {
			Ok(()) => report.space_freed += meta.len(),
			Err(e) => report
				.errors
				.push(Error::io(format!("deleting {}", sidecar.display()), e)),
		},
		Err(_) => {}
	}
}

/// Sweep a cloud prefix with the same partitioning rules.
#[instrument(skip(backend, params), fields(days = params.retention_days, min = params.min_backups))]
pub async fn sweep_cloud(
	backend: &dyn ObjectBackend,
	prefix: &str,
	params: &RetentionParams,
	now: DateTime<Utc>,
) -> Result<RetentionReport> {
	let objects = backend.list(prefix).await?;

	let mut by_key: Vec<(String, Candidate)> = objects
		.into_iter()
		.filter_map(|o| {
			let name = o.key.rsplit('/').next().unwrap_or(&o.key).to_string();
			is_candidate(&name, params).then(|| {
				(
					o.key.clone(),
					Candidate {
						name,
						modified: o.modified,
						size: o.size,
					},
				)
			})
		})
		.collect();

	let mut candidates: Vec<Candidate> = by_key.iter().map(|(_, c)| c.clone()).collect();
	let mut report = RetentionReport {
		total: candidates.len(),
		..Default::default()
	};

	let doomed = partition(&mut candidates, params, now);
	report.kept = report.total - doomed.len();

	// Realign keys with the sorted candidate order.
	by_key.sort_by(|a, b| b.1.modified.cmp(&a.1.modified).then(b.1.name.cmp(&a.1.name)));

	for i in doomed {
		let (key, candidate) = &by_key[i];
		match backend.delete(key).await {
			Ok(()) => {
				info!(%key, "retention deleted");
				report.deleted += 1;
				report.space_freed += candidate.size;
				let _ = backend.delete(&format!("{key}.meta.json")).await;
			}
			Err(e) => {
				report.kept += 1;
				report.errors.push(e);
			}
		}
	}

	Ok(report)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn candidate(name: &str, age_days: i64, now: DateTime<Utc>) -> Candidate {
		Candidate {
			name: name.into(),
			modified: now - Duration::days(age_days),
			size: 100,
		}
	}

	#[test]
	fn age_and_floor_reconcile() {
		// Ages 1..80 days, 30-day cutoff, floor of 5.
		let now = Utc::now();
		let ages = [1, 10, 20, 25, 31, 40, 50, 60, 70, 80];
		let mut candidates: Vec<_> = ages
			.iter()
			.map(|d| candidate(&format!("db_a_{d}.dump"), *d, now))
			.collect();

		let params = RetentionParams {
			retention_days: 30,
			min_backups: 5,
			pattern: None,
		};
		let doomed = partition(&mut candidates, &params, now);

		let doomed_ages: Vec<i64> = doomed
			.iter()
			.map(|&i| (now - candidates[i].modified).num_days())
			.collect();
		assert_eq!(doomed_ages, vec![40, 50, 60, 70, 80]);
	}

	#[test]
	fn floor_beats_age() {
		let now = Utc::now();
		let mut candidates: Vec<_> = [100, 200, 300]
			.iter()
			.map(|d| candidate(&format!("db_a_{d}.dump"), *d, now))
			.collect();

		let params = RetentionParams {
			retention_days: 7,
			min_backups: 5,
			pattern: None,
		};
		assert!(partition(&mut candidates, &params, now).is_empty());
	}

	#[test]
	fn sidecars_and_scratch_are_not_candidates() {
		let params = RetentionParams {
			retention_days: 1,
			min_backups: 0,
			pattern: None,
		};
		assert!(!is_candidate("db_a_20260101_000000.dump.meta.json", &params));
		assert!(!is_candidate("db_a_20260101_000000.dump.part", &params));
		assert!(!is_candidate("random-notes.txt", &params));
		assert!(is_candidate("db_a_20260101_000000.dump", &params));
	}

	#[test]
	fn pattern_restricts_scope() {
		let params = RetentionParams {
			retention_days: 1,
			min_backups: 0,
			pattern: Some(glob::Pattern::new("db_legacy_*").unwrap()),
		};
		assert!(is_candidate("db_legacy_20260101_000000.dump", &params));
		assert!(!is_candidate("db_prod_20260101_000000.dump", &params));
	}

	#[tokio::test]
	async fn sweep_deletes_companions() {
		let dir = tempfile::tempdir().unwrap();
		for name in ["db_a_20260101_000000.dump", "db_b_20260102_000000.dump"] {
			std::fs::write(dir.path().join(name), b"PGDMP").unwrap();
			std::fs::write(dir.path().join(format!("{name}.meta.json")), b"{}").unwrap();
		}

		let params = RetentionParams {
			retention_days: 0,
			min_backups: 1,
			pattern: None,
		};
		// Everything is older than a zero-day cutoff; the floor saves one.
		let report = sweep_dir(
			dir.path(),
			&params,
			Utc::now() + Duration::seconds(5),
			None,
		)
		.await
		.unwrap();

		assert_eq!(report.total, 2);
		assert_eq!(report.deleted, 1);
		assert_eq!(report.kept, 1);
		assert!(report.errors.is_empty());

		let remaining: Vec<String> = std::fs::read_dir(dir.path())
			.unwrap()
			.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
			.collect();
		// The deleted archive took its sidecar with it.
		assert_eq!(remaining.len(), 2);
		assert!(remaining.iter().any(|n| n == "db_b_20260102_000000.dump"));
		assert!(remaining
			.iter()
			.any(|n| n == "db_b_20260102_000000.dump.meta.json"));
	}

	proptest::proptest! {
		#[test]
		fn floor_is_never_violated(
			ages in proptest::collection::vec(0i64..400, 0..40),
			days in 0u32..120,
			min in 0u32..20,
		) {
			let now = Utc::now();
			let mut candidates: Vec<_> = ages
				.iter()
				.enumerate()
				.map(|(i, d)| candidate(&format!("db_x_{i}.dump"), *d, now))
				.collect();
			let total = candidates.len();

			let params = RetentionParams { retention_days: days, min_backups: min, pattern: None };
			let doomed = partition(&mut candidates, &params, now);

			let kept = total - doomed.len();
			proptest::prop_assert!(kept >= total.min(min as usize));

			let cutoff = now - Duration::days(i64::from(days));
			for &i in &doomed {
				proptest::prop_assert!(candidates[i].modified < cutoff);
			}
		}
	}
}
