//! The streaming pipeline joining external dump/restore processes to
//! compression, hashing and file sinks.
//!
//! Stages run as concurrent tasks connected by bounded channels of [`Bytes`]
//! chunks, so the slowest stage throttles the whole chain. The hash tee sits
//! immediately before the sink: the digest it produces is the digest of the
//! bytes committed to disk. Sinks write to a temp sibling and only
//! fsync+rename once every upstream stage (including the external process)
//! has finished cleanly; any failure cancels the other stages, kills and
//! reaps the child, and removes the partial output before the first
//! non-cancellation error is returned.

use std::{
	ffi::OsString,
	io::Write,
	path::{Path, PathBuf},
	process::Stdio,
	time::Duration,
};

use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use sha2::{Digest, Sha256};
use tokio::{
	io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
	process::{Child, Command},
	sync::{mpsc, oneshot},
	task::JoinHandle,
	time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Chunk size for channel transfers.
const CHUNK: usize = 256 * 1024;

/// Channel depth; together with [`CHUNK`] this bounds each inter-stage
/// buffer to one compression block (4 MiB).
const DEPTH: usize = 16;

/// At most this much child stderr is forwarded to the logger per invocation.
const STDERR_CAP: usize = 64 * 1024;

/// Grace period between SIGTERM and SIGKILL when tearing a child down.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// A fully resolved external tool invocation.
///
/// Built by the database drivers; argv construction is deterministic and the
/// environment carries secrets (passwords) so they never appear in argv or
/// in logs.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
	pub program: OsString,
	pub args: Vec<OsString>,
	pub env: Vec<(OsString, OsString)>,
}

impl ToolInvocation {
	pub fn new(program: impl Into<OsString>) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
			env: Vec::new(),
		}
	}

	pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
		self.args.push(arg.into());
		self
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<OsString>,
	{
		self.args.extend(args.into_iter().map(Into::into));
		self
	}

	pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
		self.env.push((key.into(), value.into()));
		self
	}

	/// Short name for logs and errors.
	pub fn name(&self) -> String {
		Path::new(&self.program)
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_else(|| self.program.to_string_lossy().into_owned())
	}

	fn command(&self) -> Command {
		let mut cmd = Command::new(&self.program);
		cmd.args(&self.args);
		for (k, v) in &self.env {
			cmd.env(k, v);
		}
		cmd.kill_on_drop(true);
		cmd
	}
}

/// Outcome of a pipeline run that produced a file.
#[derive(Debug, Clone)]
pub struct PipelineReport {
	/// Hex SHA-256 of the committed file bytes.
	pub sha256: String,
	/// Size of the committed file.
	pub size_bytes: u64,
	/// Bytes consumed from the source, before compression.
	pub bytes_read: u64,
}

/// Run `tool`, streaming its stdout through optional gzip into `dest`.
///
/// `gzip` is the compression level; `None` skips the stage (for producers
/// that already compress internally).
pub async fn dump_to_file(
	tool: &ToolInvocation,
	gzip: Option<u32>,
	dest: &Path,
	cancel: &CancellationToken,
) -> Result<PipelineReport> {
	let mut child = spawn(tool, Stdio::null(), Stdio::piped())?;
	let stdout = child.stdout.take().expect("BUG: stdout requested piped");

	let cancel = cancel.child_token();
	let (tx, rx) = mpsc::channel::<Bytes>(DEPTH);

	let reader = spawn_reader(stdout, tx, cancel.clone());
	let stderr_task = spawn_stderr_logger(&mut child, tool.name());
	let (sink, commit) = spawn_sink(rx, gzip, dest.to_owned(), cancel.clone());

	let read = reader.await.expect("BUG: reader task panicked");
	let status = wait_for_exit(&mut child, tool, &cancel).await;
	let stderr_tail = stderr_task.await.expect("BUG: stderr task panicked");

	let upstream = read.and(match status {
		Ok(()) => Ok(()),
		Err(Error::ToolExited { tool, status, .. }) => Err(Error::ToolExited {
			tool,
			status,
			stderr_tail: stderr_tail.clone(),
		}),
		Err(e) => Err(e),
	});

	finish_sink(sink, commit, upstream, &cancel).await
}

/// A sink whose source is caller-fed chunks (sample backups).
///
/// Clone [`StreamSink::tx`] to feed plaintext; the file is only committed
/// when [`StreamSink::finish`] is called with a clean upstream result.
pub struct StreamSink {
	pub tx: mpsc::Sender<Bytes>,
	sink: JoinHandle<Result<PipelineReport>>,
	commit: oneshot::Sender<bool>,
	cancel: CancellationToken,
}

impl StreamSink {
	pub fn new(gzip: Option<u32>, dest: &Path, cancel: &CancellationToken) -> Self {
		let cancel = cancel.child_token();
		let (tx, rx) = mpsc::channel::<Bytes>(DEPTH);
		let (sink, commit) = spawn_sink(rx, gzip, dest.to_owned(), cancel.clone());
		Self {
			tx,
			sink,
			commit,
			cancel,
		}
	}

	/// Close the stream and commit (or, on upstream failure, delete the
	/// partial output and propagate the error).
	pub async fn finish(self, upstream: Result<()>) -> Result<PipelineReport> {
		let Self {
			tx,
			sink,
			commit,
			cancel,
		} = self;
		drop(tx);
		finish_sink(sink, commit, upstream, &cancel).await
	}
}

/// Run `tool` and forward its stdout into an existing stream.
///
/// Used to prepend a schema-only dump to a sampled data section sharing one
/// sink.
pub async fn tool_into_stream(
	tool: &ToolInvocation,
	tx: mpsc::Sender<Bytes>,
	cancel: &CancellationToken,
) -> Result<u64> {
	let mut child = spawn(tool, Stdio::null(), Stdio::piped())?;
	let stdout = child.stdout.take().expect("BUG: stdout requested piped");

	let cancel = cancel.child_token();
	let reader = spawn_reader(stdout, tx, cancel.clone());
	let stderr_task = spawn_stderr_logger(&mut child, tool.name());

	let read = reader.await.expect("BUG: reader task panicked");
	let status = wait_for_exit(&mut child, tool, &cancel).await;
	let stderr_tail = stderr_task.await.expect("BUG: stderr task panicked");

	match status {
		Ok(()) => read,
		Err(Error::ToolExited { tool, status, .. }) => Err(Error::ToolExited {
			tool,
			status,
			stderr_tail,
		}),
		Err(e) => Err(e),
	}
}

/// Feed a file (optionally gunzipping) into `tool`'s stdin and wait for it.
pub async fn file_to_tool(
	src: &Path,
	gunzip: bool,
	tool: &ToolInvocation,
	cancel: &CancellationToken,
) -> Result<()> {
	let mut child = spawn(tool, Stdio::piped(), Stdio::null())?;
	let mut stdin = child.stdin.take().expect("BUG: stdin requested piped");

	let cancel = cancel.child_token();
	let (tx, mut rx) = mpsc::channel::<Bytes>(DEPTH);
	let reader = spawn_file_reader(src.to_owned(), gunzip, tx, cancel.clone());
	let stderr_task = spawn_stderr_logger(&mut child, tool.name());

	let mut feed_err = None;
	while let Some(chunk) = rx.recv().await {
		if let Err(e) = stdin.write_all(&chunk).await {
			// Child went away; its exit status tells the real story.
			feed_err = Some(e);
			break;
		}
	}
	drop(stdin);
	// Unblock the reader if we bailed out mid-stream.
	drop(rx);

	let read = reader.await.expect("BUG: reader task panicked");
	let status = wait_for_exit(&mut child, tool, &cancel).await;
	let stderr_tail = stderr_task.await.expect("BUG: stderr task panicked");

	match status {
		Ok(()) => {
			read?;
			if let Some(e) = feed_err {
				return Err(Error::io(format!("feeding {}", tool.name()), e));
			}
			Ok(())
		}
		Err(Error::ToolExited { tool, status, .. }) => Err(Error::ToolExited {
			tool,
			status,
			stderr_tail,
		}),
		Err(e) => Err(e),
	}
}

/// Run a tool to completion with no stdio plumbing beyond the stderr cap.
///
/// Used for dump modes where the tool writes its output file itself
/// (pg_dump custom format with `--file`).
pub async fn run_tool(tool: &ToolInvocation, cancel: &CancellationToken) -> Result<()> {
	let mut child = spawn(tool, Stdio::null(), Stdio::null())?;
	let stderr_task = spawn_stderr_logger(&mut child, tool.name());

	let cancel = cancel.child_token();
	let status = wait_for_exit(&mut child, tool, &cancel).await;
	let stderr_tail = stderr_task.await.expect("BUG: stderr task panicked");

	match status {
		Err(Error::ToolExited { tool, status, .. }) => Err(Error::ToolExited {
			tool,
			status,
			stderr_tail,
		}),
		other => other,
	}
}

/// Copy a file through optional gzip into `dest` (WAL archival).
pub async fn copy_to_file(
	src: &Path,
	gzip: Option<u32>,
	dest: &Path,
	cancel: &CancellationToken,
) -> Result<PipelineReport> {
	let cancel = cancel.child_token();
	let (tx, rx) = mpsc::channel::<Bytes>(DEPTH);
	let reader = spawn_file_reader(src.to_owned(), false, tx, cancel.clone());
	let (sink, commit) = spawn_sink(rx, gzip, dest.to_owned(), cancel.clone());

	let upstream = reader.await.expect("BUG: reader task panicked");
	finish_sink(sink, commit, upstream.map(|_| ()), &cancel).await
}

fn spawn(tool: &ToolInvocation, stdin: Stdio, stdout: Stdio) -> Result<Child> {
	let mut cmd = tool.command();
	cmd.stdin(stdin).stdout(stdout).stderr(Stdio::piped());
	debug!(tool = %tool.name(), args = ?tool.args, "spawning");
	cmd.spawn().map_err(|source| Error::ToolSpawnFailed {
		tool: tool.name(),
		source,
	})
}

/// Pump child stdout into the chain, honouring cancellation.
fn spawn_reader(
	mut stdout: tokio::process::ChildStdout,
	tx: mpsc::Sender<Bytes>,
	cancel: CancellationToken,
) -> JoinHandle<Result<u64>> {
	tokio::spawn(async move {
		let mut total = 0u64;
		let mut buf = vec![0u8; CHUNK];
		loop {
			let n = tokio::select! {
				_ = cancel.cancelled() => return Err(Error::Cancelled),
				res = stdout.read(&mut buf) => {
					res.map_err(|e| Error::io("reading dump output", e))?
				}
			};
			if n == 0 {
				break;
			}
			total += n as u64;
			let chunk = Bytes::copy_from_slice(&buf[..n]);
			tokio::select! {
				_ = cancel.cancelled() => return Err(Error::Cancelled),
				sent = tx.send(chunk) => {
					if sent.is_err() {
						// Sink died; stop the child so it observes EPIPE
						// instead of blocking on a full pipe. The sink's
						// own error wins.
						cancel.cancel();
						return Ok(total);
					}
				}
			}
		}
		trace!(bytes = total, "source drained");
		Ok(total)
	})
}

/// Read a file (optionally through gunzip) into the chain.
fn spawn_file_reader(
	src: PathBuf,
	gunzip: bool,
	tx: mpsc::Sender<Bytes>,
	cancel: CancellationToken,
) -> JoinHandle<Result<u64>> {
	tokio::task::spawn_blocking(move || {
		use std::io::Read;

		let file = std::fs::File::open(&src)
			.map_err(|e| Error::io(format!("opening {}", src.display()), e))?;
		let mut reader: Box<dyn Read> = if gunzip {
			Box::new(flate2::read::GzDecoder::new(file))
		} else {
			Box::new(file)
		};

		let mut total = 0u64;
		let mut buf = vec![0u8; CHUNK];
		loop {
			if cancel.is_cancelled() {
				return Err(Error::Cancelled);
			}
			let n = reader
				.read(&mut buf)
				.map_err(|e| Error::io(format!("reading {}", src.display()), e))?;
			if n == 0 {
				break;
			}
			total += n as u64;
			if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
				return Ok(total);
			}
		}
		Ok(total)
	})
}

/// Forward child stderr to the logger, capped, keeping a short tail for
/// error context.
fn spawn_stderr_logger(child: &mut Child, tool: String) -> JoinHandle<String> {
	let stderr = child.stderr.take().expect("BUG: stderr requested piped");
	tokio::spawn(async move {
		let mut lines = BufReader::new(stderr).lines();
		let mut logged = 0usize;
		let mut tail = std::collections::VecDeque::with_capacity(8);
		while let Ok(Some(line)) = lines.next_line().await {
			if logged < STDERR_CAP {
				logged += line.len();
				debug!(tool = %tool, "{line}");
				if logged >= STDERR_CAP {
					warn!(tool = %tool, "stderr output truncated");
				}
			}
			if tail.len() == 8 {
				tail.pop_front();
			}
			tail.push_back(line);
		}
		tail.into_iter().collect::<Vec<_>>().join("\n")
	})
}

/// Wait for the child, killing it (SIGTERM, then SIGKILL after a grace
/// period) if cancellation fires first. The exit status is the
/// authoritative success signal.
async fn wait_for_exit(
	child: &mut Child,
	tool: &ToolInvocation,
	cancel: &CancellationToken,
) -> Result<()> {
	let status = tokio::select! {
		status = child.wait() => {
			status.map_err(|e| Error::io(format!("waiting for {}", tool.name()), e))?
		}
		_ = cancel.cancelled() => {
			kill_with_grace(child).await;
			return Err(Error::Cancelled);
		}
	};

	if status.success() {
		Ok(())
	} else {
		Err(Error::ToolExited {
			tool: tool.name(),
			status: status.code().unwrap_or(-1),
			stderr_tail: String::new(),
		})
	}
}

/// SIGTERM, wait out the grace period, then SIGKILL and reap.
pub(crate) async fn kill_with_grace(child: &mut Child) {
	#[cfg(unix)]
	if let Some(pid) = child.id() {
		// SAFETY: pid comes from a live child we own.
		unsafe {
			libc::kill(pid as libc::pid_t, libc::SIGTERM);
		}
		if timeout(KILL_GRACE, child.wait()).await.is_ok() {
			return;
		}
		warn!(pid, "child ignored SIGTERM, sending SIGKILL");
	}

	let _ = child.kill().await;
}

/// Sink stage: optional gzip, hash tee, temp file, then commit-on-signal.
///
/// The sink never renames on its own: it reports readiness and waits for
/// the supervisor's verdict, so a failed upstream stage can never publish
/// a partial archive.
fn spawn_sink(
	mut rx: mpsc::Receiver<Bytes>,
	gzip: Option<u32>,
	dest: PathBuf,
	cancel: CancellationToken,
) -> (JoinHandle<Result<PipelineReport>>, oneshot::Sender<bool>) {
	let (commit_tx, commit_rx) = oneshot::channel::<bool>();

	let handle = tokio::task::spawn_blocking(move || {
		let tmp = temp_path(&dest);
		let result = write_sink(&mut rx, gzip, &tmp, &cancel, commit_rx, &dest);
		if result.is_err() {
			let _ = std::fs::remove_file(&tmp);
		}
		result
	});

	(handle, commit_tx)
}

fn write_sink(
	rx: &mut mpsc::Receiver<Bytes>,
	gzip: Option<u32>,
	tmp: &Path,
	cancel: &CancellationToken,
	commit_rx: oneshot::Receiver<bool>,
	dest: &Path,
) -> Result<PipelineReport> {
	let file = std::fs::File::create(tmp).map_err(|source| Error::SinkIo {
		path: tmp.into(),
		source,
	})?;

	let hasher = HashWriter::new(file);
	let mut out: Box<dyn FinishWrite> = match gzip {
		Some(level) => Box::new(GzEncoder::new(hasher, Compression::new(level))),
		None => Box::new(hasher),
	};

	let mut bytes_read = 0u64;
	while let Some(chunk) = rx.blocking_recv() {
		if cancel.is_cancelled() {
			return Err(Error::Cancelled);
		}
		bytes_read += chunk.len() as u64;
		out.write_all(&chunk).map_err(|e| sink_or_compressor(gzip, tmp, e))?;
	}

	let hasher = out
		.finish_inner()
		.map_err(|e| sink_or_compressor(gzip, tmp, e))?;
	let (file, sha256, size_bytes) = hasher.finish();
	file.sync_all().map_err(|source| Error::SinkIo {
		path: tmp.into(),
		source,
	})?;
	drop(file);

	// Upstream verdict: only a clean chain may publish.
	match commit_rx.blocking_recv() {
		Ok(true) => {}
		Ok(false) | Err(_) => return Err(Error::Cancelled),
	}

	std::fs::rename(tmp, dest).map_err(|source| Error::SinkIo {
		path: dest.into(),
		source,
	})?;

	Ok(PipelineReport {
		sha256,
		size_bytes,
		bytes_read,
	})
}

fn sink_or_compressor(gzip: Option<u32>, tmp: &Path, e: std::io::Error) -> Error {
	if gzip.is_some() {
		Error::Compressor { source: e }
	} else {
		Error::SinkIo {
			path: tmp.into(),
			source: e,
		}
	}
}

/// Resolve the chain: signal the sink to commit or abort, then prefer the
/// first upstream error over a cancellation report from the sink.
async fn finish_sink(
	sink: JoinHandle<Result<PipelineReport>>,
	commit: oneshot::Sender<bool>,
	upstream: Result<()>,
	cancel: &CancellationToken,
) -> Result<PipelineReport> {
	let ok = upstream.is_ok() && !cancel.is_cancelled();
	if !ok {
		cancel.cancel();
	}
	let _ = commit.send(ok);

	let sunk = sink.await.expect("BUG: sink task panicked");
	match (upstream, sunk) {
		(Ok(_), Ok(report)) => Ok(report),
		// The first non-cancellation error wins.
		(Err(Error::Cancelled), Err(e)) if !matches!(e, Error::Cancelled) => Err(e),
		(Err(e), _) => Err(e),
		(Ok(_), Err(e)) => Err(e),
	}
}

fn temp_path(dest: &Path) -> PathBuf {
	let mut name = dest.as_os_str().to_owned();
	name.push(".part");
	name.into()
}

/// A writer that hashes everything it forwards.
struct HashWriter {
	inner: std::fs::File,
	hasher: Sha256,
	written: u64,
}

impl HashWriter {
	fn new(inner: std::fs::File) -> Self {
		Self {
			inner,
			hasher: Sha256::new(),
			written: 0,
		}
	}

	fn finish(self) -> (std::fs::File, String, u64) {
		(self.inner, hex::encode(self.hasher.finalize()), self.written)
	}
}

impl Write for HashWriter {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		let n = self.inner.write(buf)?;
		self.hasher.update(&buf[..n]);
		self.written += n as u64;
		Ok(n)
	}

	fn flush(&mut self) -> std::io::Result<()> {
		self.inner.flush()
	}
}

/// Object-safe "finish and hand back the hash tee" for the optional gzip
/// layer.
trait FinishWrite: Write + Send {
	fn finish_inner(self: Box<Self>) -> std::io::Result<HashWriter>;
}

impl FinishWrite for HashWriter {
	fn finish_inner(self: Box<Self>) -> std::io::Result<HashWriter> {
		Ok(*self)
	}
}

impl FinishWrite for GzEncoder<HashWriter> {
	fn finish_inner(self: Box<Self>) -> std::io::Result<HashWriter> {
		(*self).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sh(script: &str) -> ToolInvocation {
		ToolInvocation::new("sh").arg("-c").arg(script)
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn dump_commits_and_hashes_file_bytes() {
		let dir = tempfile::tempdir().unwrap();
		let dest = dir.path().join("out.sql");
		let cancel = CancellationToken::new();

		let report = dump_to_file(&sh("printf 'hello database'"), None, &dest, &cancel)
			.await
			.unwrap();

		assert_eq!(std::fs::read(&dest).unwrap(), b"hello database");
		assert_eq!(report.bytes_read, 14);
		assert_eq!(report.size_bytes, 14);
		let (sha, _) = crate::metadata::hash_file(&dest).await.unwrap();
		assert_eq!(report.sha256, sha);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn gzip_stage_produces_decodable_output() {
		use std::io::Read;

		let dir = tempfile::tempdir().unwrap();
		let dest = dir.path().join("out.sql.gz");
		let cancel = CancellationToken::new();

		let report = dump_to_file(&sh("printf 'SELECT 1;\n'"), Some(6), &dest, &cancel)
			.await
			.unwrap();

		let mut plain = String::new();
		flate2::read::GzDecoder::new(std::fs::File::open(&dest).unwrap())
			.read_to_string(&mut plain)
			.unwrap();
		assert_eq!(plain, "SELECT 1;\n");
		assert_eq!(report.bytes_read, 10);
		// The digest covers the compressed file bytes, not the plaintext.
		let (sha, size) = crate::metadata::hash_file(&dest).await.unwrap();
		assert_eq!(report.sha256, sha);
		assert_eq!(report.size_bytes, size);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn nonzero_exit_publishes_nothing() {
		let dir = tempfile::tempdir().unwrap();
		let dest = dir.path().join("out.sql");
		let cancel = CancellationToken::new();

		let err = dump_to_file(&sh("printf partial; exit 3"), None, &dest, &cancel)
			.await
			.unwrap_err();
		match err {
			Error::ToolExited { status, .. } => assert_eq!(status, 3),
			other => panic!("expected ToolExited, got {other:?}"),
		}

		assert!(!dest.exists());
		assert!(!temp_path(&dest).exists());
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn cancellation_tears_down_cleanly() {
		let dir = tempfile::tempdir().unwrap();
		let dest = dir.path().join("out.sql");
		let cancel = CancellationToken::new();

		let cmd = sh("printf start; sleep 30");
		let run = dump_to_file(&cmd, None, &dest, &cancel);
		tokio::pin!(run);

		tokio::select! {
			_ = tokio::time::sleep(Duration::from_millis(100)) => {}
			_ = &mut run => panic!("pipeline finished before cancellation"),
		}
		cancel.cancel();

		let err = timeout(Duration::from_secs(10), run)
			.await
			.expect("cancellation must be prompt")
			.unwrap_err();
		assert!(matches!(err, Error::Cancelled), "got {err:?}");
		assert!(!dest.exists());
		assert!(!temp_path(&dest).exists());
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn file_feeds_tool_stdin() {
		let dir = tempfile::tempdir().unwrap();
		let src = dir.path().join("in.sql");
		let copied = dir.path().join("copied");
		std::fs::write(&src, b"INSERT INTO t VALUES (1);\n").unwrap();

		let cancel = CancellationToken::new();
		let tool = sh(&format!("cat > {}", copied.display()));
		file_to_tool(&src, false, &tool, &cancel).await.unwrap();

		assert_eq!(
			std::fs::read(&copied).unwrap(),
			b"INSERT INTO t VALUES (1);\n"
		);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn gunzip_on_the_way_in() {
		let dir = tempfile::tempdir().unwrap();
		let src = dir.path().join("in.sql.gz");
		let copied = dir.path().join("copied");

		let mut enc = GzEncoder::new(Vec::new(), Compression::new(6));
		enc.write_all(b"CREATE TABLE t ();\n").unwrap();
		std::fs::write(&src, enc.finish().unwrap()).unwrap();

		let cancel = CancellationToken::new();
		let tool = sh(&format!("cat > {}", copied.display()));
		file_to_tool(&src, true, &tool, &cancel).await.unwrap();

		assert_eq!(std::fs::read(&copied).unwrap(), b"CREATE TABLE t ();\n");
	}

	#[tokio::test]
	async fn copy_pipeline_for_wal_segments() {
		let dir = tempfile::tempdir().unwrap();
		let src = dir.path().join("000000010000000000000001");
		let dest = dir.path().join("archived.gz");
		std::fs::write(&src, vec![0xaa; 8192]).unwrap();

		let cancel = CancellationToken::new();
		let report = copy_to_file(&src, Some(6), &dest, &cancel).await.unwrap();
		assert_eq!(report.bytes_read, 8192);
		assert!(dest.exists());
	}

	#[tokio::test]
	async fn caller_fed_stream_commits() {
		let dir = tempfile::tempdir().unwrap();
		let dest = dir.path().join("sample.sql");
		let cancel = CancellationToken::new();

		let sink = StreamSink::new(None, &dest, &cancel);
		let tx = sink.tx.clone();
		tx.send(Bytes::from_static(b"-- schema\n")).await.unwrap();
		tx.send(Bytes::from_static(b"COPY t FROM stdin;\n"))
			.await
			.unwrap();
		drop(tx);
		let report = sink.finish(Ok(())).await.unwrap();

		assert_eq!(report.bytes_read, 29);
		assert_eq!(
			std::fs::read(&dest).unwrap(),
			b"-- schema\nCOPY t FROM stdin;\n"
		);
	}

	#[tokio::test]
	async fn failed_feeder_publishes_nothing() {
		let dir = tempfile::tempdir().unwrap();
		let dest = dir.path().join("sample.sql");
		let cancel = CancellationToken::new();

		let sink = StreamSink::new(None, &dest, &cancel);
		sink.tx
			.send(Bytes::from_static(b"half a schema"))
			.await
			.unwrap();
		let err = sink
			.finish(Err(Error::Cancelled))
			.await
			.unwrap_err();
		assert!(matches!(err, Error::Cancelled));
		assert!(!dest.exists());
		assert!(!temp_path(&dest).exists());
	}

	#[test]
	fn tool_invocation_name_strips_path() {
		let tool = ToolInvocation::new("/usr/lib/postgresql/16/bin/pg_dump");
		assert_eq!(tool.name(), "pg_dump");
	}
}
