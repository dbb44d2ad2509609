//! Startup snapshots of a bootstrapped validation bundle.
//!
//! Building runs the sandbox runtime extension and the bundle once and
//! serializes the resulting heap, so creating a sandbox afterwards only has
//! to deserialize it.
//!
//! V8 can be initialized for snapshotting or for execution, but not both in
//! one process. A host that also runs sandboxes builds through
//! [`BuildMode::ChildProcess`], which re-executes `validator-sandbox
//! snapshot` and reads the envelope back from its stdout.

use crate::error::{Result, SandboxError};
use crate::ops::validator_runtime;
use deno_core::snapshot::{create_snapshot, CreateSnapshotOptions};
use deno_core::JsRuntimeForSnapshot;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::rc::Rc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Script name the bundle is evaluated under.
pub(crate) const BOOTSTRAP_SPECIFIER: &str = "validator:bootstrap.js";

/// Envelope: [magic (10 bytes)] [tag length (u16 BE)] [runtime tag]
/// [SHA-256 of payload (32 bytes)] [payload].
///
/// V8 aborts the process on a malformed startup blob, and a blob from another
/// V8 build is malformed to it, so nothing reaches V8 without passing the
/// header, runtime tag and checksum checks first.
const SNAPSHOT_MAGIC: &[u8] = b"VSBXSNAP\x00\x02";
const CHECKSUM_LEN: usize = 32;
/// Smaller payloads cannot be real V8 snapshots.
const MIN_SNAPSHOT_PAYLOAD: usize = 64 * 1024;

/// Identifies the crate and V8 build a snapshot was taken with.
fn runtime_tag() -> String {
    format!(
        "validator-sandbox/{} v8/{}",
        env!("CARGO_PKG_VERSION"),
        deno_core::v8::V8::get_version()
    )
}

fn sha256_hash(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Immutable V8 startup blob. Clones share the payload.
///
/// The payload is kept for the rest of the process: V8 holds on to the
/// startup data of every isolate created from it.
#[derive(Clone)]
pub struct Snapshot {
    data: &'static [u8],
    digest: [u8; 32],
}

impl Snapshot {
    fn from_payload(payload: Box<[u8]>) -> Self {
        let digest = sha256_hash(&payload);
        Self {
            data: Box::leak(payload),
            digest,
        }
    }

    pub(crate) fn payload(&self) -> &'static [u8] {
        self.data
    }

    /// Size of the V8 payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Hex SHA-256 of the payload.
    pub fn digest(&self) -> String {
        self.digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Serialize into the checksummed envelope, tagged with this runtime.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.envelope(&runtime_tag())
    }

    /// Validate and load an envelope produced by [`Snapshot::to_bytes`] in a
    /// build of this crate on the same V8 version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::open_envelope(bytes, &runtime_tag())
    }

    fn envelope(&self, tag: &str) -> Vec<u8> {
        let tag = &tag.as_bytes()[..tag.len().min(u16::MAX as usize)];
        let mut wrapped = Vec::with_capacity(
            SNAPSHOT_MAGIC.len() + 2 + tag.len() + CHECKSUM_LEN + self.data.len(),
        );
        wrapped.extend_from_slice(SNAPSHOT_MAGIC);
        wrapped.extend_from_slice(&(tag.len() as u16).to_be_bytes());
        wrapped.extend_from_slice(tag);
        wrapped.extend_from_slice(&self.digest);
        wrapped.extend_from_slice(self.data);
        wrapped
    }

    fn open_envelope(bytes: &[u8], expected_tag: &str) -> Result<Self> {
        let too_small = || SandboxError::bootstrap("snapshot data too small");

        let (magic, rest) = bytes
            .split_at_checked(SNAPSHOT_MAGIC.len())
            .ok_or_else(too_small)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(SandboxError::bootstrap(
                "invalid snapshot: missing magic header",
            ));
        }

        let (tag_len, rest) = rest.split_at_checked(2).ok_or_else(too_small)?;
        let tag_len = u16::from_be_bytes([tag_len[0], tag_len[1]]) as usize;
        let (tag, rest) = rest.split_at_checked(tag_len).ok_or_else(too_small)?;
        if tag != expected_tag.as_bytes() {
            return Err(SandboxError::bootstrap(format!(
                "snapshot was built by a different runtime ({}, expected {})",
                String::from_utf8_lossy(tag),
                expected_tag
            )));
        }

        let (checksum, payload) = rest.split_at_checked(CHECKSUM_LEN).ok_or_else(too_small)?;
        if payload.len() < MIN_SNAPSHOT_PAYLOAD {
            return Err(SandboxError::bootstrap("invalid snapshot: payload too small"));
        }
        if sha256_hash(payload)[..] != *checksum {
            return Err(SandboxError::bootstrap("invalid snapshot: checksum mismatch"));
        }
        Ok(Self::from_payload(payload.into()))
    }

    pub async fn read_from(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            SandboxError::bootstrap(format!("failed to read snapshot '{}': {}", path.display(), e))
        })?;
        Self::from_bytes(&bytes)
    }

    pub async fn write_to(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.to_bytes()).await.map_err(|e| {
            SandboxError::bootstrap(format!("failed to write snapshot '{}': {}", path.display(), e))
        })
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("len", &self.data.len())
            .field("digest", &self.digest())
            .finish()
    }
}

/// Build a snapshot in this process.
///
/// Puts V8 into snapshotting mode, so a process that calls this must not
/// create sandboxes. No bridge or console sink exists while the bundle runs.
pub fn build_snapshot(bootstrap_source: &str) -> Result<Snapshot> {
    let source = bootstrap_source.to_string();
    let failure: Rc<RefCell<Option<String>>> = Rc::default();
    let recorded = failure.clone();

    let output = create_snapshot(
        CreateSnapshotOptions {
            cargo_manifest_dir: env!("CARGO_MANIFEST_DIR"),
            startup_snapshot: None,
            skip_op_registration: false,
            extensions: vec![validator_runtime::init_ops_and_esm()],
            with_runtime_cb: Some(Box::new(move |runtime: &mut JsRuntimeForSnapshot| {
                if let Err(e) = runtime.execute_script(BOOTSTRAP_SPECIFIER, source.clone()) {
                    *recorded.borrow_mut() = Some(e.to_string());
                }
            })),
            extension_transpiler: None,
        },
        None,
    )
    .map_err(SandboxError::bootstrap)?;

    if let Some(message) = failure.take() {
        return Err(SandboxError::bootstrap(message));
    }

    let snapshot = Snapshot::from_payload(output.output);
    tracing::debug!(len = snapshot.len(), digest = %snapshot.digest(), "snapshot built");
    Ok(snapshot)
}

/// Where snapshot builds run.
#[derive(Debug, Clone, Default)]
pub enum BuildMode {
    /// In this process, on a blocking thread.
    #[default]
    InProcess,
    /// In a child `validator-sandbox snapshot` process at this path.
    ChildProcess(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotBuilder {
    mode: BuildMode,
}

impl SnapshotBuilder {
    pub fn new(mode: BuildMode) -> Self {
        Self { mode }
    }

    /// Build in a child process running the current executable.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().map_err(SandboxError::bootstrap)?;
        Ok(Self::new(BuildMode::ChildProcess(exe)))
    }

    pub fn mode(&self) -> &BuildMode {
        &self.mode
    }

    pub async fn build(&self, bootstrap_source: &str) -> Result<Snapshot> {
        match &self.mode {
            BuildMode::InProcess => {
                let source = bootstrap_source.to_string();
                tokio::task::spawn_blocking(move || build_snapshot(&source))
                    .await
                    .map_err(SandboxError::bootstrap)?
            }
            BuildMode::ChildProcess(exe) => build_in_child(exe, bootstrap_source).await,
        }
    }
}

async fn build_in_child(exe: &Path, bootstrap_source: &str) -> Result<Snapshot> {
    let mut child = tokio::process::Command::new(exe)
        .arg("snapshot")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            SandboxError::bootstrap(format!(
                "failed to spawn snapshot process '{}': {}",
                exe.display(),
                e
            ))
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| SandboxError::bootstrap("snapshot process has no stdin"))?;
    let input = bootstrap_source.as_bytes().to_vec();
    let writer = tokio::spawn(async move {
        let written = stdin.write_all(&input).await;
        drop(stdin);
        written
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(SandboxError::bootstrap)?;
    writer
        .await
        .map_err(SandboxError::bootstrap)?
        .map_err(|e| SandboxError::bootstrap(format!("failed to send bundle: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SandboxError::bootstrap(format!(
            "snapshot process exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Snapshot::from_bytes(&output.stdout)
}

/// Snapshots keyed by bundle version. Each version is built at most once;
/// concurrent requests for it wait on the first build.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    builder: SnapshotBuilder,
    entries: Mutex<HashMap<String, Snapshot>>,
}

impl SnapshotCache {
    pub fn new(builder: SnapshotBuilder) -> Self {
        Self {
            builder,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_build(&self, version: &str, bootstrap_source: &str) -> Result<Snapshot> {
        let mut entries = self.entries.lock().await;
        if let Some(snapshot) = entries.get(version) {
            return Ok(snapshot.clone());
        }

        tracing::info!(version, "building snapshot");
        let snapshot = self.builder.build(bootstrap_source).await?;
        entries.insert(version.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    pub async fn get(&self, version: &str) -> Option<Snapshot> {
        self.entries.lock().await.get(version).cloned()
    }

    pub async fn insert(&self, version: impl Into<String>, snapshot: Snapshot) {
        self.entries.lock().await.insert(version.into(), snapshot);
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_snapshot() -> Snapshot {
        let payload: Vec<u8> = (0..MIN_SNAPSHOT_PAYLOAD).map(|i| (i % 251) as u8).collect();
        Snapshot::from_payload(payload.into_boxed_slice())
    }

    #[test]
    fn test_envelope_round_trip() {
        let snapshot = fake_snapshot();
        let bytes = snapshot.to_bytes();

        let tag = runtime_tag();
        assert!(tag.starts_with("validator-sandbox/"));
        assert_eq!(&bytes[..SNAPSHOT_MAGIC.len()], SNAPSHOT_MAGIC);
        assert_eq!(
            bytes.len(),
            SNAPSHOT_MAGIC.len() + 2 + tag.len() + CHECKSUM_LEN + snapshot.len()
        );

        let loaded = Snapshot::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.payload(), snapshot.payload());
        assert_eq!(loaded.digest(), snapshot.digest());
        assert_eq!(loaded.digest().len(), 64);
    }

    #[test]
    fn test_rejects_corruption() {
        let mut bytes = fake_snapshot().to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let err = Snapshot::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_rejects_bad_header_and_truncation() {
        let bytes = fake_snapshot().to_bytes();

        let mut wrong_magic = bytes.clone();
        wrong_magic[0] = b'X';
        assert!(Snapshot::from_bytes(&wrong_magic)
            .unwrap_err()
            .to_string()
            .contains("magic header"));

        assert!(Snapshot::from_bytes(&bytes[..20])
            .unwrap_err()
            .to_string()
            .contains("too small"));

        let header_len = bytes.len() - MIN_SNAPSHOT_PAYLOAD;
        assert!(Snapshot::from_bytes(&bytes[..header_len + 10])
            .unwrap_err()
            .to_string()
            .contains("payload too small"));
    }

    #[test]
    fn test_rejects_other_runtime() {
        let bytes = fake_snapshot().envelope("validator-sandbox/0.0.1 v8/11.0.0");

        let err = Snapshot::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Bootstrap);
        assert!(err.to_string().contains("different runtime"), "{}", err);

        assert!(Snapshot::open_envelope(&bytes, "validator-sandbox/0.0.1 v8/11.0.0").is_ok());
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.snapshot");
        let snapshot = fake_snapshot();

        snapshot.write_to(&path).await.unwrap();
        let loaded = Snapshot::read_from(&path).await.unwrap();
        assert_eq!(loaded.digest(), snapshot.digest());

        let missing = Snapshot::read_from(&dir.path().join("missing")).await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_cache_serves_inserted_versions() {
        let cache = SnapshotCache::default();
        let snapshot = fake_snapshot();
        cache.insert("1.0.0", snapshot.clone()).await;

        let cached = cache
            .get_or_build("1.0.0", "this bundle is never built")
            .await
            .unwrap();
        assert_eq!(cached.digest(), snapshot.digest());
        assert!(cache.get("2.0.0").await.is_none());

        cache.clear().await;
        assert!(cache.get("1.0.0").await.is_none());
    }
}
