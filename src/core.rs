use std::hash::Hash;
use std::sync::Arc;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Atomic reference-counted string type used for task identifiers.
pub type TaskId = Arc<str>;

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `tsumiki`, this serves two primary purposes:
/// 1. It fingerprints source files and produced outputs, so the scheduler can
///    tell whether the inputs of a task changed since its last run.
/// 2. It names blobs in the artifact cache, so identical outputs are stored
///    only once.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    /// Derive a hash from any value implementing [`Hash`], fed through BLAKE3.
    pub(crate) fn hash_value(value: &impl Hash) -> Self {
        let mut hasher = Blake3Hasher::default();
        value.hash(&mut hasher);
        hasher.into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex()[..12])
    }
}

#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// A file produced by a task, as seen by the rest of the build.
///
/// Artifacts are owned by the task that produced them. Downstream tasks
/// receive them read-only, and the cache stores them as the value of an
/// entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path relative to the output directory.
    pub path: Utf8PathBuf,
    /// Digest of the artifact bytes.
    pub fingerprint: Hash32,
    /// When the artifact was produced.
    pub modified: Option<SystemTime>,
}

impl Artifact {
    pub fn new(path: impl Into<Utf8PathBuf>, fingerprint: Hash32) -> Self {
        Self {
            path: path.into(),
            fingerprint,
            modified: Some(SystemTime::now()),
        }
    }

    /// Two artifacts describe the same content if their paths and
    /// fingerprints agree. The modification marker is ignored.
    pub fn same_content(&self, other: &Artifact) -> bool {
        self.path == other.path && self.fingerprint == other.fingerprint
    }
}

/// The mode in which the pipeline is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// A one-time build.
    Build,
    /// A continuous watch mode for development.
    Watch,
}

/// Immutable environment shared by the scheduler and every task.
///
/// Tasks read configuration only through this value, never from ambient
/// process state.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Project configuration.
    pub config: Arc<Config>,
    /// The current build mode (Build or Watch).
    pub mode: Mode,
    /// The port of the live-reload WebSocket server (if running).
    pub reload_port: Option<u16>,
}

impl Environment {
    pub fn new(config: Arc<Config>, mode: Mode) -> Self {
        Self {
            config,
            mode,
            reload_port: None,
        }
    }

    pub fn with_reload_port(mut self, port: u16) -> Self {
        self.reload_port = Some(port);
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.config.root
    }

    /// Everything in the environment that can change what a task produces,
    /// including the version of the tool itself. It is folded into every
    /// cache key.
    pub(crate) fn fingerprint(&self) -> Hash32 {
        self.fingerprint_for(env!("CARGO_PKG_VERSION"))
    }

    fn fingerprint_for(&self, version: &str) -> Hash32 {
        Hash32::hash_value(&(version, self.mode, self.reload_port))
    }

    /// Returns a JavaScript snippet to enable live-reloading.
    ///
    /// If the pipeline is running in `Watch` mode and a port is configured,
    /// this returns a script that connects to the WebSocket server and
    /// reloads the page on any message.
    pub fn get_refresh_script(&self) -> Option<String> {
        if self.mode != Mode::Watch {
            return None;
        }

        self.reload_port.map(|port| {
            format!(
                r#"<script>
const socket = new WebSocket("ws://localhost:{port}");
socket.addEventListener("message", event => {{
    window.location.reload();
}});
</script>"#
            )
        })
    }
}
