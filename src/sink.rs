/// Persistence sink contract.
///
/// The protocol treats the destination for a completed transfer as an
/// external collaborator reachable only through `save(filename, bytes)`;
/// this module gives that contract a concrete default so the crate runs
/// without a caller supplying one, while remaining generic over it.
use std::fs;
use std::io;
use std::path::PathBuf;

pub trait FileSink: Send + Sync {
    fn save(&self, filename: &str, bytes: &[u8]) -> io::Result<()>;
}

/// Writes completed transfers into a configured directory.
///
/// As defense in depth alongside the sanitizer in `sanitize.rs`, refuses
/// to write outside `root` even if a sanitized name somehow still
/// resolves elsewhere (e.g. via a platform-specific alias).
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileSink for DirectorySink {
    fn save(&self, filename: &str, bytes: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        let dest = self.root.join(filename);

        let canonical_root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        if let Some(parent) = dest.parent() {
            if parent != self.root && !parent.starts_with(&canonical_root) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("refusing to write outside sink root: {}", dest.display()),
                ));
            }
        }

        fs::write(&dest, bytes)
    }
}

/// In-memory sink used by tests, recording every `(filename, bytes)` pair saved.
#[derive(Default)]
pub struct MemorySink {
    pub saved: std::sync::Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileSink for MemorySink {
    fn save(&self, filename: &str, bytes: &[u8]) -> io::Result<()> {
        self.saved
            .lock()
            .unwrap()
            .push((filename.to_string(), bytes.to_vec()));
        Ok(())
    }
}
