/// Marker file: the `<supervisor pid> <child pid>` record a running supervisor
/// keeps in the directory it owns.
///
/// Writes go through a temporary file in the same directory followed by a rename,
/// so a controller reading concurrently never sees a partial line.
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Fixed name of the marker inside a supervised directory.
pub const MARKER_FILE_NAME: &str = ".respawn.pid";

/// The pair of process ids recorded in the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PidPair {
    pub supervisor: i32,
    pub child: i32,
}

impl PidPair {
    pub fn new(supervisor: i32, child: i32) -> Self {
        Self { supervisor, child }
    }
}

impl std::fmt::Display for PidPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.supervisor, self.child)
    }
}

impl FromStr for PidPair {
    type Err = String;

    /// Parse a line of exactly two positive integers separated by whitespace.
    ///
    /// Zero and negative ids are rejected: handed to `kill(2)` they address
    /// process groups, not single processes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split_whitespace();
        let (Some(first), Some(second), None) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(format!("expected two process ids, got {:?}", s.trim()));
        };
        let parse = |field: &str| match field.parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(pid),
            _ => Err(format!("invalid process id {field:?}")),
        };
        Ok(Self {
            supervisor: parse(first)?,
            child: parse(second)?,
        })
    }
}

/// Errors produced by marker file operations.
#[derive(Debug)]
pub enum MarkerError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Malformed {
        path: PathBuf,
        reason: String,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for MarkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkerError::Read { path, source } => {
                write!(f, "failed to read marker {}: {}", path.display(), source)
            }
            MarkerError::Malformed { path, reason } => {
                write!(f, "malformed marker {}: {}", path.display(), reason)
            }
            MarkerError::Write { path, source } => {
                write!(f, "failed to write marker {}: {}", path.display(), source)
            }
            MarkerError::Remove { path, source } => {
                write!(f, "failed to remove marker {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for MarkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MarkerError::Read { source, .. } => Some(source),
            MarkerError::Malformed { .. } => None,
            MarkerError::Write { source, .. } => Some(source),
            MarkerError::Remove { source, .. } => Some(source),
        }
    }
}

/// Handle on the marker file of one directory.
#[derive(Debug, Clone)]
pub struct MarkerFile {
    path: PathBuf,
}

impl MarkerFile {
    /// The marker belonging to `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(MARKER_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded pair. `Ok(None)` means the directory is not supervised.
    pub fn read(&self) -> Result<Option<PidPair>, MarkerError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(MarkerError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        contents
            .parse()
            .map(Some)
            .map_err(|reason| MarkerError::Malformed {
                path: self.path.clone(),
                reason,
            })
    }

    /// Atomically replace the marker with `pair`.
    pub fn write(&self, pair: PidPair) -> Result<(), MarkerError> {
        let write_err = |e: std::io::Error| MarkerError::Write {
            path: self.path.clone(),
            source: e,
        };
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::Builder::new()
            .prefix(".respawn.pid.tmp.")
            .tempfile_in(dir)
            .map_err(write_err)?;
        writeln!(tmp, "{pair}").map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        tracing::debug!(path = %self.path.display(), %pair, "marker written");
        Ok(())
    }

    /// Delete the marker. Returns `false` if there was nothing to delete.
    pub fn remove(&self) -> Result<bool, MarkerError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MarkerError::Remove {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}
