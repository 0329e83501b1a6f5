use std::fmt;
use std::fs;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};

/// An abstract unit of work.
///
/// When run (by whatever [`TaskScheduler`](crate::TaskScheduler) the caller
/// plugs in), a task is expected to create all of the outputs returned by
/// [`outputs`](Task::outputs). Two calls to `outputs` must describe the same
/// output data.
pub trait Task: Send + Sync + 'static {
    /// The outputs this task creates when run.
    fn outputs(&self) -> Vec<Arc<dyn Output>>;
}

/// An abstract unit of task output, such as a file or a database row.
///
/// An output either exists (and then has a creation timestamp) or does not.
pub trait Output: Send + Sync {
    /// The time at which this output was created, or `None` if it does not
    /// exist.
    fn timestamp(&self) -> io::Result<Option<SystemTime>>;

    /// Deletes this output if it exists. Deleting an absent output is not an
    /// error.
    fn delete(&self) -> io::Result<()>;
}

/// An output consisting of a single file or directory.
///
/// The timestamp is the filesystem modification time. Deletion removes
/// directories recursively, even when they are not empty.
pub struct PathOutput {
    path: Utf8PathBuf,
}

impl PathOutput {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Output for PathOutput {
    fn timestamp(&self) -> io::Result<Option<SystemTime>> {
        match fs::metadata(self.path.as_std_path()) {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete(&self) -> io::Result<()> {
        match fs::symlink_metadata(self.path.as_std_path()) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(self.path.as_std_path()),
            Ok(_) => fs::remove_file(self.path.as_std_path()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for PathOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathOutput({})", self.path)
    }
}
