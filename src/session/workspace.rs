// ABOUTME: Per-session workspace directory that is bind-mounted into the sandbox
// Exclusively owned by one session and removed when the session goes away

use crate::models::SessionId;
use std::io;
use std::path::Path;
use tempfile::TempDir;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh directory for `session_id` under `root`.
    ///
    /// The path is absolute (Docker rejects relative bind sources) and unique
    /// even if two sessions were ever handed the same id.
    pub fn create(root: &Path, session_id: SessionId) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("session-{}-", session_id))
            .tempdir_in(&root)?;
        debug!("Created workspace {} for session {}", dir.path().display(), session_id);
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Delete the directory now, reporting failures instead of ignoring them.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            // Files created by a root listener can outlive an unprivileged host process
            warn!("Failed to remove workspace {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_session_gets_its_own_absolute_directory() {
        let root = tempfile::tempdir().unwrap();
        let a = Workspace::create(root.path(), SessionId::new()).unwrap();
        let b = Workspace::create(root.path(), SessionId::new()).unwrap();

        assert_ne!(a.path(), b.path());
        assert!(a.path().is_absolute());
        assert!(a.path().starts_with(root.path().canonicalize().unwrap()));
    }

    #[test]
    fn test_root_is_created_on_demand() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("workspaces").join("nested");
        let workspace = Workspace::create(&nested, SessionId::new()).unwrap();
        assert!(workspace.path().is_dir());
    }

    #[test]
    fn test_close_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path(), SessionId::new()).unwrap();
        let path = workspace.path().to_path_buf();
        std::fs::write(path.join("main.py"), "print('hi')").unwrap();

        workspace.close();

        assert!(!path.exists());
    }
}
