use crate::error::RunError;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// System directories the fuzz test needs to load its shared libraries.
const SYSTEM_READ_ONLY: &[&str] = &["/bin", "/lib", "/lib64", "/usr"];

/// Device and process pseudo filesystems the sanitizer runtimes read from.
const PSEUDO_FILESYSTEMS: &[&str] = &["/dev", "/proc"];

/// Confines a command with `minijail0`.
///
/// Only the bound paths are visible inside the jail. Everything is bound at
/// its original location below a fresh, empty root directory.
#[derive(Debug)]
pub struct Sandbox {
    minijail: PathBuf,
    root: PathBuf,
    read_only: Vec<PathBuf>,
    read_write: Vec<PathBuf>,
}

impl Sandbox {
    /// Creates the jail's root directory inside `temp_dir`.
    pub fn new(minijail: impl Into<PathBuf>, temp_dir: &Path) -> Result<Self, RunError> {
        let root = temp_dir.join("sandbox-root");
        fs::create_dir_all(&root).map_err(|e| {
            RunError::SandboxSetup(format!("failed to create {}: {e}", root.display()))
        })?;
        Ok(Self {
            minijail: minijail.into(),
            root,
            read_only: Vec::new(),
            read_write: Vec::new(),
        })
    }

    /// Binds `path` read-only. Symlinks are resolved first, the jail
    /// cannot follow links that point outside of it.
    pub fn bind_read_only(&mut self, path: &Path) -> Result<(), RunError> {
        let path = resolve(path)?;
        if !self.read_only.contains(&path) {
            self.read_only.push(path);
        }
        Ok(())
    }

    pub fn bind_read_write(&mut self, path: &Path) -> Result<(), RunError> {
        let path = resolve(path)?;
        if !self.read_write.contains(&path) {
            self.read_write.push(path);
        }
        Ok(())
    }

    pub fn read_only(&self) -> &[PathBuf] {
        &self.read_only
    }

    pub fn read_write(&self) -> &[PathBuf] {
        &self.read_write
    }

    /// Creates a mount point below the jail root for every binding.
    pub fn prepare(&self) -> Result<(), RunError> {
        for path in self.bindings() {
            let target = self
                .root
                .join(path.strip_prefix("/").unwrap_or(path.as_path()));
            let result = if path.is_dir() {
                fs::create_dir_all(&target)
            } else {
                target
                    .parent()
                    .map(fs::create_dir_all)
                    .unwrap_or(Ok(()))
                    .and_then(|_| fs::File::create(&target).map(|_| ()))
            };
            result.map_err(|e| {
                RunError::SandboxSetup(format!(
                    "failed to create mount point {}: {e}",
                    target.display()
                ))
            })?;
        }
        Ok(())
    }

    fn bindings(&self) -> Vec<PathBuf> {
        system_paths()
            .chain(self.read_only.iter().cloned())
            .chain(self.read_write.iter().cloned())
            .collect()
    }

    /// Prefixes `argv` with the minijail invocation.
    pub fn wrap(&self, argv: Vec<OsString>) -> Vec<OsString> {
        let mut wrapped: Vec<OsString> = vec![self.minijail.clone().into_os_string()];
        // New user, pid, mount and network namespaces; no new privileges.
        for flag in ["-U", "-m", "-M", "-p", "-v", "-e", "-n"] {
            wrapped.push(flag.into());
        }
        wrapped.push("-P".into());
        wrapped.push(self.root.clone().into_os_string());

        for path in system_paths() {
            wrapped.push("-b".into());
            wrapped.push(binding(&path, false));
        }
        for path in &self.read_only {
            wrapped.push("-b".into());
            wrapped.push(binding(path, false));
        }
        for path in &self.read_write {
            wrapped.push("-b".into());
            wrapped.push(binding(path, true));
        }

        wrapped.push("--".into());
        wrapped.extend(argv);
        debug!(bindings = self.read_only.len() + self.read_write.len(), "wrapped command in sandbox");
        wrapped
    }
}

fn system_paths() -> impl Iterator<Item = PathBuf> {
    SYSTEM_READ_ONLY
        .iter()
        .chain(PSEUDO_FILESYSTEMS)
        .map(|p| PathBuf::from(*p))
        .filter(|p| p.exists())
}

fn resolve(path: &Path) -> Result<PathBuf, RunError> {
    path.canonicalize().map_err(|e| {
        RunError::SandboxSetup(format!("cannot bind {}: {e}", path.display()))
    })
}

/// `<src>,<dest>,<writable>` as minijail expects it.
fn binding(path: &Path, writable: bool) -> OsString {
    let mut arg = OsString::from(path);
    arg.push(",");
    arg.push(path);
    arg.push(if writable { ",1" } else { ",0" });
    arg
}
