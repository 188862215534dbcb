/*!
Script resolution and validation.

Turns request parameters into a `ScriptDescriptor` (absolute, normalized,
executable regular file plus working directory). All checks run before any
process is spawned; nothing here executes anything.

Symlinked scripts are rejected, never resolved.
*/
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use tracing::instrument;

use crate::errors::ScriptError;
use crate::gateway::Params;

pub const DOCUMENT_ROOT: &str = "DOCUMENT_ROOT";
pub const SCRIPT_NAME: &str = "SCRIPT_NAME";
pub const SCRIPT_FILENAME: &str = "SCRIPT_FILENAME";
pub const FCGI_CHDIR: &str = "FCGI_CHDIR";

/// `FCGI_CHDIR` value meaning "keep the bridge's working directory".
const CHDIR_INHERIT: &str = "-";

/// Knobs for script resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptPolicy {
    /// Accept `SCRIPT_FILENAME` without `DOCUMENT_ROOT` (skips containment).
    pub allow_unrooted: bool,
}

/// Where the script runs from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkDir {
    /// Change into this directory before exec.
    Path(PathBuf),
    /// Keep the bridge's own working directory.
    Inherit,
}

/// Validated script to execute for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDescriptor {
    pub path: PathBuf,
    pub workdir: WorkDir,
}

fn non_empty<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).map(String::as_str).filter(|s| !s.is_empty())
}

/// Resolve and validate the script for a request.
pub fn resolve_script(params: &Params, policy: ScriptPolicy) -> Result<ScriptDescriptor, ScriptError> {
    let doc_root = non_empty(params, DOCUMENT_ROOT);

    let candidate = match non_empty(params, SCRIPT_FILENAME) {
        Some(filename) => {
            if doc_root.is_none() && !policy.allow_unrooted {
                return Err(ScriptError::MissingDocumentRoot);
            }
            PathBuf::from(filename)
        }
        None => {
            let root = doc_root.ok_or(ScriptError::MissingDocumentRoot)?;
            let name = non_empty(params, SCRIPT_NAME).ok_or(ScriptError::MissingScriptName)?;
            join_script_name(Path::new(root), name)
        }
    };

    let path = validate_script(&candidate, doc_root.map(Path::new))?;
    let workdir = resolve_workdir(params.get(FCGI_CHDIR).map(String::as_str), &path)?;
    Ok(ScriptDescriptor { path, workdir })
}

/// Join `SCRIPT_NAME` under the document root. SCRIPT_NAME conventionally starts
/// with '/', which `Path::join` would treat as a new root.
fn join_script_name(root: &Path, name: &str) -> PathBuf {
    root.join(name.trim_start_matches('/'))
}

/// Validate a candidate script path; returns the normalized path.
#[instrument(level = "debug", skip_all, fields(script = %script.display()))]
pub fn validate_script(script: &Path, doc_root: Option<&Path>) -> Result<PathBuf, ScriptError> {
    if !script.is_absolute() {
        return Err(ScriptError::NotAbsolute(script.to_path_buf()));
    }
    let script = normalize_lexically(script);

    if let Some(root) = doc_root.filter(|r| !r.as_os_str().is_empty()) {
        if !root.is_absolute() {
            return Err(ScriptError::RelativeDocumentRoot(root.to_path_buf()));
        }
        let root = normalize_lexically(root);
        if !script.starts_with(&root) {
            return Err(ScriptError::OutsideDocumentRoot { path: script, root });
        }
    }

    let meta = match std::fs::symlink_metadata(&script) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ScriptError::NotFound(script));
        }
        Err(e) => {
            return Err(ScriptError::Inspect {
                path: script,
                source: e,
            })
        }
    };
    let ft = meta.file_type();
    if ft.is_symlink() {
        return Err(ScriptError::Symlink(script));
    }
    if !ft.is_file() {
        return Err(ScriptError::NotRegularFile(script));
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(ScriptError::NotExecutable(script));
    }

    tracing::debug!(script = %script.display(), "script validated");
    Ok(script)
}

fn resolve_workdir(chdir: Option<&str>, script: &Path) -> Result<WorkDir, ScriptError> {
    match chdir {
        Some(CHDIR_INHERIT) => Ok(WorkDir::Inherit),
        Some(dir) => {
            let dir = PathBuf::from(dir);
            if !dir.is_absolute() {
                return Err(ScriptError::ChdirNotAbsolute(dir));
            }
            let meta = std::fs::metadata(&dir).map_err(|e| ScriptError::ChdirInspect {
                path: dir.clone(),
                source: e,
            })?;
            if !meta.is_dir() {
                return Err(ScriptError::ChdirNotDirectory(dir));
            }
            Ok(WorkDir::Path(dir))
        }
        None => Ok(script
            .parent()
            .map(|p| WorkDir::Path(p.to_path_buf()))
            .unwrap_or(WorkDir::Inherit)),
    }
}

/// Resolve `.` and `..` without touching the filesystem or following symlinks.
/// `..` at the root stays at the root.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            Component::Normal(c) => out.push(c),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
