//! Executable lookup with a login-shell fallback
//!
//! A pool host started by a service manager usually has a bare PATH, so
//! interpreters installed through Homebrew, nvm, pyenv or `~/.local/bin`
//! are invisible to it. When an executable is not found on the process
//! PATH we ask the user's login shell for its PATH once, cache it for the
//! lifetime of the process, and retry the lookup there. Child processes
//! launched through that fallback get the widened PATH as well.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, info, warn};

static LOGIN_PATH: OnceLock<Option<OsString>> = OnceLock::new();

/// Where an executable was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProgram {
    pub path: PathBuf,
    /// PATH the child should run with, if it differs from ours
    pub search_path: Option<OsString>,
}

/// Resolve `program` on the process PATH, then on the login-shell PATH.
///
/// Blocking on first use (spawns the shell); call from `spawn_blocking`.
pub fn resolve_program(program: &str, cwd: Option<&Path>) -> Option<ResolvedProgram> {
    if program.contains('/') || program.contains('\\') {
        let path = match cwd {
            Some(dir) if Path::new(program).is_relative() => dir.join(program),
            _ => PathBuf::from(program),
        };
        return path.exists().then_some(ResolvedProgram {
            path,
            search_path: None,
        });
    }

    if let Ok(path) = which::which(program) {
        return Some(ResolvedProgram {
            path,
            search_path: None,
        });
    }

    let login_path = login_shell_path()?;
    let lookup_dir = cwd
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())?;
    match which::which_in(program, Some(login_path), lookup_dir) {
        Ok(path) => {
            debug!(program, path = ?path, "[ShellPath] Found via login shell PATH");
            Some(ResolvedProgram {
                path,
                search_path: Some(login_path.clone()),
            })
        }
        Err(_) => None,
    }
}

/// The login shell's PATH merged with ours, resolved once.
pub fn login_shell_path() -> Option<&'static OsString> {
    LOGIN_PATH
        .get_or_init(|| {
            #[cfg(unix)]
            {
                query_login_shell()
            }
            #[cfg(not(unix))]
            {
                None
            }
        })
        .as_ref()
}

#[cfg(unix)]
fn query_login_shell() -> Option<OsString> {
    use std::process::{Command, Stdio};

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    info!("[ShellPath] Asking {} for its login PATH", shell);

    let output = Command::new(&shell)
        .args(["-l", "-c", r#"printf "%s" "$PATH""#])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();

    let shell_path = match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().to_string(),
        Ok(out) => {
            warn!("[ShellPath] {} exited with {}", shell, out.status);
            return None;
        }
        Err(e) => {
            warn!("[ShellPath] Could not run {}: {}", shell, e);
            return None;
        }
    };
    if shell_path.is_empty() {
        return None;
    }

    let current = std::env::var("PATH").unwrap_or_default();
    Some(OsString::from(merge_paths(&shell_path, &current)))
}

/// Join two PATH lists, first occurrence wins, empty entries dropped.
pub fn merge_paths(primary: &str, secondary: &str) -> String {
    let mut seen = std::collections::HashSet::new();
    primary
        .split(':')
        .chain(secondary.split(':'))
        .filter(|entry| !entry.is_empty() && seen.insert(*entry))
        .collect::<Vec<_>>()
        .join(":")
}

/// Prepend a directory (e.g. a venv's `bin`) to a PATH value.
pub fn prepend_path(dir: &Path, path: Option<&OsString>) -> OsString {
    let current = path
        .cloned()
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_default();
    merge_paths(&dir.to_string_lossy(), &current.to_string_lossy()).into()
}
