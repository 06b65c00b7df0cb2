//! Environment provisioning for stdio providers
//!
//! A stdio config may carry a `setup` command that must finish before the
//! provider starts: cloning its repository, or installing its Python
//! package. [`HostProvisioner`] runs it on the local machine with two
//! special cases:
//!
//! - `git clone` runs inside a fresh `REPOS_PATH/<instance_id>` directory,
//!   which becomes the provider's working directory.
//! - pip installs on an externally managed Python (PEP 668) go into a
//!   per-instance virtual environment under `VENVS_PATH/<instance_id>`, and
//!   the provider is started with that venv's interpreter.
//!
//! Setup commands are never retried; a failure aborts the connect with a
//! hint the operator can act on.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use mcpool_core::{
    clone_url, executable_name, is_git_clone, PoolError, PoolResult, SetupCommand, StdioConfig,
    TransportSettings,
};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Where and how the main process should run after setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provisioned {
    pub working_dir: Option<PathBuf>,
    /// Interpreter that replaces a `python`/`python3` main command
    pub interpreter: Option<PathBuf>,
    /// Directory to put in front of the child's PATH
    pub bin_dir: Option<PathBuf>,
}

#[async_trait]
pub trait EnvironmentProvisioner: Send + Sync {
    async fn provision(&self, instance_id: &str, config: &StdioConfig) -> PoolResult<Provisioned>;

    /// Drop whatever `provision` left on disk for the instance. Best effort.
    async fn release(&self, _instance_id: &str) {}
}

pub struct HostProvisioner {
    repos_dir: PathBuf,
    venvs_dir: PathBuf,
    setup_timeout: Duration,
    managed_python: OnceCell<bool>,
}

impl HostProvisioner {
    pub fn new(settings: &TransportSettings) -> Self {
        Self {
            repos_dir: settings.repos_dir.clone(),
            venvs_dir: settings.venvs_dir.clone(),
            setup_timeout: settings.setup_timeout,
            managed_python: OnceCell::new(),
        }
    }

    async fn clone_repository(&self, instance_id: &str, setup: &SetupCommand) -> PoolResult<Provisioned> {
        let dir = self.repos_dir.join(instance_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            PoolError::spawn(
                format!("Cannot create repository directory {}: {}", dir.display(), e),
                Some("check that REPOS_PATH is writable"),
            )
        })?;

        // No destination given: clone straight into the instance directory.
        let mut args = setup.args.clone();
        if let Some(url) = clone_url(&setup.args) {
            if setup.args.last().map(String::as_str) == Some(url) {
                args.push(".".to_string());
            }
        }

        info!(
            instance_id,
            dir = %dir.display(),
            "[Provision] Cloning repository"
        );
        run_setup(Path::new(&setup.command), &args, Some(&dir), self.setup_timeout).await?;

        Ok(Provisioned {
            working_dir: Some(dir),
            ..Default::default()
        })
    }

    async fn install_into_venv(
        &self,
        instance_id: &str,
        setup: &SetupCommand,
        config: &StdioConfig,
    ) -> PoolResult<Provisioned> {
        let venv = self.venvs_dir.join(instance_id);
        info!(
            instance_id,
            venv = %venv.display(),
            "[Provision] Host Python is externally managed, creating virtual environment"
        );

        let venv_arg = venv.to_string_lossy().to_string();
        run_setup(
            Path::new("python3"),
            &["-m".to_string(), "venv".to_string(), venv_arg],
            None,
            self.setup_timeout,
        )
        .await?;

        let bin_dir = venv_bin_dir(&venv);
        let python = bin_dir.join(if cfg!(windows) { "python.exe" } else { "python" });
        let working_dir = config.working_dir.as_ref().map(PathBuf::from);
        run_setup(&python, &pip_args(setup), working_dir.as_deref(), self.setup_timeout).await?;

        Ok(Provisioned {
            working_dir,
            interpreter: Some(python),
            bin_dir: Some(bin_dir),
        })
    }

    async fn python_is_managed(&self) -> bool {
        *self
            .managed_python
            .get_or_init(|| async {
                let probe = Command::new("python3")
                    .args([
                        "-c",
                        "import os, sysconfig; print(os.path.exists(os.path.join(sysconfig.get_path('stdlib'), 'EXTERNALLY-MANAGED')))",
                    ])
                    .stdin(Stdio::null())
                    .stderr(Stdio::null())
                    .output()
                    .await;
                let managed = matches!(&probe, Ok(out) if String::from_utf8_lossy(&out.stdout).trim() == "True");
                debug!(managed, "[Provision] Probed host Python");
                managed
            })
            .await
    }
}

#[async_trait]
impl EnvironmentProvisioner for HostProvisioner {
    async fn provision(&self, instance_id: &str, config: &StdioConfig) -> PoolResult<Provisioned> {
        let Some(setup) = &config.setup else {
            return Ok(Provisioned::default());
        };

        if is_git_clone(&setup.command, &setup.args) {
            return self.clone_repository(instance_id, setup).await;
        }

        if is_pip_install(setup) && self.python_is_managed().await {
            return self.install_into_venv(instance_id, setup, config).await;
        }

        let working_dir = config.working_dir.as_ref().map(PathBuf::from);
        run_setup(
            Path::new(&setup.command),
            &setup.args,
            working_dir.as_deref(),
            self.setup_timeout,
        )
        .await?;
        Ok(Provisioned {
            working_dir,
            ..Default::default()
        })
    }

    async fn release(&self, instance_id: &str) {
        for dir in [self.repos_dir.join(instance_id), self.venvs_dir.join(instance_id)] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(instance_id, dir = %dir.display(), "[Provision] Removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    instance_id,
                    dir = %dir.display(),
                    error = %e,
                    "[Provision] Could not remove directory"
                ),
            }
        }
    }
}

/// `pip install ...` or `python -m pip install ...`.
fn is_pip_install(setup: &SetupCommand) -> bool {
    let exe = executable_name(&setup.command);
    let args: Vec<&str> = setup.args.iter().map(String::as_str).collect();
    if exe.starts_with("pip") {
        return args.first() == Some(&"install");
    }
    exe.starts_with("python") && args.starts_with(&["-m", "pip", "install"])
}

/// Arguments for `<venv python> -m pip ...` equivalent to `setup`.
fn pip_args(setup: &SetupCommand) -> Vec<String> {
    if executable_name(&setup.command).starts_with("pip") {
        ["-m", "pip"]
            .iter()
            .map(|s| s.to_string())
            .chain(setup.args.iter().cloned())
            .collect()
    } else {
        setup.args.clone()
    }
}

fn venv_bin_dir(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts")
    } else {
        venv.join("bin")
    }
}

/// Run one setup command to completion, mapping failures to `ProcessSpawn`.
async fn run_setup(
    program: &Path,
    args: &[String],
    cwd: Option<&Path>,
    limit: Duration,
) -> PoolResult<()> {
    let shown = format!("{} {}", program.display(), args.join(" "));
    debug!(command = %shown, "[Provision] Running setup");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = match tokio::time::timeout(limit, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PoolError::spawn(
                format!("Setup command not found: {}", program.display()),
                setup_hint(Some(127), ""),
            ));
        }
        Ok(Err(e)) => {
            return Err(PoolError::spawn(
                format!("Failed to start setup `{}`: {}", shown, e),
                None,
            ));
        }
        Err(_) => {
            return Err(PoolError::spawn(
                format!("Setup `{}` did not finish within {:?}", shown, limit),
                None,
            ));
        }
    };

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let code = output.status.code();
    let detail = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no error output")
        .trim();
    warn!(
        command = %shown,
        exit_code = ?code,
        "[Provision] Setup failed: {}",
        detail
    );
    Err(PoolError::spawn(
        format!(
            "Setup `{}` failed (exit {}): {}",
            shown,
            code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
            detail
        ),
        setup_hint(code, &stderr),
    ))
}

/// Remediation for common setup failures.
pub fn setup_hint(exit_code: Option<i32>, stderr: &str) -> Option<&'static str> {
    if stderr.contains("externally-managed-environment") {
        Some("the system Python forbids global installs; use a virtual environment")
    } else if stderr.contains("No module named pip") {
        Some("pip is missing for this interpreter; install it (python3 -m ensurepip) or use a virtual environment")
    } else if stderr.contains("Permission denied") {
        Some("permission denied; retry with --user or use a virtual environment")
    } else if exit_code == Some(127) || stderr.contains("not found") {
        Some("command not found; make sure it is installed and on PATH")
    } else {
        None
    }
}
