//! Content-addressed identity for provider configurations
//!
//! The fingerprint is `sha256(canonical_json)` in hex, where the canonical
//! form contains:
//! - stdio: `command`, `args` (order kept), `env` (keys sorted), `workingDir`, `setup`
//! - sse: the trimmed `url`
//!
//! Git-backed providers (`git clone ...` either as the command or as the
//! setup step) are keyed by the repository instead, so two clones of the
//! same repository into different local paths share one instance.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use super::config::{executable_name, McpConfig, StdioConfig, REPO_HASH_ENV, REPO_URL_ENV};
use crate::error::PoolResult;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigFingerprint(String);

impl ConfigFingerprint {
    /// Compute the fingerprint of a config. Pure; fails only on invalid configs.
    pub fn of(config: &McpConfig) -> PoolResult<Self> {
        config.validate()?;

        let canonical = match config {
            McpConfig::Stdio(cfg) => match git_repo_identity(cfg) {
                Some(repo) if is_git_clone(&cfg.command, &cfg.args) => {
                    json!({ "type": "git-repo", "repo": repo })
                }
                // Cloned by setup: the repo replaces only the clone
                // destination. Launch command, env and working dir still
                // distinguish providers.
                Some(repo) => json!({
                    "type": "git-repo",
                    "repo": repo,
                    "command": cfg.command,
                    "args": cfg.args,
                    "env": sorted_env(cfg, true),
                    "workingDir": cfg.working_dir,
                }),
                None => json!({
                    "type": "stdio",
                    "command": cfg.command,
                    "args": cfg.args,
                    "env": sorted_env(cfg, false),
                    "workingDir": cfg.working_dir,
                    "setup": cfg.setup,
                }),
            },
            McpConfig::Sse(cfg) => json!({
                "type": "sse",
                "url": cfg.url.trim().trim_end_matches('/'),
            }),
        };

        Ok(Self(sha256_hex(&canonical.to_string())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ConfigFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Env with keys sorted; `skip_repo_keys` drops the repository markers
/// already folded into the repo identity.
fn sorted_env(cfg: &StdioConfig, skip_repo_keys: bool) -> BTreeMap<&str, &str> {
    cfg.env
        .iter()
        .filter(|(k, _)| !(skip_repo_keys && (*k == REPO_URL_ENV || *k == REPO_HASH_ENV)))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

/// Whether `command args...` is a `git clone` invocation.
pub fn is_git_clone(command: &str, args: &[String]) -> bool {
    let is_git = executable_name(command) == "git" || args.iter().any(|a| a == "git");
    is_git && args.iter().any(|a| a == "clone")
}

/// First argument after `clone` that looks like a repository URL.
pub fn clone_url(args: &[String]) -> Option<&str> {
    let clone_at = args.iter().position(|a| a == "clone")?;
    args[clone_at + 1..]
        .iter()
        .map(String::as_str)
        .find(|a| a.contains("://") || a.starts_with("git@"))
}

fn git_repo_identity(cfg: &StdioConfig) -> Option<String> {
    let args = if is_git_clone(&cfg.command, &cfg.args) {
        cfg.args.as_slice()
    } else {
        let setup = cfg.setup.as_ref()?;
        if !is_git_clone(&setup.command, &setup.args) {
            return None;
        }
        setup.args.as_slice()
    };

    cfg.env
        .get(REPO_HASH_ENV)
        .or_else(|| cfg.env.get(REPO_URL_ENV))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| clone_url(args).map(str::to_string))
}
