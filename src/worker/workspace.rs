use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use uuid::Uuid;

use crate::catalog::{Server, VarMap};
use crate::config::{ArtifactConfig, ExecutorConfig};
use crate::error::{Result, RunbookError};

const INVENTORY_FILE: &str = "inventory.ini";
const VARS_FILE: &str = "extra_vars.json";
const RC_FILE: &str = "rc";
const INVENTORY_GROUP: &str = "targets";

/// Scratch directory owned by the worker executing one job.
///
/// Backed by a [`TempDir`], so it is removed when dropped on any exit path.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    inventory: PathBuf,
    vars: PathBuf,
}

impl Workspace {
    /// Create the directory and write the inventory and merged variables.
    pub fn prepare(
        config: &ExecutorConfig,
        job_id: Uuid,
        server: &Server,
        vars: &VarMap,
    ) -> Result<Self> {
        let inventory = render_inventory(server, config.private_key_dir.as_deref())?;

        std::fs::create_dir_all(&config.runner_dir).map_err(|e| {
            RunbookError::AdapterLaunch(format!(
                "cannot create runner directory {}: {}",
                config.runner_dir.display(),
                e
            ))
        })?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{}-", job_id))
            .tempdir_in(&config.runner_dir)
            .map_err(|e| RunbookError::AdapterLaunch(format!("cannot create workspace: {}", e)))?;

        let inventory_path = dir.path().join(INVENTORY_FILE);
        let vars_path = dir.path().join(VARS_FILE);
        std::fs::write(&inventory_path, inventory)?;
        std::fs::write(&vars_path, serde_json::to_vec_pretty(vars)?)?;

        tracing::debug!(job_id = %job_id, path = %dir.path().display(), "Workspace prepared");
        Ok(Self {
            dir,
            inventory: inventory_path,
            vars: vars_path,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn inventory_path(&self) -> &Path {
        &self.inventory
    }

    pub fn vars_path(&self) -> &Path {
        &self.vars
    }

    /// Remove the directory, reporting any failure instead of ignoring it.
    pub fn close(self) -> std::io::Result<()> {
        self.dir.close()
    }
}

/// Playbook defaults overlaid with the job's extra variables. Keys present
/// in both take the job's value.
pub fn merge_vars(defaults: &VarMap, overrides: &VarMap) -> VarMap {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn is_inventory_token(value: &str) -> bool {
    !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '[' | ']' | '=' | '#' | ';'))
}

/// Single-host INI inventory for `server`.
pub fn render_inventory(server: &Server, private_key_dir: Option<&Path>) -> Result<String> {
    let conn = &server.connection;
    if !is_inventory_token(&server.hostname) {
        return Err(RunbookError::AdapterLaunch(format!(
            "malformed inventory: invalid hostname '{}'",
            server.hostname
        )));
    }
    if !is_inventory_token(&conn.address) {
        return Err(RunbookError::AdapterLaunch(format!(
            "malformed inventory: invalid address '{}'",
            conn.address
        )));
    }
    if !is_inventory_token(&conn.user) {
        return Err(RunbookError::AdapterLaunch(format!(
            "malformed inventory: invalid user '{}'",
            conn.user
        )));
    }
    if conn.port == 0 {
        return Err(RunbookError::AdapterLaunch(
            "malformed inventory: port must not be 0".to_string(),
        ));
    }

    let mut out = format!("[{}]\n", INVENTORY_GROUP);
    let _ = write!(
        out,
        "{} ansible_host={} ansible_port={} ansible_user={}",
        server.hostname, conn.address, conn.port, conn.user
    );
    if let Some(key) = &conn.private_key {
        let key = match private_key_dir {
            Some(dir) if key.is_relative() => dir.join(key),
            _ => key.clone(),
        };
        let key = key.display().to_string();
        if !is_inventory_token(&key) {
            return Err(RunbookError::AdapterLaunch(format!(
                "malformed inventory: invalid private key path '{}'",
                key
            )));
        }
        let _ = write!(out, " ansible_ssh_private_key_file={}", key);
    }
    out.push('\n');
    Ok(out)
}

/// Per-job copies of the inputs and return code, kept after the workspace
/// is gone. Only the newest `keep` directories survive.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    config: ArtifactConfig,
}

impl ArtifactStore {
    pub fn new(config: ArtifactConfig) -> Self {
        Self { config }
    }

    pub fn persist(
        &self,
        job_id: Uuid,
        workspace: &Workspace,
        exit_code: Option<i32>,
    ) -> std::io::Result<PathBuf> {
        let target = self.config.dir.join(job_id.to_string());
        std::fs::create_dir_all(&target)?;
        std::fs::copy(workspace.inventory_path(), target.join(INVENTORY_FILE))?;
        std::fs::copy(workspace.vars_path(), target.join(VARS_FILE))?;
        let rc = exit_code.map_or_else(|| "none".to_string(), |c| c.to_string());
        std::fs::write(target.join(RC_FILE), rc)?;
        self.rotate()?;
        Ok(target)
    }

    fn rotate(&self) -> std::io::Result<()> {
        let mut dirs: Vec<(std::time::SystemTime, PathBuf)> = std::fs::read_dir(&self.config.dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| {
                let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
                Some((modified, entry.path()))
            })
            .collect();
        if dirs.len() <= self.config.keep {
            return Ok(());
        }
        dirs.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, path) in dirs.into_iter().skip(self.config.keep) {
            tracing::debug!(path = %path.display(), "Rotating old artifacts");
            std::fs::remove_dir_all(&path)?;
        }
        Ok(())
    }
}
