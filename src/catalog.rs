//! Read-only references to the playbook and server catalogs.
//!
//! The catalogs themselves are owned elsewhere; job execution only needs to
//! look entries up by id and check that they are active.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub type PlaybookId = u64;
pub type ServerId = u64;

/// Free-form playbook variables.
pub type VarMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    pub id: PlaybookId,
    pub name: String,
    pub file_location: PathBuf,
    #[serde(default)]
    pub default_vars: VarMap,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

/// How to reach a target host over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub hostname: String,
    pub connection: ConnectionParams,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

pub trait Catalog: Send + Sync {
    fn playbook(&self, id: PlaybookId) -> Option<Playbook>;
    fn server(&self, id: ServerId) -> Option<Server>;
}

/// On-disk catalog format used by the CLI.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub playbooks: Vec<Playbook>,
    #[serde(default)]
    pub servers: Vec<Server>,
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryCatalog {
    playbooks: HashMap<PlaybookId, Playbook>,
    servers: HashMap<ServerId, Server>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a catalog from a JSON file. Relative playbook paths are resolved
    /// against the directory containing the file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: CatalogFile = serde_json::from_str(&raw)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut catalog = Self::new();
        for mut playbook in file.playbooks {
            if playbook.file_location.is_relative() {
                playbook.file_location = base.join(&playbook.file_location);
            }
            catalog = catalog.with_playbook(playbook);
        }
        for server in file.servers {
            catalog = catalog.with_server(server);
        }
        tracing::debug!(
            path = %path.display(),
            playbooks = catalog.playbooks.len(),
            servers = catalog.servers.len(),
            "Catalog loaded"
        );
        Ok(catalog)
    }

    pub fn with_playbook(mut self, playbook: Playbook) -> Self {
        self.playbooks.insert(playbook.id, playbook);
        self
    }

    pub fn with_server(mut self, server: Server) -> Self {
        self.servers.insert(server.id, server);
        self
    }
}

impl Catalog for InMemoryCatalog {
    fn playbook(&self, id: PlaybookId) -> Option<Playbook> {
        self.playbooks.get(&id).cloned()
    }

    fn server(&self, id: ServerId) -> Option<Server> {
        self.servers.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_applies_defaults_and_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{
                "playbooks": [{"id": 1, "name": "site", "file_location": "site.yml"}],
                "servers": [{"id": 7, "hostname": "web1", "connection": {"address": "10.0.0.5"}}]
            }"#,
        )
        .unwrap();

        let catalog = InMemoryCatalog::load(&path).unwrap();

        let playbook = catalog.playbook(1).unwrap();
        assert!(playbook.is_active);
        assert!(playbook.default_vars.is_empty());
        assert_eq!(playbook.file_location, dir.path().join("site.yml"));

        let server = catalog.server(7).unwrap();
        assert!(server.is_active);
        assert_eq!(server.connection.port, 22);
        assert_eq!(server.connection.user, "root");
        assert!(server.connection.private_key.is_none());

        assert!(catalog.playbook(2).is_none());
        assert!(catalog.server(1).is_none());
    }

    #[test]
    fn load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(InMemoryCatalog::load(&path).is_err());
    }
}
