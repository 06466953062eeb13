//! Persisted port mappings.
//!
//! The mapping set lives in a JSON array file (`master.mappings_path`):
//!
//! ```json
//! [{"agentId": "web-01", "masterPort": 2222, "agentPort": 22,
//!   "description": "ssh", "isActive": true}]
//! ```
//!
//! `serverId` is accepted as an alias of `agentId`. A missing file means no
//! mappings. Writes go to a temp file that is renamed into place.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::auth::AgentCredentials;
use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelMapping {
    #[serde(alias = "serverId")]
    pub agent_id: String,
    /// Listener port on the master.
    pub master_port: u16,
    /// Target port on the agent host.
    pub agent_port: u16,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Mapping records, serialized through one lock so validation and
/// persistence never interleave.
pub struct MappingStore {
    path: Option<PathBuf>,
    mappings: Mutex<Vec<TunnelMapping>>,
}

impl MappingStore {
    /// Load the store. `None` keeps mappings in memory only.
    pub async fn open(path: Option<PathBuf>) -> Result<Self, RelayError> {
        let mappings = match &path {
            Some(p) => read_file(p).await?,
            None => Vec::new(),
        };
        Ok(Self {
            path,
            mappings: Mutex::new(mappings),
        })
    }

    pub async fn list(&self) -> Vec<TunnelMapping> {
        self.mappings.lock().await.clone()
    }

    pub async fn active(&self) -> Vec<TunnelMapping> {
        active_of(&self.mappings.lock().await)
    }

    /// Validate and persist a new mapping. Returns the new active set.
    pub async fn create(
        &self,
        mapping: TunnelMapping,
        credentials: &AgentCredentials,
    ) -> Result<Vec<TunnelMapping>, RelayError> {
        let mut mappings = self.mappings.lock().await;
        validate(&mapping, &mappings, credentials)?;
        let mut next = mappings.clone();
        next.push(mapping);
        self.persist(&next).await?;
        *mappings = next;
        Ok(active_of(&mappings))
    }

    /// Delete every mapping on `master_port`. Returns how many were removed
    /// and the new active set.
    pub async fn delete(
        &self,
        master_port: u16,
    ) -> Result<(usize, Vec<TunnelMapping>), RelayError> {
        let mut mappings = self.mappings.lock().await;
        let next: Vec<TunnelMapping> = mappings
            .iter()
            .filter(|m| m.master_port != master_port)
            .cloned()
            .collect();
        let removed = mappings.len() - next.len();
        if removed > 0 {
            self.persist(&next).await?;
            *mappings = next;
        }
        Ok((removed, active_of(&mappings)))
    }

    /// Re-read the file, picking up edits made outside the API.
    pub async fn reread(&self) -> Result<Vec<TunnelMapping>, RelayError> {
        let mut mappings = self.mappings.lock().await;
        if let Some(path) = &self.path {
            *mappings = read_file(path).await?;
        }
        Ok(active_of(&mappings))
    }

    async fn persist(&self, mappings: &[TunnelMapping]) -> Result<(), RelayError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let body = serde_json::to_vec_pretty(mappings)
            .map_err(|e| RelayError::Config(format!("serialize mappings: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        info!(path = %path.display(), count = mappings.len(), "Mappings saved");
        Ok(())
    }
}

fn active_of(mappings: &[TunnelMapping]) -> Vec<TunnelMapping> {
    mappings.iter().filter(|m| m.is_active).cloned().collect()
}

async fn read_file(path: &Path) -> Result<Vec<TunnelMapping>, RelayError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| RelayError::Config(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn validate(
    mapping: &TunnelMapping,
    existing: &[TunnelMapping],
    credentials: &AgentCredentials,
) -> Result<(), RelayError> {
    if mapping.master_port == 0 || mapping.agent_port == 0 {
        return Err(RelayError::InvalidMapping("ports must be non-zero".into()));
    }
    if !credentials.is_tunnel_capable(&mapping.agent_id) {
        return Err(RelayError::InvalidMapping(format!(
            "agent '{}' has no tunnel identity",
            mapping.agent_id
        )));
    }
    if mapping.is_active
        && existing
            .iter()
            .any(|m| m.is_active && m.master_port == mapping.master_port)
    {
        return Err(RelayError::PortConflict(mapping.master_port));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentCredential;

    fn credentials() -> AgentCredentials {
        AgentCredentials::new(&[AgentCredential {
            agent_id: "A1".into(),
            secret: "s3cret".into(),
        }])
    }

    fn mapping(master_port: u16, agent_port: u16) -> TunnelMapping {
        TunnelMapping {
            agent_id: "A1".into(),
            master_port,
            agent_port,
            description: String::new(),
            is_active: true,
        }
    }

    #[test]
    fn test_server_id_alias_and_defaults() {
        let m: TunnelMapping =
            serde_json::from_str(r#"{"serverId":"A1","masterPort":2222,"agentPort":22}"#).unwrap();
        assert_eq!(m.agent_id, "A1");
        assert!(m.is_active);
        assert!(m.description.is_empty());
        let out = serde_json::to_value(&m).unwrap();
        assert_eq!(out["agentId"], "A1");
    }

    #[tokio::test]
    async fn test_create_validates() {
        let store = MappingStore::open(None).await.unwrap();
        let creds = credentials();

        store.create(mapping(2222, 22), &creds).await.unwrap();
        assert!(matches!(
            store.create(mapping(2222, 80), &creds).await,
            Err(RelayError::PortConflict(2222))
        ));

        let mut inactive = mapping(2222, 80);
        inactive.is_active = false;
        store.create(inactive, &creds).await.unwrap();

        let mut stranger = mapping(3000, 80);
        stranger.agent_id = "nobody".into();
        assert!(matches!(
            store.create(stranger, &creds).await,
            Err(RelayError::InvalidMapping(_))
        ));
        assert!(matches!(
            store.create(mapping(0, 22), &creds).await,
            Err(RelayError::InvalidMapping(_))
        ));

        assert_eq!(store.list().await.len(), 2);
        assert_eq!(store.active().await.len(), 1);
    }

    #[tokio::test]
    async fn test_persists_and_rereads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mappings.json");
        let store = MappingStore::open(Some(path.clone())).await.unwrap();
        assert!(store.list().await.is_empty());

        store.create(mapping(2222, 22), &credentials()).await.unwrap();
        store.create(mapping(8080, 80), &credentials()).await.unwrap();
        let (removed, active) = store.delete(2222).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(active, vec![mapping(8080, 80)]);
        assert_eq!(store.delete(2222).await.unwrap().0, 0);

        let reopened = MappingStore::open(Some(path.clone())).await.unwrap();
        assert_eq!(reopened.list().await, vec![mapping(8080, 80)]);

        std::fs::write(&path, r#"[{"agentId":"A1","masterPort":9000,"agentPort":90}]"#).unwrap();
        assert_eq!(reopened.reread().await.unwrap(), vec![mapping(9000, 90)]);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            reopened.reread().await,
            Err(RelayError::Config(_))
        ));
    }
}
