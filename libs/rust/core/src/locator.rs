//! Parameter locator: `model_id -> [ParticipantReference]` in canonical order.
//!
//! The registry is an external collaborator; these are thin clients over it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::LocatorFailure;
use crate::package::ParticipantReference;

#[async_trait]
pub trait ParameterLocator: Send + Sync {
    /// Participants of `model_id`, in the order their packages must be aggregated.
    async fn locate(&self, model_id: &str) -> Result<Vec<ParticipantReference>, LocatorFailure>;

    /// Re-reads a locally cached registry. Remote registries are queried per call and have nothing to refresh.
    fn refresh(&self) -> Result<(), LocatorFailure> { Ok(()) }
}

#[derive(Debug, Default, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    models: HashMap<String, Vec<ParticipantReference>>,
}

/// File-backed registry (YAML or JSON), reloadable without restarting.
pub struct StaticRegistry {
    path: Option<PathBuf>,
    models: RwLock<HashMap<String, Vec<ParticipantReference>>>,
}

impl StaticRegistry {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LocatorFailure> {
        let path = path.as_ref().to_path_buf();
        let models = read_document(&path)?;
        info!(path = %path.display(), models = models.len(), "participant registry loaded");
        Ok(Self { path: Some(path), models: RwLock::new(models) })
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, Vec<ParticipantReference>)>) -> Self {
        Self { path: None, models: RwLock::new(entries.into_iter().collect()) }
    }

    /// Re-reads the backing file. The previous contents stay active if the new file is invalid.
    pub fn reload(&self) -> Result<usize, LocatorFailure> {
        let Some(path) = &self.path else { return Ok(self.models.read().len()) };
        let models = read_document(path)?;
        let n = models.len();
        *self.models.write() = models;
        info!(path = %path.display(), models = n, "participant registry reloaded");
        Ok(n)
    }
}

fn read_document(path: &Path) -> Result<HashMap<String, Vec<ParticipantReference>>, LocatorFailure> {
    let text = std::fs::read_to_string(path).map_err(|e| LocatorFailure::Registry(format!("{}: {e}", path.display())))?;
    // YAML is a superset of JSON, one parser covers both formats
    let doc: RegistryDocument = serde_yaml::from_str(&text).map_err(|e| LocatorFailure::Registry(format!("{}: {e}", path.display())))?;
    Ok(doc.models)
}

#[async_trait]
impl ParameterLocator for StaticRegistry {
    async fn locate(&self, model_id: &str) -> Result<Vec<ParticipantReference>, LocatorFailure> {
        let models = self.models.read();
        let refs = models.get(model_id).cloned().ok_or_else(|| LocatorFailure::UnknownModel(model_id.to_string()))?;
        debug!(model_id, participants = refs.len(), "located participants");
        Ok(refs)
    }

    fn refresh(&self) -> Result<(), LocatorFailure> { self.reload().map(|_| ()) }
}

/// Registry reached over HTTP: `GET {base_url}/models/{model_id}/participants`.
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRegistry {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, LocatorFailure> {
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(|e| LocatorFailure::Registry(e.to_string()))?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl ParameterLocator for HttpRegistry {
    async fn locate(&self, model_id: &str) -> Result<Vec<ParticipantReference>, LocatorFailure> {
        if model_id.is_empty() || !model_id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
            return Err(LocatorFailure::UnknownModel(model_id.to_string()));
        }
        let url = format!("{}/models/{}/participants", self.base_url, model_id);
        let resp = self.client.get(&url).send().await.map_err(|e| LocatorFailure::Registry(e.to_string()))?;
        match resp.status() {
            s if s == reqwest::StatusCode::NOT_FOUND => Err(LocatorFailure::UnknownModel(model_id.to_string())),
            s if !s.is_success() => Err(LocatorFailure::Registry(format!("registry answered with status {}", s.as_u16()))),
            _ => resp.json::<Vec<ParticipantReference>>().await.map_err(|e| LocatorFailure::Registry(e.to_string())),
        }
    }
}
