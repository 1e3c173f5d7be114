//! Registered server instances and their on-disk registry (`instances.json`).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::utils;

/// One registered server: identity plus the directory its files live in.
/// Runtime state (process, lifecycle) lives in the manager, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub working_dir: String,
    /// Pinned game version, if the operator chose one.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: u64,
}

impl InstanceRecord {
    pub fn new(name: &str, working_dir: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            working_dir: working_dir.to_string(),
            version: None,
            description: None,
            created_at: utils::current_timestamp(),
        }
    }

    pub fn working_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.working_dir)
    }
}

/// JSON-file-backed instance registry.
pub struct InstanceStore {
    file_path: PathBuf,
    instances: Vec<InstanceRecord>,
}

impl InstanceStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            instances: Vec::new(),
        }
    }

    pub fn load(&mut self) -> Result<()> {
        if !self.file_path.exists() {
            tracing::info!("Instance registry does not exist yet, starting empty");
            self.instances = Vec::new();
            return Ok(());
        }

        let content = fs::read_to_string(&self.file_path)?;
        self.instances = serde_json::from_str(&content)?;
        tracing::info!("Loaded {} instance(s)", self.instances.len());
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.instances)?;
        fs::write(&self.file_path, content)?;
        tracing::debug!("Saved {} instance(s)", self.instances.len());
        Ok(())
    }

    pub fn add(&mut self, instance: InstanceRecord) -> Result<()> {
        self.instances.push(instance);
        self.save()
    }

    pub fn remove(&mut self, id: &str) -> Result<()> {
        self.instances.retain(|i| i.id != id);
        self.save()
    }

    pub fn get(&self, id: &str) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| i.name == name)
    }

    pub fn list(&self) -> &[InstanceRecord] {
        &self.instances
    }

    pub fn update(&mut self, id: &str, instance: InstanceRecord) -> Result<()> {
        if let Some(pos) = self.instances.iter().position(|i| i.id == id) {
            self.instances[pos] = instance;
            self.save()
        } else {
            Err(anyhow::anyhow!("Instance not found: {}", id))
        }
    }
}
