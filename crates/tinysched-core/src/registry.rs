//! The agent registry: a static mapping from agent name to queue name,
//! loaded once at scheduler start from the agent control file.
//!
//! The control file is a JSON array of `{"agentName": ..., "agentType": ...}`
//! objects. `agentType` names the queue the agent serves. Unknown fields are
//! ignored with a warning so newer control files keep loading. An absent file
//! yields an empty registry and the reconciler falls back to legacy mode.

use crate::error::CoreError;
use crate::ident;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

const MAX_CONTROL_FILE_BYTES: u64 = 10 * 1024 * 1024;
const KNOWN_FIELDS: [&str; 2] = ["agentName", "agentType"];

#[derive(Debug, Default, Clone)]
pub struct AgentRegistry {
    by_queue: BTreeMap<String, Vec<String>>,
    by_agent: BTreeMap<String, String>,
}

impl AgentRegistry {
    /// Load the registry from the control file. A missing file is not an
    /// error; it produces an empty registry.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.len() > MAX_CONTROL_FILE_BYTES {
            return Err(CoreError::Config(format!(
                "agent control file {} exceeds {} bytes",
                path.display(),
                MAX_CONTROL_FILE_BYTES
            )));
        }

        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<serde_json::Map<String, serde_json::Value>> =
            serde_json::from_str(&raw).map_err(|e| {
                CoreError::Config(format!(
                    "agent control file {} is not a JSON array of objects: {e}",
                    path.display()
                ))
            })?;

        let mut registry = Self::default();
        for (index, entry) in entries.iter().enumerate() {
            let name = required_field(entry, index, "agentName")?;
            let queue = required_field(entry, index, "agentType")?;
            ident::validate_ident("agentName", &name)?;
            ident::validate_ident("agentType", &queue)?;

            for key in entry.keys() {
                if !KNOWN_FIELDS.contains(&key.as_str()) {
                    warn!(agent = %name, field = %key, "ignoring unknown agent control field");
                }
            }

            if registry.by_agent.contains_key(&name) {
                return Err(CoreError::Config(format!(
                    "duplicate agent {name:?} in control file"
                )));
            }
            registry
                .by_queue
                .entry(queue.clone())
                .or_default()
                .push(name.clone());
            registry.by_agent.insert(name, queue);
        }

        for agents in registry.by_queue.values_mut() {
            agents.sort();
        }
        Ok(registry)
    }

    pub fn is_empty(&self) -> bool {
        self.by_agent.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_agent.len()
    }

    /// Queues in lexicographic order.
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.by_queue.keys().map(String::as_str)
    }

    /// Agents in lexicographic order.
    pub fn agents(&self) -> impl Iterator<Item = &str> {
        self.by_agent.keys().map(String::as_str)
    }

    pub fn agents_in_queue(&self, queue: &str) -> &[String] {
        self.by_queue.get(queue).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn queue_of(&self, agent: &str) -> Option<&str> {
        self.by_agent.get(agent).map(String::as_str)
    }
}

fn required_field(
    entry: &serde_json::Map<String, serde_json::Value>,
    index: usize,
    field: &str,
) -> Result<String, CoreError> {
    match entry.get(field).and_then(|v| v.as_str()) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(CoreError::Config(format!(
            "agent control entry {index} is missing a non-empty {field:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_control(json: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agents.json");
        std::fs::write(&path, json).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_builds_both_indices() {
        let (_dir, path) = write_control(
            r#"[{"agentName":"vaela","agentType":"dev"},
                {"agentName":"damien","agentType":"dev"},
                {"agentName":"oscar","agentType":"qa"}]"#,
        );
        let registry = AgentRegistry::load(&path).unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.agents_in_queue("dev"), ["damien", "vaela"]);
        assert_eq!(registry.agents_in_queue("qa"), ["oscar"]);
        assert_eq!(registry.queue_of("oscar"), Some("qa"));
        assert_eq!(registry.queue_of("nobody"), None);
        assert_eq!(registry.queues().collect::<Vec<_>>(), vec!["dev", "qa"]);
    }

    #[test]
    fn test_missing_file_is_empty_registry() {
        let dir = tempdir().unwrap();
        let registry = AgentRegistry::load(&dir.path().join("absent.json")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_agent_is_error() {
        let (_dir, path) = write_control(
            r#"[{"agentName":"vaela","agentType":"dev"},
                {"agentName":"vaela","agentType":"qa"}]"#,
        );
        assert!(matches!(
            AgentRegistry::load(&path),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn test_missing_required_field_is_error() {
        let (_dir, path) = write_control(r#"[{"agentName":"vaela"}]"#);
        assert!(AgentRegistry::load(&path).is_err());

        let (_dir, path) = write_control(r#"[{"agentName":"","agentType":"dev"}]"#);
        assert!(AgentRegistry::load(&path).is_err());
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let (_dir, path) = write_control(
            r#"[{"agentName":"vaela","agentType":"dev","color":"teal"}]"#,
        );
        let registry = AgentRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_not_an_array_is_error() {
        let (_dir, path) = write_control(r#"{"agentName":"vaela"}"#);
        assert!(AgentRegistry::load(&path).is_err());
    }
}
