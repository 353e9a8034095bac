//! Named state-chart definitions.
//!
//! The registry always carries the bundled `document-workflow` chart. Extra
//! charts come from `*.toml` files in a definitions directory and can be
//! reloaded while the process runs; a reload that fails leaves the previously
//! loaded set in place.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::definition::{StateMachineDefinition, DOCUMENT_WORKFLOW};
use crate::errors::{DefinitionError, DefinitionResult};

#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: RwLock<HashMap<String, Arc<StateMachineDefinition>>>,
    directory: Option<PathBuf>,
}

impl DefinitionRegistry {
    /// Registry holding only the bundled document workflow.
    pub fn with_builtin() -> DefinitionResult<Self> {
        let registry = Self::default();
        registry.register(StateMachineDefinition::document_workflow()?);
        Ok(registry)
    }

    /// Bundled workflow plus every definition found in `dir`.
    pub fn from_dir(dir: impl Into<PathBuf>) -> DefinitionResult<Self> {
        let mut registry = Self::with_builtin()?;
        registry.directory = Some(dir.into());
        registry.reload()?;
        Ok(registry)
    }

    /// Add or replace a definition under its own name.
    pub fn register(&self, definition: StateMachineDefinition) -> Arc<StateMachineDefinition> {
        let definition = Arc::new(definition);
        let name = definition.name().to_string();
        if self
            .definitions
            .write()
            .insert(name.clone(), Arc::clone(&definition))
            .is_some()
        {
            debug!(definition = %name, "Replaced workflow definition");
        }
        definition
    }

    pub fn get(&self, name: &str) -> DefinitionResult<Arc<StateMachineDefinition>> {
        self.definitions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DefinitionError::NotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Compile every `*.toml` file in `dir`, sorted by file name.
    pub fn load_dir(dir: &Path) -> DefinitionResult<Vec<StateMachineDefinition>> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                paths.push(path);
            }
        }
        paths.sort();

        paths
            .iter()
            .map(|path| {
                debug!("Loading workflow definition from {:?}", path);
                StateMachineDefinition::load(path)
            })
            .collect()
    }

    /// Re-read the definitions directory and swap the loaded set in one step.
    ///
    /// Returns the number of definitions now registered.
    pub fn reload(&self) -> DefinitionResult<usize> {
        let Some(dir) = self.directory.as_deref() else {
            return Ok(self.definitions.read().len());
        };

        let loaded = match Self::load_dir(dir) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("Reload of {:?} failed, keeping current definitions: {}", dir, e);
                return Err(e);
            }
        };

        let mut next = HashMap::new();
        let builtin = StateMachineDefinition::document_workflow()?;
        next.insert(DOCUMENT_WORKFLOW.to_string(), Arc::new(builtin));
        for definition in loaded {
            let name = definition.name().to_string();
            if next.contains_key(&name) && name != DOCUMENT_WORKFLOW {
                return Err(DefinitionError::Invalid(format!(
                    "definition '{}' is defined twice in {:?}",
                    name, dir
                )));
            }
            next.insert(name, Arc::new(definition));
        }

        let count = next.len();
        *self.definitions.write() = next;
        info!(definitions = count, "Workflow definitions reloaded from {:?}", dir);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOGGLE: &str = r#"
name = "toggle"
initial = "off"

[[states]]
id = "off"
[[states.transitions]]
event = "flip"
target = "on"

[[states]]
id = "on"
[[states.transitions]]
event = "flip"
target = "off"
"#;

    #[test]
    fn test_builtin_is_always_present() {
        let registry = DefinitionRegistry::with_builtin().unwrap();
        assert_eq!(registry.names(), vec![DOCUMENT_WORKFLOW.to_string()]);
        assert!(registry.get(DOCUMENT_WORKFLOW).is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(DefinitionError::NotFound(_))
        ));
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("toggle.toml"), TOGGLE).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = DefinitionRegistry::from_dir(dir.path()).unwrap();
        assert_eq!(registry.names(), vec!["document-workflow", "toggle"]);
        assert_eq!(registry.get("toggle").unwrap().initial(), "off");
    }

    #[test]
    fn test_failed_reload_keeps_previous_set() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("toggle.toml"), TOGGLE).unwrap();
        let registry = DefinitionRegistry::from_dir(dir.path()).unwrap();

        std::fs::write(dir.path().join("broken.toml"), "name = ").unwrap();
        assert!(registry.reload().is_err());
        assert!(registry.get("toggle").is_ok());

        std::fs::remove_file(dir.path().join("broken.toml")).unwrap();
        std::fs::remove_file(dir.path().join("toggle.toml")).unwrap();
        assert_eq!(registry.reload().unwrap(), 1);
        assert!(registry.get("toggle").is_err());
    }

    #[test]
    fn test_register_replaces() {
        let registry = DefinitionRegistry::with_builtin().unwrap();
        let first = registry.register(StateMachineDefinition::from_toml_str(TOGGLE).unwrap());
        let second = registry.register(StateMachineDefinition::from_toml_str(TOGGLE).unwrap());
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&registry.get("toggle").unwrap(), &second));
    }
}
