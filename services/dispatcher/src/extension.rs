use std::collections::HashMap;

use parking_lot::RwLock;
use schema::{DatasetDefinition, ExtensionCapabilities, ExtensionDescriptor};
use serde::Serialize;

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionChange {
    Updated,
    Removed,
    Disabled,
}

impl ExtensionChange {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::Removed => "removed",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionEvent {
    pub name: String,
    pub change: ExtensionChange,
}

impl ExtensionEvent {
    pub fn new(name: &str, change: ExtensionChange) -> Self {
        Self {
            name: name.to_string(),
            change,
        }
    }
}

#[derive(Debug, Clone)]
struct ExtensionEntry {
    descriptor: ExtensionDescriptor,
    enabled: bool,
    version: u64,
}

/// Declared extensions keyed by case-insensitive name.
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    entries: RwLock<HashMap<String, ExtensionEntry>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: ExtensionDescriptor) -> u64 {
        let mut entries = self.entries.write();
        let key = descriptor.name.to_ascii_lowercase();
        let version = entries.get(&key).map_or(1, |entry| entry.version + 1);
        entries.insert(
            key,
            ExtensionEntry {
                descriptor,
                enabled: true,
                version,
            },
        );
        version
    }

    /// Replaces the descriptor and bumps its version; `None` when unknown.
    pub fn update(&self, descriptor: ExtensionDescriptor) -> Option<ExtensionEvent> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&descriptor.name.to_ascii_lowercase())?;
        entry.version += 1;
        entry.enabled = true;
        let event = ExtensionEvent::new(&entry.descriptor.name, ExtensionChange::Updated);
        entry.descriptor = descriptor;
        Some(event)
    }

    pub fn remove(&self, name: &str) -> Option<ExtensionEvent> {
        self.entries
            .write()
            .remove(&name.to_ascii_lowercase())
            .map(|entry| ExtensionEvent::new(&entry.descriptor.name, ExtensionChange::Removed))
    }

    pub fn disable(&self, name: &str) -> Option<ExtensionEvent> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&name.to_ascii_lowercase())?;
        entry.enabled = false;
        entry.version += 1;
        Some(ExtensionEvent::new(
            &entry.descriptor.name,
            ExtensionChange::Disabled,
        ))
    }

    /// Enabled descriptors only.
    pub fn descriptor(&self, name: &str) -> Option<ExtensionDescriptor> {
        self.entries
            .read()
            .get(&name.to_ascii_lowercase())
            .filter(|entry| entry.enabled)
            .map(|entry| entry.descriptor.clone())
    }

    pub fn version(&self, name: &str) -> Option<u64> {
        self.entries
            .read()
            .get(&name.to_ascii_lowercase())
            .map(|entry| entry.version)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .values()
            .map(|entry| entry.descriptor.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Every referenced extension must be present, enabled, and declare the
    /// capabilities the dataset asks for.
    pub fn check_references(&self, dataset: &DatasetDefinition) -> Result<(), DispatchError> {
        for reference in &dataset.extensions {
            let declared = self
                .descriptor(&reference.name)
                .map(|descriptor| descriptor.capabilities);
            let satisfied =
                declared.is_some_and(|capabilities| capabilities.contains(reference.requires));
            if !satisfied {
                return Err(DispatchError::ExtensionCapabilityMismatch {
                    dataset: dataset.name.clone(),
                    extension: reference.name.clone(),
                    required: reference.requires,
                    declared,
                });
            }
        }
        Ok(())
    }
}

pub fn descriptor(name: &str, capabilities: ExtensionCapabilities) -> ExtensionDescriptor {
    ExtensionDescriptor {
        name: name.to_string(),
        capabilities,
    }
}
