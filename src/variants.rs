//! Variant System - One Pipeline, N Images
//!
//! Every service and agent shares the same build pipeline; a variant
//! descriptor is the only thing that differs between them. Descriptors are
//! contracts: an unknown identifier is an error, never a fallback.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::contract::HealthProbe;

pub type VariantId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantDescriptor {
    pub id: VariantId,
    pub name: String,
    pub description: String,
    pub descriptor_version: String,
    pub engine_min_version: String,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub superseded_by: Option<String>,
    pub kind: VariantKind,
    /// Source entry point compiled for this variant, relative to the context.
    pub entry_point: PathBuf,
    /// Variant-specific configuration overlay, relative to the context.
    /// Absent means an empty overlay.
    #[serde(default)]
    pub config_overlay: Option<PathBuf>,
    #[serde(default)]
    pub base: BasePolicy,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Probe override; the minimal-OS default applies when absent.
    #[serde(default)]
    pub probe: Option<HealthProbe>,
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VariantKind {
    Service,
    Agent,
}

/// Runtime base strategy for the assembled image.
///
/// Minimal-OS keeps a shell and a probe-capable client in the final layer;
/// zero-OS keeps nothing but the binary and trust material.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BasePolicy {
    #[default]
    MinimalOs,
    ZeroOs,
}

impl VariantDescriptor {
    /// Resolve the (entry point, overlay) pair for this variant.
    ///
    /// Pure and deterministic: the same descriptor always yields the same
    /// pair. A missing overlay resolves to `None` (empty overlay).
    pub fn resolve(&self) -> (&Path, Option<&Path>) {
        (self.entry_point.as_path(), self.config_overlay.as_deref())
    }
}

/// Variant registry - loads and caches descriptors
pub struct VariantRegistry {
    variants: HashMap<VariantId, VariantDescriptor>,
}

impl VariantRegistry {
    pub fn new() -> Self {
        Self {
            variants: HashMap::new(),
        }
    }

    pub fn load_from_dir(dir: &Path) -> Result<Self, std::io::Error> {
        let mut registry = Self::new();
        if dir.exists() {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().map_or(false, |e| e == "json") {
                    if let Ok(content) = fs::read_to_string(&path) {
                        if let Ok(descriptor) =
                            serde_json::from_str::<VariantDescriptor>(&content)
                        {
                            registry.variants.insert(descriptor.id.clone(), descriptor);
                        }
                    }
                }
            }
        }
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<&VariantDescriptor> {
        self.variants.get(id)
    }

    pub fn list(&self) -> Vec<&VariantDescriptor> {
        self.variants.values().collect()
    }

    pub fn register(&mut self, descriptor: VariantDescriptor) {
        self.variants.insert(descriptor.id.clone(), descriptor);
    }
}

impl Default for VariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> VariantDescriptor {
        VariantDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            descriptor_version: "1.0.0".to_string(),
            engine_min_version: "1.0.0".to_string(),
            deprecated: false,
            superseded_by: None,
            kind: VariantKind::Agent,
            entry_point: PathBuf::from("src/main/agents").join(id),
            config_overlay: Some(PathBuf::from("src/main/agents").join(id).join("config")),
            base: BasePolicy::default(),
            port: default_port(),
            probe: None,
        }
    }

    #[test]
    fn resolve_is_deterministic() {
        let d = descriptor("agent-billing");
        let first = d.resolve();
        let second = d.resolve();
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
    }

    #[test]
    fn missing_overlay_resolves_to_none() {
        let mut d = descriptor("svc-gateway");
        d.config_overlay = None;
        assert!(d.resolve().1.is_none());
    }

    #[test]
    fn registry_lookup_by_id() {
        let mut registry = VariantRegistry::new();
        registry.register(descriptor("agent-billing"));
        assert!(registry.get("agent-billing").is_some());
        assert!(registry.get("agent-unicorn").is_none());
    }

    #[test]
    fn descriptor_json_round_trip() {
        let json = r#"{
            "id": "agent-billing",
            "name": "Billing Agent",
            "description": "Invoices and metering",
            "descriptorVersion": "1.0.0",
            "engineMinVersion": "1.0.0",
            "kind": "agent",
            "entryPoint": "src/main/agents/agent-billing",
            "configOverlay": "src/main/agents/agent-billing/config",
            "base": "zero-os"
        }"#;
        let d: VariantDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.base, BasePolicy::ZeroOs);
        assert_eq!(d.port, 8080);
        assert!(d.probe.is_none());
    }
}
