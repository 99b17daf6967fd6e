//! Skill manifest - metadata and tool declarations
//!
//! A skill is a directory containing `skill.json`. Each declared tool
//! names its handler as `./file#exportName`; the export is resolved
//! against the compile-time handler registry.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Skill manifest filename
pub const SKILL_MANIFEST_FILENAME: &str = "skill.json";

/// Skill manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillManifest {
    /// Unique skill name
    pub name: String,
    /// Skill version
    #[serde(default)]
    pub version: Option<String>,
    /// Human description
    #[serde(default)]
    pub description: String,
    /// Disabled skills are skipped by auto-load
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Tools this skill contributes
    #[serde(default)]
    pub tools: Vec<SkillToolSpec>,
}

fn default_enabled() -> bool {
    true
}

/// One tool declared by a skill
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillToolSpec {
    /// Tool name (snake_case)
    pub name: String,
    /// Tool description shown to the model
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool parameters
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
    /// Handler reference, `./file#exportName`
    pub handler: String,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl SkillManifest {
    /// Load and parse a manifest file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read manifest {}: {}", path.display(), e))
        })?;
        let manifest: SkillManifest = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Invalid manifest {}: {}", path.display(), e))
        })?;
        if manifest.name.is_empty() {
            return Err(Error::Config(format!(
                "Manifest {} has an empty skill name",
                path.display()
            )));
        }
        Ok(manifest)
    }
}

/// A parsed `./file#exportName` handler reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerRef {
    /// File part, without the `./` prefix
    pub file: String,
    /// Named export within the file
    pub export: String,
}

impl HandlerRef {
    /// Parse a handler string
    pub fn parse(raw: &str) -> Result<Self> {
        let (file, export) = raw.split_once('#').ok_or_else(|| {
            Error::Config(format!(
                "Handler \"{}\" must have the form ./file#exportName",
                raw
            ))
        })?;
        let file = file.strip_prefix("./").unwrap_or(file);
        if file.is_empty() || export.is_empty() {
            return Err(Error::Config(format!(
                "Handler \"{}\" must have the form ./file#exportName",
                raw
            )));
        }
        Ok(HandlerRef {
            file: file.to_string(),
            export: export.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_manifest() {
        let json = serde_json::json!({
            "name": "reporting",
            "version": "1.2.0",
            "description": "Report generation",
            "tools": [{
                "name": "generate_report",
                "description": "Build a report",
                "parameters": { "type": "object", "properties": { "title": { "type": "string" } } },
                "handler": "./handlers#generateReport"
            }]
        });

        let manifest: SkillManifest = serde_json::from_value(json).unwrap();
        assert_eq!(manifest.name, "reporting");
        assert!(manifest.enabled);
        assert_eq!(manifest.tools.len(), 1);
        assert_eq!(manifest.tools[0].handler, "./handlers#generateReport");
    }

    #[test]
    fn enabled_defaults_to_true_and_can_be_disabled() {
        let manifest: SkillManifest =
            serde_json::from_value(serde_json::json!({ "name": "x" })).unwrap();
        assert!(manifest.enabled);

        let manifest: SkillManifest =
            serde_json::from_value(serde_json::json!({ "name": "x", "enabled": false })).unwrap();
        assert!(!manifest.enabled);
    }

    #[test]
    fn handler_ref_parsing() {
        let r = HandlerRef::parse("./handlers#run").unwrap();
        assert_eq!(r.file, "handlers");
        assert_eq!(r.export, "run");

        let r = HandlerRef::parse("nested/tools.rs#doIt").unwrap();
        assert_eq!(r.file, "nested/tools.rs");
        assert_eq!(r.export, "doIt");

        assert!(HandlerRef::parse("no-hash").is_err());
        assert!(HandlerRef::parse("./file#").is_err());
        assert!(HandlerRef::parse("#export").is_err());
    }
}
