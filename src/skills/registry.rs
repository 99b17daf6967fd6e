//! Skill lifecycle registry and handler resolution
//!
//! Rust has no dynamic module loading, so `./file#exportName` handler
//! strings resolve against a lookup table populated at startup (the
//! compile-time registration path). Resolution is two-phase: locate
//! the file key, trying the configured extensions, then look up the
//! named export.
//!
//! Lifecycle: unloaded → loading → loaded → active → (error), with
//! hooks firing at each transition.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::manifest::{HandlerRef, SkillManifest, SkillToolSpec, SKILL_MANIFEST_FILENAME};
use crate::error::{Error, Result};
use crate::tools::{Tool, ToolProvider, ToolResult};

/// Skill lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillState {
    Unloaded,
    Loading,
    Loaded,
    Active,
    Error,
}

/// The body of a skill tool
#[async_trait]
pub trait SkillHandler: Send + Sync {
    async fn call(&self, args: Value) -> Result<ToolResult>;
}

impl std::fmt::Debug for dyn SkillHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SkillHandler")
    }
}

/// Wrap an async closure as a handler
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> SkillHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<ToolResult>> + Send,
{
    async fn call(&self, args: Value) -> Result<ToolResult> {
        (self.0)(args).await
    }
}

/// Lookup table mapping `file#export` references to handlers
pub struct HandlerRegistry {
    handlers: HashMap<HandlerRef, Arc<dyn SkillHandler>>,
    /// Extensions tried when locating the file part
    extensions: Vec<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: HashMap::new(),
            extensions: vec!["rs".into(), "js".into(), "ts".into()],
        }
    }

    /// Register a handler under `file#export`. The file part is
    /// stored without `./` prefix or extension.
    pub fn register(
        &mut self,
        file: &str,
        export: &str,
        handler: Arc<dyn SkillHandler>,
    ) {
        let key = HandlerRef {
            file: normalize_file_key(file, &self.extensions),
            export: export.to_string(),
        };
        self.handlers.insert(key, handler);
    }

    /// Two-phase resolution: locate the file key, then the export
    pub fn resolve(&self, raw: &str) -> Result<Arc<dyn SkillHandler>> {
        let parsed = HandlerRef::parse(raw)?;
        let key = HandlerRef {
            file: normalize_file_key(&parsed.file, &self.extensions),
            export: parsed.export.clone(),
        };

        if let Some(handler) = self.handlers.get(&key) {
            return Ok(handler.clone());
        }

        // Export lookup failure is distinguished from file lookup
        // failure for a useful error message.
        let file_known = self.handlers.keys().any(|k| k.file == key.file);
        if file_known {
            Err(Error::NotFound(format!(
                "export \"{}\" in handler file \"{}\"",
                parsed.export, parsed.file
            )))
        } else {
            Err(Error::NotFound(format!("handler file \"{}\"", parsed.file)))
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_file_key(file: &str, extensions: &[String]) -> String {
    let file = file.strip_prefix("./").unwrap_or(file);
    for ext in extensions {
        if let Some(stripped) = file.strip_suffix(&format!(".{}", ext)) {
            return stripped.to_string();
        }
    }
    file.to_string()
}

/// Lifecycle hooks. All default to no-ops.
#[async_trait]
pub trait SkillHooks: Send + Sync {
    async fn on_load(&self, _skill: &str) {}
    async fn on_activate(&self, _skill: &str) {}
    async fn on_deactivate(&self, _skill: &str) {}
    async fn on_unload(&self, _skill: &str) {}
}

struct NoHooks;

#[async_trait]
impl SkillHooks for NoHooks {}

struct SkillRecord {
    manifest: SkillManifest,
    dir: PathBuf,
    state: SkillState,
    /// Resolved at load time so activation cannot fail late
    handlers: Vec<(SkillToolSpec, Arc<dyn SkillHandler>)>,
}

/// Registry of skills and their states
pub struct SkillRegistry {
    skills: Mutex<HashMap<String, SkillRecord>>,
    handlers: HandlerRegistry,
    hooks: Arc<dyn SkillHooks>,
}

impl SkillRegistry {
    pub fn new(handlers: HandlerRegistry) -> Self {
        SkillRegistry {
            skills: Mutex::new(HashMap::new()),
            handlers,
            hooks: Arc::new(NoHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SkillHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// State of a skill, if known
    pub fn state(&self, name: &str) -> Option<SkillState> {
        self.skills
            .lock()
            .expect("skills lock")
            .get(name)
            .map(|r| r.state)
    }

    /// Names of all known skills
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .skills
            .lock()
            .expect("skills lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Load a skill from its directory. On handler-resolution failure
    /// the skill is recorded in the `Error` state.
    pub async fn load(&self, dir: &Path) -> Result<String> {
        let manifest_path = dir.join(SKILL_MANIFEST_FILENAME);
        let manifest = SkillManifest::load(&manifest_path)?;
        let name = manifest.name.clone();
        debug!("Loading skill {} from {}", name, dir.display());

        {
            let mut skills = self.skills.lock().expect("skills lock");
            skills.insert(
                name.clone(),
                SkillRecord {
                    manifest: manifest.clone(),
                    dir: dir.to_path_buf(),
                    state: SkillState::Loading,
                    handlers: Vec::new(),
                },
            );
        }

        let mut resolved = Vec::with_capacity(manifest.tools.len());
        for spec in &manifest.tools {
            match self.handlers.resolve(&spec.handler) {
                Ok(handler) => resolved.push((spec.clone(), handler)),
                Err(e) => {
                    warn!("Skill {} failed to load: {}", name, e);
                    self.set_state(&name, SkillState::Error);
                    return Err(Error::Config(format!(
                        "Skill \"{}\": cannot resolve handler \"{}\": {}",
                        name, spec.handler, e
                    )));
                }
            }
        }

        {
            let mut skills = self.skills.lock().expect("skills lock");
            if let Some(record) = skills.get_mut(&name) {
                record.handlers = resolved;
                record.state = SkillState::Loaded;
            }
        }
        self.hooks.on_load(&name).await;
        info!("Loaded skill {} ({} tools)", name, manifest.tools.len());
        Ok(name)
    }

    /// Activate a loaded skill
    pub async fn activate(&self, name: &str) -> Result<()> {
        self.expect_state(name, SkillState::Loaded, SkillState::Active)?;
        self.hooks.on_activate(name).await;
        Ok(())
    }

    /// Deactivate an active skill
    pub async fn deactivate(&self, name: &str) -> Result<()> {
        self.expect_state(name, SkillState::Active, SkillState::Loaded)?;
        self.hooks.on_deactivate(name).await;
        Ok(())
    }

    /// Unload a skill entirely
    pub async fn unload(&self, name: &str) -> Result<()> {
        let removed = self
            .skills
            .lock()
            .expect("skills lock")
            .remove(name)
            .is_some();
        if !removed {
            return Err(Error::NotFound(format!("skill {}", name)));
        }
        self.hooks.on_unload(name).await;
        Ok(())
    }

    /// Recursively scan `dir` for manifests and load every enabled
    /// skill. Returns the loaded names; broken skills are skipped
    /// with a warning.
    pub async fn discover_and_load(&self, dir: &Path) -> Result<Vec<String>> {
        let mut loaded = Vec::new();
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Skill discovery error under {}: {}", dir.display(), e);
                    continue;
                }
            };
            if entry.file_type().is_file()
                && entry.file_name() == SKILL_MANIFEST_FILENAME
            {
                let skill_dir = entry.path().parent().unwrap_or(dir);
                match SkillManifest::load(entry.path()) {
                    Ok(manifest) if !manifest.enabled => {
                        debug!("Skipping disabled skill {}", manifest.name);
                    }
                    Ok(_) => match self.load(skill_dir).await {
                        Ok(name) => loaded.push(name),
                        Err(e) => warn!("Skipping skill at {}: {}", skill_dir.display(), e),
                    },
                    Err(e) => warn!("Skipping manifest {}: {}", entry.path().display(), e),
                }
            }
        }
        loaded.sort();
        Ok(loaded)
    }

    /// Tools of one active skill
    pub fn tools(&self, name: &str) -> Result<Vec<Arc<dyn Tool>>> {
        let skills = self.skills.lock().expect("skills lock");
        let record = skills
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("skill {}", name)))?;
        if record.state != SkillState::Active {
            return Err(Error::InvalidInput(format!(
                "skill {} is not active",
                name
            )));
        }
        Ok(record
            .handlers
            .iter()
            .map(|(spec, handler)| {
                Arc::new(SkillTool {
                    spec: spec.clone(),
                    handler: handler.clone(),
                }) as Arc<dyn Tool>
            })
            .collect())
    }

    /// Directory a skill was loaded from
    pub fn dir(&self, name: &str) -> Option<PathBuf> {
        self.skills
            .lock()
            .expect("skills lock")
            .get(name)
            .map(|r| r.dir.clone())
    }

    fn expect_state(&self, name: &str, from: SkillState, to: SkillState) -> Result<()> {
        let mut skills = self.skills.lock().expect("skills lock");
        let record = skills
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("skill {}", name)))?;
        if record.state != from {
            return Err(Error::InvalidInput(format!(
                "skill {} is {:?}, expected {:?}",
                name, record.state, from
            )));
        }
        record.state = to;
        Ok(())
    }

    fn set_state(&self, name: &str, state: SkillState) {
        if let Some(record) = self.skills.lock().expect("skills lock").get_mut(name) {
            record.state = state;
        }
    }
}

/// A skill tool bridged into the tool registry
struct SkillTool {
    spec: SkillToolSpec,
    handler: Arc<dyn SkillHandler>,
}

#[async_trait]
impl Tool for SkillTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn parameters_schema(&self) -> Value {
        self.spec.parameters.clone()
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        self.handler.call(args).await
    }
}

/// Exposes one active skill's tools as a provider
pub struct SkillToolProvider {
    registry: Arc<SkillRegistry>,
    skill: String,
    source: String,
}

impl SkillToolProvider {
    pub fn new(registry: Arc<SkillRegistry>, skill: impl Into<String>) -> Self {
        let skill = skill.into();
        SkillToolProvider {
            registry,
            source: format!("skill__{}", skill),
            skill,
        }
    }
}

#[async_trait]
impl ToolProvider for SkillToolProvider {
    fn source(&self) -> &str {
        &self.source
    }

    async fn provide(&self) -> Result<Vec<Arc<dyn Tool>>> {
        self.registry.tools(&self.skill)
    }
}
