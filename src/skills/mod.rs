//! Skills: manifest-declared tool packs with a lifecycle

pub mod manifest;
pub mod registry;

pub use manifest::{HandlerRef, SkillManifest, SkillToolSpec, SKILL_MANIFEST_FILENAME};
pub use registry::{
    FnHandler, HandlerRegistry, SkillHandler, SkillHooks, SkillRegistry, SkillState,
    SkillToolProvider,
};
