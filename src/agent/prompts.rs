//! Prompt templates and system prompt assembly

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::{Error, Result};

/// Default system prompt used when the caller supplies none
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a helpful assistant. Use the available tools when they help you \
answer accurately, and answer directly when they do not. Be concise.";

/// A prompt template using Handlebars syntax
pub struct PromptTemplate {
    /// Template name
    name: String,
    /// Handlebars registry
    registry: Handlebars<'static>,
}

impl PromptTemplate {
    /// Create a new prompt template
    pub fn new(name: impl Into<String>, template: &str) -> Result<Self> {
        let name = name.into();
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);

        registry
            .register_template_string(&name, template)
            .map_err(|e| Error::Internal(format!("Invalid template: {}", e)))?;

        Ok(PromptTemplate { name, registry })
    }

    /// Render the template with given data
    pub fn render<T: Serialize>(&self, data: &T) -> Result<String> {
        self.registry
            .render(&self.name, data)
            .map_err(|e| Error::Internal(format!("Template render error: {}", e)))
    }
}

/// Combine the base system prompt with an optional memory section and
/// an optional compaction summary.
pub fn compose_system_prompt(
    base: &str,
    memory_section: Option<&str>,
    compaction_summary: Option<&str>,
) -> String {
    let mut prompt = base.to_string();
    if let Some(summary) = compaction_summary {
        prompt.push_str("\n\n## Earlier Conversation (summarized)\n\n");
        prompt.push_str(summary);
    }
    if let Some(section) = memory_section {
        prompt.push_str("\n\n");
        prompt.push_str(section);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_with_data() {
        let template = PromptTemplate::new("greet", "Hello {{name}}!").unwrap();
        let out = template
            .render(&serde_json::json!({ "name": "world" }))
            .unwrap();
        assert_eq!(out, "Hello world!");
    }

    #[test]
    fn invalid_template_is_an_error() {
        assert!(PromptTemplate::new("bad", "{{#each}").is_err());
    }

    #[test]
    fn compose_appends_sections_in_order() {
        let prompt = compose_system_prompt("base", Some("MEMORY"), Some("earlier summary"));
        let summary_pos = prompt.find("earlier summary").unwrap();
        let memory_pos = prompt.find("MEMORY").unwrap();
        assert!(prompt.starts_with("base"));
        assert!(summary_pos < memory_pos);
    }
}
