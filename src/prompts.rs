//! System prompt templating.

use crate::error::{ConfigError, Result};

use std::collections::HashMap;

/// Assistant persona used when variables are configured without a template.
pub const DEFAULT_SYSTEM_TEMPLATE: &str = "You are a helpful AI assistant that helps people find information.
Your name is {{ name }}.
You should reply to the user's request with your name and also in the style of a {{ voice }}.";

/// Render `template` with `variables`. Referencing an unset variable is an error.
pub fn render_system_prompt(template: &str, variables: &HashMap<String, String>) -> Result<String> {
    let mut env = minijinja::Environment::new();
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

    env.render_str(template, variables)
        .map(|rendered| rendered.trim().to_string())
        .map_err(|error| ConfigError::Invalid(format!("system prompt template: {error}")).into())
}
