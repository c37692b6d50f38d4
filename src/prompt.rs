//! Prompt templates.
//!
//! Prompts are TOML (or JSON) files with an optional `developer` message and a
//! list of `messages`. Every string is a Handlebars template. An `assistant`
//! entry holds an example JSON reply, which lets a prompt carry few-shot
//! examples.

use handlebars::{Handlebars, no_escape};
use schemars::JsonSchema;
use serde_json::Map;

use crate::{async_utils::io::read_json_or_toml, prelude::*};

/// Template bindings.
pub type JsonObject = Map<String, Value>;

/// A chat prompt template.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ChatPrompt {
    /// The developer (aka "system") message, if any.
    #[serde(default)]
    pub developer: Option<String>,

    /// Messages.
    pub messages: Vec<Message>,
}

/// A user message, and optionally an example response.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Message {
    /// The user message.
    pub user: String,

    /// An example assistant response. String fields are rendered as templates.
    #[serde(default)]
    pub assistant: Option<Value>,
}

/// A prompt with all templates filled in.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedPrompt {
    pub developer: Option<String>,
    pub messages: Vec<RenderedMessage>,
}

/// A single rendered chat message.
#[derive(Clone, Debug, PartialEq)]
pub enum RenderedMessage {
    User(String),
    /// An example reply, already serialized as JSON.
    Assistant(String),
}

#[cfg(test)]
impl RenderedPrompt {
    /// The text of the last user message, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match m {
            RenderedMessage::User(text) => Some(text.as_str()),
            RenderedMessage::Assistant(_) => None,
        })
    }
}

impl ChatPrompt {
    /// Parse a built-in prompt. These ship with the binary, so a parse failure
    /// is a bug.
    pub fn builtin(name: &str, toml_src: &str) -> Self {
        toml::from_str::<ChatPrompt>(toml_src)
            .unwrap_or_else(|err| panic!("failed to parse built-in {name} prompt: {err}"))
    }

    /// Load a prompt from a file, or fall back to a built-in one.
    pub async fn load_or(path: Option<&Path>, fallback: impl FnOnce() -> Self) -> Result<Self> {
        match path {
            Some(path) => read_json_or_toml::<ChatPrompt>(path)
                .await
                .with_context(|| format!("Failed to load prompt from {:?}", path)),
            None => Ok(fallback()),
        }
    }

    /// Fill in our templates.
    pub fn render(&self, bindings: &JsonObject) -> Result<RenderedPrompt> {
        let mut handlebars = Handlebars::new();
        // We're building chat messages, not HTML. OCR text is full of `<`, `&`
        // and quotes that must reach the model untouched.
        handlebars.register_escape_fn(no_escape);
        handlebars.set_strict_mode(true);

        let developer = self
            .developer
            .as_deref()
            .map(|developer| handlebars.render_template(developer, bindings))
            .transpose()
            .context("Error rendering developer message")?;

        let mut messages = Vec::with_capacity(self.messages.len() * 2);
        for message in &self.messages {
            let user = handlebars
                .render_template(&message.user, bindings)
                .context("Error rendering user message")?;
            messages.push(RenderedMessage::User(user));
            if let Some(assistant) = &message.assistant {
                let assistant = render_value(&handlebars, assistant, bindings)?;
                messages.push(RenderedMessage::Assistant(assistant.to_string()));
            }
        }
        Ok(RenderedPrompt {
            developer,
            messages,
        })
    }
}

/// Render every string inside a JSON value.
fn render_value(
    handlebars: &Handlebars<'_>,
    value: &Value,
    bindings: &JsonObject,
) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(
            handlebars
                .render_template(s, bindings)
                .context("Error rendering assistant message")?,
        )),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(handlebars, item, bindings))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(obj) => {
            let mut output = Map::new();
            for (key, value) in obj {
                output.insert(key.clone(), render_value(handlebars, value, bindings)?);
            }
            Ok(Value::Object(output))
        }
        _ => Ok(value.clone()),
    }
}
