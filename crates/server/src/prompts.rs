//! Prompt registry: auto-generated `use_<tool>` prompts plus explicit registrations.
//!
//! Explicit prompts are authoritative: registering one under a key that an auto-generated
//! prompt already uses replaces it. Turning auto-generation off drops only the derived prompts.

use crate::config::PromptConfig;
use crate::error::{Result, ServerError};
use minijinja::Environment;
use routebridge_openapi_tools::tools::ToolDefinition;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptArgumentDef {
    pub name: String,
    pub description: Option<String>,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptDefinition {
    pub name: String,
    pub title: String,
    pub description: String,
    pub arguments: Vec<PromptArgumentDef>,
    pub template: String,
    /// `true` for prompts derived from a tool.
    pub generated: bool,
}

impl PromptDefinition {
    /// Build an explicit prompt, checking that its template parses.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Configuration`] if the template does not compile.
    pub fn explicit(config: &PromptConfig) -> Result<Self> {
        check_template(&config.name, &config.template)?;
        Ok(Self {
            name: config.name.clone(),
            title: config
                .title
                .clone()
                .unwrap_or_else(|| title_from_name(&config.name)),
            description: config
                .description
                .clone()
                .unwrap_or_else(|| format!("Prompt: {}", config.name)),
            arguments: config
                .arguments
                .iter()
                .map(|a| PromptArgumentDef {
                    name: a.name.clone(),
                    description: a.description.clone(),
                    required: a.required,
                })
                .collect(),
            template: config.template.clone(),
            generated: false,
        })
    }

    /// The `use_<tool>` prompt for `tool`.
    #[must_use]
    pub fn for_tool(tool: &ToolDefinition) -> Self {
        let name = format!("use_{}", tool.name);
        Self {
            title: title_from_name(&name),
            description: format!(
                "Best practices and guidance for using the {} tool effectively",
                tool.name
            ),
            arguments: vec![PromptArgumentDef {
                name: "task".to_string(),
                description: Some(format!(
                    "What you want to accomplish with {}",
                    tool.name
                )),
                required: false,
            }],
            template: tool_prompt_template(tool),
            name,
            generated: true,
        }
    }

    /// Render the template with `arguments` as variables.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::PromptArgument`] for a missing required argument and
    /// [`ServerError::PromptRender`] if rendering fails.
    pub fn render(&self, arguments: &Map<String, Value>) -> Result<String> {
        for arg in self.arguments.iter().filter(|a| a.required) {
            let present = arguments.get(&arg.name).is_some_and(|v| !v.is_null());
            if !present {
                return Err(ServerError::PromptArgument {
                    prompt: self.name.clone(),
                    argument: arg.name.clone(),
                });
            }
        }

        let env = Environment::new();
        env.render_str(&self.template, arguments)
            .map_err(|e| ServerError::PromptRender {
                prompt: self.name.clone(),
                message: e.to_string(),
            })
    }
}

/// Prompts keyed by name, listed in name order.
#[derive(Debug, Clone, Default)]
pub struct PromptRegistry {
    prompts: BTreeMap<String, PromptDefinition>,
}

impl PromptRegistry {
    /// Derive prompts for `tools` (when enabled), then apply the explicit ones on top.
    #[must_use]
    pub fn build(
        tools: &[ToolDefinition],
        auto_generate: bool,
        explicit: &[PromptDefinition],
    ) -> Self {
        let mut registry = Self::default();
        if auto_generate {
            for tool in tools {
                registry.insert(PromptDefinition::for_tool(tool));
            }
        }
        for prompt in explicit {
            registry.register(prompt.clone());
        }
        registry
    }

    /// Register an explicit prompt, replacing any prompt with the same name.
    pub fn register(&mut self, prompt: PromptDefinition) {
        if let Some(previous) = self.prompts.get(&prompt.name)
            && previous.generated
        {
            tracing::debug!(prompt = %prompt.name, "Explicit prompt overrides generated one");
        }
        self.insert(prompt);
    }

    fn insert(&mut self, prompt: PromptDefinition) {
        self.prompts.insert(prompt.name.clone(), prompt);
    }

    pub fn list(&self) -> impl Iterator<Item = &PromptDefinition> {
        self.prompts.values()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PromptDefinition> {
        self.prompts.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Render prompt `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::PromptNotFound`] for an unknown name, otherwise whatever
    /// [`PromptDefinition::render`] returns.
    pub fn render(&self, name: &str, arguments: &Map<String, Value>) -> Result<(&PromptDefinition, String)> {
        let prompt = self
            .get(name)
            .ok_or_else(|| ServerError::PromptNotFound(name.to_string()))?;
        let text = prompt.render(arguments)?;
        Ok((prompt, text))
    }
}

fn check_template(name: &str, template: &str) -> Result<()> {
    let env = Environment::new();
    env.template_from_str(template)
        .map(|_| ())
        .map_err(|e| {
            ServerError::Configuration(format!("prompt '{name}' has an invalid template: {e}"))
        })
}

/// `create_item` -> `Create Item`.
fn title_from_name(name: &str) -> String {
    name.split(['_', '-'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect::<String>()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn tool_prompt_template(tool: &ToolDefinition) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "You are about to use the **{}** tool.", tool.name);
    out.push('\n');

    let summary = tool
        .title
        .as_deref()
        .unwrap_or_else(|| tool.description.lines().next().unwrap_or_default());
    if !summary.is_empty() {
        let _ = writeln!(out, "{}", escape_template_text(summary));
        out.push('\n');
    }

    out.push_str("## Key Guidelines\n");
    let mut any_args = false;
    for (name, required) in tool.argument_names() {
        any_args = true;
        let name = escape_template_text(name);
        if required {
            let _ = writeln!(out, "- `{name}` (required)");
        } else {
            let _ = writeln!(out, "- `{name}` (optional)");
        }
    }
    if !any_args {
        out.push_str("- This tool takes no arguments.\n");
    }
    out.push('\n');

    out.push_str("## Best Practices\n");
    out.push_str("- Provide every required argument; leave optional ones out unless needed.\n");
    out.push_str("- Check the response status before relying on the returned data.\n");
    if tool.hints.destructive {
        out.push_str("- This operation modifies data; confirm the target before calling it.\n");
    } else if tool.hints.read_only {
        out.push_str("- This operation only reads data and is safe to repeat.\n");
    }
    out.push_str("{% if task %}\nTask: {{ task }}\n{% endif %}");
    out
}

/// Keep operation text literal inside a template. Every `{` is emitted through an expression,
/// so no delimiter can open in the text, `{% endraw %}` included.
fn escape_template_text(text: &str) -> String {
    if text.contains('{') {
        text.replace('{', "{{ \"{\" }}")
    } else {
        text.to_string()
    }
}
