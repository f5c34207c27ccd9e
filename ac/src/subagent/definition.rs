//! Sub-agent definitions

use serde::{Deserialize, Serialize};

/// What a delegated worker is
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentDefinition {
    /// Stable identifier, also used as the default tenant key
    pub id: String,

    /// Role description rendered into the system prompt
    pub role: String,

    /// System prompt; assembled by the caller, carried as data
    #[serde(rename = "system-prompt")]
    pub system_prompt: String,

    pub provider: String,
    pub model: String,

    #[serde(rename = "max-tokens", default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    8_192
}

impl SubAgentDefinition {
    pub fn new(id: &str, role: &str, provider: &str, model: &str) -> Self {
        Self {
            id: id.to_string(),
            role: role.to_string(),
            system_prompt: String::new(),
            provider: provider.to_string(),
            model: model.to_string(),
            max_tokens: default_max_tokens(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: &str) -> Self {
        self.system_prompt = system_prompt.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let def = SubAgentDefinition::new("researcher", "Research the topic", "anthropic", "sonnet")
            .with_system_prompt("You verify claims.");
        assert_eq!(def.id, "researcher");
        assert_eq!(def.max_tokens, 8_192);
        assert_eq!(def.system_prompt, "You verify claims.");
    }

    #[test]
    fn test_deserialize_defaults_max_tokens() {
        let yaml = r#"
id: checker
role: Check the work
system-prompt: ""
provider: anthropic
model: sonnet
"#;
        let def: SubAgentDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.max_tokens, 8_192);
    }
}
