use std::collections::HashMap;

use crate::config::{AppConfig, CliConfig};

/// What to launch for one agent session
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub cli: String,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub flags: Vec<String>,
}

/// CLI Registry for building RPC-mode commands from agent configurations
#[derive(Debug, Clone)]
pub struct CliRegistry {
    config: AppConfig,
}

impl CliRegistry {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub fn get_cli(&self, name: &str) -> Option<&CliConfig> {
        self.config.clis.get(name)
    }

    /// Registered CLI names, sorted
    pub fn list_clis(&self) -> Vec<String> {
        let mut names: Vec<String> = self.config.clis.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build command, arguments, and environment variables from an agent config
    pub fn build_command(&self, agent_config: &AgentConfig) -> Result<BuiltCommand, RegistryError> {
        let cli = self
            .config
            .clis
            .get(&agent_config.cli)
            .ok_or_else(|| RegistryError::UnknownCli(agent_config.cli.clone()))?;

        let mut args = cli.rpc_args.clone();
        let mut env = HashMap::new();

        if let Some(ref model_flag) = cli.model_flag {
            if let Some(model) = agent_config.model.as_ref().or(cli.default_model.as_ref()) {
                args.push(model_flag.clone());
                args.push(model.clone());
            }
        }

        if let (Some(flag), Some(level)) = (&cli.thinking_flag, &agent_config.thinking_level) {
            args.push(flag.clone());
            args.push(level.clone());
        }

        if let Some(ref cli_env) = cli.env {
            env.extend(cli_env.clone());
        }

        args.extend(agent_config.flags.clone());

        Ok(BuiltCommand {
            command: cli.command.clone(),
            args,
            env,
        })
    }

    pub fn update_config(&mut self, config: AppConfig) {
        self.config = config;
    }
}

/// A built command ready for execution
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltCommand {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown CLI: {0}")]
    UnknownCli(String),
}
