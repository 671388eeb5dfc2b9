pub mod registry;

pub use registry::{AgentConfig, BuiltCommand, CliRegistry, RegistryError};
