mod loader;
pub mod schema;

pub use schema::{
    Config, ExecutionConfig, JournalBackend, JournalConfig, NetworkConfig, ToolchainConfig,
};
