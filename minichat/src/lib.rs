pub mod config;
pub mod filter;
pub mod providers;
pub mod session;
pub mod types;

// Re-exports for convenience
pub use config::{ConfigError, ConfigManager, MaxTokens, PreferenceSource, Preferences, StaticPreferences, Temperature};
pub use filter::{ThinkFilter, strip_thinking};
pub use providers::minimax::MiniMaxProvider;
pub use providers::{ErrorKind, Provider, ProviderError, StreamCallbacks};
pub use session::{ChatSession, ErrorReporter, LogReporter, ProviderFactory};
pub use types::*;
