pub mod config;
pub mod error;
pub mod paths;
pub mod settings;

pub use config::{inspect_document, ConfigManager, DocumentState, YamlConfigManager};
pub use error::{CoreError, CoreResult};
pub use paths::{AppPaths, StateFile, APP_NAME};
pub use settings::HealingSettings;
