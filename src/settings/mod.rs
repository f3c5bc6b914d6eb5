// Settings: JSON configuration file and debounced persistence.

pub mod store;
pub mod types;

pub use store::SettingsStore;
pub use types::{AppSettings, SettingsError};
