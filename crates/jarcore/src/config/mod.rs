pub mod ini;
pub mod settings;

pub use settings::EngineSettings;
