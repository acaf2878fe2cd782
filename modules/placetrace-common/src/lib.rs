pub mod config;
pub mod error;
pub mod normalize;
pub mod types;

pub use config::GeocodeConfig;
pub use error::EngineError;
pub use normalize::normalize;
pub use types::*;
