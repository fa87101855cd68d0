pub mod discovery;
pub mod documents;
pub mod health;
pub mod tokens;
pub mod wopi;

pub use health::{health_check, metrics, readiness_check};
