//! Application wiring and lifecycle.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use self::builder::ApplicationBuilder;
pub use self::core::Application;
pub use self::services::ApplicationServices;
