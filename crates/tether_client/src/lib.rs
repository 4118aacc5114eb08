#![forbid(unsafe_code)]

pub mod app;
pub mod bindings;
pub mod config;

pub use app::{App, AppDeps};
pub use bindings::BindingsFile;
pub use config::{ClientConfig, default_config_path, load_client_config_from_path};
