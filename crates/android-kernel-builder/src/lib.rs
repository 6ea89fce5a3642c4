pub mod analyzer;
pub mod buildlog;
pub mod config;
pub mod error;
pub mod executor;
pub mod github;
pub mod kconfig;
pub mod make_args;
pub mod modules;
pub mod planner;
pub mod settings;
pub mod toolchain;
pub mod trust;
pub mod workspace;

pub use error::{Error, Result};
