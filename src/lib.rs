pub mod app;
pub mod backup;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod log;
pub mod model;
pub mod repository;
pub mod retention;
pub mod space;
pub mod storage;

pub use error::{BackupError, Result};
