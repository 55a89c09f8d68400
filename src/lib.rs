pub mod app;
pub mod backend;
pub mod config;
pub mod error;
pub mod http_client;
pub mod messages;
pub mod models;
pub mod services;
pub mod session;
pub mod timeout;

pub use app::FamilySpace;
pub use config::Config;
pub use error::{AppError, AppResult};
