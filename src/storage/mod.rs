pub mod cache;
pub mod database;
pub mod entities;
pub mod models;
pub mod papers;
pub mod settings;
pub mod stats;

pub use database::Database;
