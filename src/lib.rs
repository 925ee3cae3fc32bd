pub mod api;
pub mod audit;
pub mod config;
pub mod database;
pub mod entries;
pub mod error;
pub mod grants;
pub mod identity;
pub mod signals;
pub mod tasks;
pub mod verification;

pub use error::VerificationError;
