//! Infrastructure adapters: database, HTTP clients, telemetry.

pub mod db;
pub mod error;
pub mod http;
pub mod telemetry;

pub use db::PostgresRepositories;
pub use error::InfraError;
pub use http::{ReqwestTransport, SsoAuthClient};
