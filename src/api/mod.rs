//! REST API surface

pub mod rest;
pub mod server;

pub use rest::RestRouter;
pub use server::{ApiServer, ApiServerConfig};
