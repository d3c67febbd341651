pub mod cache;
pub mod error;
pub mod handlers;
pub mod server;
pub mod service;
pub mod sweeper;
pub mod wire;

#[cfg(test)]
mod testing;

pub use cache::ClassificationCache;
pub use error::{ApiError, ApiResult};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use service::TicketService;
