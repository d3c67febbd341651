pub mod database;
pub mod error;
pub mod schema;
pub mod sessions;
pub mod tickets;

pub use database::Database;
pub use error::StoreError;
pub use sessions::{SessionRepo, SessionRow};
pub use tickets::{TicketRepo, TicketRow};
