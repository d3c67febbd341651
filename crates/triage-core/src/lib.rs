pub mod embedding;
pub mod errors;
pub mod events;
pub mod hooks;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod state;
pub mod ticket;
pub mod tools;
