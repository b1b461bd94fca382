pub mod bus;
pub mod events;
pub mod handler;
pub mod presence;
pub mod registry;
pub mod server;
pub mod session;
