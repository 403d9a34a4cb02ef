pub mod forward;
pub mod invite;
pub mod register;
pub mod server;
pub mod session;

pub use server::{SipServer, SipServerBuilder};
