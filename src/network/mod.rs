//! Control-channel networking: framing, the accept loop, and per-client
//! connection tasks.

pub mod connection;
pub mod frame;
pub mod gateway;

pub use connection::Connection;
pub use gateway::Gateway;
