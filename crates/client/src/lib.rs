// crates/client/src/lib.rs
pub mod cli;
pub mod confirm;
pub mod rpc;
pub mod ws;

pub use ws::WsTransport;
