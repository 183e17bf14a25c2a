//! IPC server for client pages

pub mod protocol;
pub mod server;

pub use server::IpcServer;
