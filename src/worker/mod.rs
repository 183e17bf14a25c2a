//! Request interception: lifecycle, classification and routing

pub mod classify;
pub mod controller;
pub mod lifecycle;
pub mod router;

pub use controller::{ClientId, WorkerController};
