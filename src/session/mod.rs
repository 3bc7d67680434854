//! The network control layer (spec.md §4.8, §6): a line-oriented TCP
//! protocol for driving devices and the loop engine remotely.

pub mod broadcast;
pub mod handler;
pub mod protocol;
pub mod server;

pub use broadcast::Broadcaster;
pub use handler::{DeviceHandle, DispatchCtx, Reply};
pub use server::{serve, SessionServer};
