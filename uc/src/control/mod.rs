//! External control - HTTP daemon, lockfile, client

mod client;
mod lockfile;
mod server;

pub use client::DaemonClient;
pub use lockfile::{DaemonLock, DaemonLockInfo};
pub use server::{ControlServer, DaemonContext, StatusResponse};
