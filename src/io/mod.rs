// src/io/mod.rs
//
// I/O module - viewer connection, process launch, and the read/write threads.

pub mod connection;
pub mod launcher;
pub mod manager;
pub mod reader;
pub mod writer;


pub use connection::{Connection, Endpoint};
pub use launcher::{ProcessLauncher, ViewerCommand, ViewerLauncher};
pub use manager::{retry_bounded, ConnectionManager, RetryPolicy};
pub use reader::ReadThread;
pub use writer::{OutboundItem, WriteThread};
