// src/io/writer.rs

//! Serialized write path.
//!
//! Renderer threads enqueue [`OutboundItem`]s; one writer thread drains the
//! queue onto the connection in FIFO order. A tile header and its payload are
//! enqueued as one group, so nothing queued by another thread can land
//! between them.

use anyhow::{Context, Result};
use log::*;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::connection::Connection;

/// One unit of outbound traffic. Payload buffers are owned by the queue
/// until written, and freed when dropped with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundItem {
    Text(String),
    Payload(Vec<u8>),
}

impl OutboundItem {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            OutboundItem::Text(text) => text.as_bytes(),
            OutboundItem::Payload(bytes) => bytes,
        }
    }
}

/// Handle to the writer thread and its queue.
pub struct WriteThread {
    queue: Option<Sender<Vec<OutboundItem>>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl WriteThread {
    /// Spawns the writer thread draining into `connection`.
    pub fn spawn(connection: Arc<Connection>) -> Result<Self> {
        let (queue, items) = mpsc::channel();
        let thread_handle = thread::Builder::new()
            .name("rv-write".to_string())
            .spawn(move || drain_forever(&connection, items))
            .context("Failed to spawn write thread")?;

        debug!("Write thread spawned");

        Ok(Self {
            queue: Some(queue),
            thread_handle: Some(thread_handle),
        })
    }

    /// Queues a single item. Returns `false` once the writer has stopped.
    pub fn enqueue(&self, item: OutboundItem) -> bool {
        self.enqueue_group(vec![item])
    }

    /// Queues `items` as one inseparable, ordered group.
    pub fn enqueue_group(&self, items: Vec<OutboundItem>) -> bool {
        match &self.queue {
            Some(queue) => queue.send(items).is_ok(),
            None => false,
        }
    }

    /// Closes the queue, lets the writer flush what is already queued, and
    /// joins it.
    pub fn shutdown(&mut self) {
        self.queue.take();
        if let Some(handle) = self.thread_handle.take() {
            if let Err(e) = handle.join() {
                error!("Write thread panicked: {:?}", e);
            }
            debug!("Write thread joined");
        }
    }
}

impl Drop for WriteThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Writes every queued group in order until all senders are gone. Groups
/// arriving after the connection died are dropped unwritten.
fn drain_forever(connection: &Connection, items: Receiver<Vec<OutboundItem>>) {
    debug!("Write thread starting for {}", connection.endpoint());
    let mut dropped = 0usize;
    for group in items {
        let parts: Vec<&[u8]> = group.iter().map(OutboundItem::as_bytes).collect();
        if !connection.write_parts(&parts) {
            dropped += group.len();
        }
    }
    if dropped > 0 {
        debug!("Write thread: dropped {} items after connection loss", dropped);
    }
    debug!("Write thread: queue closed, exiting");
}
