// src/io/reader.rs

//! Read thread for a viewer connection.
//!
//! Parses inbound frames for the lifetime of the connection: answers
//! keep-alive pings, forwards `RETURN` replies to whoever is waiting for
//! them, and shuts the connection down when the viewer disconnects. The loop
//! exits when the socket is closed from either side.

use anyhow::{Context, Result};
use log::*;
use std::io::{ErrorKind, Read};
use std::net::TcpStream;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::connection::Connection;
use crate::protocol::{FrameParser, Inbound, PONG};

/// Size of a single socket read.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Handle to the read thread.
pub struct ReadThread {
    connection: Arc<Connection>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ReadThread {
    /// Spawns the read thread.
    ///
    /// # Arguments
    ///
    /// * `connection` - The connection to read from; pings are answered on it
    /// * `replies` - Receives the value of every `RETURN` reply
    pub fn spawn(connection: Arc<Connection>, replies: Sender<String>) -> Result<Self> {
        let stream = connection.reader()?;
        let thread_connection = connection.clone();
        let thread_handle = thread::Builder::new()
            .name("rv-read".to_string())
            .spawn(move || {
                if let Err(e) = read_loop(&thread_connection, stream, &replies) {
                    if thread_connection.is_valid() {
                        warn!("Read thread error: {:#}", e);
                    } else {
                        debug!("Read thread stopped: {:#}", e);
                    }
                    thread_connection.shutdown();
                }
            })
            .context("Failed to spawn read thread")?;

        debug!("Read thread spawned for {}", connection.endpoint());

        Ok(Self {
            connection,
            thread_handle: Some(thread_handle),
        })
    }

    /// True once the loop has exited.
    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Whether this thread reads from `connection`.
    pub fn serves(&self, connection: &Arc<Connection>) -> bool {
        Arc::ptr_eq(&self.connection, connection)
    }

    /// Closes the socket to unblock the loop, then joins the thread.
    pub fn join(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            self.connection.shutdown();
            if let Err(e) = handle.join() {
                error!("Read thread panicked: {:?}", e);
            }
            debug!("Read thread joined");
        }
    }
}

impl Drop for ReadThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop(connection: &Connection, mut stream: TcpStream, replies: &Sender<String>) -> Result<()> {
    debug!("Read thread starting for {}", connection.endpoint());
    let mut parser = FrameParser::new();
    let mut read_buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let bytes_read = match stream.read(&mut read_buffer) {
            Ok(0) => {
                if connection.is_valid() {
                    info!("Viewer at {} closed the connection", connection.endpoint());
                }
                connection.shutdown();
                return Ok(());
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("Failed to read from viewer"),
        };

        trace!("Read thread: {} bytes from viewer", bytes_read);
        parser.push(&read_buffer[..bytes_read]);

        loop {
            match parser.next_frame() {
                Ok(Some(frame)) => {
                    if !handle_frame(connection, Inbound::from(frame), replies) {
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(e) => warn!("Read thread: skipping malformed frame: {}", e),
            }
        }
    }
}

/// Returns `false` when the loop should stop.
fn handle_frame(connection: &Connection, inbound: Inbound, replies: &Sender<String>) -> bool {
    match inbound {
        Inbound::Greeting => debug!("Viewer greeting received"),
        Inbound::Ping => {
            trace!("PING from viewer");
            connection.write_all(PONG.as_bytes());
        }
        Inbound::Return(value) => {
            debug!("Viewer returned {:?}", value);
            if replies.send(value).is_err() {
                debug!("Nobody is waiting for viewer replies");
            }
        }
        Inbound::Disconnect => {
            info!("Viewer at {} requested disconnect", connection.endpoint());
            connection.shutdown();
            return false;
        }
        Inbound::Other(frame) => {
            trace!(
                "Ignoring {} frame ({} bytes)",
                frame.kind,
                frame.payload.len()
            );
        }
    }
    true
}
