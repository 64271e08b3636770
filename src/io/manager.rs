// src/io/manager.rs

//! Connection manager: owns the active viewer connection, (re)connects it,
//! launches the viewer on demand, and routes writes either directly onto the
//! socket or through the serialized writer thread.

use log::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::connection::{Connection, Endpoint};
use super::launcher::{ViewerCommand, ViewerLauncher};
use super::writer::{OutboundItem, WriteThread};
use crate::config::ViewerConfig;

/// Bound on the connect attempts made after launching a viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

/// Runs `attempt` up to `policy.max_retries` times, sleeping `policy.delay`
/// before each one. Returns the first success.
pub fn retry_bounded<T, F>(policy: &RetryPolicy, mut attempt: F) -> Option<T>
where
    F: FnMut(u32) -> Option<T>,
{
    for n in 1..=policy.max_retries {
        thread::sleep(policy.delay);
        if let Some(value) = attempt(n) {
            return Some(value);
        }
    }
    None
}

pub struct ConnectionManager {
    viewer: ViewerConfig,
    launcher: Box<dyn ViewerLauncher>,
    serialized_io: bool,
    active: Option<Arc<Connection>>,
    writer: Option<WriteThread>,
    /// Bumped each time a new connection is installed.
    generation: u64,
    launched_with_ocio: bool,
}

impl ConnectionManager {
    pub fn new(viewer: ViewerConfig, serialized_io: bool, launcher: Box<dyn ViewerLauncher>) -> Self {
        Self {
            viewer,
            launcher,
            serialized_io,
            active: None,
            writer: None,
            generation: 0,
            launched_with_ocio: false,
        }
    }

    /// Ensures a live connection to `endpoint`.
    ///
    /// An existing valid connection to the same endpoint is kept. A connection
    /// to another endpoint, or a dead one, is closed first. When the first
    /// attempt fails and `auto_launch` is set, the viewer is spawned once and
    /// the connect is retried according to `retry`.
    pub fn connect(
        &mut self,
        endpoint: &Endpoint,
        auto_launch: bool,
        retry: &RetryPolicy,
        ocio_preload: bool,
    ) -> bool {
        if let Some(active) = &self.active {
            if active.endpoint() == endpoint && active.is_valid() {
                debug!("Reusing connection to {}", endpoint);
                return true;
            }
            if active.endpoint() == endpoint {
                info!("Connection to {} was lost, reconnecting", endpoint);
            } else {
                info!(
                    "Switching viewer from {} to {}",
                    active.endpoint(),
                    endpoint
                );
            }
            self.close();
        }

        let first_error = match Connection::open(endpoint) {
            Ok(connection) => {
                self.install(connection, false);
                return true;
            }
            Err(e) => e,
        };

        if !auto_launch {
            warn!("Could not connect to viewer: {:#}", first_error);
            return false;
        }
        info!("No viewer at {} ({:#}), launching one", endpoint, first_error);

        let command = ViewerCommand::new(&self.viewer, endpoint.port, ocio_preload);
        if let Err(e) = self.launcher.launch(&command) {
            warn!("Could not launch viewer: {:#}", e);
            return false;
        }

        let connection = retry_bounded(retry, |attempt| {
            match Connection::open(endpoint) {
                Ok(connection) => Some(connection),
                Err(e) => {
                    debug!(
                        "Connect attempt {}/{} to {} failed: {:#}",
                        attempt, retry.max_retries, endpoint, e
                    );
                    None
                }
            }
        });

        match connection {
            Some(connection) => {
                self.install(connection, ocio_preload);
                true
            }
            None => {
                warn!(
                    "Viewer at {} did not accept a connection after {} retries",
                    endpoint, retry.max_retries
                );
                false
            }
        }
    }

    fn install(&mut self, connection: Connection, launched_with_ocio: bool) {
        let connection = Arc::new(connection);
        self.launched_with_ocio = launched_with_ocio;
        if self.serialized_io {
            match WriteThread::spawn(connection.clone()) {
                Ok(writer) => self.writer = Some(writer),
                Err(e) => warn!("Falling back to direct writes: {:#}", e),
            }
        }
        self.active = Some(connection);
        self.generation += 1;
    }

    /// True iff a connection exists and its transport reports itself valid.
    pub fn is_alive(&self) -> bool {
        self.active.as_ref().is_some_and(|c| c.is_valid())
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.active.as_ref()
    }

    /// Identifies the installed connection; changes on every reconnect.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the current viewer was launched by us with the OCIO package.
    pub fn launched_with_ocio(&self) -> bool {
        self.launched_with_ocio
    }

    /// Sends one command. A dead connection makes this a silent no-op.
    pub fn send_text(&self, text: String) -> bool {
        self.send(vec![OutboundItem::Text(text)])
    }

    /// Sends a tile header immediately followed by its payload.
    pub fn send_tile(&self, header: String, payload: Vec<u8>) -> bool {
        self.send(vec![OutboundItem::Text(header), OutboundItem::Payload(payload)])
    }

    fn send(&self, items: Vec<OutboundItem>) -> bool {
        let Some(connection) = self.active.as_ref().filter(|c| c.is_valid()) else {
            return false;
        };
        match &self.writer {
            Some(writer) => writer.enqueue_group(items),
            None => {
                let parts: Vec<&[u8]> = items.iter().map(OutboundItem::as_bytes).collect();
                connection.write_parts(&parts)
            }
        }
    }

    /// Drains and joins the writer thread, then closes the connection.
    pub fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown();
        }
        if let Some(connection) = self.active.take() {
            connection.shutdown();
            info!("Disconnected from {}", connection.endpoint());
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}
