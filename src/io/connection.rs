// src/io/connection.rs

//! A single TCP connection to one viewer endpoint.
//!
//! The connection is shared (`Arc`) between renderer threads, the optional
//! writer thread and the read thread. Writes go through one mutex so a tile
//! header and its payload are never split by another writer; reads use a
//! cloned stream and never touch that mutex. Any write failure shuts the
//! socket down, after which writes are silent no-ops.

use anyhow::{bail, Context, Result};
use log::*;
use std::fmt;
use std::io::{ErrorKind, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Per-attempt connect timeout for each resolved address.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A blocked send fails after this long, so a stalled viewer cannot wedge
/// the writer forever.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Host and port of a viewer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
pub struct Connection {
    endpoint: Endpoint,
    /// Kept for shutdown and for cloning read handles.
    stream: TcpStream,
    writer: Mutex<TcpStream>,
    valid: AtomicBool,
}

impl Connection {
    /// Resolves `endpoint` and connects to the first address that accepts.
    pub fn open(endpoint: &Endpoint) -> Result<Self> {
        let addrs = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {}", endpoint))?;

        let mut last_err = None;
        for addr in addrs {
            debug!("Connecting to {} ({})", endpoint, addr);
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => return Self::from_stream(endpoint.clone(), stream),
                Err(e) => last_err = Some(e),
            }
        }

        match last_err {
            Some(e) => Err(e).with_context(|| format!("Failed to connect to {}", endpoint)),
            None => bail!("Host not found: {}", endpoint.host),
        }
    }

    fn from_stream(endpoint: Endpoint, stream: TcpStream) -> Result<Self> {
        stream
            .set_nodelay(true)
            .context("Failed to set TCP_NODELAY")?;
        stream
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .context("Failed to set write timeout")?;
        let writer = stream
            .try_clone()
            .context("Failed to clone stream for writing")?;
        info!("Connected to viewer at {}", endpoint);
        Ok(Self {
            endpoint,
            stream,
            writer: Mutex::new(writer),
            valid: AtomicBool::new(true),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Cheap liveness check; performs no I/O on the stream.
    ///
    /// `take_error` clears the pending socket error, so an error seen here
    /// shuts the connection down and stays visible to later checks.
    pub fn is_valid(&self) -> bool {
        if !self.valid.load(Ordering::Acquire) {
            return false;
        }
        match self.stream.take_error() {
            Ok(None) => true,
            Ok(Some(e)) => {
                warn!("Connection to {} failed: {}", self.endpoint, e);
                self.shutdown();
                false
            }
            Err(e) => {
                warn!("Could not query connection to {}: {}", self.endpoint, e);
                self.shutdown();
                false
            }
        }
    }

    /// A second handle for the read thread.
    pub fn reader(&self) -> Result<TcpStream> {
        self.stream
            .try_clone()
            .context("Failed to clone stream for reading")
    }

    /// Writes `bytes` as one unit. Returns `false` if nothing was sent.
    pub fn write_all(&self, bytes: &[u8]) -> bool {
        self.write_parts(&[bytes])
    }

    /// Writes all `parts` back to back while holding the write lock, so no
    /// other writer can interleave between them.
    pub fn write_parts(&self, parts: &[&[u8]]) -> bool {
        if !self.valid.load(Ordering::Acquire) {
            return false;
        }
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        for part in parts {
            if let Err(e) = writer.write_all(part) {
                drop(writer);
                if self.valid.load(Ordering::Acquire) {
                    warn!("Error while writing to {}: {}", self.endpoint, e);
                }
                self.shutdown();
                return false;
            }
        }
        trace!(
            "Wrote {} bytes to {}",
            parts.iter().map(|p| p.len()).sum::<usize>(),
            self.endpoint
        );
        true
    }

    /// Marks the connection dead and closes both directions of the socket,
    /// which unblocks a read thread parked in `read`.
    pub fn shutdown(&self) {
        if !self.valid.swap(false, Ordering::AcqRel) {
            return;
        }
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => debug!("Closed connection to {}", self.endpoint),
            Err(e) if e.kind() == ErrorKind::NotConnected => {
                debug!("Connection to {} was already closed", self.endpoint)
            }
            Err(e) => warn!("Error while closing connection to {}: {}", self.endpoint, e),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}
