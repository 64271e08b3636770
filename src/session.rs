// src/session.rs

//! Session orchestrator.
//!
//! One [`Session`] streams one media into the viewer across any number of
//! render passes. Each pass is bracketed by [`Session::open`] and
//! [`Session::close`]; [`Session::finish`] ends the session for good.
//!
//! ```text
//! Idle -> Connecting -> SourceRegistered -> Streaming -> Closing -> Idle
//! ```
//!
//! None of the renderer-facing operations fail: when the viewer is missing or
//! goes away, tiles are dropped and the render carries on.

use chrono::{DateTime, Local};
use log::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::color::ColorCorrection;
use crate::config::{DriverConfig, MediaConfig};
use crate::io::{ConnectionManager, Endpoint, ProcessLauncher, ReadThread, RetryPolicy, ViewerLauncher};
use crate::pixels::{PixelData, TileBuffer};
use crate::protocol::{
    flipped_y_origin, greeting, pixel_tile, registration_script, return_event,
    ImageSourceDescriptor, TileHeader, DISCONNECT,
};

/// Base name used when no media name is configured.
const DEFAULT_MEDIA_NAME: &str = "render";

/// Timestamp prefix of generated media identifiers.
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    SourceRegistered,
    Streaming,
    Closing,
}

/// Image description handed over by the renderer when a pass starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassInfo {
    /// Display window size.
    pub width: u32,
    pub height: u32,
    /// AOV names, in the order they become viewer layers.
    pub aovs: Vec<String>,
}

/// One AOV's pixels for a bucket.
#[derive(Debug, Clone, Copy)]
pub struct BucketLayer<'a> {
    pub aov: &'a str,
    pub data: PixelData<'a>,
}

/// A rendered bucket. `y` is the renderer's top-down origin.
#[derive(Debug, Clone, Copy)]
pub struct Bucket<'a> {
    pub x: i32,
    pub y: i32,
    pub width: usize,
    pub height: usize,
    pub layers: &'a [BucketLayer<'a>],
}

/// Traffic counters, logged when the session finishes.
#[derive(Debug, Default)]
pub struct StreamStats {
    tiles_sent: AtomicU64,
    bytes_sent: AtomicU64,
    tiles_dropped: AtomicU64,
}

impl StreamStats {
    pub fn tiles_sent(&self) -> u64 {
        self.tiles_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn tiles_dropped(&self) -> u64 {
        self.tiles_dropped.load(Ordering::Relaxed)
    }

    fn record_sent(&self, bytes: usize) {
        self.tiles_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.record_dropped_n(1);
    }

    fn record_dropped_n(&self, tiles: usize) {
        self.tiles_dropped.fetch_add(tiles as u64, Ordering::Relaxed);
    }
}

/// Builds `<timestamp>/<name>`. The viewer shows only the part after the
/// slash. An empty name always gets a timestamp.
pub fn media_identifier(media: &MediaConfig, now: DateTime<Local>) -> String {
    let name = sanitize_media_name(media.name.trim());
    if name != media.name.trim() {
        warn!("Media name {:?} sent as {:?}", media.name, name);
    }
    if name.is_empty() {
        return format!("{}/{}", now.format(TIMESTAMP_FORMAT), DEFAULT_MEDIA_NAME);
    }
    if media.timestamp {
        format!("{}/{}", now.format(TIMESTAMP_FORMAT), name)
    } else {
        name
    }
}

/// The name ends up inside `PIXELTILE(media=...)`, which may not contain
/// whitespace or the header's own delimiters.
fn sanitize_media_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            c if c.is_whitespace() || c.is_control() => '_',
            ',' | '=' | '(' | ')' => '_',
            c => c,
        })
        .collect()
}

pub struct Session {
    config: DriverConfig,
    manager: ConnectionManager,
    reader: Option<ReadThread>,
    reply_tx: Sender<String>,
    replies: Mutex<Receiver<String>>,
    media: Option<String>,
    frame: u32,
    y_resolution: i32,
    state: SessionState,
    /// Connection generation the greeting was last sent on.
    greeted: Option<u64>,
    /// Tag of the latest registration; replies carrying another one are stale.
    registration: u64,
    stats: StreamStats,
    finished: bool,
}

impl Session {
    pub fn new(config: DriverConfig) -> Self {
        Self::with_launcher(config, Box::new(ProcessLauncher))
    }

    /// Like [`Session::new`], with a custom way of starting the viewer.
    pub fn with_launcher(config: DriverConfig, launcher: Box<dyn ViewerLauncher>) -> Self {
        let manager = ConnectionManager::new(
            config.viewer.clone(),
            config.connection.serialized_io,
            launcher,
        );
        let (reply_tx, replies) = mpsc::channel();
        Self {
            config,
            manager,
            reader: None,
            reply_tx,
            replies: Mutex::new(replies),
            media: None,
            frame: 1,
            y_resolution: 0,
            state: SessionState::Idle,
            greeted: None,
            registration: 0,
            stats: StreamStats::default(),
            finished: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Frame the current pass streams into.
    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// `None` while streaming is disabled.
    pub fn media(&self) -> Option<&str> {
        self.media.as_deref()
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Starts a render pass: connects (launching the viewer if configured),
    /// greets, registers the image source and picks the frame to stream into.
    pub fn open(&mut self, pass: &PassInfo) {
        if self.finished {
            warn!("Session already finished, ignoring open");
            return;
        }
        self.state = SessionState::Connecting;

        let color = ColorCorrection::resolve(&self.config.color);
        color.apply_environment();

        let conn = &self.config.connection;
        let endpoint = Endpoint::new(conn.host.clone(), conn.port);
        let retry = RetryPolicy {
            max_retries: conn.max_retries,
            delay: Duration::from_millis(conn.retry_delay_ms),
        };
        let reply_timeout = Duration::from_millis(conn.reply_timeout_ms);
        let ocio_preload = color.requires_ocio_preload();

        if !self
            .manager
            .connect(&endpoint, conn.auto_launch, &retry, ocio_preload)
        {
            warn!("No viewer at {}; tiles of this pass will be dropped", endpoint);
            self.disable();
            return;
        }

        if ocio_preload && !self.manager.launched_with_ocio() {
            warn!(
                "OCIO correction requested, but the viewer at {} was not started with {}; \
                 the correction may not take effect",
                endpoint, self.config.viewer.ocio_preload_package
            );
        }

        let media_config = &self.config.media;
        let media = self
            .media
            .get_or_insert_with(|| media_identifier(media_config, Local::now()))
            .clone();

        if !self.ensure_reader() {
            self.disable();
            return;
        }

        let generation = self.manager.generation();
        if self.greeted != Some(generation) {
            if !self.manager.send_text(greeting(&self.config.media.greeting)) {
                warn!("Failed to greet viewer at {}", endpoint);
                self.state = SessionState::Idle;
                return;
            }
            self.greeted = Some(generation);
        }

        self.drain_replies();
        self.registration += 1;
        let script = registration_script(&ImageSourceDescriptor {
            media: &media,
            width: pass.width,
            height: pass.height,
            layers: &pass.aovs,
            color: &color,
            tag: self.registration,
        });
        if !self.manager.send_text(return_event(&script)) {
            warn!("Failed to register media {} with the viewer", media);
            self.state = SessionState::Idle;
            return;
        }
        self.state = SessionState::SourceRegistered;

        self.await_frame(reply_timeout);
        self.y_resolution = pass.height as i32;
        self.state = SessionState::Streaming;
        info!(
            "Streaming {}x{} ({} layers) to {} as {} frame {}",
            pass.width,
            pass.height,
            pass.aovs.len(),
            endpoint,
            media,
            self.frame
        );
    }

    /// Starts a read thread unless one already serves the live connection.
    fn ensure_reader(&mut self) -> bool {
        let Some(connection) = self.manager.connection().cloned() else {
            return false;
        };
        if self.reader.as_ref().is_some_and(|r| r.serves(&connection)) {
            return true;
        }
        if let Some(stale) = self.reader.take() {
            stale.join();
        }
        match ReadThread::spawn(connection, self.reply_tx.clone()) {
            Ok(reader) => {
                self.reader = Some(reader);
                true
            }
            Err(e) => {
                warn!("Could not start reading from viewer: {:#}", e);
                false
            }
        }
    }

    fn drain_replies(&mut self) {
        let replies = self.replies.get_mut().unwrap_or_else(|e| e.into_inner());
        while let Ok(stale) = replies.try_recv() {
            debug!("Discarding stale viewer reply {:?}", stale);
        }
    }

    /// Waits for the reply to the latest registration, skipping late replies
    /// to earlier ones.
    fn await_frame(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let replies = self.replies.get_mut().unwrap_or_else(|e| e.into_inner());
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match replies.recv_timeout(remaining) {
                Ok(value) => match parse_reply(&value) {
                    Some((tag, frame)) if tag == self.registration => {
                        self.frame = frame;
                        return;
                    }
                    Some((tag, frame)) => {
                        debug!("Discarding late reply to registration {} (frame {})", tag, frame)
                    }
                    None => {
                        warn!(
                            "Unexpected registration reply {:?}; keeping frame {}",
                            value, self.frame
                        );
                        return;
                    }
                },
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "Viewer did not answer the registration within {:?}; keeping frame {}",
                        timeout, self.frame
                    );
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Reply channel closed; keeping frame {}", self.frame);
                    return;
                }
            }
        }
    }

    /// Connect failure: drop the media so writes become no-ops.
    fn disable(&mut self) {
        self.media = None;
        self.state = SessionState::Idle;
    }

    /// Converts and sends every layer of `bucket`. Safe to call from many
    /// render threads at once; a no-op unless the session is streaming.
    pub fn write_bucket(&self, bucket: &Bucket<'_>) {
        if self.state != SessionState::Streaming {
            return;
        }
        let Some(media) = self.media.as_deref() else {
            return;
        };
        if bucket.width == 0 || bucket.height == 0 {
            return;
        }
        if !self.manager.is_alive() {
            self.stats.record_dropped_n(bucket.layers.len());
            return;
        }

        let y = flipped_y_origin(self.y_resolution, bucket.y, bucket.height as i32);
        for layer in bucket.layers {
            let tile = match TileBuffer::convert(bucket.width, bucket.height, layer.data) {
                Ok(tile) => tile,
                Err(e) => {
                    debug!("Skipping {} tile at ({}, {}): {:#}", layer.aov, bucket.x, bucket.y, e);
                    self.stats.record_dropped();
                    continue;
                }
            };
            let header = pixel_tile(
                &TileHeader {
                    media,
                    width: bucket.width,
                    height: bucket.height,
                    x: bucket.x,
                    y,
                    layer: layer.aov,
                    frame: self.frame,
                },
                tile.byte_len(),
            );
            let payload = tile.into_bytes();
            let bytes = header.len() + payload.len();
            trace!("{}", header);
            if self.manager.send_tile(header, payload) {
                self.stats.record_sent(bytes);
            } else {
                self.stats.record_dropped();
            }
        }
    }

    /// Ends a render pass. The connection stays up for the next one.
    pub fn close(&mut self) {
        if self.state == SessionState::Streaming || self.state == SessionState::SourceRegistered {
            debug!("Pass closed, keeping connection for the next one");
            self.state = SessionState::Closing;
        }
    }

    /// Sends the disconnect notice, closes the connection and joins all
    /// background threads.
    pub fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if self.manager.is_alive() {
            self.manager.send_text(DISCONNECT.to_string());
        }
        self.manager.close();
        if let Some(reader) = self.reader.take() {
            reader.join();
        }
        if let Some(media) = self.media.take() {
            info!(
                "Finished {}: {} tiles ({} bytes) sent, {} dropped",
                media,
                self.stats.tiles_sent(),
                self.stats.bytes_sent(),
                self.stats.tiles_dropped()
            );
        }
        self.state = SessionState::Idle;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Parses a `<tag>:<frame>` registration reply; the viewer may quote strings.
fn parse_reply(value: &str) -> Option<(u64, u32)> {
    let (tag, frame) = value.trim().trim_matches('"').split_once(':')?;
    let tag = tag.trim().parse::<u64>().ok()?;
    let frame = frame.trim().parse::<u32>().ok().filter(|&frame| frame > 0)?;
    Some((tag, frame))
}
