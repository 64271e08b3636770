// tests/session_tests.rs
//
// End-to-end session tests against an in-process fake viewer.

use rv_stream::config::DriverConfig;
use rv_stream::io::{ViewerCommand, ViewerLauncher};
use rv_stream::pixels::Rgba;
use rv_stream::protocol::{Frame, FrameParser};
use rv_stream::{Bucket, BucketLayer, PassInfo, PixelData, Session, SessionState};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const HELLO: &[u8] = b"GREETING 10 rv-shell-1";
const RED: Rgba = [1.0, 0.0, 0.0, 1.0];

/// Accepts one client, records every frame it sends, and answers each
/// registration with the next entry of `replies` (`None` stays silent).
struct FakeViewer {
    port: u16,
    frames: mpsc::Receiver<Frame>,
    handle: Option<JoinHandle<()>>,
}

impl FakeViewer {
    fn start(replies: Vec<Option<u32>>) -> Self {
        Self::start_on(TcpListener::bind("127.0.0.1:0").unwrap(), replies, HELLO)
    }

    fn start_on(listener: TcpListener, replies: Vec<Option<u32>>, hello: &'static [u8]) -> Self {
        let port = listener.local_addr().unwrap().port();
        let (tx, frames) = mpsc::channel();
        let handle = thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let _ = stream.write_all(hello);
            serve(&mut stream, replies.into_iter(), |frame| tx.send(frame).is_ok());
        });
        Self {
            port,
            frames,
            handle: Some(handle),
        }
    }

    /// Waits for the client to hang up and returns everything it sent.
    fn into_frames(mut self) -> Vec<Frame> {
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
        self.frames.try_iter().collect()
    }
}

fn serve<I, F>(stream: &mut TcpStream, mut replies: I, mut record: F)
where
    I: Iterator<Item = Option<u32>>,
    F: FnMut(Frame) -> bool,
{
    let mut parser = FrameParser::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        parser.push(&buf[..n]);
        while let Ok(Some(frame)) = parser.next_frame() {
            if let Some(tag) = registration_tag(&frame) {
                if let Some(Some(value)) = replies.next() {
                    let _ = stream.write_all(&reply(&tag, value));
                }
            }
            if !record(frame) {
                return;
            }
        }
    }
}

/// Tag the client put into a registration script.
fn registration_tag(frame: &Frame) -> Option<String> {
    if frame.kind != "MESSAGE" {
        return None;
    }
    let text = frame.payload_text();
    if !text.starts_with("RETURNEVENT") {
        return None;
    }
    let start = text.find("int tag = ")? + "int tag = ".len();
    let end = start + text[start..].find(';')?;
    Some(text[start..end].to_string())
}

/// What the viewer answers once a tagged registration evaluated to `frame`.
fn reply(tag: &str, frame: u32) -> Vec<u8> {
    let body = format!("RETURN {}:{}", tag, frame);
    format!("MESSAGE {} {}", body.len(), body).into_bytes()
}

fn config(port: u16) -> DriverConfig {
    let mut config = DriverConfig::default();
    config.connection.port = port;
    config.connection.reply_timeout_ms = 2000;
    config.media.name = "shotA".to_string();
    config.media.timestamp = false;
    config
}

fn pass(width: u32, height: u32) -> PassInfo {
    PassInfo {
        width,
        height,
        aovs: vec!["RGBA".to_string()],
    }
}

fn write_rgba(session: &Session, x: i32, y: i32, w: usize, h: usize, pixels: &[Rgba]) {
    let layers = [BucketLayer {
        aov: "RGBA",
        data: PixelData::Rgba(pixels),
    }];
    session.write_bucket(&Bucket {
        x,
        y,
        width: w,
        height: h,
        layers: &layers,
    });
}

/// Writes buckets until the session notices its connection is gone.
fn write_until_dropped(session: &Session) {
    for _ in 0..200 {
        write_rgba(session, 0, 0, 2, 2, &[RED; 4]);
        if session.stats().tiles_dropped() > 0 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(session.stats().tiles_dropped() > 0);
}

fn le_bytes(pixels: &[Rgba]) -> Vec<u8> {
    pixels
        .iter()
        .flatten()
        .flat_map(|c| c.to_le_bytes())
        .collect()
}

fn text(frame: &Frame) -> String {
    frame.payload_text().into_owned()
}

fn tiles(frames: &[Frame]) -> Vec<&Frame> {
    frames
        .iter()
        .filter(|f| f.kind.starts_with("PIXELTILE("))
        .collect()
}

fn registrations(frames: &[Frame]) -> Vec<String> {
    frames
        .iter()
        .filter(|f| f.kind == "MESSAGE")
        .map(text)
        .filter(|t| t.starts_with("RETURNEVENT remote-eval * "))
        .collect()
}

#[test_log::test]
fn streams_one_tile_end_to_end() {
    let viewer = FakeViewer::start(vec![Some(1)]);
    let mut session = Session::new(config(viewer.port));

    session.open(&pass(4, 4));
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(session.media(), Some("shotA"));
    assert_eq!(session.frame(), 1);

    write_rgba(&session, 0, 0, 2, 2, &[RED; 4]);
    session.close();
    assert_eq!(session.state(), SessionState::Closing);
    assert_eq!(session.stats().tiles_sent(), 1);
    session.finish();

    let frames = viewer.into_frames();
    assert_eq!(frames[0].kind, "NEWGREETING");
    assert_eq!(text(&frames[0]), "rv-shell-1 rv-stream");

    let scripts = registrations(&frames);
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].contains("string media = \"shotA\";"));
    assert!(scripts[0].contains("newImageSource(media, 4, 4, 4, 4,"));
    assert!(scripts[0].contains("string[] {\"RGBA\"}"));

    let tiles = tiles(&frames);
    assert_eq!(tiles.len(), 1);
    assert_eq!(tiles[0].kind, "PIXELTILE(media=shotA,w=2,h=2,x=0,y=2,layer=RGBA,f=1)");
    assert_eq!(tiles[0].payload.len(), 64);
    assert_eq!(tiles[0].payload, le_bytes(&[RED; 4]));

    let last = frames.last().unwrap();
    assert_eq!((last.kind.as_str(), text(last).as_str()), ("MESSAGE", "DISCONNECT"));
}

#[test_log::test]
fn tile_rows_are_sent_bottom_up() {
    let viewer = FakeViewer::start(vec![Some(1)]);
    let mut session = Session::new(config(viewer.port));
    session.open(&pass(4, 4));

    let top = [0.1, 0.2, 0.3, 1.0];
    let bottom = [0.7, 0.8, 0.9, 0.5];
    write_rgba(&session, 2, 0, 2, 2, &[top, top, bottom, bottom]);
    session.finish();

    let frames = viewer.into_frames();
    let tiles = tiles(&frames);
    assert_eq!(tiles[0].kind, "PIXELTILE(media=shotA,w=2,h=2,x=2,y=2,layer=RGBA,f=1)");
    assert_eq!(tiles[0].payload, le_bytes(&[bottom, bottom, top, top]));
}

#[test_log::test]
fn reopening_appends_a_frame_to_the_same_media() {
    let viewer = FakeViewer::start(vec![Some(1), Some(2)]);
    let mut session = Session::new(config(viewer.port));

    session.open(&pass(4, 4));
    write_rgba(&session, 0, 0, 2, 2, &[RED; 4]);
    session.close();

    session.open(&pass(4, 4));
    assert_eq!(session.frame(), 2);
    assert_eq!(session.media(), Some("shotA"));
    write_rgba(&session, 0, 0, 2, 2, &[RED; 4]);
    session.finish();

    let frames = viewer.into_frames();
    let greetings = frames.iter().filter(|f| f.kind == "NEWGREETING").count();
    assert_eq!(greetings, 1);

    let scripts = registrations(&frames);
    assert_eq!(scripts.len(), 2);
    assert!(scripts[0].contains("int tag = 1;"));
    assert!(scripts[1].contains("int tag = 2;"));
    assert_eq!(
        scripts[0].replace("int tag = 1;", ""),
        scripts[1].replace("int tag = 2;", "")
    );

    let kinds: Vec<&str> = tiles(&frames).iter().map(|f| f.kind.as_str()).collect();
    assert_eq!(
        kinds,
        [
            "PIXELTILE(media=shotA,w=2,h=2,x=0,y=2,layer=RGBA,f=1)",
            "PIXELTILE(media=shotA,w=2,h=2,x=0,y=2,layer=RGBA,f=2)",
        ]
    );
}

#[test_log::test]
fn missing_reply_keeps_current_frame() {
    let viewer = FakeViewer::start(vec![None]);
    let mut cfg = config(viewer.port);
    cfg.connection.reply_timeout_ms = 100;
    let mut session = Session::new(cfg);

    session.open(&pass(4, 4));
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(session.frame(), 1);
    session.finish();
    viewer.into_frames();
}

#[test_log::test]
fn zero_area_buckets_are_skipped() {
    let viewer = FakeViewer::start(vec![Some(1)]);
    let mut session = Session::new(config(viewer.port));
    session.open(&pass(4, 4));

    write_rgba(&session, 4, 0, 0, 2, &[]);
    assert_eq!(session.stats().tiles_sent(), 0);
    assert_eq!(session.stats().tiles_dropped(), 0);
    session.finish();

    assert!(tiles(&viewer.into_frames()).is_empty());
}

#[test_log::test]
fn unreachable_viewer_disables_streaming() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut session = Session::new(config(port));

    session.open(&pass(4, 4));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.media(), None);

    write_rgba(&session, 0, 0, 2, 2, &[RED; 4]);
    assert_eq!(session.stats().tiles_sent(), 0);
    session.close();
    session.finish();
}

#[test_log::test]
fn finish_returns_after_viewer_hangs_up() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let viewer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut parser = FrameParser::new();
        let mut buf = [0u8; 4096];
        let tag = 'read: loop {
            let n = stream.read(&mut buf).unwrap();
            parser.push(&buf[..n]);
            while let Ok(Some(frame)) = parser.next_frame() {
                if let Some(tag) = registration_tag(&frame) {
                    break 'read tag;
                }
            }
        };
        stream.write_all(&reply(&tag, 1)).unwrap();
        stream.write_all(b"MESSAGE 10 DISCONNECT").unwrap();
        // Keep the socket open; the client has to tear it down itself.
        thread::sleep(Duration::from_millis(500));
    });

    let mut session = Session::new(config(port));
    session.open(&pass(4, 4));
    assert_eq!(session.frame(), 1);

    write_until_dropped(&session);
    session.finish();
    viewer.join().unwrap();
}

#[test_log::test]
fn reconnects_after_viewer_drops_between_passes() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let first = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(HELLO).unwrap();
        // Goes away right after the first tile.
        serve(&mut stream, vec![Some(1)].into_iter(), |frame| {
            !frame.kind.starts_with("PIXELTILE(")
        });
    });

    let mut cfg = config(port);
    cfg.media.timestamp = true;
    let mut session = Session::new(cfg);
    session.open(&pass(4, 4));
    let media = session.media().unwrap().to_string();
    assert_eq!(session.frame(), 1);
    write_rgba(&session, 0, 0, 2, 2, &[RED; 4]);
    first.join().unwrap();
    write_until_dropped(&session);
    session.close();
    assert_eq!(session.media(), Some(media.as_str()));

    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    let second = FakeViewer::start_on(listener, vec![Some(2)], b"GREETING 10 rv-shell-1PING 1 p");
    session.open(&pass(4, 4));
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(session.media(), Some(media.as_str()));
    assert_eq!(session.frame(), 2);
    write_rgba(&session, 0, 0, 2, 2, &[RED; 4]);
    session.finish();

    let frames = second.into_frames();
    let greeting = frames.iter().position(|f| f.kind == "NEWGREETING").unwrap();
    let registration = frames.iter().position(|f| registration_tag(f).is_some()).unwrap();
    assert!(greeting < registration);
    assert!(frames.iter().any(|f| f.kind == "PONG" && f.payload == b"p"));

    let kinds: Vec<&str> = tiles(&frames).iter().map(|f| f.kind.as_str()).collect();
    assert_eq!(
        kinds,
        [format!("PIXELTILE(media={},w=2,h=2,x=0,y=2,layer=RGBA,f=2)", media)]
    );
}

#[test_log::test]
fn late_reply_to_an_earlier_pass_is_ignored() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let viewer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(HELLO).unwrap();
        let mut parser = FrameParser::new();
        let mut buf = [0u8; 4096];
        let mut tags = Vec::new();
        let mut tile_kinds = Vec::new();
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            parser.push(&buf[..n]);
            while let Ok(Some(frame)) = parser.next_frame() {
                if let Some(tag) = registration_tag(&frame) {
                    tags.push(tag);
                    if tags.len() == 2 {
                        // The first registration is answered only now.
                        stream.write_all(&reply(&tags[0], 9)).unwrap();
                        stream.write_all(&reply(&tags[1], 2)).unwrap();
                    }
                } else if frame.kind.starts_with("PIXELTILE(") {
                    tile_kinds.push(frame.kind);
                }
            }
        }
        tile_kinds
    });

    let mut cfg = config(port);
    cfg.connection.reply_timeout_ms = 300;
    let mut session = Session::new(cfg);

    session.open(&pass(4, 4));
    assert_eq!(session.frame(), 1);
    session.close();

    session.open(&pass(4, 4));
    assert_eq!(session.frame(), 2);
    write_rgba(&session, 0, 0, 2, 2, &[RED; 4]);
    session.finish();

    assert_eq!(
        viewer.join().unwrap(),
        ["PIXELTILE(media=shotA,w=2,h=2,x=0,y=2,layer=RGBA,f=2)"]
    );
}

#[test_log::test]
fn pings_are_answered() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let viewer = FakeViewer::start_on(listener, vec![Some(1)], b"GREETING 10 rv-shell-1PING 1 p");
    let mut session = Session::new(config(viewer.port));
    session.open(&pass(4, 4));
    session.finish();

    let frames = viewer.into_frames();
    assert!(frames.iter().any(|f| f.kind == "PONG" && f.payload == b"p"));
}

#[test_log::test]
fn concurrent_buckets_keep_framing_intact() {
    for serialized_io in [false, true] {
        let viewer = FakeViewer::start(vec![Some(1)]);
        let mut cfg = config(viewer.port);
        cfg.connection.serialized_io = serialized_io;
        let mut session = Session::new(cfg);
        session.open(&pass(8, 8));

        thread::scope(|s| {
            for row in 0..4 {
                let session = &session;
                s.spawn(move || {
                    for col in 0..4 {
                        let shade = [row as f32, col as f32, 0.0, 1.0];
                        write_rgba(session, col * 2, row * 2, 2, 2, &[shade; 4]);
                    }
                });
            }
        });
        session.finish();

        let frames = viewer.into_frames();
        let tiles = tiles(&frames);
        assert_eq!(tiles.len(), 16, "serialized_io={}", serialized_io);
        for tile in tiles {
            assert_eq!(tile.payload.len(), 64);
        }
    }
}

/// Stands a fake viewer up on the requested port when asked to launch one.
#[derive(Clone, Default)]
struct FakeLauncher {
    started: Arc<Mutex<Option<FakeViewer>>>,
}

impl ViewerLauncher for FakeLauncher {
    fn launch(&self, command: &ViewerCommand) -> anyhow::Result<()> {
        let port = &command.args[2];
        let listener = TcpListener::bind(format!("127.0.0.1:{}", port))?;
        let viewer = FakeViewer::start_on(listener, vec![Some(1)], HELLO);
        *self.started.lock().unwrap() = Some(viewer);
        Ok(())
    }
}

#[test_log::test]
fn auto_launch_starts_viewer_and_streams() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut cfg = config(port);
    cfg.connection.auto_launch = true;
    cfg.connection.max_retries = 5;
    cfg.connection.retry_delay_ms = 20;

    let launcher = FakeLauncher::default();
    let mut session = Session::with_launcher(cfg, Box::new(launcher.clone()));
    session.open(&pass(4, 4));
    assert_eq!(session.state(), SessionState::Streaming);
    write_rgba(&session, 0, 0, 2, 2, &[RED; 4]);
    session.finish();

    let viewer = launcher.started.lock().unwrap().take().unwrap();
    assert_eq!(tiles(&viewer.into_frames()).len(), 1);
}
