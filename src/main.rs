// src/main.rs

//! Streams a synthetic test image into a viewer.
//!
//! Usage: `rv-stream [config.json]`. Environment overrides apply on top of
//! the file, see `DriverConfig::apply_env_overrides`.

use anyhow::Context;
use log::info;
use rv_stream::pixels::Rgba;
use rv_stream::{Bucket, BucketLayer, DriverConfig, PassInfo, PixelData, Session};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

const IMAGE_WIDTH: usize = 640;
const IMAGE_HEIGHT: usize = 360;
const BUCKET_SIZE: usize = 64;

/// Bucket origins in render order, clipped at the image border.
fn buckets() -> Vec<(usize, usize, usize, usize)> {
    let mut out = Vec::new();
    for y in (0..IMAGE_HEIGHT).step_by(BUCKET_SIZE) {
        for x in (0..IMAGE_WIDTH).step_by(BUCKET_SIZE) {
            let w = BUCKET_SIZE.min(IMAGE_WIDTH - x);
            let h = BUCKET_SIZE.min(IMAGE_HEIGHT - y);
            out.push((x, y, w, h));
        }
    }
    out
}

/// A color gradient plus a radial "depth" channel.
fn shade(x0: usize, y0: usize, w: usize, h: usize) -> (Vec<Rgba>, Vec<f32>) {
    let mut beauty = Vec::with_capacity(w * h);
    let mut depth = Vec::with_capacity(w * h);
    let (cx, cy) = (IMAGE_WIDTH as f32 / 2.0, IMAGE_HEIGHT as f32 / 2.0);
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            let u = x as f32 / IMAGE_WIDTH as f32;
            let v = y as f32 / IMAGE_HEIGHT as f32;
            beauty.push([u, v, 1.0 - u, 1.0]);
            let d = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
            depth.push(d / cx);
        }
    }
    (beauty, depth)
}

fn main() -> anyhow::Result<()> {
    // Default filter is "info" if RUST_LOG is not set.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let mut config = DriverConfig::load(config_path.as_deref())
        .context("Failed to load driver configuration")?;
    config.apply_env_overrides();
    info!(
        "Streaming to {}:{}",
        config.connection.host, config.connection.port
    );

    let mut session = Session::new(config);
    session.open(&PassInfo {
        width: IMAGE_WIDTH as u32,
        height: IMAGE_HEIGHT as u32,
        aovs: vec!["RGBA".to_string(), "Z".to_string()],
    });

    let work = buckets();
    let next = AtomicUsize::new(0);
    let workers = thread::available_parallelism().map_or(4, |n| n.get());
    thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(&(x, y, w, h)) = work.get(i) else {
                    break;
                };
                let (beauty, depth) = shade(x, y, w, h);
                let layers = [
                    BucketLayer {
                        aov: "RGBA",
                        data: PixelData::Rgba(&beauty),
                    },
                    BucketLayer {
                        aov: "Z",
                        data: PixelData::Float(&depth),
                    },
                ];
                session.write_bucket(&Bucket {
                    x: x as i32,
                    y: y as i32,
                    width: w,
                    height: h,
                    layers: &layers,
                });
            });
        }
    });

    session.close();
    info!(
        "Rendered {} buckets, {} tiles sent",
        work.len(),
        session.stats().tiles_sent()
    );
    session.finish();
    Ok(())
}
