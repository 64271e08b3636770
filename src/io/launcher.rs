// src/io/launcher.rs

//! Spawning the viewer when nothing is listening on the configured port.

use anyhow::{Context, Result};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use crate::config::ViewerConfig;

/// Command line used to start a viewer in network mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ViewerCommand {
    /// `<viewer> -network -networkPort <port> [-flags ModeManagerPreload=<pkg>] [extra...]`
    pub fn new(viewer: &ViewerConfig, port: u16, ocio_preload: bool) -> Self {
        let mut args = vec![
            "-network".to_string(),
            "-networkPort".to_string(),
            port.to_string(),
        ];
        if ocio_preload {
            args.push("-flags".to_string());
            args.push(format!("ModeManagerPreload={}", viewer.ocio_preload_package));
        }
        args.extend(viewer.extra_args.iter().cloned());
        Self {
            program: viewer.executable.clone(),
            args,
        }
    }
}

/// Starts viewer processes. Implemented by [`ProcessLauncher`]; tests swap in
/// their own.
pub trait ViewerLauncher: Send + Sync {
    /// Starts `command` without waiting for it.
    fn launch(&self, command: &ViewerCommand) -> Result<()>;
}

/// Spawns the viewer as a detached child in its own session.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ViewerLauncher for ProcessLauncher {
    fn launch(&self, command: &ViewerCommand) -> Result<()> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // New session: the viewer outlives the renderer's terminal.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()?;
                Ok(())
            });
        }

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to launch viewer {} {}",
                command.program.display(),
                command.args.join(" ")
            )
        })?;
        log::info!(
            "Launched viewer {} {} (pid {})",
            command.program.display(),
            command.args.join(" "),
            child.id()
        );

        // Reap the child whenever it exits; nobody joins this thread.
        thread::Builder::new()
            .name("viewer-reaper".to_string())
            .spawn(move || match child.wait() {
                Ok(status) => log::debug!("Viewer exited: {}", status),
                Err(e) => log::debug!("Failed to wait for viewer: {}", e),
            })
            .context("Failed to spawn viewer reaper thread")?;
        Ok(())
    }
}
