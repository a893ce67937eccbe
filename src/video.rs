use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use once_cell::sync::OnceCell;
use serde_json::json;

#[cfg(any(unix, target_os = "windows"))]
use rand::{distributions::Alphanumeric, Rng};
#[cfg(unix)]
use std::os::unix::net::UnixStream;

fn video_debug_enabled() -> bool {
    static FLAG: OnceCell<bool> = OnceCell::new();
    *FLAG.get_or_init(|| {
        std::env::var("STORYTUI_DEBUG_VIDEO")
            .map(|val| {
                let trimmed = val.trim();
                !(trimmed.is_empty()
                    || trimmed.eq_ignore_ascii_case("0")
                    || trimmed.eq_ignore_ascii_case("false")
                    || trimmed.eq_ignore_ascii_case("no")
                    || trimmed.eq_ignore_ascii_case("off"))
            })
            .unwrap_or(false)
    })
}

fn video_debug_writer() -> Option<&'static Mutex<std::fs::File>> {
    static WRITER: OnceCell<Option<Mutex<std::fs::File>>> = OnceCell::new();
    WRITER
        .get_or_init(|| {
            std::env::var("STORYTUI_DEBUG_VIDEO_LOG")
                .ok()
                .and_then(|path| {
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .map(Mutex::new)
                        .ok()
                })
        })
        .as_ref()
}

pub fn debug_log(message: impl AsRef<str>) {
    if !video_debug_enabled() {
        return;
    }
    if let Some(writer) = video_debug_writer() {
        if let Ok(mut file) = writer.lock() {
            let _ = writeln!(file, "{}", message.as_ref());
            return;
        }
    }
    eprintln!("{}", message.as_ref());
}

/// A story video ready for playback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoSource {
    pub playback_url: String,
    pub label: String,
}

pub struct InlineLaunchOptions<'a> {
    pub mpv_path: &'a str,
    pub source: &'a VideoSource,
    pub user_agent: &'a str,
    pub col: u16,
    pub row: u16,
    pub term_cols: i32,
    pub term_rows: i32,
    pub pixel_width: i32,
    pub pixel_height: i32,
}

/// A running inline playback. Exactly one exists per shown video item; the
/// viewer stops it before rendering anything else.
pub struct InlineSession {
    kill_tx: Sender<()>,
    status_rx: Receiver<Result<ExitStatus>>,
    handle: Option<thread::JoinHandle<()>>,
    ipc_path: Option<Arc<String>>,
}

impl InlineSession {
    fn finalize(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Poll for natural end-of-playback. `Some(Ok(status))` with a success
    /// status means the video played through.
    pub fn try_status(&mut self) -> Option<Result<ExitStatus>> {
        match self.status_rx.try_recv() {
            Ok(res) => {
                self.finalize();
                Some(res)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.finalize();
                Some(Err(anyhow!("video session closed unexpectedly")))
            }
        }
    }

    /// Stop playback and wait for the player to exit. Used when the viewer
    /// closes or navigates away from a still-playing video.
    pub fn stop_blocking(mut self) -> Option<Result<ExitStatus>> {
        let _ = self.kill_tx.send(());
        let res = self.status_rx.recv().ok();
        self.finalize();
        res
    }

    pub fn controls_supported(&self) -> bool {
        self.ipc_path.is_some()
    }

    pub fn send_command(&self, command: VideoCommand) -> Result<()> {
        let Some(path) = &self.ipc_path else {
            return Err(anyhow!(
                "Inline video controls are not supported on this platform."
            ));
        };
        send_ipc_command(path, command)
    }
}

impl Drop for InlineSession {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.kill_tx.send(());
            let _ = self.status_rx.recv().ok();
            self.finalize();
        }
    }
}

pub fn spawn_inline_player(opts: InlineLaunchOptions<'_>) -> Result<InlineSession> {
    if opts.source.playback_url.trim().is_empty() {
        return Err(anyhow!("video URL missing"));
    }

    let (kill_tx, kill_rx) = bounded::<()>(1);
    let (status_tx, status_rx) = bounded::<Result<ExitStatus>>(1);

    let mpv_path = opts.mpv_path.to_string();
    let remote_url = opts.source.playback_url.clone();
    let label = opts.source.label.clone();
    let user_agent = opts.user_agent.to_string();
    let debug_enabled = video_debug_enabled();
    #[cfg(unix)]
    let ipc_path = unique_ipc_path();
    #[cfg(not(unix))]
    let ipc_path: Option<String> = None;
    let ipc_path_for_session = ipc_path.clone();
    debug_log(format!(
        "spawning inline mpv term={}x{} pixels={}x{} url={} ipc={}",
        opts.term_cols,
        opts.term_rows,
        opts.pixel_width,
        opts.pixel_height,
        remote_url,
        ipc_path.as_deref().unwrap_or("n/a")
    ));
    #[cfg(unix)]
    if let Some(path) = &ipc_path {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound && video_debug_enabled() {
                debug_log(format!("failed to remove stale mpv ipc path {path}: {err}"));
            }
        }
    }
    let ipc_arg = ipc_path
        .as_ref()
        .map(|path| format!("--input-ipc-server={path}"));
    let col = opts.col;
    let row = opts.row;
    let term_cols = opts.term_cols;
    let term_rows = opts.term_rows;
    let pixel_width = opts.pixel_width;
    let pixel_height = opts.pixel_height;
    let handle = thread::spawn(move || {
        let ipc_cleanup = ipc_path.clone();
        let result = (|| -> Result<ExitStatus> {
            let mut args = Vec::new();
            args.push(remote_url.clone());
            args.push("--vo=kitty".to_string());
            args.push(format!("--vo-kitty-cols={}", term_cols.max(1)));
            args.push(format!("--vo-kitty-rows={}", term_rows.max(1)));
            let left = u32::from(col).saturating_add(1);
            let top = u32::from(row).saturating_add(1);
            args.push(format!("--vo-kitty-left={}", left));
            args.push(format!("--vo-kitty-top={}", top));
            args.push(format!("--vo-kitty-width={}", pixel_width.max(1)));
            args.push(format!("--vo-kitty-height={}", pixel_height.max(1)));
            args.push("--vo-kitty-config-clear=no".to_string());
            args.push("--force-window=no".to_string());
            // Stories autoplay muted and exit at the end of the file; the
            // exit is what reports natural end-of-playback upstream.
            args.push("--mute=yes".to_string());
            args.push("--keep-open=no".to_string());
            args.push("--loop-file=no".to_string());
            args.push("--really-quiet".to_string());
            args.push("--idle=no".to_string());
            args.push("--terminal=no".to_string());
            args.push("--input-terminal=no".to_string());
            args.push("--no-config".to_string());
            args.push("--ytdl=no".to_string());
            args.push("--osc=no".to_string());
            args.push("--osd-level=0".to_string());
            args.push("--osd-duration=0".to_string());
            if let Some(arg) = &ipc_arg {
                args.push(arg.clone());
            }

            if !label.is_empty() {
                args.push(format!("--force-media-title={}", label));
            }
            args.push(format!("--http-header-fields=User-Agent: {}", user_agent));

            if debug_enabled {
                debug_log(format!("mpv args: {:?}", args));
            }

            let mut command = Command::new(&mpv_path);
            for arg in &args {
                command.arg(arg);
            }

            command.stdin(Stdio::null());
            #[cfg(unix)]
            {
                use std::os::unix::io::{AsRawFd, FromRawFd};

                let stdout = std::io::stdout();
                let fd = stdout.as_raw_fd();
                let dup_fd = unsafe { libc::dup(fd) };
                if dup_fd >= 0 {
                    let stdio = unsafe { Stdio::from_raw_fd(dup_fd) };
                    command.stdout(stdio);
                } else {
                    command.stdout(Stdio::inherit());
                }
            }
            #[cfg(not(unix))]
            {
                command.stdout(Stdio::inherit());
            }
            if debug_enabled {
                command.stderr(Stdio::piped());
            } else {
                command.stderr(Stdio::null());
            }

            let mut child = command
                .spawn()
                .with_context(|| format!("launch mpv to play {}", remote_url))?;
            let mut stderr_handle = None;
            if debug_enabled {
                if let Some(stderr) = child.stderr.take() {
                    stderr_handle = Some(thread::spawn(move || {
                        let reader = BufReader::new(stderr);
                        for line in reader.lines().map_while(Result::ok) {
                            debug_log(format!("mpv stderr: {}", line));
                        }
                    }));
                }
            }

            loop {
                if kill_rx.try_recv().is_ok() {
                    let _ = child.kill();
                    let status = child.wait().context("wait for mpv after stop request")?;
                    if debug_enabled {
                        debug_log(format!("mpv stopped with status {:?}", status.code()));
                    }
                    if let Some(handle) = stderr_handle.take() {
                        let _ = handle.join();
                    }
                    return Ok(status);
                }

                match child.try_wait() {
                    Ok(Some(status)) => {
                        if debug_enabled {
                            debug_log(format!("mpv exited with status {:?}", status.code()));
                        }
                        if let Some(handle) = stderr_handle.take() {
                            let _ = handle.join();
                        }
                        return Ok(status);
                    }
                    Ok(None) => thread::sleep(Duration::from_millis(30)),
                    Err(err) => {
                        if debug_enabled {
                            debug_log(format!("mpv poll error: {}", err));
                        }
                        if let Some(handle) = stderr_handle.take() {
                            let _ = handle.join();
                        }
                        return Err(anyhow!(err)).context("poll mpv status");
                    }
                }
            }
        })();
        #[cfg(unix)]
        if let Some(path) = ipc_cleanup {
            cleanup_ipc_path(&path);
        }

        let _ = status_tx.send(result);
    });

    Ok(InlineSession {
        kill_tx,
        status_rx,
        handle: Some(handle),
        ipc_path: ipc_path_for_session.map(Arc::new),
    })
}

#[derive(Clone, Copy)]
pub enum VideoCommand {
    TogglePause,
}

fn send_ipc_command(path: &str, command: VideoCommand) -> Result<()> {
    let payload = json!({
        "command": command_payload(command),
    });
    let serialized = serde_json::to_string(&payload).context("serialize mpv command")?;
    send_ipc_command_inner(path, &serialized)
}

#[cfg(unix)]
fn send_ipc_command_inner(path: &str, serialized: &str) -> Result<()> {
    let mut stream =
        UnixStream::connect(path).with_context(|| format!("connect to mpv IPC socket {path}"))?;
    stream
        .write_all(serialized.as_bytes())
        .context("write mpv IPC command")?;
    stream
        .write_all(b"\n")
        .context("write mpv IPC command terminator")?;
    Ok(())
}

#[cfg(target_os = "windows")]
fn send_ipc_command_inner(path: &str, serialized: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io::ErrorKind;

    const PIPE_RETRIES: usize = 5;
    const PIPE_RETRY_DELAY: Duration = Duration::from_millis(100);

    for attempt in 0..PIPE_RETRIES {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(mut pipe) => {
                pipe.write_all(serialized.as_bytes())
                    .with_context(|| format!("write mpv IPC command to {path}"))?;
                pipe.write_all(b"\n")
                    .with_context(|| format!("write mpv IPC command terminator to {path}"))?;
                pipe.flush().ok();
                return Ok(());
            }
            Err(err) if err.kind() == ErrorKind::NotFound && attempt + 1 < PIPE_RETRIES => {
                thread::sleep(PIPE_RETRY_DELAY);
            }
            Err(err) => {
                return Err(anyhow!(err)).context(format!("connect to mpv IPC named pipe {path}"));
            }
        }
    }

    Err(anyhow!("connect to mpv IPC named pipe {}", path))
}

#[cfg(all(not(unix), not(target_os = "windows")))]
fn send_ipc_command_inner(_path: &str, _serialized: &str) -> Result<()> {
    Err(anyhow!(
        "Inline video controls are not supported on this platform."
    ))
}

#[cfg(unix)]
fn unique_ipc_path() -> Option<String> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    let mut path = std::env::temp_dir();
    path.push(format!("story-tui-mpv-{}-{suffix}.sock", std::process::id()));
    Some(path.to_string_lossy().to_string())
}

#[cfg(target_os = "windows")]
fn unique_ipc_path() -> Option<String> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    Some(format!(
        r"\\.\pipe\story-tui-mpv-{}-{suffix}",
        std::process::id()
    ))
}

#[cfg(all(not(unix), not(target_os = "windows")))]
fn unique_ipc_path() -> Option<String> {
    None
}

#[cfg(unix)]
fn cleanup_ipc_path(path: &str) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound && video_debug_enabled() {
            debug_log(format!("failed to remove mpv ipc path {path}: {err}"));
        }
    }
}

#[cfg(target_os = "windows")]
fn cleanup_ipc_path(_path: &str) {}

#[cfg(all(not(unix), not(target_os = "windows")))]
fn cleanup_ipc_path(_path: &str) {}

fn command_payload(command: VideoCommand) -> serde_json::Value {
    match command {
        VideoCommand::TogglePause => json!(["cycle", "pause"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_pause_payload_cycles_pause() {
        let payload = command_payload(VideoCommand::TogglePause);
        assert_eq!(payload, json!(["cycle", "pause"]));
    }

    #[test]
    fn spawn_rejects_blank_url() {
        let source = VideoSource {
            playback_url: "  ".into(),
            label: "ivy".into(),
        };
        let err = spawn_inline_player(InlineLaunchOptions {
            mpv_path: "mpv",
            source: &source,
            user_agent: "story-tui/test",
            col: 0,
            row: 0,
            term_cols: 40,
            term_rows: 20,
            pixel_width: 400,
            pixel_height: 300,
        });
        assert!(err.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn ipc_paths_are_unique() {
        let first = unique_ipc_path().unwrap();
        let second = unique_ipc_path().unwrap();
        assert_ne!(first, second);
    }
}
