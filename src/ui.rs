//! Terminal front end.
//!
//! Commands arrive from a stdin reader thread; FPS readings and session
//! status changes arrive from the pipeline. Everything funnels through one
//! channel so the UI loop is the only writer to the terminal.

use std::io::{self, BufRead, Write};
use std::str::FromStr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

use crate::camera::error::CaptureError;
use crate::camera::session::{SessionStatus, StatusCallback};
use crate::camera::types::CaptureSessionState;
use crate::diagnostics::fps::FpsSink;
use crate::diagnostics::stats::DiagnosticSnapshot;
use crate::processing::mode::ProcessingMode;

/// What the UI can ask of the running pipeline.
pub trait Controls {
    fn mode(&self) -> ProcessingMode;
    fn toggle_mode(&self) -> ProcessingMode;
    fn set_mode(&self, mode: ProcessingMode);
    fn pause(&self);
    fn resume(&self) -> Result<CaptureSessionState, CaptureError>;
    fn reopen(&self) -> Result<CaptureSessionState, CaptureError>;
    fn state(&self) -> CaptureSessionState;
    fn snapshot(&self) -> DiagnosticSnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Toggle,
    Raw,
    Edges,
    Pause,
    Resume,
    Reopen,
    Stats,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "t" | "toggle" => Ok(Self::Toggle),
            "raw" => Ok(Self::Raw),
            "edge" | "edges" => Ok(Self::Edges),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "reopen" => Ok(Self::Reopen),
            "s" | "stats" => Ok(Self::Stats),
            "h" | "help" | "?" => Ok(Self::Help),
            "q" | "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

const HELP: &str = "commands: <enter>/toggle, raw, edges, pause, resume, reopen, stats, help, quit";

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Fps(u32),
    Status(SessionStatus),
    Command(Command),
    Invalid(String),
    /// Input stream ended.
    Closed,
}

/// Sending half of the UI channel, handed to producers.
#[derive(Clone)]
pub struct UiHandle {
    tx: mpsc::Sender<UiEvent>,
}

impl UiHandle {
    pub fn send(&self, event: UiEvent) {
        // Receiver gone means the UI already quit.
        let _ = self.tx.send(event);
    }

    pub fn fps_sink(&self) -> FpsSink {
        let handle = self.clone();
        Arc::new(move |rate| handle.send(UiEvent::Fps(rate)))
    }

    pub fn status_callback(&self) -> StatusCallback {
        let handle = self.clone();
        Arc::new(move |status| handle.send(UiEvent::Status(status.clone())))
    }
}

pub fn channel() -> (UiHandle, mpsc::Receiver<UiEvent>) {
    let (tx, rx) = mpsc::channel();
    (UiHandle { tx }, rx)
}

/// Forward lines of `input` as commands until it ends.
pub fn spawn_input_reader<R>(input: R, handle: UiHandle) -> io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    std::thread::Builder::new()
        .name("ui-input".to_string())
        .spawn(move || {
            for line in input.lines() {
                let Ok(line) = line else { break };
                let event = match line.parse::<Command>() {
                    Ok(cmd) => UiEvent::Command(cmd),
                    Err(msg) => UiEvent::Invalid(msg),
                };
                let quit = event == UiEvent::Command(Command::Quit);
                handle.send(event);
                if quit {
                    return;
                }
            }
            handle.send(UiEvent::Closed);
        })
}

/// Run the UI loop until a quit command, end of input, or every sender
/// being dropped.
pub fn run<C, W>(controls: &C, events: mpsc::Receiver<UiEvent>, out: &mut W) -> io::Result<()>
where
    C: Controls + ?Sized,
    W: Write,
{
    writeln!(out, "mode: {}", controls.mode())?;
    writeln!(out, "{HELP}")?;

    while let Ok(event) = events.recv() {
        match event {
            UiEvent::Fps(rate) => writeln!(out, "fps: {rate}")?,
            UiEvent::Status(status) => write_status(out, &status)?,
            UiEvent::Invalid(msg) => writeln!(out, "{msg}; {HELP}")?,
            UiEvent::Closed => break,
            UiEvent::Command(Command::Quit) => break,
            UiEvent::Command(cmd) => execute(controls, cmd, out)?,
        }
        out.flush()?;
    }
    debug!("ui loop finished");
    Ok(())
}

fn execute<C, W>(controls: &C, cmd: Command, out: &mut W) -> io::Result<()>
where
    C: Controls + ?Sized,
    W: Write,
{
    match cmd {
        Command::Toggle => writeln!(out, "mode: {}", controls.toggle_mode()),
        Command::Raw | Command::Edges => {
            let mode = if cmd == Command::Raw {
                ProcessingMode::Raw
            } else {
                ProcessingMode::EdgeDetect
            };
            controls.set_mode(mode);
            writeln!(out, "mode: {mode}")
        }
        Command::Pause => {
            controls.pause();
            writeln!(out, "capture: {}", controls.state())
        }
        Command::Resume => report(out, controls.resume()),
        Command::Reopen => report(out, controls.reopen()),
        Command::Stats => write_snapshot(out, &controls.snapshot()),
        Command::Help => writeln!(out, "{HELP}"),
        Command::Quit => Ok(()),
    }
}

fn report<W: Write>(
    out: &mut W,
    result: Result<CaptureSessionState, CaptureError>,
) -> io::Result<()> {
    match result {
        Ok(state) => writeln!(out, "capture: {state}"),
        Err(e) => writeln!(out, "capture failed: {e}"),
    }
}

fn write_status<W: Write>(out: &mut W, status: &SessionStatus) -> io::Result<()> {
    let device = status.device_id.as_deref().unwrap_or("-");
    write!(out, "[{device}] {}: {}", status.state, status.message)?;
    if status.recoverable {
        write!(out, " (retry with 'reopen')")?;
    }
    writeln!(out)
}

fn write_snapshot<W: Write>(out: &mut W, s: &DiagnosticSnapshot) -> io::Result<()> {
    let fps = s.fps.map_or_else(|| "-".to_string(), |f| f.to_string());
    writeln!(
        out,
        "fps {} (avg {:.1}) | frames {} | dropped {} ({:.1}%) | stalls {} | failures {}",
        fps,
        s.average_fps,
        s.frame_count,
        s.drop_count,
        s.drop_rate * 100.0,
        s.stall_count,
        s.processing_failures
    )?;
    writeln!(
        out,
        "processing {:.2} ms (mean {:.2}) | streamed {} bytes at {} B/s to {} viewer(s)",
        s.last_processing_ms, s.mean_processing_ms, s.bytes_streamed, s.bandwidth_bps, s.viewers
    )
}
