//! `comterm`: the interactive full-screen terminal session binary.
//!
//! CLI shape and the top-level error-rendering dance are grounded on
//! the teacher's `cargo-rtic-scope/src/main.rs` (`Opts`/`StructOpt`,
//! a `#[derive(Error)]` top-level enum implementing `DiagnosableError`,
//! `fn main` delegating to a `Result`-returning `main_try` and calling
//! `.render()` on failure).
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::terminal;
use structopt::StructOpt;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use comterm::config::{Config, ConfigError};
use comterm::diag::DiagnosableError;
use comterm::endpoint::{Endpoint, OpenError};
use comterm::session::{Emulator, KeyInput, Keyboard, Screen, Session};
use comterm::status::CursorMode;
use comterm::{log, VERSION};

#[derive(Debug, StructOpt)]
#[structopt(name = "comterm", about = "Full-screen serial-line terminal session")]
struct Opts {
    /// Device path, unix:PATH, or tcp:HOST:PORT to connect to.
    device: String,

    /// Path to a config file, instead of the default ~/.comtermrc.
    #[structopt(long = "config", parse(from_os_str))]
    config: Option<PathBuf>,

    /// Skip lockfile acquisition and the callout program (useful when
    /// reattaching to an endpoint another instance still has open).
    #[structopt(long = "no-init")]
    no_init: bool,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DiagnosableError for CliError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            CliError::Config(e) => e.diagnose(),
            CliError::Open(e) => e.diagnose(),
            CliError::Other(_) => vec![],
        }
    }
}

impl CliError {
    fn render(&self) {
        log::err(format!("{self}"));
        for hint in self.diagnose() {
            log::hint(hint);
        }
    }
}

fn main() {
    init_tracing();
    if let Err(e) = main_try() {
        e.render();
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main_try() -> Result<(), CliError> {
    let opts = Opts::from_args();
    let config = Config::load(opts.config.as_deref())?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let handler_flag = interrupted.clone();
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))
        .expect("failed to install SIGINT handler");

    log::status("Opening", opts.device.clone());
    let mut endpoint = Endpoint::new(&opts.device);
    endpoint.open(&config, !opts.no_init)?;

    log::status(
        "Connected",
        format!("{} ({}) at {}", opts.device, VERSION, Local::now().format("%H:%M:%S")),
    );

    let (rows, cols) = terminal::size().unwrap_or((80, 24));
    let keyboard = RawKeyboard::new().map_err(anyhow::Error::from)?;
    let escape_label = escape_label(config.escape);

    let mut session = Session::new(
        endpoint,
        config,
        Box::new(PassthroughEmulator::default()),
        Box::new(PassthroughScreen { cols, rows }),
        Box::new(keyboard),
        VERSION,
        escape_label,
        true,
    );

    let ticker = comterm::timeout::Ticker::start(Duration::from_secs(1));
    while !interrupted.load(Ordering::SeqCst) {
        if !session.poll_once(&ticker, None)? {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    Ok(())
}

/// The label shown by the `%H` status directive: `"C-A"` for the
/// default CTRL-A, matching `StatusLine`'s existing convention of no
/// space before the trailing `Z`.
fn escape_label(byte: u8) -> String {
    if byte < 0x20 {
        format!("C-{}", (byte + 0x40) as char)
    } else {
        (byte as char).to_string()
    }
}

/// VT102/ANSI interpretation itself is out of scope; this emulator
/// forwards every byte straight to the real terminal so the session
/// loop has something functional to drive, and reports a fixed cursor
/// mode since there is no escape-sequence state machine behind it.
#[derive(Default)]
struct PassthroughEmulator;

impl Emulator for PassthroughEmulator {
    fn feed(&mut self, byte: u8) {
        let mut stdout = io::stdout();
        let _ = stdout.write_all(&[byte]);
        let _ = stdout.flush();
    }

    fn cursor_mode(&self) -> CursorMode {
        CursorMode::Normal
    }

    fn name(&self) -> &'static str {
        "VT102"
    }
}

struct PassthroughScreen {
    cols: u16,
    rows: u16,
}

impl Screen for PassthroughScreen {
    fn resize(&mut self, rows: u16, cols: u16) {
        self.rows = rows;
        self.cols = cols;
    }

    fn width(&self) -> u16 {
        self.cols
    }
}

/// Raw-mode stdin keyboard source built on `crossterm`. Enables raw
/// mode for its lifetime and restores the terminal on drop.
struct RawKeyboard;

impl RawKeyboard {
    fn new() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(RawKeyboard)
    }
}

impl Drop for RawKeyboard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

impl Keyboard for RawKeyboard {
    fn poll_timeout(&mut self, timeout: Duration) -> Option<KeyInput> {
        match event::poll(timeout) {
            Ok(true) => match event::read() {
                Ok(Event::Key(key)) => key_event_to_input(key),
                _ => None,
            },
            _ => None,
        }
    }
}

fn key_event_to_input(key: event::KeyEvent) -> Option<KeyInput> {
    match key.code {
        KeyCode::F(n) if (1..=12).contains(&n) => Some(KeyInput::Function(n)),
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(KeyInput::Bytes(vec![(c.to_ascii_uppercase() as u8) & 0x1f]))
        }
        KeyCode::Char(c) => {
            let mut buf = [0u8; 4];
            Some(KeyInput::Bytes(c.encode_utf8(&mut buf).as_bytes().to_vec()))
        }
        KeyCode::Enter => Some(KeyInput::Bytes(vec![b'\r'])),
        KeyCode::Tab => Some(KeyInput::Bytes(vec![b'\t'])),
        KeyCode::Backspace => Some(KeyInput::Bytes(vec![0x7f])),
        KeyCode::Esc => Some(KeyInput::Bytes(vec![0x1b])),
        KeyCode::Up => Some(KeyInput::Bytes(b"\x1b[A".to_vec())),
        KeyCode::Down => Some(KeyInput::Bytes(b"\x1b[B".to_vec())),
        KeyCode::Right => Some(KeyInput::Bytes(b"\x1b[C".to_vec())),
        KeyCode::Left => Some(KeyInput::Bytes(b"\x1b[D".to_vec())),
        _ => None,
    }
}
