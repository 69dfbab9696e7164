//! The terminal event loop: pumps bytes between the endpoint and the
//! screen, keyboard input back to the endpoint, and drives the status
//! line and online tracker off a one-second ticker.
//!
//! Grounded on `original_source/src/main.c::do_terminal` for the loop
//! shape (resize check, timer update, device-health check, I/O
//! multiplex, auto-Zmodem signature scan). Where the original relied
//! on a blocking `select(2)` over the tty fd, `Session::poll_once`
//! drives one non-blocking pass per call and `Session::run` spins that
//! against the one-second `Ticker`, the same cooperative-polling shape
//! the teacher's `cargo-rtic-scope/src/main.rs::run_loop` uses for its
//! own packet pump.
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{Config, Parity};
use crate::endpoint::Endpoint;
use crate::online::OnlineTracker;
use crate::status::{CursorMode, StatusContext, StatusLine};
use crate::timeout::Ticker;

/// The VT emulator that interprets endpoint bytes into screen updates.
/// Its internals are out of scope here; the session loop only needs
/// to feed it bytes and ask what cursor mode it's in.
pub trait Emulator: Send {
    fn feed(&mut self, byte: u8);
    fn cursor_mode(&self) -> CursorMode;
    fn name(&self) -> &'static str;
}

/// The screen surface bytes get rendered onto. Resize is the only
/// thing the session loop drives directly; everything else flows
/// through `Emulator::feed`.
pub trait Screen: Send {
    fn resize(&mut self, rows: u16, cols: u16);
    fn width(&self) -> u16;
}

/// One reported unit of keyboard input. `Bytes` carries already
/// line-discipline-translated raw bytes; `Function` reports a 1-indexed
/// F1..F12 press so the session loop can apply macro substitution
/// (spec.md §4.4 step 6) before anything reaches the endpoint; `Closed`
/// signals the keyboard source itself has gone away (e.g. stdin EOF),
/// telling `Session::run` to stop.
pub enum KeyInput {
    Bytes(Vec<u8>),
    Function(u8),
    Closed,
}

/// Raw keystrokes from the controlling terminal, already translated
/// out of whatever local line discipline applies. `None` means nothing
/// arrived within `timeout`.
pub trait Keyboard: Send {
    fn poll_timeout(&mut self, timeout: Duration) -> Option<KeyInput>;
}

/// Detects the `**\x18B00` Zmodem autostart signature inline with the
/// byte stream, matching `do_terminal`'s `zsig` scan.
struct ZmodemDetector {
    pos: usize,
    enabled: bool,
}

impl ZmodemDetector {
    const SIGNATURE: &'static [u8] = b"**\x18B00";

    fn new(enabled: bool) -> Self {
        ZmodemDetector { pos: 0, enabled }
    }

    /// Feeds one byte, returns true exactly once the full signature
    /// has just completed.
    fn feed(&mut self, byte: u8) -> bool {
        if !self.enabled {
            return false;
        }
        if Self::SIGNATURE[self.pos] == byte {
            self.pos += 1;
        } else {
            self.pos = 0;
        }
        if self.pos == Self::SIGNATURE.len() {
            self.pos = 0;
            true
        } else {
            false
        }
    }
}

pub struct Session {
    endpoint: Endpoint,
    config: Config,
    online: OnlineTracker,
    status: StatusLine,
    emulator: Box<dyn Emulator>,
    screen: Box<dyn Screen>,
    keyboard: Box<dyn Keyboard>,
    zmodem: ZmodemDetector,
    version: String,
    device_path: String,
    escape_key_label: String,
    script_running: Option<String>,
    /// Set once the command-prefix key has been seen; the next byte
    /// is consumed as the command letter instead of being forwarded.
    awaiting_command: bool,
    /// Incomplete multibyte tail held back across `handle_endpoint_bytes`
    /// calls by the charset translation pass (spec.md §4.4 step 5).
    translate_pending: Vec<u8>,
}

impl Session {
    pub fn new(
        endpoint: Endpoint,
        config: Config,
        emulator: Box<dyn Emulator>,
        screen: Box<dyn Screen>,
        keyboard: Box<dyn Keyboard>,
        version: impl Into<String>,
        escape_key_label: impl Into<String>,
        auto_zmodem: bool,
    ) -> Self {
        let device_path = endpoint.descriptor().to_string();
        let width = screen.width() as usize;
        let online = OnlineTracker::new(config.has_dcd, config.dcd_drives_flow, config.log_connections);
        let status = StatusLine::new(config.statusline_format.clone(), width.max(1));
        Session {
            endpoint,
            config,
            online,
            status,
            emulator,
            screen,
            keyboard,
            zmodem: ZmodemDetector::new(auto_zmodem),
            version: version.into(),
            device_path,
            escape_key_label: escape_key_label.into(),
            script_running: None,
            awaiting_command: false,
            translate_pending: Vec::new(),
        }
    }

    pub fn set_script_running(&mut self, name: Option<String>) {
        self.script_running = name;
    }

    /// The "Comterm VERSION" / "script NAME" indicator drawn beside
    /// the status line.
    pub fn script_label(&self) -> String {
        crate::status::script_label(self.script_running.as_deref(), &self.version)
    }

    /// Drives the loop for exactly one pass: reads whatever the
    /// endpoint has pending, sends along any pending keyboard input,
    /// applies a resize if one is pending, and ticks the online/status
    /// timers once the ticker fires. Split out from a `loop { }` driver
    /// so callers (and tests) can step it directly instead of running
    /// it forever.
    pub fn poll_once(&mut self, ticker: &Ticker, pending_resize: Option<(u16, u16)>) -> Result<bool, crate::endpoint::OpenError> {
        if let Some((rows, cols)) = pending_resize {
            self.screen.resize(rows, cols);
            self.status = StatusLine::new(self.config.statusline_format.clone(), cols as usize);
        }

        match self.read_endpoint() {
            ReadOutcome::Data(bytes) => self.handle_endpoint_bytes(bytes),
            ReadOutcome::WouldBlock => {}
            ReadOutcome::Gone => {
                if !self.reconnect()? {
                    return Ok(false);
                }
            }
        }

        match self.keyboard.poll_timeout(Duration::from_millis(0)) {
            None => {}
            Some(KeyInput::Closed) => return Ok(false),
            Some(KeyInput::Function(n)) => {
                if !self.handle_function_key(n) {
                    return Ok(false);
                }
            }
            Some(KeyInput::Bytes(bytes)) => {
                if !self.handle_keyboard_bytes(&bytes) {
                    return Ok(false);
                }
            }
        }

        if ticker.receiver().try_recv().is_ok() {
            self.tick();
        }

        Ok(true)
    }

    /// Runs `poll_once` until it reports the session should end (the
    /// keyboard source signalled EOF, or a non-device endpoint is gone
    /// for good).
    pub fn run(&mut self) -> Result<(), crate::endpoint::OpenError> {
        let ticker = Ticker::start(Duration::from_secs(1));
        while self.poll_once(&ticker, None)? {
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    fn read_endpoint(&mut self) -> ReadOutcome {
        let Some(transport) = self.endpoint.transport_mut() else {
            return ReadOutcome::Gone;
        };
        let reader: &mut dyn Read = match transport {
            crate::endpoint::Transport::Device(f) => f,
            crate::endpoint::Transport::Unix(s) => s,
            crate::endpoint::Transport::Tcp(s) => s,
        };
        let mut buf = [0u8; 256];
        match reader.read(&mut buf) {
            Ok(0) => ReadOutcome::Gone,
            Ok(n) => ReadOutcome::Data(buf[..n].to_vec()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
            Err(_) => ReadOutcome::Gone,
        }
    }

    fn handle_endpoint_bytes(&mut self, bytes: Vec<u8>) {
        let bytes = if self.config.translate_charset {
            self.translate_charset(bytes)
        } else {
            bytes
        };

        for byte in bytes {
            let byte = match self.config.parity {
                Parity::Mark | Parity::Space => byte & 0x7f,
                _ => byte,
            };

            if self.zmodem.feed(byte) {
                info!("Zmodem autostart signature detected");
            }

            if self.config.display_hex {
                for hex_digit in format!("{byte:02x} ").bytes() {
                    self.emulator.feed(hex_digit);
                }
            } else {
                self.emulator.feed(byte);
            }
        }
    }

    /// Validates `bytes` (appended to any tail held back from the last
    /// call) as UTF-8, feeding through everything up to the last
    /// complete character and holding back an incomplete trailing
    /// multibyte sequence for the next call, per spec.md §4.4 step 5.
    /// A genuinely invalid byte (not just an incomplete tail) is passed
    /// through unmodified rather than dropped.
    fn translate_charset(&mut self, bytes: Vec<u8>) -> Vec<u8> {
        let pending = std::mem::take(&mut self.translate_pending);
        let (ready, tail) = split_utf8_tail(pending, &bytes);
        self.translate_pending = tail;
        ready
    }

    /// Applies the command-prefix/escape-key convention (spec.md §3,
    /// §4.4 step 6). Returns `false` if the caller should stop the
    /// session loop (a quit command was dispatched).
    fn handle_keyboard_bytes(&mut self, bytes: &[u8]) -> bool {
        for &byte in bytes {
            if self.awaiting_command {
                self.awaiting_command = false;
                if byte == self.config.escape {
                    self.write_to_endpoint(&[byte]);
                } else if byte.is_ascii_alphabetic() && !self.dispatch_command(byte) {
                    return false;
                }
                continue;
            }

            let is_alt_command = self.config.alt_override && (225..=251).contains(&byte);
            if is_alt_command {
                let command = (byte - 225) + b'A';
                if !self.dispatch_command(command) {
                    return false;
                }
                continue;
            }

            if byte == self.config.escape {
                self.awaiting_command = true;
                self.status.show_temporary(format!("{} ", self.script_label()), None);
                continue;
            }

            self.write_to_endpoint(&[byte]);
        }
        true
    }

    /// Substitutes the configured macro for F1..F12, falling through to
    /// the key's own escape sequence when the macro is empty, per
    /// spec.md §4.4 step 6. Returns `false` to stop the session loop.
    fn handle_function_key(&mut self, n: u8) -> bool {
        let idx = n.saturating_sub(1) as usize;
        let macro_str = self.config.macros.get(idx).map(String::as_str).unwrap_or("");
        if macro_str.is_empty() {
            self.write_to_endpoint(function_key_escape(n).as_bytes());
        } else {
            self.write_to_endpoint(macro_str.as_bytes());
        }
        true
    }

    /// The real menu system (`mc_wopen` et al.) is out of scope; only
    /// the two letters needed to actually leave the session are wired
    /// up here. Returns `false` to ask the loop to stop.
    fn dispatch_command(&mut self, command: u8) -> bool {
        match (command as char).to_ascii_uppercase() {
            'X' | 'Q' => false,
            other => {
                info!(command = %other, "unhandled command key");
                true
            }
        }
    }

    /// `do_output`: applies Mark-parity high-bit setting and, when an
    /// inter-character delay is configured, paces the write one byte
    /// at a time. `write_all` already re-enters on a short write, so
    /// no explicit retry loop is needed for that part.
    fn write_to_endpoint(&mut self, bytes: &[u8]) {
        let Some(transport) = self.endpoint.transport_mut() else {
            return;
        };
        let mut writer: &mut dyn Write = match transport {
            crate::endpoint::Transport::Device(f) => f,
            crate::endpoint::Transport::Unix(s) => s,
            crate::endpoint::Transport::Tcp(s) => s,
        };

        let masked: Vec<u8> = if self.config.parity == Parity::Mark {
            bytes.iter().map(|b| b | 0x80).collect()
        } else {
            bytes.to_vec()
        };

        if self.config.char_delay_ms > 0 {
            let delay = Duration::from_millis(self.config.char_delay_ms);
            for &byte in &masked {
                let _ = writer.write_all(&[byte]);
                std::thread::sleep(delay);
            }
        } else {
            let _ = writer.write_all(&masked);
        }
        let _ = writer.flush();
    }

    fn tick(&mut self) {
        let dcd_high = self.endpoint.device_alive() && self.config.has_dcd;
        self.online.tick(dcd_high);

        if !self.endpoint.device_alive() {
            warn!(device = %self.device_path, "endpoint is gone, attempting reconnect");
        }

        let ctx = StatusContext {
            escape_key_label: &self.escape_key_label,
            version: &self.version,
            terminal_name: self.emulator.name(),
            cursor_mode: self.emulator.cursor_mode(),
            baud_label: baud_label(&self.config),
            has_dcd: self.config.has_dcd,
            online_elapsed: if self.online.is_online() {
                Some(self.online.elapsed())
            } else {
                None
            },
            device_path: &self.device_path,
        };
        if self.status.render(&ctx, false).is_some() {
            // caller-supplied screen is responsible for actually
            // painting the status bar; the session only decides *that*
            // it changed, matching `show_status_fmt`'s own
            // change-detection gate.
        }
    }

    /// Attempts to reopen a device endpoint that was unplugged mid
    /// session, matching `do_terminal`'s "someone unplugged the
    /// USB-serial" recovery path. Returns `false` if the caller should
    /// give up (non-device endpoints never come back on their own).
    fn reconnect(&mut self) -> Result<bool, crate::endpoint::OpenError> {
        if !matches!(self.endpoint.kind(), crate::endpoint::EndpointKind::Device(_)) {
            return Ok(false);
        }
        self.endpoint.close();
        match self.endpoint.open(&self.config, false) {
            Ok(()) => {
                info!(device = %self.device_path, "endpoint reconnected");
                Ok(true)
            }
            Err(e) => {
                warn!(device = %self.device_path, error = %e, "reconnect attempt failed");
                Ok(true)
            }
        }
    }
}

enum ReadOutcome {
    Data(Vec<u8>),
    WouldBlock,
    Gone,
}

/// Appends `bytes` to `pending` and splits at the last complete UTF-8
/// boundary, returning `(ready-to-feed, held-back-tail)`. A genuinely
/// invalid byte (not just an incomplete sequence at the end) is kept
/// in the ready half rather than dropped.
fn split_utf8_tail(pending: Vec<u8>, bytes: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut buf = pending;
    buf.extend_from_slice(bytes);
    match std::str::from_utf8(&buf) {
        Ok(_) => (buf, Vec::new()),
        Err(e) if e.error_len().is_none() => {
            let tail = buf.split_off(e.valid_up_to());
            (buf, tail)
        }
        Err(_) => (buf, Vec::new()),
    }
}

/// The VT220/xterm escape sequence a bare F-key sends when no macro is
/// configured for it.
fn function_key_escape(n: u8) -> &'static str {
    match n {
        1 => "\x1bOP",
        2 => "\x1bOQ",
        3 => "\x1bOR",
        4 => "\x1bOS",
        5 => "\x1b[15~",
        6 => "\x1b[17~",
        7 => "\x1b[18~",
        8 => "\x1b[19~",
        9 => "\x1b[20~",
        10 => "\x1b[21~",
        11 => "\x1b[23~",
        12 => "\x1b[24~",
        _ => "",
    }
}

fn baud_label(config: &Config) -> &'static str {
    match config.parity {
        Parity::None => "8N1",
        Parity::Even => "8E1",
        Parity::Odd => "8O1",
        Parity::Mark => "7M1",
        Parity::Space => "7S1",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct NullEmulator {
        cursor: CursorMode,
        fed: Vec<u8>,
    }

    impl Emulator for NullEmulator {
        fn feed(&mut self, byte: u8) {
            self.fed.push(byte);
        }
        fn cursor_mode(&self) -> CursorMode {
            self.cursor
        }
        fn name(&self) -> &'static str {
            "VT102"
        }
    }

    #[test]
    fn zmodem_detector_fires_once_per_signature() {
        let mut z = ZmodemDetector::new(true);
        let mut fired = 0;
        for byte in ZmodemDetector::SIGNATURE {
            if z.feed(*byte) {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn zmodem_detector_disabled_never_fires() {
        let mut z = ZmodemDetector::new(false);
        for byte in ZmodemDetector::SIGNATURE {
            assert!(!z.feed(*byte));
        }
    }

    #[test]
    fn zmodem_detector_resets_on_mismatch() {
        let mut z = ZmodemDetector::new(true);
        assert!(!z.feed(b'*'));
        assert!(!z.feed(b'x'));
        assert!(!z.feed(0x18));
        for byte in ZmodemDetector::SIGNATURE {
            z.feed(*byte);
        }
    }

    #[test]
    fn null_emulator_receives_hex_translated_bytes() {
        let mut emu = NullEmulator {
            cursor: CursorMode::Normal,
            fed: Vec::new(),
        };
        for hex_digit in format!("{:02x} ", 0x41u8).bytes() {
            emu.feed(hex_digit);
        }
        assert_eq!(emu.fed, b"41 ");
    }

    #[test]
    fn split_utf8_tail_holds_back_incomplete_sequence() {
        let euro = "€".as_bytes(); // 3-byte sequence
        let (ready, tail) = split_utf8_tail(Vec::new(), &euro[..2]);
        assert!(ready.is_empty());
        assert_eq!(tail, &euro[..2]);

        let (ready, tail) = split_utf8_tail(tail, &euro[2..]);
        assert_eq!(ready, euro);
        assert!(tail.is_empty());
    }

    #[test]
    fn split_utf8_tail_passes_through_ascii_whole() {
        let (ready, tail) = split_utf8_tail(Vec::new(), b"hello");
        assert_eq!(ready, b"hello");
        assert!(tail.is_empty());
    }

    #[test]
    fn split_utf8_tail_does_not_drop_genuinely_invalid_bytes() {
        let (ready, tail) = split_utf8_tail(Vec::new(), &[0xff, b'a']);
        assert_eq!(ready, vec![0xff, b'a']);
        assert!(tail.is_empty());
    }

    #[test]
    fn function_key_escape_known_and_unknown() {
        assert_eq!(function_key_escape(1), "\x1bOP");
        assert_eq!(function_key_escape(12), "\x1b[24~");
        assert_eq!(function_key_escape(200), "");
    }
}
