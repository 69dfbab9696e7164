//! The primitive operations a script runtime exposes, independent of
//! whatever drives them (spec.md keeps the actual interpreter/VM
//! explicitly out of scope; `bin/comterm-script.rs` supplies a minimal
//! one).
//!
//! Grounded on `original_source/src/scriptlua.c`'s `minicomlib`
//! table: `getenv`, `expect`, `send`, `flush`, `print`, `timeout`,
//! `verbose`, `pipedshell`. `readline` has no direct counterpart there
//! (Lua scripts read via `expect`); it's supplemented from the
//! interactive line-editing a full terminal program needs, in the
//! style of the teacher's own stdin handling in `cargo-rtic-scope`.
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::matcher::PatternMatcher;
use crate::diag::DiagnosableError;
use crate::timeout::Deadline;

const PIPEDSHELL_CHUNK_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("expect() timed out waiting for a pattern")]
    ExpectTimedOut,
    #[error("global script timeout elapsed")]
    GlobalTimeout,
    #[error("I/O error talking to the endpoint: {0}")]
    Io(#[from] io::Error),
    #[error("pipedshell command failed to start: {0}")]
    PipedShellFailed(#[source] io::Error),
}

impl DiagnosableError for ScriptError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            ScriptError::ExpectTimedOut => vec![
                "Raise the expect timeout with timeout(\"etime\", seconds) if the \
                 remote end is just slow."
                    .to_string(),
            ],
            _ => vec![],
        }
    }
}

/// Login/password captured out of the process environment at
/// startup and scrubbed from it, per `init_env`'s "someone using ps
/// might see them" concern. `getenv("LOGIN"|"PASS")` reads these
/// instead of falling through to the environment.
pub struct Credentials {
    pub login: Option<String>,
    pub pass: Option<String>,
}

impl Credentials {
    /// Captures `LOGIN`/`PASS` from the live environment and removes
    /// them, so a `ps -e` on this process no longer shows them.
    pub fn capture() -> Self {
        let login = std::env::var("LOGIN").ok();
        let pass = std::env::var("PASS").ok();
        if login.is_some() {
            std::env::set_var("LOGIN", "");
        }
        if pass.is_some() {
            std::env::set_var("PASS", "");
        }
        Credentials { login, pass }
    }
}

pub struct ScriptEnv<M: PatternMatcher, R: Read, W: Write> {
    matcher: M,
    endpoint_in: R,
    endpoint_out: W,
    credentials: Credentials,
    global_deadline: Deadline,
    expect_timeout: Duration,
    verbose: bool,
    pub last_shell_status: i32,
}

impl<M: PatternMatcher, R: Read, W: Write> ScriptEnv<M, R, W> {
    pub fn new(matcher: M, endpoint_in: R, endpoint_out: W) -> Self {
        ScriptEnv {
            matcher,
            endpoint_in,
            endpoint_out,
            credentials: Credentials::capture(),
            global_deadline: Deadline::after(crate::timeout::DEFAULT_GLOBAL_TIMEOUT),
            expect_timeout: crate::timeout::DEFAULT_EXPECT_TIMEOUT,
            verbose: true,
            last_shell_status: 0,
        }
    }

    /// Whether the global script timeout (`timeout("gtime", …)`,
    /// `DFL_GTIMEOUT` by default) has elapsed. `expect`/`readline`
    /// check this on every iteration of their read loops; the driver
    /// also polls it once a second via `timeout::Ticker` so a script
    /// that never blocks on the endpoint still gets cut off.
    pub fn global_timeout_expired(&self) -> bool {
        self.global_deadline.expired()
    }

    /// `getenv(name)`: `LOGIN`/`PASS` resolve to the captured
    /// credentials rather than the (now-scrubbed) environment.
    pub fn getenv(&self, name: &str) -> Option<String> {
        match name {
            "LOGIN" => self.credentials.login.clone(),
            "PASS" => self.credentials.pass.clone(),
            other => std::env::var(other).ok(),
        }
    }

    /// `timeout("gtime"|"etime", seconds)`.
    pub fn set_timeout(&mut self, which: &str, seconds: u64) -> bool {
        match which {
            "gtime" => {
                self.global_deadline = Deadline::after(Duration::from_secs(seconds));
                true
            }
            "etime" => {
                self.expect_timeout = Duration::from_secs(seconds);
                true
            }
            _ => false,
        }
    }

    /// `verbose("on"|"off")`. Matches the original's `mc_verbose`
    /// exactly, including its asymmetry: "off" actually disables echo,
    /// but "on" only validates the argument and returns success
    /// without re-enabling it. A script that turns verbose off can't
    /// turn it back on.
    pub fn set_verbose(&mut self, which: &str) -> bool {
        match which {
            "on" => true,
            "off" => {
                self.verbose = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// `flush()`: drop anything buffered from the endpoint so the next
    /// `expect()` only sees fresh data.
    pub fn flush(&mut self) {
        self.matcher.clear();
    }

    /// `send(text)`: writes to the endpoint, translating `\n` to
    /// `\r\n` the way the original's `newline = "\n"` selection for
    /// `mc_send` does for a modem peer expecting CRLF.
    pub fn send(&mut self, text: &str) -> Result<(), ScriptError> {
        self.write_translated(text, "\r\n")
    }

    /// `print(text)`: writes to the operator's screen instead of the
    /// endpoint (stderr in the original).
    pub fn print(&self, text: &str) {
        let mut out = String::new();
        for c in text.chars() {
            if c == '\n' {
                out.push_str("\r\n");
            } else {
                out.push(c);
            }
        }
        eprint!("{out}");
    }

    fn write_translated(&mut self, text: &str, newline: &str) -> Result<(), ScriptError> {
        let mut out = String::new();
        for c in text.chars() {
            if c == '\n' {
                out.push_str(newline);
            } else {
                out.push(c);
            }
        }
        self.endpoint_out.write_all(out.as_bytes())?;
        self.endpoint_out.flush()?;
        Ok(())
    }

    /// `expect(pattern1, ..., pattern16)`: reads one byte at a time
    /// from the endpoint until one of the patterns matches or
    /// `expect_timeout` elapses. Returns the 1-based index of the
    /// matched pattern (mirroring the Lua return convention).
    pub fn expect(&mut self, patterns: &[&str]) -> Result<usize, ScriptError> {
        let deadline = Deadline::after(self.expect_timeout);
        let needles: Vec<&[u8]> = patterns.iter().map(|p| p.as_bytes()).collect();

        loop {
            if self.global_deadline.expired() {
                return Err(ScriptError::GlobalTimeout);
            }
            if deadline.expired() {
                return Err(ScriptError::ExpectTimedOut);
            }
            let mut byte = [0u8; 1];
            match self.endpoint_in.read(&mut byte) {
                Ok(0) => {
                    return Err(ScriptError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "endpoint closed",
                    )))
                }
                Ok(_) => {
                    if self.verbose {
                        eprint!("{}", byte[0] as char);
                    }
                    self.matcher.push(byte[0]);
                    if let Some(idx) = self.matcher.find(&needles) {
                        return Ok(idx + 1);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1))
                }
                Err(e) => return Err(ScriptError::Io(e)),
            }
        }
    }

    /// `pipedshell(cmd)`: runs `cmd` via a shell, piping its stdout to
    /// the endpoint in chunks, pacing each chunk by 20ms the way the
    /// original's `usleep(20000)` does to avoid overrunning a slow
    /// modem link. Returns the child's exit status.
    pub fn pipedshell(&mut self, cmd: &str) -> Result<i32, ScriptError> {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(ScriptError::PipedShellFailed)?;

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut chunk = [0u8; 4096];
        let mut last_chunk = Instant::now() - PIPEDSHELL_CHUNK_DELAY;
        loop {
            if self.global_deadline.expired() {
                return Err(ScriptError::GlobalTimeout);
            }
            let n = stdout.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            let elapsed = last_chunk.elapsed();
            if elapsed < PIPEDSHELL_CHUNK_DELAY {
                std::thread::sleep(PIPEDSHELL_CHUNK_DELAY - elapsed);
            }
            self.endpoint_out.write_all(&chunk[..n])?;
            self.endpoint_out.flush()?;
            last_chunk = Instant::now();
        }

        let status = child.wait()?;
        let code = status.code().unwrap_or(-1);
        self.last_shell_status = code;
        self.flush();
        Ok(code)
    }

    /// `readline()`: reads a CR/LF-terminated line from the endpoint,
    /// echoing it when verbose, for scripts that need a whole response
    /// line rather than a pattern match.
    pub fn readline(&mut self) -> Result<String, ScriptError> {
        let mut line = Vec::new();
        loop {
            if self.global_deadline.expired() {
                return Err(ScriptError::GlobalTimeout);
            }
            let mut byte = [0u8; 1];
            match self.endpoint_in.read(&mut byte) {
                Ok(0) => {
                    return Err(ScriptError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "endpoint closed",
                    )))
                }
                Ok(_) => {
                    if self.verbose {
                        eprint!("{}", byte[0] as char);
                    }
                    if byte[0] == b'\n' {
                        break;
                    }
                    if byte[0] != b'\r' {
                        line.push(byte[0]);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1))
                }
                Err(e) => return Err(ScriptError::Io(e)),
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::script::matcher::RingMatcher;
    use std::io::Cursor;

    fn env(input: &'static [u8]) -> ScriptEnv<RingMatcher, Cursor<&'static [u8]>, Vec<u8>> {
        ScriptEnv::new(RingMatcher::new(64), Cursor::new(input), Vec::new())
    }

    #[test]
    fn expect_matches_and_reports_index() {
        let mut e = env(b"welcome\r\nlogin: ");
        let idx = e.expect(&["login:", "password:"]).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn expect_times_out_on_exhausted_input() {
        let mut e = env(b"nothing useful here");
        e.set_timeout("etime", 0);
        let result = e.expect(&["never-appears"]);
        assert!(matches!(result, Err(ScriptError::ExpectTimedOut)));
    }

    #[test]
    fn send_translates_newline_to_crlf() {
        let mut e = env(b"");
        e.send("AT\nOK").unwrap();
        assert_eq!(e.endpoint_out.as_slice(), &b"AT\r\nOK"[..]);
    }

    #[test]
    fn verbose_off_then_on_stays_off() {
        let mut e = env(b"");
        assert!(e.is_verbose());
        e.set_verbose("off");
        assert!(!e.is_verbose());
        e.set_verbose("on");
        assert!(!e.is_verbose(), "verbose(\"on\") does not re-enable echo");
    }

    #[test]
    fn getenv_prefers_captured_credentials_and_scrubs_environment() {
        std::env::set_var("LOGIN", "should-not-leak");
        let e = env(b"");
        assert_eq!(e.getenv("LOGIN").as_deref(), Some("should-not-leak"));
        assert_eq!(std::env::var("LOGIN").unwrap(), "");
        std::env::remove_var("LOGIN");
    }
}
