//! The status line: a small format-string language rendered into a
//! fixed-width bar, redrawn only when its content actually changes.
//!
//! Grounded on `original_source/src/main.c`'s `show_status_fmt` for the
//! directive table and the "redraw only if `buf` differs from
//! `current_status_line`" idempotency rule, and on `status_set_display`
//! for the transient-message overlay (`%$`, default 2s).
use std::time::{Duration, Instant};

use crate::config::DEFAULT_STATUSLINE_FORMAT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMode {
    Normal,
    Application,
}

impl CursorMode {
    fn label(self) -> &'static str {
        match self {
            CursorMode::Normal => "NOR",
            CursorMode::Application => "APP",
        }
    }
}

/// Everything the format directives need to know to render one frame.
/// Callers (the session loop) fill this in fresh each tick from live
/// state; `StatusLine` itself holds only the format and the
/// change-detection cache.
pub struct StatusContext<'a> {
    pub escape_key_label: &'a str,
    pub version: &'a str,
    pub terminal_name: &'a str,
    pub cursor_mode: CursorMode,
    pub baud_label: &'a str,
    pub has_dcd: bool,
    pub online_elapsed: Option<Duration>,
    pub device_path: &'a str,
}

pub struct StatusLine {
    format: String,
    width: usize,
    current: Option<String>,
    transient: Option<Transient>,
}

struct Transient {
    text: String,
    until: Instant,
}

impl StatusLine {
    pub fn new(format: impl Into<String>, width: usize) -> Self {
        StatusLine {
            format: format.into(),
            width,
            current: None,
            transient: None,
        }
    }

    pub fn with_default_format(width: usize) -> Self {
        StatusLine::new(DEFAULT_STATUSLINE_FORMAT, width)
    }

    /// Overlays `text` in place of `%$` for `duration` (2s if `None`,
    /// matching `status_set_display`'s `duration_s == 0` fallback).
    pub fn show_temporary(&mut self, text: impl Into<String>, duration: Option<Duration>) {
        self.transient = Some(Transient {
            text: text.into(),
            until: Instant::now() + duration.unwrap_or(Duration::from_secs(2)),
        });
    }

    fn transient_message(&mut self) -> &str {
        match &self.transient {
            Some(t) if Instant::now() < t.until => self.transient.as_ref().unwrap().text.as_str(),
            Some(_) => {
                self.transient = None;
                ""
            }
            None => "",
        }
    }

    /// Renders the current frame. Returns `Some(line)` only when it
    /// differs from the last rendered frame (or the width changed),
    /// so callers can skip the redraw otherwise.
    pub fn render(&mut self, ctx: &StatusContext, width_changed: bool) -> Option<String> {
        let line = self.format_line(ctx);
        if width_changed || self.current.as_deref() != Some(line.as_str()) {
            self.current = Some(line.clone());
            Some(line)
        } else {
            None
        }
    }

    fn format_line(&mut self, ctx: &StatusContext) -> String {
        let width = self.width;
        let transient = self.transient_message().to_string();
        let mut out = String::with_capacity(width);

        let mut chars = self.format.chars().peekable();
        while let Some(c) = chars.next() {
            if out.len() >= width {
                break;
            }
            if c != '%' {
                out.push(c);
                continue;
            }
            let Some(&func) = chars.peek() else {
                out.push(c);
                break;
            };
            chars.next();
            match func {
                '%' => out.push('%'),
                'H' => {
                    out.push_str(ctx.escape_key_label);
                    out.push('Z');
                }
                'V' => out.push_str(ctx.version),
                'b' => out.push_str(ctx.baud_label),
                'T' => out.push_str(ctx.terminal_name),
                'C' => out.push_str(ctx.cursor_mode.label()),
                't' => out.push_str(&online_label(ctx)),
                'D' => out.push_str(&crate::endpoint::shortened_devpath(ctx.device_path, width)),
                '$' => out.push_str(&transient),
                other => {
                    out.push('?');
                    out.push(other);
                }
            }
        }

        if out.chars().count() < width {
            let pad = width - out.chars().count();
            out.push_str(&" ".repeat(pad));
        }
        out.chars().take(width).collect()
    }
}

fn online_label(ctx: &StatusContext) -> String {
    match ctx.online_elapsed {
        None => {
            if ctx.has_dcd {
                "Offline".to_string()
            } else {
                "OFFLINE".to_string()
            }
        }
        Some(elapsed) => {
            let secs = elapsed.as_secs();
            let word = if ctx.has_dcd { "Online" } else { "ONLINE" };
            format!("{word} {}:{}", secs / 3600, (secs / 60) % 60)
        }
    }
}

/// The small "Comterm VERSION" / "script NAME" indicator drawn beside
/// the status line, independent of the format string, matching
/// `scriptname`'s fixed-column overlay.
pub fn script_label(running: Option<&str>, version: &str) -> String {
    match running {
        None => format!("Comterm {:<6.6}", version),
        Some(name) => format!("script {:<7.7}", name),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_ctx() -> StatusContext<'static> {
        StatusContext {
            escape_key_label: "C-A",
            version: "1.0",
            terminal_name: "VT102",
            cursor_mode: CursorMode::Normal,
            baud_label: "115200 8N1",
            has_dcd: false,
            online_elapsed: None,
            device_path: "/dev/ttyUSB0",
        }
    }

    #[test]
    fn renders_directives() {
        let mut line = StatusLine::new("%H for help | %b | %T | %C", 40);
        let ctx = base_ctx();
        let out = line.render(&ctx, false).unwrap();
        assert!(out.starts_with("C-AZ for help | 115200 8N1 | VT102 | NOR"));
    }

    #[test]
    fn unknown_directive_is_question_marked() {
        let mut line = StatusLine::new("%Q", 10);
        let out = line.render(&base_ctx(), false).unwrap();
        assert!(out.starts_with("?Q"));
    }

    #[test]
    fn does_not_rerender_identical_frame() {
        let mut line = StatusLine::new("%T", 10);
        let ctx = base_ctx();
        assert!(line.render(&ctx, false).is_some());
        assert!(line.render(&ctx, false).is_none());
    }

    #[test]
    fn width_change_forces_rerender() {
        let mut line = StatusLine::new("%T", 10);
        let ctx = base_ctx();
        line.render(&ctx, false);
        assert!(line.render(&ctx, true).is_some());
    }

    #[test]
    fn online_label_uses_lowercase_when_has_dcd() {
        let mut ctx = base_ctx();
        ctx.has_dcd = true;
        ctx.online_elapsed = Some(Duration::from_secs(3725));
        assert_eq!(online_label(&ctx), "Online 1:2");
    }

    #[test]
    fn offline_label_is_uppercase_without_dcd() {
        assert_eq!(online_label(&base_ctx()), "OFFLINE");
    }

    #[test]
    fn script_label_switches_between_idle_and_running() {
        assert_eq!(script_label(None, "2.8"), format!("Comterm {:<6.6}", "2.8"));
        assert_eq!(script_label(Some("dial-isp"), "2.8"), "script dial-is");
    }

    #[test]
    fn transient_message_expires() {
        let mut line = StatusLine::new("%$", 20);
        line.show_temporary("connecting", Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        let out = line.render(&base_ctx(), true).unwrap();
        assert!(out.trim().is_empty());
    }
}
