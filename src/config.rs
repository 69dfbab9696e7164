//! Session configuration, loaded from a small TOML file (default
//! `~/.comtermrc`) the way the teacher reads `[package.metadata.*]`
//! tables via `serde::Deserialize` (see `manifest.rs` upstream): an
//! "intermediate" struct of all-`Option` fields is deserialized, then
//! completed field-by-field against built-in defaults.
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::diag::DiagnosableError;

pub const DEFAULT_STATUSLINE_FORMAT: &str = "%H for help | %b | %C | Comterm %V | %T | %t | %D";
pub const DEFAULT_ESCAPE: char = '\x01'; // CTRL-A

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {1}", .0.display())]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file {}: {1}", .0.display())]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}

impl DiagnosableError for ConfigError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            ConfigError::ParseFailed(path, _) => vec![format!(
                "Check the TOML syntax of {} against the documented fields.",
                path.display()
            )],
            _ => vec![],
        }
    }
}

#[derive(Deserialize, Debug, Default)]
struct ConfigIntermediate {
    lock_dir: Option<PathBuf>,
    callout: Option<String>,
    callin: Option<String>,
    statusline_format: Option<String>,
    escape: Option<String>,
    macros: Option<[String; 12]>,
    char_delay_ms: Option<u64>,
    parity: Option<Parity>,
    display_hex: Option<bool>,
    translate_charset: Option<bool>,
    has_dcd: Option<bool>,
    dcd_drives_flow: Option<bool>,
    log_connections: Option<bool>,
    wrap: Option<bool>,
    autocr: Option<bool>,
    alt_override: Option<bool>,
}

impl ConfigIntermediate {
    fn complete_with(&mut self, other: Self) {
        macro_rules! complete {
            ($($f:ident),+ $(,)?) => {{
                $(
                    if self.$f.is_none() {
                        self.$f = other.$f;
                    }
                )+
            }};
        }
        complete!(
            lock_dir,
            callout,
            callin,
            statusline_format,
            escape,
            macros,
            char_delay_ms,
            parity,
            display_hex,
            translate_charset,
            has_dcd,
            dcd_drives_flow,
            log_connections,
            wrap,
            autocr,
            alt_override
        );
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
    Mark,
    Space,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub lock_dir: Option<PathBuf>,
    pub callout: String,
    pub callin: String,
    pub statusline_format: String,
    pub escape: u8,
    pub macros: [String; 12],
    pub char_delay_ms: u64,
    pub parity: Parity,
    pub display_hex: bool,
    pub translate_charset: bool,
    pub has_dcd: bool,
    pub dcd_drives_flow: bool,
    pub log_connections: bool,
    pub wrap: bool,
    pub autocr: bool,
    pub alt_override: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            lock_dir: Some(PathBuf::from("/var/lock")),
            callout: String::new(),
            callin: String::new(),
            statusline_format: DEFAULT_STATUSLINE_FORMAT.to_string(),
            escape: DEFAULT_ESCAPE as u8,
            macros: Default::default(),
            char_delay_ms: 0,
            parity: Parity::None,
            display_hex: false,
            translate_charset: false,
            has_dcd: false,
            dcd_drives_flow: false,
            log_connections: true,
            wrap: true,
            autocr: false,
            alt_override: false,
        }
    }
}

impl Config {
    /// Loads `path` if given, else `~/.comtermrc` if present, completing
    /// any missing fields from the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let candidate = path.map(PathBuf::from).or_else(default_path);

        let mut intermediate = ConfigIntermediate::default();
        if let Some(path) = &candidate {
            if path.exists() {
                let text = fs::read_to_string(path)
                    .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
                let parsed: ConfigIntermediate =
                    toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?;
                intermediate.complete_with(parsed);
            }
        }

        let defaults = Config::default();
        Ok(Config {
            lock_dir: intermediate.lock_dir.or(defaults.lock_dir),
            callout: intermediate.callout.unwrap_or(defaults.callout),
            callin: intermediate.callin.unwrap_or(defaults.callin),
            statusline_format: intermediate
                .statusline_format
                .unwrap_or(defaults.statusline_format),
            escape: intermediate
                .escape
                .and_then(|s| s.bytes().next())
                .unwrap_or(defaults.escape),
            macros: intermediate.macros.unwrap_or(defaults.macros),
            char_delay_ms: intermediate.char_delay_ms.unwrap_or(defaults.char_delay_ms),
            parity: intermediate.parity.unwrap_or(defaults.parity),
            display_hex: intermediate.display_hex.unwrap_or(defaults.display_hex),
            translate_charset: intermediate
                .translate_charset
                .unwrap_or(defaults.translate_charset),
            has_dcd: intermediate.has_dcd.unwrap_or(defaults.has_dcd),
            dcd_drives_flow: intermediate
                .dcd_drives_flow
                .unwrap_or(defaults.dcd_drives_flow),
            log_connections: intermediate
                .log_connections
                .unwrap_or(defaults.log_connections),
            wrap: intermediate.wrap.unwrap_or(defaults.wrap),
            autocr: intermediate.autocr.unwrap_or(defaults.autocr),
            alt_override: intermediate.alt_override.unwrap_or(defaults.alt_override),
        })
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".comtermrc"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(Some(Path::new("/nonexistent/path/comtermrc"))).unwrap();
        assert_eq!(cfg.statusline_format, DEFAULT_STATUSLINE_FORMAT);
        assert_eq!(cfg.escape, DEFAULT_ESCAPE as u8);
    }

    #[test]
    fn partial_file_completes_from_defaults() {
        let dir = std::env::temp_dir().join(format!("comterm-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("comtermrc");
        fs::write(&path, "statusline_format = \"%H\"\n").unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.statusline_format, "%H");
        assert_eq!(cfg.lock_dir, Config::default().lock_dir);

        fs::remove_file(&path).unwrap();
    }
}
