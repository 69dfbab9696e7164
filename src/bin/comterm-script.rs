//! `comterm-script`: runs a small line-oriented script of dialogue
//! primitives (`getenv`, `expect`, `send`, `print`, `flush`,
//! `timeout`, `verbose`, `pipedshell`, `readline`) against an endpoint
//! already connected on its standard input/output, the way the
//! original script runtime (`scriptlua.c`) is exec'd as a coprocess
//! with the dial-out device already duped onto fd 0/1 rather than
//! opening a device of its own.
//!
//! The scripting VM/interpreter itself has no single upstream
//! counterpart (it is explicitly out of scope); this driver exists
//! purely to sequence `comterm::script::ops` calls from a file and
//! makes no claim to generality beyond that. Primitive semantics are
//! grounded on `original_source/src/scriptlua.c`'s `minicomlib` table.
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use structopt::StructOpt;
use thiserror::Error;

use comterm::diag::DiagnosableError;
use comterm::log;
use comterm::script::{RingMatcher, ScriptEnv, ScriptError};
use comterm::timeout::Ticker;

#[derive(Debug, StructOpt)]
#[structopt(name = "comterm-script", about = "Run a dialogue script against an endpoint inherited on stdin/stdout")]
struct Opts {
    /// Path to the script file to run.
    scriptfile: Option<PathBuf>,

    /// Optional transcript log of every line executed.
    logfile: Option<PathBuf>,

    /// Optional working directory to run the script from.
    homedir: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum RunError {
    #[error("could not read script {0}: {1}")]
    ReadScript(PathBuf, #[source] io::Error),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("line {0}: {1}")]
    Parse(usize, String),
    #[error("line {0}: unknown label {1:?}")]
    UnknownLabel(usize, String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DiagnosableError for RunError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            RunError::Script(e) => e.diagnose(),
            _ => vec![],
        }
    }
}

fn main() {
    let opts = Opts::from_args();
    let Some(scriptfile) = opts.scriptfile.clone() else {
        eprintln!("usage: comterm-script <scriptfile> [<logfile> [<homedir>]]");
        std::process::exit(1);
    };

    if let Err(e) = run(&opts, &scriptfile) {
        log::err(format!("{e}"));
        for hint in e.diagnose() {
            log::hint(hint);
        }
        std::process::exit(1);
    }
}

fn run(opts: &Opts, scriptfile: &Path) -> Result<(), RunError> {
    if let Some(homedir) = &opts.homedir {
        let _ = std::env::set_current_dir(homedir);
    }

    let text = fs::read_to_string(scriptfile).map_err(|e| RunError::ReadScript(scriptfile.to_path_buf(), e))?;
    let lines: Vec<&str> = text.lines().collect();

    let mut log_file = match &opts.logfile {
        Some(path) => Some(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| RunError::ReadScript(path.clone(), e))?,
        ),
        None => None,
    };

    let script_name = scriptfile
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| scriptfile.to_string_lossy().into_owned());

    let mut env = ScriptEnv::new(RingMatcher::new(1024), io::stdin(), io::stdout());
    let ticker = Ticker::start(Duration::from_secs(1));

    let labels = index_labels(&lines);
    let mut pc = 0usize;
    let mut last_match = 0usize;

    while pc < lines.len() {
        if ticker.receiver().try_recv().is_ok() && env.global_timeout_expired() {
            report_global_timeout(&script_name);
        }

        let raw = lines[pc].trim();
        pc += 1;
        if raw.is_empty() || raw.starts_with('#') || raw.ends_with(':') {
            continue;
        }
        let tokens = tokenize(raw).map_err(|e| RunError::Parse(pc, e))?;
        let Some((cmd, args)) = tokens.split_first() else {
            continue;
        };

        if let Some(log_file) = log_file.as_mut() {
            let _ = writeln!(log_file, "{raw}");
        }

        match cmd.as_str() {
            "send" => on_timeout(env.send(arg(args, 0)), &script_name)?,
            "print" => env.print(arg(args, 0)),
            "flush" => env.flush(),
            "verbose" => {
                env.set_verbose(arg(args, 0));
            }
            "timeout" => {
                let seconds: u64 = arg(args, 1).parse().unwrap_or(0);
                env.set_timeout(arg(args, 0), seconds);
            }
            "pipedshell" => {
                on_timeout(env.pipedshell(arg(args, 0)), &script_name)?;
            }
            "readline" => {
                let line = on_timeout(env.readline(), &script_name)?;
                log::status("readline", line);
            }
            "getenv" => {
                if let Some(value) = env.getenv(arg(args, 0)) {
                    log::status("getenv", value);
                }
            }
            "expect" => {
                let refs: Vec<&str> = args.iter().map(String::as_str).collect();
                last_match = on_timeout(env.expect(&refs), &script_name)?;
            }
            "goto" => {
                pc = *labels
                    .get(arg(args, 0))
                    .ok_or_else(|| RunError::UnknownLabel(pc, arg(args, 0).to_string()))?;
            }
            "ifmatch" => {
                // ifmatch N label: jump to label if the last expect()
                // matched pattern N (1-based).
                let n: usize = arg(args, 0).parse().unwrap_or(0);
                if n == last_match {
                    pc = *labels
                        .get(arg(args, 1))
                        .ok_or_else(|| RunError::UnknownLabel(pc, arg(args, 1).to_string()))?;
                }
            }
            other => return Err(RunError::Parse(pc, format!("unknown command {other:?}"))),
        }
    }

    Ok(())
}

/// Intercepts `ScriptError::GlobalTimeout` before it reaches the
/// generic error path: spec.md §4.7/§7 wants the exact line
/// `script "<name>": global timeout` and exit status 1, not the
/// decorated `log::err` rendering every other error gets.
fn on_timeout<T>(result: Result<T, ScriptError>, script_name: &str) -> Result<T, RunError> {
    match result {
        Err(ScriptError::GlobalTimeout) => report_global_timeout(script_name),
        other => other.map_err(RunError::from),
    }
}

fn report_global_timeout(script_name: &str) -> ! {
    eprintln!("script \"{script_name}\": global timeout");
    std::process::exit(1);
}

fn arg(args: &[String], idx: usize) -> &str {
    args.get(idx).map(String::as_str).unwrap_or("")
}

fn index_labels(lines: &[&str]) -> std::collections::HashMap<String, usize> {
    let mut labels = std::collections::HashMap::new();
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_suffix(':') {
            labels.insert(name.trim().to_string(), i);
        }
    }
    labels
}

/// Splits a line into whitespace-separated tokens, honoring
/// double-quoted strings with `\"` and `\\` escapes so `send`/`expect`
/// arguments can contain spaces.
fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut token = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => token.push('\n'),
                        Some('t') => token.push('\t'),
                        Some(escaped) => token.push(escaped),
                        None => return Err("unterminated escape".to_string()),
                    },
                    Some(other) => token.push(other),
                    None => return Err("unterminated quoted string".to_string()),
                }
            }
            tokens.push(token);
        } else {
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
            tokens.push(token);
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tokenizes_quoted_arguments_with_spaces() {
        let tokens = tokenize(r#"send "AT+CGDCONT=1,\"IP\",\"internet\"""#).unwrap();
        assert_eq!(tokens, vec!["send", "AT+CGDCONT=1,\"IP\",\"internet\""]);
    }

    #[test]
    fn tokenizes_bare_words() {
        let tokens = tokenize("timeout etime 5").unwrap();
        assert_eq!(tokens, vec!["timeout", "etime", "5"]);
    }

    #[test]
    fn indexes_labels_by_line_number() {
        let lines = vec!["send \"AT\"", "retry:", "expect \"OK\""];
        let labels = index_labels(&lines);
        assert_eq!(labels.get("retry"), Some(&1));
    }
}
