//! Script-driven dialogue automation: the primitives a login/dialing
//! script calls (`src/script/ops.rs`), the buffers and matchers they
//! read from (`src/script/buffer.rs`, `src/script/matcher.rs`).
//!
//! The scripting VM/interpreter itself is explicitly out of scope;
//! `bin/comterm-script.rs` supplies a deliberately small line-oriented
//! driver over these primitives for the CLI surface, making no claim
//! to generality beyond that.
pub mod buffer;
pub mod matcher;
pub mod ops;

pub use matcher::{PatternMatcher, RingMatcher, ShiftRegisterMatcher};
pub use ops::{Credentials, ScriptEnv, ScriptError};
