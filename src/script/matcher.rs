//! Unifies the two pattern-matching strategies `expect()` can use
//! behind one trait, so callers don't need to know which buffer shape
//! backs a given runtime.
use super::buffer::{InputBuffer, ShiftRegister};

pub trait PatternMatcher {
    fn push(&mut self, byte: u8);
    fn clear(&mut self);
    /// Index (1-based, matching the Lua `expect()` return convention
    /// of "which argument matched") of the first pattern in `needles`
    /// found, or `None`.
    fn find(&self, needles: &[&[u8]]) -> Option<usize>;
}

/// The primary matcher: a bounded ring buffer, any pattern occurring
/// anywhere in the retained window counts.
pub struct RingMatcher {
    buf: InputBuffer,
}

impl RingMatcher {
    pub fn new(capacity: usize) -> Self {
        RingMatcher {
            buf: InputBuffer::new(capacity),
        }
    }
}

impl PatternMatcher for RingMatcher {
    fn push(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    fn clear(&mut self) {
        self.buf.clear();
    }

    fn find(&self, needles: &[&[u8]]) -> Option<usize> {
        needles.iter().position(|n| self.buf.contains(n))
    }
}

/// The legacy matcher: a fixed-size shift register, only a suffix
/// match counts. Some existing scripts rely on this narrower
/// semantics (a pattern that scrolled past is forgotten even though it
/// once appeared), so it's kept available rather than folded into
/// `RingMatcher`.
pub struct ShiftRegisterMatcher {
    reg: ShiftRegister,
    size: usize,
}

impl ShiftRegisterMatcher {
    pub fn new(size: usize) -> Self {
        ShiftRegisterMatcher {
            reg: ShiftRegister::new(size),
            size,
        }
    }
}

impl PatternMatcher for ShiftRegisterMatcher {
    fn push(&mut self, byte: u8) {
        self.reg.push(byte);
    }

    fn clear(&mut self) {
        // The original never resets inbuf mid-session; callers that
        // want a clean slate (flush()) create a fresh register.
        self.reg = ShiftRegister::new(self.size);
    }

    fn find(&self, needles: &[&[u8]]) -> Option<usize> {
        needles.iter().position(|n| self.reg.ends_with(n))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ring_matcher_finds_needle_mid_buffer() {
        let mut m = RingMatcher::new(32);
        for b in b"welcome\r\nlogin: " {
            m.push(*b);
        }
        assert_eq!(m.find(&[b"login:", b"password:"]), Some(0));
    }

    #[test]
    fn shift_register_matcher_requires_suffix() {
        let mut m = ShiftRegisterMatcher::new(16);
        for b in b"login: admin" {
            m.push(*b);
        }
        assert_eq!(m.find(&[b"login:"]), None);
        assert_eq!(m.find(&[b"admin"]), Some(0));
    }
}
