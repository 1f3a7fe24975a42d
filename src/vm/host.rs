//! The host feed consulted once per scheduling pass.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io::{self, Write};
use std::rc::Rc;
use std::time::Instant;

/// Clock and input state supplied by the embedding application.
pub trait Host {
    /// Monotonic time in seconds.
    fn now(&mut self) -> f64;

    /// Whether `key` is currently held.
    fn is_key_down(&mut self, key: &str) -> bool;

    /// Whether `key` went down since the previous pass.
    fn is_key_pressed(&mut self, key: &str) -> bool;
}

/// Wall-clock host with no input device.
pub struct SystemHost {
    start: Instant,
}

impl SystemHost {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for SystemHost {
    fn now(&mut self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    fn is_key_down(&mut self, _key: &str) -> bool {
        false
    }

    fn is_key_pressed(&mut self, _key: &str) -> bool {
        false
    }
}

/// A host driven by hand: the clock only moves on `advance`, and key state
/// is set explicitly. Key names compare case-insensitively.
#[derive(Debug, Default)]
pub struct ManualHost {
    time: f64,
    down: HashSet<String>,
    pressed: HashSet<String>,
}

impl ManualHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, seconds: f64) {
        self.time += seconds;
    }

    /// Hold a key down. It also reads as pressed until `clear_pressed`.
    pub fn press(&mut self, key: &str) {
        let key = key.to_uppercase();
        self.down.insert(key.clone());
        self.pressed.insert(key);
    }

    pub fn release(&mut self, key: &str) {
        self.down.remove(&key.to_uppercase());
    }

    pub fn clear_pressed(&mut self) {
        self.pressed.clear();
    }
}

impl Host for ManualHost {
    fn now(&mut self) -> f64 {
        self.time
    }

    fn is_key_down(&mut self, key: &str) -> bool {
        self.down.contains(&key.to_uppercase())
    }

    fn is_key_pressed(&mut self, key: &str) -> bool {
        self.pressed.contains(&key.to_uppercase())
    }
}

/// A cloneable in-memory sink for `Print` output.
#[derive(Debug, Clone, Default)]
pub struct SharedOutput {
    buffer: Rc<RefCell<Vec<u8>>>,
}

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.borrow()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_host_keys() {
        let mut host = ManualHost::new();
        host.press("escape");
        assert!(host.is_key_down("ESCAPE"));
        assert!(host.is_key_pressed("Escape"));

        host.clear_pressed();
        assert!(host.is_key_down("ESCAPE"));
        assert!(!host.is_key_pressed("ESCAPE"));

        host.release("ESCAPE");
        assert!(!host.is_key_down("ESCAPE"));
    }

    #[test]
    fn test_manual_clock() {
        let mut host = ManualHost::new();
        assert_eq!(host.now(), 0.0);
        host.advance(0.5);
        assert_eq!(host.now(), 0.5);
    }

    #[test]
    fn test_shared_output_clones_see_writes() {
        let out = SharedOutput::new();
        let mut writer = out.clone();
        writeln!(writer, "hello").unwrap();
        assert_eq!(out.contents(), "hello\n");
    }
}
