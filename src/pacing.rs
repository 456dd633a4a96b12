//! Blocking pacing for hardware settle times and the engine tick.
//!
//! Detections are only trustworthy after the mechanics have settled, so the
//! dwell after each actuator command is a blocking pause on the control
//! thread. The pause itself sits behind a trait so tests and dry runs can
//! drop it.

use std::time::Duration;

/// Blocking pause between hardware commands and the next measurement.
pub trait Pacer {
    fn pause(&mut self, duration: Duration);
}

/// Pacer that sleeps the calling thread.
#[derive(Debug, Default)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Pacer that returns immediately. For tests and offline replay.
#[derive(Debug, Default)]
pub struct NullPacer;

impl Pacer for NullPacer {
    fn pause(&mut self, _duration: Duration) {}
}
