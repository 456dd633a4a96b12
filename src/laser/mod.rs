//! Pan/tilt laser pointer control.
//!
//! The hardware proxy is the `LaserDriver` trait; `LaserActuator` layers
//! range clamping, the settle dwell after each move, and the mirrored
//! `LaserState` on top of it. The dwell is tiered on angular travel: a big
//! slew needs the mechanics to stop ringing before a detection can be
//! trusted.

use crate::pacing::Pacer;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Laser hardware error.
#[derive(Debug)]
pub enum LaserError {
    Command(String),
}

impl std::fmt::Display for LaserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaserError::Command(msg) => write!(f, "laser command error: {}", msg),
        }
    }
}

impl std::error::Error for LaserError {}

/// Low-level pan/tilt laser hardware proxy.
pub trait LaserDriver {
    fn set_pan(&mut self, pan: f64) -> Result<(), LaserError>;
    fn set_tilt(&mut self, tilt: f64) -> Result<(), LaserError>;
    fn set_power(&mut self, on: bool) -> Result<(), LaserError>;
    fn set_brightness(&mut self, brightness: f64) -> Result<(), LaserError>;
}

/// Travel range of one laser axis, plus the number of raster sweep steps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LaserRange {
    pub min: f64,
    pub max: f64,
    pub steps: usize,
}

impl LaserRange {
    /// Clamp a commanded angle into `[min, max-1]`.
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max - 1.0)
    }
}

/// Mirror of the last successfully commanded laser state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaserState {
    pub pan: f64,
    pub tilt: f64,
    pub power: bool,
    pub brightness: f64,
}

/// Settle dwell for a move of the given angular distance.
pub fn settle_duration(dist: f64) -> Duration {
    if dist > 200.0 {
        Duration::from_millis(2000)
    } else if dist > 100.0 {
        Duration::from_millis(1000)
    } else if dist > 50.0 {
        Duration::from_millis(800)
    } else if dist > 10.0 {
        Duration::from_millis(500)
    } else {
        Duration::from_millis(300)
    }
}

/// Rate-limited pan/tilt/power control with range clamping.
pub struct LaserActuator {
    driver: Box<dyn LaserDriver>,
    pan_range: LaserRange,
    tilt_range: LaserRange,
    state: LaserState,
    pacer: Box<dyn Pacer>,
}

impl LaserActuator {
    pub fn new(
        driver: Box<dyn LaserDriver>,
        pan_range: LaserRange,
        tilt_range: LaserRange,
        pacer: Box<dyn Pacer>,
    ) -> Self {
        Self {
            driver,
            pan_range,
            tilt_range,
            state: LaserState {
                pan: 0.0,
                tilt: 0.0,
                power: false,
                brightness: 0.0,
            },
            pacer,
        }
    }

    pub fn state(&self) -> &LaserState {
        &self.state
    }

    pub fn pan_range(&self) -> LaserRange {
        self.pan_range
    }

    pub fn tilt_range(&self) -> LaserRange {
        self.tilt_range
    }

    /// Drive the laser to its configured home without a settle dwell, used
    /// once at startup before any detection runs.
    pub fn initialize(&mut self, pan: f64, tilt: f64, brightness: f64) -> Result<(), LaserError> {
        self.set_brightness(brightness)?;
        self.driver.set_power(false)?;
        self.state.power = false;
        self.driver.set_pan(pan)?;
        self.state.pan = pan;
        self.driver.set_tilt(tilt)?;
        self.state.tilt = tilt;
        Ok(())
    }

    /// Move to (pan, tilt) with the beam on or off, clamped into range, then
    /// dwell for the settle time tiered on the travel distance. Returns the
    /// clamped position actually commanded.
    pub fn light(&mut self, pan: f64, tilt: f64, power: bool) -> Result<(f64, f64), LaserError> {
        let pan = self.pan_range.clamp(pan);
        let tilt = self.tilt_range.clamp(tilt);

        let dpan = self.state.pan - pan;
        let dtilt = self.state.tilt - tilt;
        let dist = (dpan * dpan + dtilt * dtilt).sqrt();
        log::info!(
            "laser {}: pan: {:.0} tilt: {:.0} dist: {:.1}",
            if power { "on" } else { "off" },
            pan,
            tilt,
            dist
        );

        self.driver.set_pan(pan)?;
        self.state.pan = pan;
        self.driver.set_tilt(tilt)?;
        self.state.tilt = tilt;
        self.driver.set_power(power)?;
        self.state.power = power;

        self.pacer.pause(settle_duration(dist));
        Ok((pan, tilt))
    }

    /// Switch the beam off without moving or dwelling.
    pub fn power_off(&mut self) -> Result<(), LaserError> {
        self.driver.set_power(false)?;
        self.state.power = false;
        Ok(())
    }

    pub fn set_brightness(&mut self, brightness: f64) -> Result<(), LaserError> {
        self.driver.set_brightness(brightness)?;
        self.state.brightness = brightness;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::NullPacer;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorded {
        pans: Vec<f64>,
        tilts: Vec<f64>,
        powers: Vec<bool>,
    }

    struct RecordingDriver(Rc<RefCell<Recorded>>);

    impl LaserDriver for RecordingDriver {
        fn set_pan(&mut self, pan: f64) -> Result<(), LaserError> {
            self.0.borrow_mut().pans.push(pan);
            Ok(())
        }
        fn set_tilt(&mut self, tilt: f64) -> Result<(), LaserError> {
            self.0.borrow_mut().tilts.push(tilt);
            Ok(())
        }
        fn set_power(&mut self, on: bool) -> Result<(), LaserError> {
            self.0.borrow_mut().powers.push(on);
            Ok(())
        }
        fn set_brightness(&mut self, _brightness: f64) -> Result<(), LaserError> {
            Ok(())
        }
    }

    fn actuator() -> (LaserActuator, Rc<RefCell<Recorded>>) {
        let rec = Rc::new(RefCell::new(Recorded::default()));
        let act = LaserActuator::new(
            Box::new(RecordingDriver(rec.clone())),
            LaserRange {
                min: -100.0,
                max: 100.0,
                steps: 10,
            },
            LaserRange {
                min: 0.0,
                max: 50.0,
                steps: 5,
            },
            Box::new(NullPacer),
        );
        (act, rec)
    }

    #[test]
    fn commands_are_clamped_into_range() {
        let (mut act, rec) = actuator();
        let (pan, tilt) = act.light(500.0, -20.0, true).unwrap();
        assert_eq!(pan, 99.0); // max - 1
        assert_eq!(tilt, 0.0); // min
        assert_eq!(rec.borrow().pans, vec![99.0]);
        assert_eq!(rec.borrow().tilts, vec![0.0]);

        let (pan, tilt) = act.light(-500.0, 200.0, false).unwrap();
        assert_eq!(pan, -100.0);
        assert_eq!(tilt, 49.0);
    }

    #[test]
    fn state_tracks_last_commanded_position() {
        let (mut act, _rec) = actuator();
        act.light(10.0, 20.0, true).unwrap();
        assert_eq!(act.state().pan, 10.0);
        assert_eq!(act.state().tilt, 20.0);
        assert!(act.state().power);
        act.power_off().unwrap();
        assert!(!act.state().power);
        assert_eq!(act.state().pan, 10.0);
    }

    #[test]
    fn settle_tiers() {
        assert_eq!(settle_duration(250.0), Duration::from_millis(2000));
        assert_eq!(settle_duration(150.0), Duration::from_millis(1000));
        assert_eq!(settle_duration(75.0), Duration::from_millis(800));
        assert_eq!(settle_duration(30.0), Duration::from_millis(500));
        assert_eq!(settle_duration(5.0), Duration::from_millis(300));
    }

    #[test]
    fn settle_is_monotonic_in_distance() {
        let mut prev = Duration::ZERO;
        for dist in [0.0, 5.0, 10.1, 30.0, 50.1, 75.0, 100.1, 150.0, 200.1, 300.0] {
            let d = settle_duration(dist);
            assert!(d >= prev, "settle not monotonic at dist {}", dist);
            prev = d;
        }
    }
}
