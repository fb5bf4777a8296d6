//! Simulated tank controller for local development.
//!
//! Models a TDS probe and the two actuators:
//! - Random walk with mean reversion around a baseline reading
//! - Per-reading electronic noise
//! - Slow mineral build-up while the pump is off, filtration pulls it back
//! - `FEED_AUTO` runs the feeder for a fixed number of samples, then `READY`

use serde::Serialize;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Actuator states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    Off,
    On,
}

impl Pump {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::On => "ON",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feeder {
    Ready,
    On,
    Off,
}

impl Feeder {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }
}

/// Wire shape of a status publish.
#[derive(Debug, Serialize)]
pub struct StatusMsg {
    pub sensor_value: i64,
    pub pump_status: &'static str,
    pub feeder_status: &'static str,
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// Samples the feeder stays `ON` after an automatic feed.
pub const FEED_CYCLE_SAMPLES: u32 = 3;

const TDS_MIN: f64 = 0.0;
const TDS_MAX: f64 = 2000.0;

pub struct TankSim {
    tds: f64,
    baseline: f64,
    /// Pull towards baseline per sample, 0..1.
    reversion: f64,
    walk_sigma: f64,
    noise_sigma: f64,
    /// TDS gained per sample while the pump is off.
    buildup: f64,
    pump: Pump,
    feeder: Feeder,
    feed_remaining: u32,
}

impl TankSim {
    pub fn new(baseline: f64) -> Self {
        Self {
            tds: baseline,
            baseline,
            reversion: 0.05,
            walk_sigma: 4.0,
            noise_sigma: 2.0,
            buildup: 3.0,
            pump: Pump::On,
            feeder: Feeder::Ready,
            feed_remaining: 0,
        }
    }

    #[cfg(test)]
    pub fn pump(&self) -> Pump {
        self.pump
    }

    #[cfg(test)]
    pub fn feeder(&self) -> Feeder {
        self.feeder
    }

    /// Apply a command body. Returns `false` for anything unrecognised.
    pub fn apply_command(&mut self, command: &str) -> bool {
        match command.trim() {
            "PUMP_ON" => self.pump = Pump::On,
            "PUMP_OFF" => self.pump = Pump::Off,
            "FEEDER_ON" => {
                self.feeder = Feeder::On;
                self.feed_remaining = 0;
            }
            "FEEDER_OFF" => {
                self.feeder = Feeder::Off;
                self.feed_remaining = 0;
            }
            "FEED_AUTO" => {
                self.feeder = Feeder::On;
                self.feed_remaining = FEED_CYCLE_SAMPLES;
            }
            _ => return false,
        }
        true
    }

    /// Advance the model by one sample period.
    pub fn step(&mut self) {
        let drift = if self.pump == Pump::Off {
            self.buildup
        } else {
            0.0
        };
        let pull = self.reversion * (self.baseline - self.tds);
        self.tds = (self.tds + pull + drift + gaussian(0.0, self.walk_sigma)).clamp(TDS_MIN, TDS_MAX);

        if self.feed_remaining > 0 {
            self.feed_remaining -= 1;
            if self.feed_remaining == 0 {
                self.feeder = Feeder::Ready;
            }
        }
    }

    /// Current status, with read noise on the sensor value.
    pub fn status(&self) -> StatusMsg {
        let reading = (self.tds + gaussian(0.0, self.noise_sigma)).clamp(TDS_MIN, TDS_MAX);
        StatusMsg {
            sensor_value: reading.round() as i64,
            pump_status: self.pump.as_str(),
            feeder_status: self.feeder.as_str(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
