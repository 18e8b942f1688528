//! envelope follower with separate attack and release time constants.
//! The limiter uses one per channel to track how hot the signal is.
use std::fmt;

use crate::utils::get_coef;

pub struct PeakDetector {
    attack_coef: f64,
    release_coef: f64,
    last_output: f64,
}

impl PeakDetector {
    /// attack and release are time constants in seconds, rate is how often
    /// per second the detector will be fed (once per frame or per period)
    pub fn build(attack: f64, release: f64, rate: f64) -> PeakDetector {
        PeakDetector {
            attack_coef: get_coef(attack, rate),
            release_coef: get_coef(release, rate),
            last_output: 0.0,
        }
    }

    pub fn get(&mut self, input: f64) -> f64 {
        let coef = if self.last_output < input {
            self.attack_coef
        } else {
            self.release_coef
        };
        self.last_output = input * coef + (1.0 - coef) * self.last_output;
        self.last_output
    }

    pub fn last(&self) -> f64 {
        self.last_output
    }
}

impl fmt::Display for PeakDetector {
    // This trait requires `fmt` with this exact signature.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ attack: {}, release: {}, peak: {} }}",
            self.attack_coef, self.release_coef, self.last_output
        )
    }
}
