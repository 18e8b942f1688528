//! used to collect running statistics and to pace periodic work.
//!
//! The jitter ring depth and the receive loop both feed a StreamTimeStat so
//! the interval report can say what the buffer has really been doing.  The
//! MicroTimer paces the supervisor's stats reports.
use std::f64;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::dsp::moving_avg::MovingAverage;

/// moving average filter that collects peak, mean, and sigma for a sequence
#[derive(Debug, Deserialize, Serialize)]
pub struct StreamTimeStat {
    window: u64,
    avg: MovingAverage,
    dev: MovingAverage,
    peak: f64,
}

impl StreamTimeStat {
    /// create a new stat collector with a specific window size
    pub fn new(window_size: u64) -> StreamTimeStat {
        StreamTimeStat {
            window: window_size,
            avg: MovingAverage::new(window_size as usize),
            dev: MovingAverage::new(window_size as usize),
            peak: 0.0,
        }
    }
    pub fn clear(&mut self) -> () {
        self.avg = MovingAverage::new(self.window as usize);
        self.dev = MovingAverage::new(self.window as usize);
        self.peak = 0.0;
    }
    pub fn get_mean(&self) -> f64 {
        self.avg.get_mean()
    }
    pub fn get_sigma(&self) -> f64 {
        f64::sqrt(self.dev.get_total()) / self.dev.get_window() as f64
    }
    /// largest sample seen since the last clear
    pub fn get_peak(&self) -> f64 {
        self.peak
    }
    pub fn get_window(&self) -> u64 {
        self.window
    }
    /// add a sample to the sequence
    pub fn add_sample(&mut self, sample: f64) -> () {
        self.avg.add_sample(sample);
        let delta = sample - self.get_mean();
        self.dev.add_sample(delta * delta);
        if sample > self.peak {
            self.peak = sample;
        }
    }
}

impl fmt::Display for StreamTimeStat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ mean: {}, sigma: {}, peak: {}, window: {} }}",
            self.get_mean(),
            self.get_sigma(),
            self.get_peak(),
            self.get_window()
        )
    }
}

#[cfg(test)]
mod test_stream_time_stat {
    use super::*;

    #[test]
    fn build() {
        let stat = StreamTimeStat::new(100);
        assert_eq!(stat.get_mean(), 0.0);
        assert_eq!(stat.get_peak(), 0.0);
    }
    #[test]
    fn add_sample() {
        let mut stat = StreamTimeStat::new(2);
        stat.add_sample(1.0);
        assert_eq!(stat.get_mean(), 0.5);
        stat.add_sample(1.0);
        stat.add_sample(1.0);
        assert!(stat.get_mean() > 0.999);
        assert!(stat.get_sigma() < 0.01);
        assert_eq!(stat.get_peak(), 1.0);
    }
    #[test]
    fn clear_resets_peak() {
        let mut stat = StreamTimeStat::new(4);
        stat.add_sample(8.0);
        assert_eq!(stat.get_peak(), 8.0);
        stat.clear();
        assert_eq!(stat.get_peak(), 0.0);
    }
}

/// Timer with microsecond accuracy to let things know when an interval passed
#[derive(Debug)]
pub struct MicroTimer {
    last_time: u128,
    interval: u128,
}

impl MicroTimer {
    /// create a new timer from the current microsecond value and the interval
    pub fn new(now: u128, interval: u128) -> MicroTimer {
        MicroTimer {
            last_time: now,
            interval,
        }
    }
    /// check if the timer is expired
    pub fn expired(&self, now: u128) -> bool {
        (self.last_time + self.interval) < now
    }
    /// reset the timer to the value of now
    pub fn reset(&mut self, now: u128) {
        self.last_time = now;
    }
}
