//! small DSP helpers used by the stats collection and the built in limiter
pub mod moving_avg;
pub mod peak_detector;
