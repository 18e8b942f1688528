//! grab bag of functions used across the board
use num::{Float, FromPrimitive};
use std::time::{SystemTime, UNIX_EPOCH};

/// microsecond timestamp used by the timers and the player bookkeeping
pub fn get_micro_time() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros(),
        Err(_) => 0,
    }
}

/// calculate a filter coefficient given a time constant and update rate
pub fn get_coef<T: Float + FromPrimitive>(val: T, rate: T) -> T {
    let one = T::from_f64(1.0).unwrap();
    let neg_one = T::from_f64(-1.0).unwrap();
    let tau = T::from_f64(2.0 * std::f64::consts::PI).unwrap();
    T::from_i32(27).unwrap() * (one - T::exp(neg_one / (tau * val * rate)))
}
