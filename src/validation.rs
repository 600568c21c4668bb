//! Validators shared by configuration loading and the controller facade.
use std::ops::RangeInclusive;

/// Valid primary addresses on a GPIB bus.
pub const GPIB_ADDRESS_RANGE: RangeInclusive<u8> = 0..=30;

/// Sampling rates the acquisition loop accepts, in Hz.
pub const SAMPLING_RATE_RANGE_HZ: RangeInclusive<f64> = 0.1..=10.0;

/// Validates if a given value is within a specified numeric range.
///
/// # Arguments
///
/// * `value` - The value to validate.
/// * `range` - The inclusive range to validate against.
///
/// # Returns
///
/// * `Ok(())` if the value is within the range.
/// * `Err(&'static str)` if the value is outside the range.
pub fn is_in_range<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<(), &'static str> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err("Value is outside the specified range")
    }
}

/// Validates a GPIB primary address.
pub fn is_valid_gpib_address(address: u8) -> Result<(), &'static str> {
    is_in_range(address, GPIB_ADDRESS_RANGE).map_err(|_| "GPIB address must be 0-30")
}

/// Validates a sampling rate in Hz. NaN is rejected.
pub fn is_valid_sampling_rate(rate_hz: f64) -> Result<(), &'static str> {
    is_in_range(rate_hz, SAMPLING_RATE_RANGE_HZ)
        .map_err(|_| "Sampling rate must be between 0.1 and 10.0 Hz")
}

/// Validates that a limit is a finite, strictly positive number.
pub fn is_positive_limit(value: f64) -> Result<(), &'static str> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err("Limit must be a positive number")
    }
}

/// Validates if a given string is not empty.
pub fn is_not_empty(value: &str) -> Result<(), &'static str> {
    if !value.trim().is_empty() {
        Ok(())
    } else {
        Err("Value cannot be empty")
    }
}
