//! Small parsing utilities shared by option structs

use std::num::ParseIntError;
use std::time::Duration;

/// Parses a number of seconds into a [`Duration`]
pub fn parse_seconds(src: &str) -> Result<Duration, ParseIntError> {
    let seconds = src.parse::<u64>()?;
    Ok(Duration::from_secs(seconds))
}
