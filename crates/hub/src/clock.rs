//! Wall-clock time in the tank's fixed regional UTC offset.
//!
//! Everything time-of-day related (slot matching, the daily reset date) is
//! evaluated in this single offset. There is no DST handling and no per-slot
//! timezone.

use anyhow::{Context, Result};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

/// Offset used when the config does not name one.
pub const DEFAULT_UTC_OFFSET: &str = "+07:00";

/// Current local time in `offset`.
pub fn now_local(offset: UtcOffset) -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(offset)
}

/// Parse an offset of the form `+HH:MM` / `-HH:MM`.
pub fn parse_utc_offset(s: &str) -> Result<UtcOffset> {
    let fmt = format_description!("[offset_hour sign:mandatory]:[offset_minute]");
    UtcOffset::parse(s.trim(), &fmt).with_context(|| format!("invalid utc offset '{s}'"))
}
