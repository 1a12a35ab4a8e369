//! Temporal column codecs.
//!
//! All values are rendered as deterministic `YYYY-MM-DD HH:MM:SS[.ffffff]`
//! style strings; timestamps are formatted in UTC regardless of the host
//! locale. The packed layouts follow `my_time.cc` / `log_event.cc`.

use chrono::{DateTime, Utc};

use crate::codec::{number_be, BinReader};
use crate::error::{Result, SyncError};

const DATETIMEF_INT_OFS: i64 = 0x8000000000;
const TIMEF_OFS: i64 = 0x800000000000;
const DATETIME_MAX_DECIMALS: u16 = 6;

/// The zero value rendered at the declared fractional precision, e.g.
/// `0000-00-00 00:00:00.000` for three decimals.
pub fn format_zero_time(frac: u32, dec: u16) -> String {
    if dec == 0 {
        return "0000-00-00 00:00:00".to_string();
    }
    let s = format!("0000-00-00 00:00:00.{frac:06}");
    // dec < 6: if frac is 924000 at dec 3, emit 924.
    s[..s.len() - (6 - dec as usize)].to_string()
}

fn format_frac(base: String, frac: u32, dec: u16) -> String {
    if dec == 0 {
        return base;
    }
    let digits = format!("{frac:06}");
    format!("{}.{}", base, &digits[..dec as usize])
}

/// DATE: 3 big-endian bytes of packed year/month/day.
pub fn decode_date(r: &mut BinReader<'_>) -> Result<String> {
    let v = number_be(r.read_bytes(3)?);
    if v == 0 {
        return Ok("0000-00-00".to_string());
    }
    Ok(format!("{:04}-{:02}-{:02}", v / (16 * 32), v / 32 % 16, v % 32))
}

/// Legacy TIME: packed decimal `HHMMSS`.
pub fn decode_time(r: &mut BinReader<'_>) -> Result<String> {
    let v = r.read_u32()?;
    Ok(format!("{:02}:{:02}:{:02}", v / 10000, (v % 10000) / 100, v % 100))
}

/// Legacy DATETIME: u64 packed decimal `YYYYMMDDHHMMSS`.
pub fn decode_datetime(r: &mut BinReader<'_>) -> Result<String> {
    let v = r.read_u64()?;
    let d = v / 1_000_000;
    let t = v % 1_000_000;
    Ok(format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        d / 10000,
        (d % 10000) / 100,
        d % 100,
        t / 10000,
        (t % 10000) / 100,
        t % 100
    ))
}

/// DATETIME2: 5 big-endian bytes biased by `0x8000000000`, plus 0-3
/// fractional bytes selected by the column's declared precision.
pub fn decode_datetime2(r: &mut BinReader<'_>, meta: u16) -> Result<String> {
    let int_part = number_be(r.read_bytes(5)?) as i64 - DATETIMEF_INT_OFS;
    let frac: i64 = match meta {
        0 => 0,
        1 | 2 => i64::from(r.read_u8()?) * 10000,
        3 | 4 => number_be(r.read_bytes(2)?) as i64 * 100,
        5 | 6 => number_be(r.read_bytes(3)?) as i64,
        _ => {
            return Err(SyncError::protocol(format!(
                "invalid datetime2 precision {meta}"
            )))
        }
    };

    if int_part == 0 {
        return Ok(format_zero_time(frac as u32, meta));
    }

    let mut tmp = (int_part << 24) + frac;
    if tmp < 0 {
        tmp = -tmp;
    }

    let ymdhms = tmp >> 24;
    let ymd = ymdhms >> 17;
    let ym = ymd >> 5;
    let hms = ymdhms % (1 << 17);

    let day = ymd % (1 << 5);
    let month = ym % 13;
    let year = ym / 13;
    let second = hms % (1 << 6);
    let minute = (hms >> 6) % (1 << 6);
    let hour = hms >> 12;

    let base = format!(
        "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
    );
    Ok(format_frac(base, frac as u32, meta))
}

/// TIMESTAMP: little-endian seconds since the epoch.
pub fn decode_timestamp(r: &mut BinReader<'_>) -> Result<String> {
    let secs = r.read_u32()?;
    Ok(format_epoch(i64::from(secs), 0, 0))
}

/// TIMESTAMP2: 4 big-endian bytes of seconds plus an optional 1/2/3-byte
/// microsecond fraction.
pub fn decode_timestamp2(r: &mut BinReader<'_>, dec: u16) -> Result<String> {
    if dec > DATETIME_MAX_DECIMALS {
        return Err(SyncError::protocol(format!(
            "invalid timestamp2 precision {dec}"
        )));
    }
    let secs = number_be(r.read_bytes(4)?) as i64;
    let usec: u32 = match dec {
        0 => 0,
        1 | 2 => u32::from(r.read_u8()?) * 10000,
        3 | 4 => number_be(r.read_bytes(2)?) as u32 * 100,
        _ => number_be(r.read_bytes(3)?) as u32,
    };

    if secs == 0 {
        return Ok(format_zero_time(usec, dec));
    }
    Ok(format_epoch(secs, usec, dec))
}

fn format_epoch(secs: i64, usec: u32, dec: u16) -> String {
    let base = match DateTime::<Utc>::from_timestamp(secs, usec * 1000) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        // Unreachable for 4-byte second counts.
        None => "1970-01-01 00:00:00".to_string(),
    };
    format_frac(base, usec, dec)
}

/// TIME2: 3-6 big-endian bytes biased by `0x800000000000`.
///
/// Negative values store the fractional part in reversed-complement order
/// for binary sort compatibility and are corrected by shifting to the next
/// integer value before combining.
pub fn decode_time2(r: &mut BinReader<'_>, meta: u16) -> Result<String> {
    let tmp: i64;
    match meta {
        1 | 2 => {
            let mut int_part = number_be(r.read_bytes(3)?) as i64 - TIMEF_OFS;
            let mut frac = i64::from(r.read_u8()?);
            if int_part < 0 && frac > 0 {
                // Shift to the next integer value; -(0x100 - frac).
                int_part += 1;
                frac -= 0x100;
            }
            tmp = (int_part << 24) + frac * 10000;
        }
        3 | 4 => {
            let mut int_part = number_be(r.read_bytes(3)?) as i64 - TIMEF_OFS;
            let mut frac = number_be(r.read_bytes(2)?) as i64;
            if int_part < 0 && frac > 0 {
                // -(0x10000 - frac).
                int_part += 1;
                frac -= 0x10000;
            }
            tmp = (int_part << 24) + frac * 100;
        }
        5 | 6 => {
            tmp = number_be(r.read_bytes(6)?) as i64 - TIMEF_OFS;
            return Ok(time_string_from_packed(tmp));
        }
        _ => {
            let int_part = number_be(r.read_bytes(3)?) as i64 - TIMEF_OFS;
            tmp = int_part << 24;
        }
    }

    if tmp == 0 {
        return Ok("00:00:00".to_string());
    }
    Ok(time_string_from_packed(tmp))
}

/// See `TIME_from_longlong_time_packed` in `log_event.cc`.
fn time_string_from_packed(mut tm: i64) -> String {
    let mut sign = "";
    if tm < 0 {
        tm = -tm;
        sign = "-";
    }

    let hms = tm >> 24;
    let hour = (hms >> 12) % (1 << 10);
    let minute = (hms >> 6) % (1 << 6);
    let second = hms % (1 << 6);
    let sec_part = tm % (1 << 24);

    if sec_part != 0 {
        format!("{sign}{hour:02}:{minute:02}:{second:02}.{sec_part:06}")
    } else {
        format!("{sign}{hour:02}:{minute:02}:{second:02}")
    }
}
