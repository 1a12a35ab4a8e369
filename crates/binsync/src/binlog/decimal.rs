//! NEW_DECIMAL codec.
//!
//! MySQL packs decimals in groups of 9 digits per 4 big-endian bytes, with
//! compressed leading/trailing groups sized by `dig2bytes`. The high bit of
//! byte 0 carries the sign (set = positive); negative values store the
//! one's complement. See `my_decimal.h` / `decimal.c`.
//!
//! The value is delivered as its exact textual form; flattening to a float
//! would silently lose precision above 15 digits.

use crate::codec::{number_be, BinReader};
use crate::error::{Result, SyncError};

const DIG_PER_DEC: usize = 9;
const DIG_TO_BYTES: [usize; DIG_PER_DEC + 1] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

/// The on-disk size of a decimal with the given precision and scale.
pub fn decimal_bin_size(precision: usize, scale: usize) -> usize {
    let intg = precision - scale;
    let intg0 = intg / DIG_PER_DEC;
    let frac0 = scale / DIG_PER_DEC;
    let intg0x = intg - intg0 * DIG_PER_DEC;
    let frac0x = scale - frac0 * DIG_PER_DEC;
    intg0 * 4 + DIG_TO_BYTES[intg0x] + frac0 * 4 + DIG_TO_BYTES[frac0x]
}

/// Decode one decimal value into its textual form.
pub fn decode_decimal(r: &mut BinReader<'_>, precision: usize, scale: usize) -> Result<String> {
    if scale > precision || precision == 0 {
        return Err(SyncError::protocol(format!(
            "invalid decimal precision {precision}, scale {scale}"
        )));
    }

    let intg = precision - scale;
    let intg0 = intg / DIG_PER_DEC;
    let frac0 = scale / DIG_PER_DEC;
    let intg0x = intg - intg0 * DIG_PER_DEC;
    let frac0x = scale - frac0 * DIG_PER_DEC;

    let size = intg0 * 4 + DIG_TO_BYTES[intg0x] + frac0 * 4 + DIG_TO_BYTES[frac0x];
    let mut buf = r.read_bytes(size)?.to_vec();

    // High bit of byte 0 is the sign; set means positive.
    let negative = buf[0] & 0x80 == 0;
    buf[0] ^= 0x80;
    if negative {
        // Stored as complement for binary sort order.
        for b in buf.iter_mut() {
            *b = !*b;
        }
    }

    let mut out = String::with_capacity(precision + 2);
    if negative {
        out.push('-');
    }

    let mut pos = 0;
    let mut int_part = String::new();

    // Compressed leading digits.
    if DIG_TO_BYTES[intg0x] > 0 {
        let v = number_be(&buf[pos..pos + DIG_TO_BYTES[intg0x]]);
        pos += DIG_TO_BYTES[intg0x];
        if v > 0 || intg0 == 0 {
            int_part.push_str(&v.to_string());
        }
    }

    // Full 9-digit integer groups.
    for _ in 0..intg0 {
        let v = number_be(&buf[pos..pos + 4]);
        pos += 4;
        if int_part.is_empty() {
            if v > 0 {
                int_part.push_str(&v.to_string());
            }
        } else {
            int_part.push_str(&format!("{v:09}"));
        }
    }

    if int_part.is_empty() {
        int_part.push('0');
    }
    out.push_str(&int_part);

    if scale > 0 {
        out.push('.');
        for _ in 0..frac0 {
            let v = number_be(&buf[pos..pos + 4]);
            pos += 4;
            out.push_str(&format!("{v:09}"));
        }
        if DIG_TO_BYTES[frac0x] > 0 {
            let v = number_be(&buf[pos..pos + DIG_TO_BYTES[frac0x]]);
            out.push_str(&format!("{v:0width$}", width = frac0x));
        }
    }

    Ok(out)
}
