//! Terminal symbol extraction and reassembly.
//!
//! Text is split by Unicode scalar value; UTF-16 input has surrogate pairs combined into one
//! scalar before it becomes a terminal. Terminals are carried as non-negative `i64` so grammar
//! rules can use the negative range.

use strata_store::{Seed, SeedKind};

use crate::error::{IngestError, Result};

/// Terminal symbols of a string, one per Unicode scalar value.
pub fn text_symbols(text: &str) -> Vec<i64> {
    text.chars().map(|c| c as u32 as i64).collect()
}

/// Terminal symbols of UTF-16 code units. Surrogate pairs become one symbol; an unpaired
/// surrogate is a validation error naming its offset.
pub fn utf16_symbols(units: &[u16]) -> Result<Vec<i64>> {
    let mut symbols = Vec::with_capacity(units.len());
    let mut offset = 0usize;
    for decoded in char::decode_utf16(units.iter().copied()) {
        match decoded {
            Ok(c) => {
                symbols.push(c as u32 as i64);
                offset += c.len_utf16();
            }
            Err(e) => {
                return Err(IngestError::Validation(format!(
                    "unpaired surrogate 0x{:04X} at code unit {}",
                    e.unpaired_surrogate(),
                    offset
                )))
            }
        }
    }
    Ok(symbols)
}

/// Terminal symbols of raw integer values.
pub fn integer_symbols(values: &[u32]) -> Vec<i64> {
    values.iter().map(|&v| v as i64).collect()
}

/// Terminal symbols of float bit patterns.
pub fn float_symbols(values: &[f32]) -> Vec<i64> {
    values.iter().map(|v| v.to_bits() as i64).collect()
}

/// Seed for one terminal. Negative or over-wide symbols, and non-scalar values under
/// [`SeedKind::Unicode`], are rejected.
pub fn terminal_seed(symbol: i64, kind: SeedKind) -> Result<Seed> {
    let value = u32::try_from(symbol)
        .map_err(|_| IngestError::Validation(format!("terminal {} out of range", symbol)))?;
    if kind == SeedKind::Unicode && char::from_u32(value).is_none() {
        return Err(IngestError::Validation(format!(
            "terminal 0x{:X} is not a Unicode scalar value",
            value
        )));
    }
    Ok(Seed::new(kind, value))
}

/// Reassemble exported terminals into text.
pub fn symbols_to_text(symbols: &[u32]) -> Result<String> {
    symbols
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            char::from_u32(v).ok_or_else(|| {
                IngestError::Validation(format!(
                    "exported symbol 0x{:X} at index {} is not a Unicode scalar value",
                    v, i
                ))
            })
        })
        .collect()
}
