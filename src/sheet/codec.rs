//! Fixed-radix packing of tokens into short strings.
//!
//! Every token becomes a signed fixed-point number with two decimal places
//! (`key.dd` for notes where `dd` is the duration in tens of milliseconds,
//! `-ms` for rests), scaled by 100 and folded into 21 unsigned bits. That
//! value is written as exactly three base-128 digits drawn from [`ALPHABET`].
//! Codes are appended to blocks of at most [`BLOCK_LEN`] characters and are
//! never split between blocks, so decoding can concatenate and read with a
//! fixed stride.
//!
//! Out of range values are clamped and unknown symbols read as digit 0;
//! neither encoding nor decoding can fail.

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::sheet::Token;

/// The 128 symbols, in digit order. Symbol 0 is the pad digit.
pub const ALPHABET: &str = "0!@#$%^&*+ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz\
ΑΒΓΔΕΖΗΘΙΚΛΜαβγδεζηθικλμΝΞΟΠΡΣΤΥΦΧΨΩνξοπρστυφχψωÀÁÂÃÄÅÆÇÈÉÊËàáâãäå";

/// Maximum characters per block.
pub const BLOCK_LEN: usize = 128;
/// Symbols per code: 21 bits at 7 bits per symbol.
pub const CODE_WIDTH: usize = 3;

const RADIX: u32 = 128;
/// Folded values at or above this are negative.
const SIGN_THRESHOLD: i64 = 1 << 20;
const RANGE: i64 = 1 << 21;
const SCALE: i64 = 100;

lazy_static! {
    static ref SYMBOLS: Vec<char> = ALPHABET.chars().collect();
    static ref ORDINALS: HashMap<char, u32> = ALPHABET
        .chars()
        .enumerate()
        .map(|(i, c)| (c, i as u32))
        .collect();
}

/// The token as a fixed-point number times 100.
///
/// Note durations are quantized to 10 ms and saturate at 990 ms, the most
/// two decimal places can hold.
pub fn scale(token: &Token) -> i64 {
    match *token {
        Token::Rest { ms } => ms.max(0).saturating_mul(-SCALE),
        Token::Note { key, duration_ms } => {
            let tens = ((i64::from(duration_ms) + 5) / 10).clamp(0, SCALE - 1);
            i64::from(key) * SCALE + tens
        }
    }
}

/// Fold a signed scaled value into `0..2^21`, clamping each half.
pub fn fold(scaled: i64) -> u32 {
    let folded = if scaled < 0 {
        scaled.saturating_add(RANGE).clamp(SIGN_THRESHOLD, RANGE - 1)
    } else {
        scaled.clamp(0, SIGN_THRESHOLD - 1)
    };
    folded as u32
}

fn unfold(value: u32) -> i64 {
    let value = i64::from(value);
    if value >= SIGN_THRESHOLD {
        value - RANGE
    } else {
        value
    }
}

fn unscale(signed: i64) -> Token {
    if signed < 0 {
        // round(|v| / 100)
        Token::Rest {
            ms: (-signed + SCALE / 2) / SCALE,
        }
    } else {
        Token::Note {
            key: (signed / SCALE) as i32,
            duration_ms: ((signed % SCALE) * 10) as i32,
        }
    }
}

/// Big-endian base-128, left-padded with symbol 0.
pub fn encode_value(value: u32) -> [char; CODE_WIDTH] {
    let mut code = [SYMBOLS[0]; CODE_WIDTH];
    let mut num = value;
    for slot in code.iter_mut().rev() {
        *slot = SYMBOLS[(num % RADIX) as usize];
        num /= RADIX;
    }
    code
}

pub fn decode_value(code: &[char]) -> u32 {
    code.iter().fold(0, |value, c| {
        value * RADIX + ORDINALS.get(c).copied().unwrap_or(0)
    })
}

/// Pack tokens into blocks of at most [`BLOCK_LEN`] characters.
pub fn encode(tokens: &[Token]) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for token in tokens {
        let code = encode_value(fold(scale(token)));
        if current_len + CODE_WIDTH > BLOCK_LEN {
            blocks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.extend(code);
        current_len += CODE_WIDTH;
    }

    if current_len > 0 {
        blocks.push(current);
    }
    blocks
}

/// Unpack up to `expected` tokens. A trailing partial code is ignored.
pub fn decode<S: AsRef<str>>(blocks: &[S], expected: usize) -> Vec<Token> {
    let symbols: Vec<char> = blocks
        .iter()
        .flat_map(|block| block.as_ref().chars())
        .take(expected.saturating_mul(CODE_WIDTH))
        .collect();

    symbols
        .chunks_exact(CODE_WIDTH)
        .map(|code| unscale(unfold(decode_value(code))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(token: Token) -> Token {
        let blocks = encode(&[token]);
        let decoded = decode(&blocks, 1);
        assert_eq!(decoded.len(), 1);
        decoded[0]
    }

    #[test]
    fn alphabet_has_128_distinct_symbols() {
        assert_eq!(SYMBOLS.len(), 128);
        assert_eq!(ORDINALS.len(), 128);
    }

    #[test]
    fn rest_on_grid_round_trips_exactly() {
        assert_eq!(round_trip(Token::Rest { ms: 100 }), Token::Rest { ms: 100 });
        assert_eq!(round_trip(Token::Rest { ms: 1 }), Token::Rest { ms: 1 });
        assert_eq!(round_trip(Token::Rest { ms: 10_485 }), Token::Rest { ms: 10_485 });
    }

    #[test]
    fn note_duration_is_quantized_to_ten_ms() {
        assert_eq!(
            round_trip(Token::Note { key: 25, duration_ms: 480 }),
            Token::Note { key: 25, duration_ms: 480 }
        );
        assert_eq!(
            round_trip(Token::Note { key: 25, duration_ms: 484 }),
            Token::Note { key: 25, duration_ms: 480 }
        );
        assert_eq!(
            round_trip(Token::Note { key: 65, duration_ms: 485 }),
            Token::Note { key: 65, duration_ms: 490 }
        );
        assert_eq!(
            round_trip(Token::Note { key: 25, duration_ms: 1000 }),
            Token::Note { key: 25, duration_ms: 990 }
        );
    }

    #[test]
    fn quantized_values_are_stable() {
        for token in [
            Token::Note { key: 12, duration_ms: 330 },
            Token::Rest { ms: 7_777 },
            Token::TERMINATOR,
        ] {
            let once = round_trip(token);
            assert_eq!(round_trip(once), once);
        }
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        assert_eq!(fold(-1), (RANGE - 1) as u32);
        assert_eq!(fold(-RANGE * 4), SIGN_THRESHOLD as u32);
        assert_eq!(fold(SIGN_THRESHOLD), (SIGN_THRESHOLD - 1) as u32);
        assert_eq!(fold(i64::MIN), SIGN_THRESHOLD as u32);

        assert_eq!(round_trip(Token::Rest { ms: 60_000 }), Token::Rest { ms: 10_486 });
        assert_eq!(
            round_trip(Token::Note { key: 20_000, duration_ms: 0 }),
            Token::Note { key: 10_485, duration_ms: 750 }
        );
    }

    #[test]
    fn codes_are_three_symbols() {
        assert_eq!(encode_value(0), ['0', '0', '0']);
        assert_eq!(encode_value(1), ['0', '0', '!']);
        assert_eq!(encode_value((RANGE - 1) as u32), ['å', 'å', 'å']);
        assert_eq!(decode_value(&encode_value(123_456)), 123_456);
    }

    #[test]
    fn blocks_never_exceed_limit_or_split_codes() {
        for count in [0usize, 1, 42, 43, 100, 1000] {
            let tokens: Vec<Token> = (0..count)
                .map(|i| Token::Note { key: (i % 60) as i32 + 1, duration_ms: 120 })
                .collect();
            let blocks = encode(&tokens);

            let mut total = 0;
            for block in &blocks {
                let len = block.chars().count();
                assert!(len <= BLOCK_LEN);
                assert!(len > 0);
                assert_eq!(len % CODE_WIDTH, 0);
                total += len;
            }
            assert_eq!(total, count * CODE_WIDTH);
            assert_eq!(decode(&blocks, count), tokens);
        }
        assert!(encode(&[]).is_empty());
    }

    #[test]
    fn unknown_symbols_read_as_zero() {
        // '?' is not in the alphabet
        assert_eq!(decode(&["0?!"], 1), vec![Token::Note { key: 0, duration_ms: 10 }]);
    }

    #[test]
    fn decode_stops_at_expected_count_and_partial_codes() {
        let blocks = encode(&[Token::Rest { ms: 10 }, Token::Note { key: 3, duration_ms: 50 }]);
        assert_eq!(decode(&blocks, 1), vec![Token::Rest { ms: 10 }]);
        assert_eq!(decode(&blocks, 5).len(), 2);
        assert!(decode(&["00"], 1).is_empty());
        assert!(decode::<&str>(&[], 3).is_empty());
    }
}
