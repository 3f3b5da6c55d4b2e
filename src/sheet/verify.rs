use crate::sheet::Token;

/// Below this match rate a round trip is worth a warning.
pub const ACCEPTABLE_MATCH_RATE: f64 = 0.95;

/// Largest difference, in milliseconds, still counted as a match.
const TOLERANCE_MS: i64 = 10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Verification {
    pub match_rate: f64,
    pub mismatched: Vec<usize>,
    pub compared: usize,
}

impl Verification {
    pub fn is_acceptable(&self) -> bool {
        self.match_rate >= ACCEPTABLE_MATCH_RATE
    }
}

fn tokens_match(a: &Token, b: &Token) -> bool {
    match (a, b) {
        (Token::Rest { ms: x }, Token::Rest { ms: y }) => (x - y).abs() < TOLERANCE_MS,
        (
            Token::Note { key: ka, duration_ms: da },
            Token::Note { key: kb, duration_ms: db },
        ) => ka == kb && (i64::from(*da) - i64::from(*db)).abs() < TOLERANCE_MS,
        _ => false,
    }
}

/// Compare two token streams position by position.
pub fn verify(original: &[Token], decoded: &[Token]) -> Verification {
    let mismatched: Vec<usize> = original
        .iter()
        .zip(decoded)
        .enumerate()
        .filter(|(_, (a, b))| !tokens_match(a, b))
        .map(|(i, _)| i)
        .collect();

    let compared = original.len().min(decoded.len());
    let match_rate = if compared == 0 {
        0.0
    } else {
        (compared - mismatched.len()) as f64 / compared as f64
    };

    Verification {
        match_rate,
        mismatched,
        compared,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerance_is_strictly_below_ten_ms() {
        let original = [
            Token::Rest { ms: 100 },
            Token::Note { key: 5, duration_ms: 200 },
            Token::Note { key: 5, duration_ms: 200 },
            Token::Rest { ms: 100 },
        ];
        let decoded = [
            Token::Rest { ms: 109 },
            Token::Note { key: 5, duration_ms: 210 },
            Token::Note { key: 6, duration_ms: 200 },
            Token::Note { key: 0, duration_ms: 100 },
        ];
        let result = verify(&original, &decoded);

        assert_eq!(result.compared, 4);
        assert_eq!(result.mismatched, vec![1, 2, 3]);
        assert_eq!(result.match_rate, 0.25);
        assert!(!result.is_acceptable());
    }

    #[test]
    fn compares_shortest_prefix() {
        let original = [Token::Rest { ms: 1 }, Token::TERMINATOR];
        let result = verify(&original, &original[..1]);
        assert_eq!(result.compared, 1);
        assert_eq!(result.match_rate, 1.0);
        assert!(result.is_acceptable());
    }

    #[test]
    fn nothing_to_compare() {
        assert_eq!(verify(&[], &[Token::TERMINATOR]).match_rate, 0.0);
    }
}
