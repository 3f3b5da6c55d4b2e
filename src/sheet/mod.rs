//! The serialized sheet: rest/note tokens, their text dump, and the packed
//! fixed-alphabet encoding.

pub mod codec;
pub mod verify;

use std::fmt;
use std::str::FromStr;

use crate::error::TokenParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    /// Silence before the next note starts, in milliseconds.
    Rest { ms: i64 },
    /// `key` is the pitch minus 35.
    Note { key: i32, duration_ms: i32 },
}

impl Token {
    /// Pads the end of every sheet.
    pub const TERMINATOR: Token = Token::Note {
        key: 0,
        duration_ms: 0,
    };

    pub fn is_note(&self) -> bool {
        matches!(self, Token::Note { .. })
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Rest { ms } => write!(f, "-{}", ms),
            Token::Note { key, duration_ms } => write!(f, "{}.{}", key, duration_ms),
        }
    }
}

impl FromStr for Token {
    type Err = TokenParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let err = || TokenParseError(s.to_string());

        if let Some(ms) = s.strip_prefix('-') {
            let ms: i64 = ms.parse().map_err(|_| err())?;
            if ms < 0 {
                return Err(err());
            }
            return Ok(Token::Rest { ms });
        }

        let (key, duration) = s.split_once('.').ok_or_else(err)?;
        Ok(Token::Note {
            key: key.parse().map_err(|_| err())?,
            duration_ms: duration.parse().map_err(|_| err())?,
        })
    }
}

/// One token per line.
pub fn dump_tokens(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(Token::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Read a dump back; blank lines are skipped.
pub fn parse_token_dump(text: &str) -> Result<Vec<Token>, TokenParseError> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_form() {
        assert_eq!(Token::Rest { ms: 250 }.to_string(), "-250");
        assert_eq!(Token::Note { key: 25, duration_ms: 1000 }.to_string(), "25.1000");
        assert_eq!(Token::TERMINATOR.to_string(), "0.0");
    }

    #[test]
    fn parses_dump() {
        let tokens = parse_token_dump("-120\n25.480\n\n 3.0 \n").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Rest { ms: 120 },
                Token::Note { key: 25, duration_ms: 480 },
                Token::Note { key: 3, duration_ms: 0 },
            ]
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!("abc".parse::<Token>(), Err(TokenParseError("abc".into())));
        assert!("--5".parse::<Token>().is_err());
        assert!("25".parse::<Token>().is_err());
        assert!("25.x".parse::<Token>().is_err());
        assert!(parse_token_dump("-1\nnope").is_err());
    }

    #[test]
    fn dump_is_line_per_token() {
        let tokens = [Token::Rest { ms: 5 }, Token::Note { key: 1, duration_ms: 20 }];
        let text = dump_tokens(&tokens);
        assert_eq!(text, "-5\n1.20");
        assert_eq!(parse_token_dump(&text).unwrap(), tokens);
    }
}
