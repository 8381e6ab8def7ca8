//! Permissive hex decoding for key material.
//!
//! Keys arrive from environment variables and files that humans edit, so
//! the decoder accepts either case and skips ASCII whitespace, `:`, and `-`
//! separators. Encoding always goes through [`hex::encode`] (lowercase).

use thiserror::Error;

/// Errors produced by [`decode`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HexError {
    /// A character that is neither a hex digit nor an accepted separator.
    #[error("invalid hex character: {character:?}")]
    InvalidCharacter {
        /// The offending character.
        character: char,
    },

    /// The input held an odd number of hex digits.
    #[error("odd number of hex digits")]
    OddLength,
}

/// Decodes a hex string, skipping whitespace, `:`, and `-` separators.
///
/// # Errors
///
/// Returns [`HexError::InvalidCharacter`] for any other non-digit input and
/// [`HexError::OddLength`] when the digit count is odd.
pub fn decode(input: &str) -> Result<Vec<u8>, HexError> {
    let mut out = Vec::with_capacity(input.len() / 2);
    let mut pending: Option<u8> = None;

    for character in input.chars() {
        if character.is_ascii_whitespace() || character == ':' || character == '-' {
            continue;
        }
        let nibble = character
            .to_digit(16)
            .ok_or(HexError::InvalidCharacter { character })?;
        #[allow(clippy::cast_possible_truncation)] // a hex digit fits in u8
        let nibble = nibble as u8;
        match pending.take() {
            Some(high) => out.push((high << 4) | nibble),
            None => pending = Some(nibble),
        }
    }

    if pending.is_some() {
        return Err(HexError::OddLength);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain() {
        assert_eq!(decode("deadbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_decode_mixed_case() {
        assert_eq!(decode("DeadBEEF").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_decode_with_separators() {
        assert_eq!(
            decode("de:ad-be ef\n").unwrap(),
            vec![0xde, 0xad, 0xbe, 0xef]
        );
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(decode("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_decode_odd_length() {
        assert_eq!(decode("abc").unwrap_err(), HexError::OddLength);
    }

    #[test]
    fn test_decode_invalid_character() {
        assert_eq!(
            decode("zz").unwrap_err(),
            HexError::InvalidCharacter { character: 'z' }
        );
    }

    #[test]
    fn test_roundtrip_with_hex_encode() {
        let bytes = vec![0x00, 0x01, 0xff, 0x7f];
        assert_eq!(decode(&hex::encode(&bytes)).unwrap(), bytes);
    }
}
