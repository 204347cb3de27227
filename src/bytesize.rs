//! Parsing of human-readable block-size specs like `"512kb"` or `"1mb"`.

use crate::error::{Error, Result};

/// Parse a block-size spec: digits followed by an optional unit suffix.
///
/// Accepted suffixes (case-insensitive): `b` for bytes, `kb` for KiB, `mb`
/// for MiB. The value must be positive; signs, unknown suffixes and trailing
/// garbage are rejected.
pub fn parse_block_size(spec: &str) -> Result<u64> {
    let digits_end = spec
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(spec.len());
    let (digits, suffix) = spec.split_at(digits_end);
    if digits.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "invalid block size \"{spec}\""
        )));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid block size \"{spec}\"")))?;
    let multiplier = match suffix.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1024,
        "mb" => 1024 * 1024,
        _ => {
            return Err(Error::InvalidArgument(format!(
                "invalid block size suffix \"{suffix}\""
            )))
        }
    };
    let bytes = value.checked_mul(multiplier).ok_or_else(|| {
        Error::InvalidArgument(format!("block size \"{spec}\" overflows"))
    })?;
    if bytes == 0 {
        return Err(Error::InvalidArgument(
            "block size must be positive".to_string(),
        ));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_and_byte_suffix() {
        assert_eq!(parse_block_size("10").unwrap(), 10);
        assert_eq!(parse_block_size("1b").unwrap(), 1);
        assert_eq!(parse_block_size("1B").unwrap(), 1);
    }

    #[test]
    fn test_kilo_and_mega_suffixes() {
        assert_eq!(parse_block_size("1kb").unwrap(), 1024);
        assert_eq!(parse_block_size("1Kb").unwrap(), 1024);
        assert_eq!(parse_block_size("2KB").unwrap(), 2048);
        assert_eq!(parse_block_size("1mb").unwrap(), 1024 * 1024);
        assert_eq!(parse_block_size("1mB").unwrap(), 1024 * 1024);
    }

    #[test]
    fn test_rejects_malformed_specs() {
        for spec in [
            "", "-1", "foo", "1g", "1k", "1m", "1-1", "-1k", "-1kb", "1kbx", "0",
        ] {
            assert!(parse_block_size(spec).is_err(), "{spec:?} should fail");
        }
    }
}
