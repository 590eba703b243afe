//! MediaWiki's compact `YYYYMMDDHHMMSS` timestamps.

use time::{Duration, PrimitiveDateTime, UtcDateTime, format_description::BorrowedFormatItem, macros::format_description};

use crate::error::{ErrorKind, Result};

const FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year][month][day][hour][minute][second]");

/// Parse a MediaWiki timestamp.
///
/// Absent timestamps stay absent. Malformed ones collapse to one second past
/// the epoch, which is what the source system stores for unknown dates.
pub fn parse(value: Option<&str>) -> Option<UtcDateTime> {
    let value = value?;
    Some(parse_strict(value).unwrap_or_else(|_| UtcDateTime::UNIX_EPOCH + Duration::seconds(1)))
}

/// Parse a MediaWiki timestamp, failing on malformed input.
pub fn parse_strict(value: &str) -> Result<UtcDateTime> {
    let parsed = PrimitiveDateTime::parse(value.trim(), FORMAT).map_err(|_| ErrorKind::ParseError {
        field: "timestamp",
        value: value.to_string(),
    })?;
    Ok(parsed.as_utc())
}

pub fn format(value: UtcDateTime) -> String {
    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}",
        value.year(),
        u8::from(value.month()),
        value.day(),
        value.hour(),
        value.minute(),
        value.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_valid_timestamp() {
        let parsed = parse(Some("20210315120001")).unwrap();
        assert_eq!(parsed.unix_timestamp(), 1_615_809_601);
        assert_eq!(format(parsed), "20210315120001");
    }

    #[rstest]
    #[case("2021-03-15")]
    #[case("20211315120000")]
    #[case("")]
    fn test_malformed_timestamps_fall_back(#[case] value: &str) {
        assert_eq!(parse(Some(value)).unwrap().unix_timestamp(), 1);
        assert!(parse_strict(value).is_err());
    }

    #[test]
    fn test_absent_timestamp() {
        assert_eq!(parse(None), None);
    }
}
