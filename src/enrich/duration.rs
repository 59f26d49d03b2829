//! ISO-8601 duration strings, as reported by the Data API and embedded in
//! watch pages (`PT8M11S`, `PT1H2M3S`, `P1DT1S`, `P0D`).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("duration must start with 'P': {0:?}")]
    MissingPrefix(String),
    #[error("duration has no components: {0:?}")]
    Empty(String),
    #[error("unexpected {found:?} in duration {input:?}")]
    Unexpected { input: String, found: char },
    #[error("duration out of range: {0:?}")]
    Overflow(String),
}

/// Parses an ISO-8601 duration into whole seconds.
///
/// Weeks, days, hours, minutes and seconds are supported; fractional seconds
/// are truncated. Years and months have no fixed length and are rejected.
///
/// ```
/// use tubefeed::enrich::parse_iso8601_duration;
///
/// assert_eq!(parse_iso8601_duration("PT8M11S"), Ok(491));
/// assert_eq!(parse_iso8601_duration("P1DT1S"), Ok(86_401));
/// ```
pub fn parse_iso8601_duration(input: &str) -> Result<u64, DurationParseError> {
    let text = input.trim();
    let body = text
        .strip_prefix('P')
        .or_else(|| text.strip_prefix('p'))
        .ok_or_else(|| DurationParseError::MissingPrefix(input.to_owned()))?;

    let unexpected = |found| DurationParseError::Unexpected {
        input: input.to_owned(),
        found,
    };
    let overflow = || DurationParseError::Overflow(input.to_owned());

    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut in_time = false;
    let mut components = 0;

    for c in body.chars() {
        match c.to_ascii_uppercase() {
            '0'..='9' | '.' | ',' => digits.push(c),
            'T' if !in_time && digits.is_empty() => in_time = true,
            designator => {
                if digits.is_empty() {
                    return Err(unexpected(c));
                }
                let unit: u64 = match (designator, in_time) {
                    ('W', false) => 7 * 86_400,
                    ('D', false) => 86_400,
                    ('H', true) => 3_600,
                    ('M', true) => 60,
                    ('S', true) => 1,
                    _ => return Err(unexpected(c)),
                };
                let whole = whole_part(&digits).ok_or_else(|| unexpected(c))?;
                total = whole
                    .checked_mul(unit)
                    .and_then(|secs| total.checked_add(secs))
                    .ok_or_else(overflow)?;
                digits.clear();
                components += 1;
            }
        }
    }

    if !digits.is_empty() || components == 0 {
        return Err(DurationParseError::Empty(input.to_owned()));
    }
    Ok(total)
}

/// Integer part of a decimal like `11`, `11.5` or `11,5`.
fn whole_part(digits: &str) -> Option<u64> {
    let whole = digits.split(['.', ',']).next().unwrap_or_default();
    if whole.is_empty() {
        return (digits.len() > 1).then_some(0);
    }
    whole.parse().ok()
}
