//! Plate-string matching.
//!
//! Gateway OCR is unreliable on the hangul/letter portion of a plate, so
//! comparisons fall back to the trailing 3-4 digits. Tie-breaks are
//! deterministic: exact match first, then smallest spot-id distance, then
//! lowest stored record id.

use std::sync::LazyLock;

use regex::Regex;

static TRAILING_DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{3,4})$").expect("static regex is valid"));

/// Extract the trailing 3-4 digit group of a plate, if present.
pub fn trailing_digits(plate: &str) -> Option<&str> {
    TRAILING_DIGITS_RE
        .captures(plate)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Entry-check comparison: does a gateway-reported plate plausibly belong
/// to the requested vehicle?
///
/// The requested plate's trailing digits must appear inside the reported
/// plate's trailing digits (substring, not equality, since partial reads
/// may glue extra characters on).
pub fn report_matches_request(requested: &str, reported: &str) -> bool {
    match (trailing_digits(requested), trailing_digits(reported)) {
        (Some(req), Some(rep)) => rep.contains(req),
        _ => false,
    }
}

/// A stored occupancy row eligible for reconciliation matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredPlate<'a> {
    pub record_id: i64,
    pub spot_id: i64,
    pub plate: &'a str,
}

/// Find the stored record best matching a scanned `(spot, plate)` pair.
///
/// Exact plate matches win outright (lowest record id among them). When
/// none exists, trailing-digit equality applies, preferring the record
/// whose spot is numerically closest to the scanned spot, then the lowest
/// record id.
pub fn best_match<'a>(
    scanned_plate: &str,
    scanned_spot: i64,
    stored: &'a [StoredPlate<'a>],
) -> Option<&'a StoredPlate<'a>> {
    if let Some(exact) = stored
        .iter()
        .filter(|s| s.plate == scanned_plate)
        .min_by_key(|s| s.record_id)
    {
        return Some(exact);
    }

    let scanned_digits = trailing_digits(scanned_plate)?;
    stored
        .iter()
        .filter(|s| trailing_digits(s.plate) == Some(scanned_digits))
        .min_by_key(|s| ((s.spot_id - scanned_spot).abs(), s.record_id))
}

/// True when a plate matches any member of a registered-plate set, exactly
/// or by trailing digits.
pub fn fuzzy_member<'a, I>(plate: &str, registered: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    let digits = trailing_digits(plate);
    for candidate in registered {
        if candidate == plate {
            return true;
        }
        if let Some(d) = digits
            && trailing_digits(candidate) == Some(d)
        {
            return true;
        }
    }
    false
}
