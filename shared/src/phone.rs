//! Phone number normalization.
//!
//! Every call log is keyed by the canonical form produced here, so the same
//! caller always lands in the same key range regardless of how the telephony
//! provider or a client formatted the number.

/// Normalize a raw phone number into its canonical key.
///
/// Only ASCII digits and `+` are kept. Japanese numbers in international form
/// (`+81...`) become domestic (`0...`), any other leading `+` is dropped.
/// Returns `None` when nothing usable remains.
pub fn normalize_phone(raw: Option<&str>) -> Option<String> {
    let raw = raw?;
    if raw.is_empty() {
        return None;
    }

    let digits: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();

    if let Some(rest) = digits.strip_prefix("+81") {
        if !rest.is_empty() {
            return Some(if rest.starts_with('0') {
                rest.to_string()
            } else {
                format!("0{}", rest)
            });
        }
    }

    let canonical = digits.strip_prefix('+').unwrap_or(&digits);
    if canonical.is_empty() {
        None
    } else {
        Some(canonical.to_string())
    }
}
