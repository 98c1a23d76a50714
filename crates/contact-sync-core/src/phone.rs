//! Phone canonicalization.
//!
//! Canonical forms: `+91 XXXXX XXXXX`, `+1 XXX XXX XXXX`, otherwise `+<digits>`.
//! Ten-digit numbers without a country code are treated as Indian numbers.

const DEFAULT_COUNTRY_CODE: &str = "91";

/// Canonicalize one raw phone number. Returns an empty string when the input
/// carries no digits. Idempotent.
#[must_use]
pub fn normalize_phone(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_digit() || (ch == '+' && cleaned.is_empty()) {
            cleaned.push(ch);
        }
    }

    let has_plus = cleaned.starts_with('+');
    let mut digits = cleaned.trim_start_matches('+').to_string();
    if digits.is_empty() {
        return String::new();
    }

    if has_plus {
        // `+0` followed by a national number is a mistyped default-country number.
        if digits.starts_with('0') && digits.len() == 11 {
            digits = format!("{DEFAULT_COUNTRY_CODE}{}", &digits[1..]);
        }
    } else {
        if digits.starts_with('0') && digits.len() == 11 {
            digits.remove(0);
        }
        if digits.len() == 10 {
            digits = format!("{DEFAULT_COUNTRY_CODE}{digits}");
        }
    }

    format_canonical(&digits)
}

fn format_canonical(digits: &str) -> String {
    if digits.len() == 12 && digits.starts_with(DEFAULT_COUNTRY_CODE) {
        return format!("+91 {} {}", &digits[2..7], &digits[7..]);
    }
    if digits.len() == 11 && digits.starts_with('1') {
        return format!("+1 {} {} {}", &digits[1..4], &digits[4..7], &digits[7..]);
    }
    format!("+{digits}")
}

fn is_default_country(canonical: &str) -> bool {
    canonical.starts_with("+91")
}

/// Normalize, drop empties and exact duplicates (first wins), then place
/// non-`+91` numbers ahead of `+91` numbers, each group in input order.
#[must_use]
pub fn order_and_dedupe<S: AsRef<str>>(raws: &[S]) -> Vec<String> {
    let mut international: Vec<String> = Vec::new();
    let mut domestic: Vec<String> = Vec::new();
    for raw in raws {
        let canonical = normalize_phone(raw.as_ref());
        if canonical.is_empty()
            || international.contains(&canonical)
            || domestic.contains(&canonical)
        {
            continue;
        }
        if is_default_country(&canonical) {
            domestic.push(canonical);
        } else {
            international.push(canonical);
        }
    }
    international.extend(domestic);
    international
}
