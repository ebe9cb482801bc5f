//! Temporal normalizer
//!
//! Rewrites natural-language date expressions into canonical `YYYY-MM-DD`
//! and projects creation dates to a timezone-local midnight instant.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Utc};

/// IANA timezone name → fixed offset (hours east of UTC).
///
/// The mobile clients only ship a handful of Latin American and European
/// zones; anything unknown falls back to UTC.
const ZONE_OFFSETS: &[(&str, i32)] = &[
    ("UTC", 0),
    ("America/Mexico_City", -6),
    ("America/Monterrey", -6),
    ("America/Bogota", -5),
    ("America/Lima", -5),
    ("America/Guayaquil", -5),
    ("America/Santiago", -4),
    ("America/Caracas", -4),
    ("America/La_Paz", -4),
    ("America/Argentina/Buenos_Aires", -3),
    ("America/Montevideo", -3),
    ("America/Sao_Paulo", -3),
    ("America/New_York", -5),
    ("America/Los_Angeles", -8),
    ("Europe/Madrid", 1),
];

const MONTHS: &[(&str, u32)] = &[
    ("enero", 1),
    ("febrero", 2),
    ("marzo", 3),
    ("abril", 4),
    ("mayo", 5),
    ("junio", 6),
    ("julio", 7),
    ("agosto", 8),
    ("septiembre", 9),
    ("setiembre", 9),
    ("octubre", 10),
    ("noviembre", 11),
    ("diciembre", 12),
];

/// Fixed offset for a caller-supplied IANA zone name; UTC when unknown.
pub fn zone_offset(timezone: Option<&str>) -> FixedOffset {
    let hours = timezone
        .and_then(|tz| {
            ZONE_OFFSETS
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(tz.trim()))
                .map(|(_, h)| *h)
        })
        .unwrap_or(0);
    FixedOffset::east_opt(hours * 3600).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap())
}

/// Today's calendar date in the caller's timezone.
pub fn today_in_zone(timezone: Option<&str>) -> NaiveDate {
    Utc::now().with_timezone(&zone_offset(timezone)).date_naive()
}

/// Normalize a date value to canonical `YYYY-MM-DD`.
///
/// Accepts ISO, `DD/MM/YYYY`, `DD-MM-YYYY`, `DD.MM.YYYY`, compact
/// `YYYYMMDD`, and the Spanish long form ("12 de julio de 2025", year
/// optional — defaults to `today`'s year).
pub fn normalize_date(input: &str, today: NaiveDate) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    const FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y%m%d"];
    for format in FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }

    parse_spanish_long_form(trimmed, today).map(|d| d.format("%Y-%m-%d").to_string())
}

/// "12 de julio de 2025" / "12 de julio" / "12 julio".
fn parse_spanish_long_form(input: &str, today: NaiveDate) -> Option<NaiveDate> {
    let lowered = input.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split_whitespace()
        .filter(|t| *t != "de" && *t != "del")
        .collect();

    if tokens.is_empty() || tokens.len() > 3 {
        return None;
    }

    let day: u32 = tokens[0].parse().ok()?;
    let month = tokens
        .get(1)
        .and_then(|name| MONTHS.iter().find(|(m, _)| m == name).map(|(_, n)| *n))?;
    let year: i32 = match tokens.get(2) {
        Some(y) => y.parse().ok()?,
        None => today.year(),
    };

    NaiveDate::from_ymd_opt(year, month, day)
}

/// Relative expression → day delta from the reference date. Includes
/// accentless and common misspelled variants; multi-word phrases first so
/// "pasado mañana" does not collapse into "mañana".
const RELATIVE_EXPRESSIONS: &[(&str, i64)] = &[
    ("pasado mañana", 2),
    ("pasado manana", 2),
    ("ante ayer", -2),
    ("anteayer", -2),
    ("antier", -2),
    ("mañana", 1),
    ("manana", 1),
    ("ayer", -1),
    ("hoy", 0),
    ("day after tomorrow", 2),
    ("day before yesterday", -2),
    ("tomorrow", 1),
    ("yesterday", -1),
    ("today", 0),
];

/// Replace whole-word relative date expressions anywhere in free text with
/// the canonical date computed from `today`. Applied to the entire user
/// message before it reaches the reasoning service.
pub fn replace_relative_dates(text: &str, today: NaiveDate) -> String {
    let mut result = text.to_string();
    for (expression, delta) in RELATIVE_EXPRESSIONS {
        let date = today + Duration::days(*delta);
        result = replace_whole_word(&result, expression, &date.format("%Y-%m-%d").to_string());
    }
    result
}

/// Case-insensitive whole-word replacement without a regex dependency.
/// Char-based so multi-byte Spanish text never splits a boundary.
fn replace_whole_word(text: &str, word: &str, replacement: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let needle: Vec<char> = word.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        let end = i + needle.len();
        let window_matches = end <= chars.len()
            && chars[i..end]
                .iter()
                .zip(&needle)
                .all(|(a, b)| a.to_lowercase().eq(b.to_lowercase()));

        if window_matches {
            let boundary_before = i == 0 || !chars[i - 1].is_alphanumeric();
            let boundary_after = end == chars.len() || !chars[end].is_alphanumeric();

            if boundary_before && boundary_after {
                out.push_str(replacement);
                i = end;
                continue;
            }
        }

        out.push(chars[i]);
        i += 1;
    }

    out
}

/// Project a canonical date to the instant of local midnight in the
/// caller's timezone. Only used for inserts; update/delete criteria match
/// on the date component alone.
pub fn local_midnight_instant(date: NaiveDate, timezone: Option<&str>) -> DateTime<Utc> {
    let offset = zone_offset(timezone);
    let midnight = date.and_time(chrono::NaiveTime::MIN);
    offset
        .from_local_datetime(&midnight)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}
