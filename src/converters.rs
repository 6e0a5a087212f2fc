//! Cell converters. Every converter is total: malformed input yields an
//! empty value, never an error.

use chrono::NaiveDate;
use std::fmt;

use crate::values::CellValue;

/// Options shared by all converters of one import run.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub phone_region: String,
    pub true_values: Vec<String>,
    pub false_values: Vec<String>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            phone_region: "DE".to_string(),
            true_values: vec!["+".to_string(), "Ja".to_string()],
            false_values: vec!["-".to_string(), "Nein".to_string()],
        }
    }
}

pub type ConverterFn = fn(&str, &ConvertOptions) -> CellValue;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhoneNumber {
    pub country_code: u16,
    /// National significant number as digits; leading zeros are significant.
    pub national_number: String,
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{}{}", self.country_code, self.national_number)
    }
}

struct Region {
    code: &'static str,
    calling_code: u16,
    trunk_prefix: Option<&'static str>,
}

const REGIONS: &[Region] = &[
    Region { code: "DE", calling_code: 49, trunk_prefix: Some("0") },
    Region { code: "AT", calling_code: 43, trunk_prefix: Some("0") },
    Region { code: "CH", calling_code: 41, trunk_prefix: Some("0") },
    Region { code: "NL", calling_code: 31, trunk_prefix: Some("0") },
    Region { code: "BE", calling_code: 32, trunk_prefix: Some("0") },
    Region { code: "LU", calling_code: 352, trunk_prefix: None },
    Region { code: "FR", calling_code: 33, trunk_prefix: Some("0") },
    Region { code: "DK", calling_code: 45, trunk_prefix: None },
    Region { code: "PL", calling_code: 48, trunk_prefix: None },
    Region { code: "CZ", calling_code: 420, trunk_prefix: None },
    Region { code: "IT", calling_code: 39, trunk_prefix: None },
    Region { code: "ES", calling_code: 34, trunk_prefix: None },
    Region { code: "GB", calling_code: 44, trunk_prefix: Some("0") },
    Region { code: "US", calling_code: 1, trunk_prefix: Some("1") },
];

/// Two-digit ITU calling codes. 1 and 7 are the only one-digit codes; all
/// remaining codes have three digits.
const TWO_DIGIT_CALLING_CODES: &[u16] = &[
    20, 27, 30, 31, 32, 33, 34, 36, 39, 40, 41, 43, 44, 45, 46, 47, 48, 49, 51, 52, 53, 54, 55,
    56, 57, 58, 60, 61, 62, 63, 64, 65, 66, 81, 82, 84, 86, 90, 91, 92, 93, 94, 95, 98,
];

pub fn is_known_region(code: &str) -> bool {
    REGIONS.iter().any(|r| r.code.eq_ignore_ascii_case(code))
}

fn split_calling_code(digits: &str) -> Option<(u16, &str)> {
    let first = digits.chars().next()?;
    let len = if first == '1' || first == '7' {
        1
    } else if digits
        .get(..2)
        .and_then(|p| p.parse::<u16>().ok())
        .map(|cc| TWO_DIGIT_CALLING_CODES.contains(&cc))
        .unwrap_or(false)
    {
        2
    } else {
        3
    };
    let cc = digits.get(..len)?.parse::<u16>().ok()?;
    if cc == 0 {
        return None;
    }
    Some((cc, &digits[len..]))
}

/// Parse a phone number, inferring the country from `region` unless the
/// number carries an international prefix (`+` or `00`).
pub fn parse_phone_number(value: &str, region: &str) -> Option<PhoneNumber> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (international, rest) = match value.strip_prefix('+') {
        Some(r) => (true, r),
        None => (false, value),
    };
    if !rest
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '-' | '/' | '(' | ')' | '.'))
    {
        return None;
    }
    let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();

    let (country_code, national) = if international {
        split_calling_code(&digits)?
    } else if let Some(intl) = digits.strip_prefix("00") {
        split_calling_code(intl)?
    } else {
        let region = REGIONS
            .iter()
            .find(|r| r.code.eq_ignore_ascii_case(region))?;
        let national = match region.trunk_prefix {
            Some(prefix) => digits.strip_prefix(prefix).unwrap_or(&digits),
            None => digits.as_str(),
        };
        (region.calling_code, national)
    };

    if !(4..=14).contains(&national.len()) {
        return None;
    }
    Some(PhoneNumber {
        country_code,
        national_number: national.to_string(),
    })
}

const SEXES: &[(&str, &str)] = &[
    ("w", "f"),
    ("f", "f"),
    ("m", "m"),
    ("weiblich", "f"),
    ("männlich", "m"),
];

/// Map a sex word or letter onto its one-letter code; unknown input → "".
pub fn parse_sex(value: &str) -> String {
    let value = value.trim().to_lowercase();
    SEXES
        .iter()
        .find(|(k, _)| *k == value)
        .map(|(_, v)| v.to_string())
        .unwrap_or_default()
}

/// Strict `DD.MM.YYYY`.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(value, "%d.%m.%Y").ok()
}

pub fn parse_comma_separated(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .collect()
}

/// Boolean coercion with the configured extra token sets.
pub fn parse_bool(value: &str, opts: &ConvertOptions) -> Option<bool> {
    let t = value.trim();
    if opts.true_values.iter().any(|v| v == t) {
        return Some(true);
    }
    if opts.false_values.iter().any(|v| v == t) {
        return Some(false);
    }
    match t.to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

pub fn phone_number_cell(value: &str, opts: &ConvertOptions) -> CellValue {
    parse_phone_number(value, &opts.phone_region)
        .map(CellValue::Phone)
        .unwrap_or(CellValue::Empty)
}

pub fn sex_cell(value: &str, _opts: &ConvertOptions) -> CellValue {
    let code = parse_sex(value);
    if code.is_empty() {
        CellValue::Empty
    } else {
        CellValue::Text(code)
    }
}

pub fn date_cell(value: &str, _opts: &ConvertOptions) -> CellValue {
    parse_date(value).map(CellValue::Date).unwrap_or(CellValue::Empty)
}

pub fn comma_separated_cell(value: &str, _opts: &ConvertOptions) -> CellValue {
    CellValue::List(parse_comma_separated(value))
}

pub fn bool_cell(value: &str, opts: &ConvertOptions) -> CellValue {
    parse_bool(value, opts)
        .map(CellValue::Bool)
        .unwrap_or(CellValue::Empty)
}

pub fn integer_cell(value: &str, _opts: &ConvertOptions) -> CellValue {
    value
        .trim()
        .parse::<i64>()
        .map(CellValue::Integer)
        .unwrap_or(CellValue::Empty)
}
