//! Phone-number normalization.
//!
//! Turns user-typed or modem-reported numbers into E.164 (`+<cc><national>`)
//! using a region hint, so the same subscriber always yields the same string
//! regardless of formatting. Numbers that cannot be placed in a numbering
//! plan (short codes, unknown regions) come back as bare digits.

/// Maximum number of digits in an E.164 number (country code included).
const MAX_E164_DIGITS: usize = 15;

/// National numbers shorter than this are treated as carrier short codes.
const MIN_NATIONAL_DIGITS: usize = 7;

/// Characters users and modems put between digits.
const SEPARATORS: &[char] = &[' ', '-', '.', '(', ')', '/', '\u{a0}', '\t'];

/// Errors from phone-number normalization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhoneError {
    /// Input was empty after trimming separators.
    #[error("empty phone number")]
    Empty,

    /// Input contains characters that cannot appear in a dialable number.
    #[error("not a phone number: {0:?}")]
    InvalidCharacters(String),

    /// More digits than any numbering plan allows.
    #[error("phone number too long: {0} digits")]
    TooLong(usize),

    /// An international prefix with nothing after it.
    #[error("phone number has no subscriber digits: {0:?}")]
    MissingDigits(String),
}

/// Calling codes for the regions we can derive or that users commonly set.
const CALLING_CODES: &[(&str, &str)] = &[
    ("AR", "54"),
    ("AT", "43"),
    ("AU", "61"),
    ("BE", "32"),
    ("BR", "55"),
    ("CA", "1"),
    ("CH", "41"),
    ("CN", "86"),
    ("CZ", "420"),
    ("DE", "49"),
    ("DK", "45"),
    ("ES", "34"),
    ("FI", "358"),
    ("FR", "33"),
    ("GB", "44"),
    ("GR", "30"),
    ("IE", "353"),
    ("IN", "91"),
    ("IT", "39"),
    ("JP", "81"),
    ("KR", "82"),
    ("MX", "52"),
    ("NL", "31"),
    ("NO", "47"),
    ("NZ", "64"),
    ("PL", "48"),
    ("PT", "351"),
    ("RU", "7"),
    ("SE", "46"),
    ("TR", "90"),
    ("UA", "380"),
    ("US", "1"),
    ("ZA", "27"),
];

/// Mobile country codes (first three IMSI digits) mapped to ISO regions.
const MOBILE_COUNTRY_CODES: &[(&str, &str)] = &[
    ("202", "GR"),
    ("204", "NL"),
    ("206", "BE"),
    ("208", "FR"),
    ("214", "ES"),
    ("222", "IT"),
    ("228", "CH"),
    ("230", "CZ"),
    ("232", "AT"),
    ("234", "GB"),
    ("235", "GB"),
    ("238", "DK"),
    ("240", "SE"),
    ("242", "NO"),
    ("244", "FI"),
    ("250", "RU"),
    ("255", "UA"),
    ("260", "PL"),
    ("262", "DE"),
    ("268", "PT"),
    ("272", "IE"),
    ("286", "TR"),
    ("302", "CA"),
    ("310", "US"),
    ("311", "US"),
    ("312", "US"),
    ("313", "US"),
    ("314", "US"),
    ("315", "US"),
    ("316", "US"),
    ("334", "MX"),
    ("404", "IN"),
    ("405", "IN"),
    ("440", "JP"),
    ("441", "JP"),
    ("450", "KR"),
    ("460", "CN"),
    ("505", "AU"),
    ("530", "NZ"),
    ("655", "ZA"),
    ("722", "AR"),
    ("724", "BR"),
];

/// Look up the international calling code for an ISO 3166 alpha-2 region.
pub fn calling_code(region: &str) -> Option<&'static str> {
    let region = region.trim().to_ascii_uppercase();
    CALLING_CODES
        .iter()
        .find(|(r, _)| *r == region)
        .map(|(_, cc)| *cc)
}

/// Derive the ISO region of a SIM from its IMSI.
///
/// Best-effort: unknown mobile country codes return `None` and callers fall
/// back to the configured region.
pub fn country_from_imsi(imsi: &str) -> Option<&'static str> {
    let mcc = imsi.get(..3)?;
    if !mcc.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    MOBILE_COUNTRY_CODES
        .iter()
        .find(|(code, _)| *code == mcc)
        .map(|(_, region)| *region)
}

/// Normalize a phone number, using `country` for numbers without an
/// international prefix.
///
/// # Errors
///
/// Returns [`PhoneError`] when the input is empty, contains letters or
/// symbols, or has more digits than E.164 allows.
pub fn normalize(raw: &str, country: Option<&str>) -> Result<String, PhoneError> {
    let compact: String = raw.trim().chars().filter(|c| !SEPARATORS.contains(c)).collect();
    if compact.is_empty() {
        return Err(PhoneError::Empty);
    }

    let (international, digits) = match compact.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, compact.as_str()),
    };
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PhoneError::InvalidCharacters(raw.trim().to_owned()));
    }
    if digits.is_empty() {
        return Err(PhoneError::MissingDigits(raw.trim().to_owned()));
    }

    let cc = country.and_then(calling_code);

    if international {
        return e164(digits, raw);
    }
    if let Some(rest) = digits.strip_prefix("00") {
        return e164(rest, raw);
    }
    if cc == Some("1") {
        if let Some(rest) = digits.strip_prefix("011") {
            return e164(rest, raw);
        }
    }

    let Some(cc) = cc else {
        return bare(digits);
    };

    let national = match cc {
        "1" if digits.len() == 11 => digits.strip_prefix('1').unwrap_or(digits),
        "1" | "39" => digits,
        _ => digits.strip_prefix('0').unwrap_or(digits),
    };

    if national.len() < MIN_NATIONAL_DIGITS {
        return bare(digits);
    }

    e164(&format!("{cc}{national}"), raw)
}

/// Whether `raw` normalizes to an international (`+`-prefixed) number.
pub fn is_international(raw: &str, country: Option<&str>) -> bool {
    normalize(raw, country).is_ok_and(|n| n.starts_with('+'))
}

fn e164(digits: &str, raw: &str) -> Result<String, PhoneError> {
    if digits.is_empty() {
        return Err(PhoneError::MissingDigits(raw.trim().to_owned()));
    }
    if digits.len() > MAX_E164_DIGITS {
        return Err(PhoneError::TooLong(digits.len()));
    }
    Ok(format!("+{digits}"))
}

fn bare(digits: &str) -> Result<String, PhoneError> {
    if digits.len() > MAX_E164_DIGITS {
        return Err(PhoneError::TooLong(digits.len()));
    }
    Ok(digits.to_owned())
}
