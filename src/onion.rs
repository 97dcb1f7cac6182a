use std::sync::OnceLock;

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use regex::Regex;

/// A normalized v3 address is the 56-char base32 label plus ".onion".
pub const V3_ADDRESS_LEN: usize = 56 + ".onion".len();

fn v3_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:.*\.)?([a-z2-7]{56})(?:\.onion)?$").expect("v3 pattern")
    })
}

fn v2_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:.*\.)?([a-z2-7]{16})(?:\.onion)?$").expect("v2 pattern")
    })
}

/// Normalize an onion host into its canonical `<56 chars>.onion` form.
///
/// Leading sub-labels and an optional trailing `.onion` are stripped and the
/// result is lowercased. Returns `None` for anything that is not a v3 label.
pub fn normalize(input: &str) -> Option<String> {
    let lowered = input.to_ascii_lowercase();
    let caps = v3_pattern().captures(&lowered)?;
    Some(format!("{}.onion", &caps[1]))
}

/// Whether the host looks like a retired v2 onion address (16-char label).
///
/// Only used to pick a 410 response with an explanation over a generic 400.
pub fn is_v2(input: &str) -> bool {
    v2_pattern().is_match(&input.to_ascii_lowercase())
}

/// Decode a form-encoded argument: `+` means space, then percent-unescape.
pub fn url_decode(input: &str) -> String {
    let plus_as_space = input.replace('+', " ");
    percent_decode_str(&plus_as_space)
        .decode_utf8_lossy()
        .into_owned()
}

/// Encode an argument for the wire: percent-escape, then `%20` becomes `+`.
pub fn url_encode(input: &str) -> String {
    utf8_percent_encode(input, NON_ALPHANUMERIC)
        .to_string()
        .replace("%20", "+")
}
