use serde::Serialize;
use std::fmt;

const CHANNEL_PREFIXES: &[&str] = &["whatsapp:", "tel:"];
const CONTACT_SUFFIXES: &[&str] = &["@c.us", "@s.whatsapp.net"];

/// Canonical sender identity: `+` followed by digits.
///
/// Only [`normalize`] builds one, so every key used for rate-limit buckets
/// and user lookup went through the same canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PhoneKey(String);

impl PhoneKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Log-safe rendering that keeps only the last four digits.
    pub fn masked(&self) -> String {
        let digits = &self.0[1..];
        if digits.len() <= 4 {
            return format!("+{}", "*".repeat(digits.len()));
        }
        let (hidden, visible) = digits.split_at(digits.len() - 4);
        format!("+{}{}", "*".repeat(hidden.len()), visible)
    }
}

impl fmt::Display for PhoneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PhoneKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn normalize(raw: &str) -> PhoneKey {
    let mut compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '(' | ')' | '-'))
        .collect();

    for prefix in CHANNEL_PREFIXES {
        if compact.len() >= prefix.len()
            && compact.is_char_boundary(prefix.len())
            && compact[..prefix.len()].eq_ignore_ascii_case(prefix)
        {
            compact.drain(..prefix.len());
            break;
        }
    }

    for suffix in CONTACT_SUFFIXES {
        if let Some(stripped) = compact.strip_suffix(suffix) {
            compact = stripped.to_string();
            break;
        }
    }

    let digits: String = compact.chars().filter(|c| c.is_ascii_digit()).collect();
    PhoneKey(format!("+{digits}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn strips_formatting_and_adds_plus() {
        assert_eq!(normalize("1 (416) 555-0199").as_str(), "+14165550199");
        assert_eq!(normalize("+91 98765 43210").as_str(), "+919876543210");
    }

    #[test]
    fn strips_channel_prefix_and_contact_suffix() {
        assert_eq!(normalize("whatsapp:+14165550199").as_str(), "+14165550199");
        assert_eq!(normalize("WhatsApp:+1 416 555 0199").as_str(), "+14165550199");
        assert_eq!(normalize("14165550199@c.us").as_str(), "+14165550199");
        assert_eq!(
            normalize("919876543210@s.whatsapp.net").as_str(),
            "+919876543210"
        );
    }

    #[test]
    fn garbage_input_still_normalizes() {
        assert_eq!(normalize("").as_str(), "+");
        assert_eq!(normalize("call me").as_str(), "+");
        assert_eq!(normalize("++1-2").as_str(), "+12");
    }

    #[test]
    fn masked_hides_all_but_last_four() {
        assert_eq!(normalize("+14165550199").masked(), "+*******0199");
        assert_eq!(normalize("+123").masked(), "+***");
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(raw in ".{0,40}") {
            let once = normalize(&raw);
            let twice = normalize(once.as_str());
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn output_is_plus_then_digits(raw in "[ a-z:()+-]{0,8}[0-9]{1,15}[ @a-z.-]{0,16}") {
            let key = normalize(&raw);
            let s = key.as_str();
            prop_assert!(s.starts_with('+'));
            prop_assert!(s.len() > 1);
            prop_assert!(s[1..].chars().all(|c| c.is_ascii_digit()));
        }
    }
}
