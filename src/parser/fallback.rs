//! Keyword-rule parser used when no completion service is configured or the
//! service fails.

use super::CandidateListing;
use once_cell::sync::Lazy;
use regex::Regex;

const TITLE_CHARS: usize = 50;

static PRICE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[₹$]\s*)?(\d[\d,]*(?:\.\d+)?)").expect("price regex")
});

/// Ordered category rules; the first matching rule wins.
const CATEGORY_RULES: &[(&[&str], &str)] = &[
    (&["ride", "carpool"], "ride_share"),
    (&["deal", "grocery"], "deals"),
    (&["parcel"], "parcel"),
    (&["job", "referral"], "job"),
    (&["buy", "sell"], "buy_sell"),
];

pub fn parse(text: &str) -> Option<CandidateListing> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let lower = text.to_lowercase();

    Some(CandidateListing {
        category: category_for(&lower).to_string(),
        title: title_for(text),
        description: text.to_string(),
        price: first_price(text),
        currency: Some(currency_for(text).to_string()),
        veg_only: is_veg_only(&lower),
        gender_filter: Some(gender_for(&lower).to_string()),
        city: None,
    })
}

fn has_word(lower: &str, word: &str) -> bool {
    lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| token == word)
}

fn category_for(lower: &str) -> &'static str {
    if lower.contains("room") || has_word(lower, "pg") {
        return if lower.contains("need") {
            "need_room"
        } else {
            "room_rent"
        };
    }
    CATEGORY_RULES
        .iter()
        .find(|(hints, _)| hints.iter().any(|hint| lower.contains(hint)))
        .map(|(_, category)| *category)
        .unwrap_or("help")
}

fn title_for(text: &str) -> String {
    let mut title: String = text.chars().take(TITLE_CHARS).collect();
    if text.chars().count() > TITLE_CHARS {
        title.push_str("...");
    }
    title
}

/// First price-like number in `text`, thousands separators dropped.
pub(super) fn first_price(text: &str) -> Option<f64> {
    let captures = PRICE.captures(text)?;
    captures.get(1)?.as_str().replace(',', "").parse().ok()
}

fn currency_for(text: &str) -> &'static str {
    if text.contains('$') || text.to_uppercase().contains("CAD") {
        "CAD"
    } else {
        "INR"
    }
}

fn is_veg_only(lower: &str) -> bool {
    lower.contains("veg")
        && !["non-veg", "nonveg", "non veg"]
            .iter()
            .any(|marker| lower.contains(marker))
}

fn gender_for(lower: &str) -> &'static str {
    if lower.contains("female") || lower.contains("girl") {
        "female"
    } else if lower.contains("male") || lower.contains("boy") {
        "male"
    } else {
        "both"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_listing_example() {
        let parsed = parse(
            "Room available in Brampton, ₹650/month, veg only kitchen, female preferred",
        )
        .unwrap();
        assert_eq!(parsed.category, "room_rent");
        assert_eq!(parsed.price, Some(650.0));
        assert!(parsed.veg_only);
        assert_eq!(parsed.gender_filter.as_deref(), Some("female"));
        assert_eq!(parsed.currency.as_deref(), Some("INR"));
    }

    #[test]
    fn ride_share_example() {
        let parsed =
            parse("Ride share from Toronto to Montreal, leaving Friday, $50 per person").unwrap();
        assert_eq!(parsed.category, "ride_share");
        assert_eq!(parsed.price, Some(50.0));
        assert_eq!(parsed.currency.as_deref(), Some("CAD"));
        assert_eq!(parsed.gender_filter.as_deref(), Some("both"));
    }

    #[test]
    fn need_qualifier_flips_room_category() {
        let parsed = parse("Need a PG near Sheridan college from May").unwrap();
        assert_eq!(parsed.category, "need_room");
    }

    #[test]
    fn pg_is_matched_as_a_word_only() {
        let parsed = parse("Selling my upgraded laptop").unwrap();
        assert_eq!(parsed.category, "buy_sell");
    }

    #[test]
    fn remaining_categories() {
        assert_eq!(parse("Big grocery sale at FreshCo").unwrap().category, "deals");
        assert_eq!(parse("Can someone carry a parcel to Delhi").unwrap().category, "parcel");
        assert_eq!(parse("Referral available at a bank").unwrap().category, "job");
        assert_eq!(parse("Where can I find a good doctor").unwrap().category, "help");
    }

    #[test]
    fn non_veg_is_not_veg_only() {
        assert!(!parse("Room with non-veg kitchen").unwrap().veg_only);
    }

    #[test]
    fn male_detection_does_not_shadow_female() {
        assert_eq!(
            parse("Room for boys only").unwrap().gender_filter.as_deref(),
            Some("male")
        );
        assert_eq!(
            parse("Looking for girls roommate").unwrap().gender_filter.as_deref(),
            Some("female")
        );
    }

    #[test]
    fn title_is_truncated_with_ellipsis() {
        let text = "a".repeat(80);
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.title.chars().count(), 53);
        assert!(parsed.title.ends_with("..."));
        assert_eq!(parsed.description, text);
    }

    #[test]
    fn thousands_separators_are_accepted() {
        assert_eq!(parse("Sofa for sale ₹12,500").unwrap().price, Some(12500.0));
    }

    #[test]
    fn blank_text_is_not_parsed() {
        assert!(parse("   ").is_none());
    }
}
