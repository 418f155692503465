//! Reply texts sent back to the sender. Every terminal pipeline state maps to
//! exactly one of these.

use crate::rate_limit::RateDecision;
use crate::validator::MAX_PRICE;

pub const USAGE_EXAMPLE: &str = "post Room available in Brampton, ₹650/month, veg only";

pub fn post_created(
    app_url: &str,
    post_id: &str,
    free_posts_remaining: Option<u64>,
    posts_remaining_today: Option<u32>,
) -> String {
    let mut reply = format!(
        "✅ Post created successfully!\n\n📱 View your post:\n{}\n\n",
        post_link(app_url, post_id)
    );
    if let Some(free) = free_posts_remaining {
        reply.push_str(&format!("🆓 Free posts remaining: {free}\n"));
    }
    if let Some(today) = posts_remaining_today {
        reply.push_str(&format!("📅 Posts remaining today: {today}\n"));
    }
    reply.push_str("\nShare this link with others!");
    reply
}

pub fn post_link(app_url: &str, post_id: &str) -> String {
    format!("{}/posts/{}", app_url.trim_end_matches('/'), post_id)
}

pub fn rate_limited(decision: &RateDecision) -> String {
    format!(
        "❌ Rate limit reached. You've reached the daily limit of {} posts.\n\nYou can post again in {}",
        decision.limit,
        decision.retry_after_label()
    )
}

pub fn quota_denied(app_url: &str, reason: &str) -> String {
    format!(
        "❌ {reason}\n\nUpgrade to Premium: {}/pricing",
        app_url.trim_end_matches('/')
    )
}

pub fn account_error() -> String {
    "Sorry, there was an error creating your account. Please try again later.".to_string()
}

pub fn usage() -> String {
    format!("Please send your post details after \"post\" or \"konnect\".\n\nExample:\n{USAGE_EXAMPLE}")
}

pub fn parse_failed() -> String {
    format!(
        "Sorry, I couldn't parse your message. Please include: category, description, and price (if applicable).\n\nExample: {USAGE_EXAMPLE}"
    )
}

pub fn price_too_large(price: f64) -> String {
    format!(
        "❌ Price is too large ({}). Maximum allowed is {}. Please adjust your price.",
        group_thousands(price),
        group_thousands(MAX_PRICE)
    )
}

pub fn validation_failed(errors: &[String]) -> String {
    format!(
        "❌ Validation error:\n{}\n\nPlease check your message and try again.",
        errors.join("\n")
    )
}

pub fn image_dropped(detail: &str) -> String {
    format!("⚠️ Image could not be uploaded: {detail}. Creating post without image.")
}

pub fn persistence_price_overflow() -> String {
    "❌ Price is too large. Maximum allowed price is ₹99,999,999.99. Please adjust your price and try again."
        .to_string()
}

pub fn persistence_permission() -> String {
    "❌ Permission error. Please contact support if this persists.".to_string()
}

pub fn persistence_failed(detail: &str) -> String {
    if detail.trim().is_empty() {
        "Failed to create post. Please try again later.".to_string()
    } else {
        format!("❌ Error: {detail}")
    }
}

pub fn database_error() -> String {
    "❌ Database error. Please try again in a few moments.".to_string()
}

pub fn unknown_error() -> String {
    "❌ Something went wrong. Please try again later or contact support.".to_string()
}

/// `1234567.5` → `1,234,567.5`; at most two decimals.
fn group_thousands(value: f64) -> String {
    let rendered = format!("{:.2}", value.abs());
    let (int_part, frac_part) = rendered.split_once('.').unwrap_or((&rendered, ""));
    let mut grouped = String::new();
    for (idx, ch) in int_part.chars().enumerate() {
        if idx > 0 && (int_part.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let frac = frac_part.trim_end_matches('0');
    let sign = if value < 0.0 { "-" } else { "" };
    if frac.is_empty() {
        format!("{sign}{grouped}")
    } else {
        format!("{sign}{grouped}.{frac}")
    }
}
