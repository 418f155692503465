use crate::parser::{CandidateListing, Category, GenderFilter};
use serde::Serialize;
use thiserror::Error;

/// Largest value a `DECIMAL(10, 2)` price column holds.
pub const MAX_PRICE: f64 = 99_999_999.99;

pub const ALLOWED_CURRENCIES: [&str; 6] = ["INR", "USD", "CAD", "GBP", "AUD", "EUR"];

const MIN_TITLE_CHARS: usize = 3;
const MAX_TITLE_CHARS: usize = 200;
const MIN_DESCRIPTION_CHARS: usize = 10;

/// A candidate that passed every rule, with closed enums in place of the
/// parser's strings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedListing {
    pub category: Category,
    pub title: String,
    pub description: String,
    pub price: Option<f64>,
    pub currency: String,
    pub veg_only: bool,
    pub gender_filter: GenderFilter,
    pub city: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{}", .errors.join("; "))]
pub struct ValidationErrors {
    errors: Vec<String>,
}

impl ValidationErrors {
    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

/// `{valid, errors}` view for callers that only need the verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

pub fn report(candidate: &CandidateListing) -> ValidationReport {
    match validate(candidate) {
        Ok(_) => ValidationReport {
            valid: true,
            errors: Vec::new(),
        },
        Err(err) => ValidationReport {
            valid: false,
            errors: err.errors,
        },
    }
}

/// Checks every rule and collects all violations.
pub fn validate(candidate: &CandidateListing) -> Result<ValidatedListing, ValidationErrors> {
    let mut errors = Vec::new();

    let category = Category::from_str(&candidate.category);
    if category.is_none() {
        errors.push(format!(
            "Invalid category. Must be one of: {}",
            Category::ALL.map(|c| c.as_str()).join(", ")
        ));
    }

    let title_chars = candidate.title.chars().count();
    if candidate.title.trim().is_empty() {
        errors.push("Title is required".to_string());
    } else if title_chars > MAX_TITLE_CHARS {
        errors.push(format!("Title must be {MAX_TITLE_CHARS} characters or less"));
    } else if title_chars < MIN_TITLE_CHARS {
        errors.push(format!("Title must be at least {MIN_TITLE_CHARS} characters"));
    }

    if candidate.description.trim().is_empty() {
        errors.push("Description is required".to_string());
    } else if candidate.description.chars().count() < MIN_DESCRIPTION_CHARS {
        errors.push(format!(
            "Description must be at least {MIN_DESCRIPTION_CHARS} characters"
        ));
    }

    if let Some(price) = candidate.price {
        if !price.is_finite() {
            errors.push("Price must be a valid number".to_string());
        } else if price < 0.0 {
            errors.push("Price cannot be negative".to_string());
        } else if price > MAX_PRICE {
            errors.push("Price cannot exceed 99,999,999.99".to_string());
        }
    }

    let currency = candidate
        .currency
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());
    if let Some(code) = currency
        && !ALLOWED_CURRENCIES.contains(&code)
    {
        errors.push(format!(
            "Invalid currency. Must be one of: {}",
            ALLOWED_CURRENCIES.join(", ")
        ));
    }

    let gender = candidate
        .gender_filter
        .as_deref()
        .map(str::trim)
        .filter(|g| !g.is_empty());
    let gender_filter = match gender {
        Some(raw) => {
            let parsed = GenderFilter::from_str(raw);
            if parsed.is_none() {
                errors.push(format!(
                    "Invalid gender filter. Must be one of: {}",
                    GenderFilter::ALL.map(|g| g.as_str()).join(", ")
                ));
            }
            parsed
        }
        None => Some(GenderFilter::Both),
    };

    match (category, gender_filter) {
        (Some(category), Some(gender_filter)) if errors.is_empty() => Ok(ValidatedListing {
            category,
            title: candidate.title.clone(),
            description: candidate.description.clone(),
            price: candidate.price,
            currency: currency.unwrap_or("INR").to_string(),
            veg_only: candidate.veg_only,
            gender_filter,
            city: candidate.city.clone(),
        }),
        _ => Err(ValidationErrors { errors }),
    }
}
