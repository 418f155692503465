use crate::store::Store;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const PARTIAL_CANDIDATES: usize = 5;
/// Shorter search terms with several partial hits are treated as ambiguous.
const MIN_AMBIGUOUS_TERM_CHARS: usize = 5;

static ABBREVIATIONS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("nyc", "New York"),
        ("ny", "New York"),
        ("sf", "San Francisco"),
        ("tor", "Toronto"),
        ("van", "Vancouver"),
        ("bram", "Brampton"),
        ("miss", "Mississauga"),
    ])
});

/// Resolves free-text city names to active city ids.
pub struct CityMatcher {
    store: Arc<dyn Store>,
}

impl CityMatcher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn match_city(&self, name: &str) -> Option<Uuid> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let term = ABBREVIATIONS
            .get(name.to_lowercase().as_str())
            .copied()
            .unwrap_or(name);

        match self.store.find_city_by_name(term).await {
            Ok(Some(city)) => return Some(city.id),
            Ok(None) => {}
            Err(err) => {
                warn!(target = "konnect.city", term, error = %err, "city_lookup_failed");
                return None;
            }
        }

        let candidates = match self.store.search_cities(term, PARTIAL_CANDIDATES).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(target = "konnect.city", term, error = %err, "city_search_failed");
                return None;
            }
        };

        let lower = term.to_lowercase();
        if let Some(city) = candidates.iter().find(|c| c.name.to_lowercase() == lower) {
            return Some(city.id);
        }
        match candidates.as_slice() {
            [] => None,
            [only] => Some(only.id),
            _ if term.chars().count() < MIN_AMBIGUOUS_TERM_CHARS => {
                debug!(
                    target = "konnect.city",
                    term,
                    candidates = candidates.len(),
                    "city_ambiguous"
                );
                None
            }
            [first, ..] => Some(
                candidates
                    .iter()
                    .find(|c| c.name.to_lowercase().starts_with(&lower))
                    .unwrap_or(first)
                    .id,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{City, MemoryStore};

    fn city(name: &str) -> City {
        City {
            id: Uuid::new_v4(),
            name: name.into(),
            country_code: "CA".into(),
            flag_emoji: None,
            is_active: true,
        }
    }

    fn matcher(cities: Vec<City>) -> CityMatcher {
        CityMatcher::new(Arc::new(MemoryStore::with_cities(cities)))
    }

    #[tokio::test]
    async fn abbreviation_expands_before_lookup() {
        let toronto = city("Toronto");
        let id = toronto.id;
        let matcher = matcher(vec![toronto, city("Montreal")]);
        assert_eq!(matcher.match_city("tor").await, Some(id));
        assert_eq!(matcher.match_city("TOR").await, Some(id));
    }

    #[tokio::test]
    async fn short_ambiguous_fragment_is_refused() {
        let matcher = matcher(vec![city("Toronto"), city("London"), city("Brampton")]);
        assert_eq!(matcher.match_city("on").await, None);
    }

    #[tokio::test]
    async fn single_partial_candidate_is_accepted() {
        let brampton = city("Brampton");
        let id = brampton.id;
        let matcher = matcher(vec![brampton, city("Toronto")]);
        assert_eq!(matcher.match_city("ramp").await, Some(id));
    }

    #[tokio::test]
    async fn long_term_prefers_prefix_match() {
        let north = city("North Vancouver");
        let vancouver_island = city("Vancouver Island");
        let id = vancouver_island.id;
        let matcher = matcher(vec![north, vancouver_island]);
        assert_eq!(matcher.match_city("vancouv").await, Some(id));
    }

    #[tokio::test]
    async fn exact_name_wins_and_unknown_is_none() {
        let london = city("London");
        let id = london.id;
        let matcher = matcher(vec![city("New London"), london]);
        assert_eq!(matcher.match_city(" london ").await, Some(id));
        assert_eq!(matcher.match_city("Atlantis").await, None);
        assert_eq!(matcher.match_city("").await, None);
    }
}
