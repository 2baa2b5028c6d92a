//! Filter predicates over events (NIP-01), including prefix matching on
//! ids/authors and indexed `#x` tag conditions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// A single REQ/COUNT filter. Unset fields don't constrain; an entirely
/// empty filter matches every event.
///
/// Indexed tag conditions arrive as extra `"#x"` keys and land in `tags`
/// via the flattened map. Keys not starting with `#` are tolerated on
/// decode and ignored by the matcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// NIP-50 full-text predicate. This relay implements it as a
    /// case-insensitive substring match over content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `#x` conditions, with the `#` stripped.
    pub fn tag_conditions(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.tags
            .iter()
            .filter(|(k, _)| k.starts_with('#'))
            .map(|(k, v)| (&k[1..], v.as_slice()))
    }

    /// Short-circuit conjunction: ids, authors, kinds, since, until, tag
    /// conditions, search. `limit` never participates in matching.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|p| event.id.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|p| event.pubkey.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (name, values) in self.tag_conditions() {
            if !event
                .tag_values(name)
                .any(|v| values.iter().any(|w| w == v))
            {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            if !event.content.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

/// OR across filters. An empty filter list matches nothing.
pub fn matches_any(event: &Event, filters: &[Filter]) -> bool {
    filters.iter().any(|f| f.matches(event))
}

/// The smallest `limit` any of the filters sets, or `None` when none do.
/// A subscription's stored-history replay is capped by this value.
pub fn effective_limit(filters: &[Filter]) -> Option<usize> {
    filters.iter().filter_map(|f| f.limit).min()
}
