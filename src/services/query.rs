//! Read-side search over an already ordered item list.

use crate::models::item::Item;

/// Keep the items whose key, text body or file name contains `query`,
/// ignoring case. The query is trimmed first; an empty query keeps every
/// item. Relative order is preserved.
pub fn filter_items(items: Vec<Item>, query: &str) -> Vec<Item> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return items;
    }
    items
        .into_iter()
        .filter(|item| matches_item(item, &needle))
        .collect()
}

fn matches_item(item: &Item, needle: &str) -> bool {
    contains_folded(&item.key, needle)
        || item
            .text_value
            .as_deref()
            .is_some_and(|text| contains_folded(text, needle))
        || item
            .file_name
            .as_deref()
            .is_some_and(|name| contains_folded(name, needle))
}

fn contains_folded(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}
