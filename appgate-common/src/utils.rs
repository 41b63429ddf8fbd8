//! Small shared helpers: search matching and order-preserving deduplication.

/// True iff every value in `search_values` is a case-folded substring of at
/// least one entry in `field_values`.
pub fn match_search(field_values: &[String], search_values: &[String]) -> bool {
    search_values.iter().all(|needle| {
        let needle = needle.to_lowercase();
        field_values
            .iter()
            .any(|field| field.to_lowercase().contains(&needle))
    })
}

/// Deduplicate `items` by a caller-supplied key, preserving first-seen order.
pub fn deduplicate_by<T, K, F>(items: Vec<T>, mut key: F) -> Vec<T>
where
    K: std::hash::Hash + Eq,
    F: FnMut(&T) -> K,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if seen.insert(key(&item)) {
            out.push(item);
        }
    }
    out
}
