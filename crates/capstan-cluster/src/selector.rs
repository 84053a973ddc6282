//! Label selector matching.

use std::collections::BTreeMap;

/// Whether `labels` satisfies `selector`: every key/value pair of the
/// selector must be present in the labels. An empty selector matches
/// everything.
#[must_use]
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector.iter().all(|(key, value)| labels.get(key) == Some(value))
}
