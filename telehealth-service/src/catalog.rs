//! Model trial-order resolution.
//!
//! Upstream model availability and quota limits vary by deployment, so the
//! generator works through a prioritized list of candidates instead of a
//! single hardcoded model name. The list is rebuilt fresh for every
//! generation attempt to tolerate catalog changes.

/// Priority buckets, fastest/cheapest family first. Within a bucket the
/// relative order of the catalog is preserved.
const PRIORITY_BUCKETS: [&str; 4] = [
    "gemini-1.5-flash",
    "gemini-1.5-pro",
    "gemini-1.0",
    "gemini-pro",
];

const FLASH_DEFAULT: &str = "gemini-1.5-flash";
const GENERIC_FALLBACK: &str = "gemini-pro";

/// Build the ordered, deduplicated trial sequence for one generation
/// attempt. Never errors: an empty catalog degrades to the static fallback.
pub fn resolve_trial_order(preferred: &str, available: &[String]) -> Vec<String> {
    if available.is_empty() {
        return static_fallback(preferred);
    }

    let mut order = TrialOrder::new();

    if available.iter().any(|m| m.contains(preferred)) {
        order.push(preferred);
    }

    for bucket in PRIORITY_BUCKETS {
        for model in available.iter().filter(|m| m.contains(bucket)) {
            order.push(model);
        }
    }

    for model in available {
        order.push(model);
    }

    order.into_vec()
}

/// Hardcoded trial sequence used when the catalog query fails or returns
/// nothing.
pub fn static_fallback(preferred: &str) -> Vec<String> {
    let mut order = TrialOrder::new();
    order.push(preferred);
    order.push(FLASH_DEFAULT);
    order.push(GENERIC_FALLBACK);
    order.into_vec()
}

/// Ordered-set builder: first-seen order wins, exact-string dedup.
struct TrialOrder {
    seen: std::collections::HashSet<String>,
    out: Vec<String>,
}

impl TrialOrder {
    fn new() -> Self {
        Self {
            seen: std::collections::HashSet::new(),
            out: Vec::new(),
        }
    }

    fn push(&mut self, model: &str) {
        if self.seen.insert(model.to_string()) {
            self.out.push(model.to_string());
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn preferred_comes_first_when_available() {
        let available = catalog(&[
            "models/gemini-1.5-pro",
            "models/gemini-1.5-flash",
            "models/gemini-pro",
        ]);
        let order = resolve_trial_order("gemini-1.5-flash", &available);
        assert_eq!(order[0], "gemini-1.5-flash");
    }

    #[test]
    fn buckets_are_applied_in_priority_order() {
        let available = catalog(&[
            "models/gemini-pro",
            "models/gemini-1.0-pro",
            "models/gemini-1.5-pro",
            "models/gemini-1.5-flash-8b",
            "models/gemini-1.5-flash",
        ]);
        let order = resolve_trial_order("gemini-2.0", &available);
        // Preferred matches nothing, so flash variants lead in catalog order.
        assert_eq!(
            order,
            vec![
                "models/gemini-1.5-flash-8b",
                "models/gemini-1.5-flash",
                "models/gemini-1.5-pro",
                "models/gemini-1.0-pro",
                "models/gemini-pro",
            ]
        );
    }

    #[test]
    fn no_duplicates_in_resolved_order() {
        let available = catalog(&[
            "models/gemini-1.5-flash",
            "models/gemini-1.5-flash",
            "models/gemini-exp",
        ]);
        let order = resolve_trial_order("models/gemini-1.5-flash", &available);
        let mut deduped = order.clone();
        deduped.dedup();
        assert_eq!(order, deduped);
        let unique: std::collections::HashSet<_> = order.iter().collect();
        assert_eq!(unique.len(), order.len());
    }

    #[test]
    fn remaining_entries_are_appended_last() {
        let available = catalog(&["models/text-embedding", "models/gemini-1.5-flash"]);
        let order = resolve_trial_order("gemini-1.5-flash", &available);
        assert_eq!(order.last().unwrap(), "models/text-embedding");
    }

    #[test]
    fn empty_catalog_yields_static_fallback() {
        let order = resolve_trial_order("gemini-2.0-flash", &[]);
        assert_eq!(
            order,
            vec!["gemini-2.0-flash", "gemini-1.5-flash", "gemini-pro"]
        );
    }

    #[test]
    fn static_fallback_dedupes_preferred() {
        let order = static_fallback("gemini-pro");
        assert_eq!(order, vec!["gemini-pro", "gemini-1.5-flash"]);
    }
}
