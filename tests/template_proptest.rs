/// Property-based tests for template resolution and port allocation
///
/// Invariants checked across generated inputs:
/// - Known variables are substituted exactly, surrounding text is preserved
/// - Substituted values are never expanded again
/// - Unknown names are left verbatim and reported
/// - Allocated port pairs are distinct and inside the range, and successive
///   pairs rarely share a port
use proptest::prelude::*;
use script_runner::variables::{referenced_variables, VariableStore};
use script_runner::PortAllocator;
use std::collections::BTreeMap;

/// Strategy for variable names
fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,10}").expect("Valid regex")
}

/// Strategy for literal text that contains no template braces
fn literal_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 .,:/_-]{0,20}").expect("Valid regex")
}

/// Strategy for variable values, braces allowed
fn value_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 {}$:_-]{0,20}").expect("Valid regex")
}

proptest! {
    #[test]
    fn prop_known_variables_substitute_exactly(
        vars in prop::collection::btree_map(name_strategy(), value_strategy(), 1..6),
        prefix in literal_strategy(),
        suffix in literal_strategy(),
    ) {
        let mut store = VariableStore::new();
        for (name, value) in &vars {
            store.set(name.clone(), value.clone(), "prop");
        }

        let names: Vec<&String> = vars.keys().collect();
        let template = format!(
            "{}{}{}",
            prefix,
            names.iter().map(|n| format!("{{{{{}}}}}", n)).collect::<Vec<_>>().join("|"),
            suffix
        );
        let expected = format!(
            "{}{}{}",
            prefix,
            names.iter().map(|n| vars[*n].as_str()).collect::<Vec<_>>().join("|"),
            suffix
        );

        let resolved = store.resolve_with_report(&template);
        prop_assert_eq!(resolved.text, expected);
        prop_assert!(resolved.unresolved.is_empty());
    }

    #[test]
    fn prop_values_are_not_expanded_again(
        outer in name_strategy(),
        inner in name_strategy(),
        inner_value in literal_strategy(),
    ) {
        prop_assume!(outer != inner);
        let mut store = VariableStore::new();
        let reference = format!("{{{{{}}}}}", inner);
        store.set(outer.clone(), reference.clone(), "prop");
        store.set(inner, inner_value, "prop");

        let resolved = store.resolve(&format!("{{{{{}}}}}", outer));
        prop_assert_eq!(resolved, reference);
    }

    #[test]
    fn prop_unknown_names_fail_open(
        known in prop::collection::btree_map(name_strategy(), literal_strategy(), 0..4),
        missing in name_strategy(),
        text in literal_strategy(),
    ) {
        prop_assume!(!known.contains_key(&missing));
        let mut store = VariableStore::new();
        for (name, value) in &known {
            store.set(name.clone(), value.clone(), "prop");
        }

        let template = format!("{}{{{{{}}}}}{}", text, missing, text);
        let resolved = store.resolve_with_report(&template);
        prop_assert_eq!(&resolved.text, &template);
        prop_assert_eq!(resolved.unresolved, vec![missing]);
    }

    #[test]
    fn prop_text_without_braces_is_unchanged(text in literal_strategy()) {
        let store = VariableStore::new();
        prop_assert_eq!(store.resolve(&text), text.clone());
        prop_assert!(referenced_variables(&text).is_empty());
    }

    #[test]
    fn prop_json_leaves_resolve_and_keys_do_not(
        vars in prop::collection::btree_map(name_strategy(), literal_strategy(), 1..4),
    ) {
        let mut store = VariableStore::new();
        let mut object = serde_json::Map::new();
        let mut expected = BTreeMap::new();
        for (name, value) in &vars {
            store.set(name.clone(), value.clone(), "prop");
            let key = format!("{{{{{}}}}}", name);
            object.insert(key.clone(), serde_json::Value::String(key.clone()));
            expected.insert(key, value.clone());
        }

        let resolved = store.resolve_value(&serde_json::Value::Object(object));
        let resolved = resolved.as_object().expect("object stays an object");
        for (key, value) in expected {
            prop_assert_eq!(resolved[&key].as_str(), Some(value.as_str()));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_port_pairs_are_distinct_and_in_range(low in 20000u16..40000u16, width in 10u16..500u16) {
        let high = low + width;
        let (front, back) = PortAllocator::new(low, high)
            .allocate_pair()
            .expect("a free pair exists in a wide unprivileged range");
        prop_assert_ne!(front, back);
        prop_assert!((low..=high).contains(&front));
        prop_assert!((low..=high).contains(&back));
    }
}

/// Two allocations in immediate succession share no port, except for a rare
/// collision of independent random draws.
#[test]
fn test_successive_pairs_rarely_overlap() {
    const SAMPLES: usize = 200;
    // Each sample has roughly 4 / 1000 chance of a shared port in 6000-7000;
    // 10 overlaps in 200 samples is far beyond that rate.
    const MAX_OVERLAPS: usize = 10;

    let allocator = PortAllocator::default();
    let mut overlaps = 0;
    for _ in 0..SAMPLES {
        let (a_front, a_back) = allocator.allocate_pair().expect("first pair");
        let (b_front, b_back) = allocator.allocate_pair().expect("second pair");
        if [a_front, a_back].iter().any(|p| *p == b_front || *p == b_back) {
            overlaps += 1;
        }
    }
    assert!(
        overlaps <= MAX_OVERLAPS,
        "{} of {} successive allocations overlapped",
        overlaps,
        SAMPLES
    );
}
