//! Property tests: parsing is stable under serialize/parse and hashing is canonical.

use keel_selector::{Condition, Selector};
use proptest::prelude::*;
use serde_json::{json, Value};

fn arb_leaf() -> impl Strategy<Value = Value> {
    let string_field = (
        prop_oneof![Just("id"), Just("name"), Just("version"), Just("system")],
        prop_oneof![
            Just("equals"),
            Just("starts-with"),
            Just("ends-with"),
            Just("contains")
        ],
        "[a-z0-9-]{0,12}",
    )
        .prop_map(|(kind, op, value)| json!({"type": kind, "operator": op, "value": value}));

    let metadata = ("[a-z]{1,8}", "[a-z0-9]{0,8}").prop_map(|(key, value)| {
        json!({"type": "metadata", "key": key, "operator": "equals", "value": value})
    });

    let date = (
        prop_oneof![Just("created-at"), Just("updated-at")],
        prop_oneof![
            Just("before"),
            Just("after"),
            Just("before-or-on"),
            Just("after-or-on")
        ],
        0i64..4_000_000_000,
    )
        .prop_map(|(kind, op, secs)| {
            let value = chrono::DateTime::from_timestamp(secs, 0)
                .unwrap_or_default()
                .to_rfc3339();
            json!({"type": kind, "operator": op, "value": value})
        });

    prop_oneof![string_field, metadata, date]
}

fn arb_condition() -> impl Strategy<Value = Value> {
    arb_leaf().prop_recursive(2, 16, 4, |inner| {
        (
            prop_oneof![Just("and"), Just("or")],
            prop::collection::vec(inner, 0..4),
        )
            .prop_map(|(op, conditions)| {
                json!({"type": "comparison", "operator": op, "conditions": conditions})
            })
    })
}

proptest! {
    #[test]
    fn parse_serialize_parse_is_identity(raw in arb_condition()) {
        let parsed = Condition::parse(&raw).unwrap();
        let serialized = serde_json::to_value(&parsed).unwrap();
        let reparsed = Condition::parse(&serialized).unwrap();
        prop_assert_eq!(parsed, reparsed);
    }

    #[test]
    fn hash_is_stable_across_reserialization(raw in arb_condition()) {
        let parsed = Condition::parse(&raw).unwrap();
        let original = Selector::Json(raw);
        let canonical = Selector::from_condition(&parsed);
        prop_assert_eq!(original.hash(), canonical.hash());
        prop_assert_eq!(original.hash(), original.hash());
    }
}
