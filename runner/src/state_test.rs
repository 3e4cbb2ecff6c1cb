use crate::{
    resolve::{ConfigResolver, OverrideResolver},
    state::{self, Registry},
};
use serde_yaml::Value;

// the only test touching the process-wide registry, tests run in parallel
#[test]
pub fn capture_restore_roundtrip() {
    state::register("state_test.answer", Value::from(42));
    state::register("state_test.name", Value::from("sweep"));

    let captured = state::capture();
    assert!(!captured.is_empty());

    // later changes don't leak into the snapshot
    state::register("state_test.answer", Value::from(7));
    state::unregister("state_test.name");

    let restored = state::restore(&captured);
    assert_eq!(restored.get("state_test.answer"), Some(&Value::from(42)));
    assert_eq!(restored.get("state_test.name"), Some(&Value::from("sweep")));

    state::restore_global(&captured);
    assert_eq!(state::lookup("state_test.answer"), Some(Value::from(42)));
    assert_eq!(state::lookup("state_test.name"), Some(Value::from("sweep")));

    // restoring twice changes nothing
    state::restore_global(&captured);
    assert_eq!(state::capture(), captured);

    // resolving against the restored snapshot matches resolving against the live registry
    let base = serde_yaml::from_str::<Value>("model:\n  size: ${state:state_test.answer}\n").unwrap();
    let overrides = vec![String::from("label=${state:state_test.name}-${state:state_test.answer}")];
    let mut live = Registry::new();
    for name in ["state_test.answer", "state_test.name"] {
        if let Some(value) = state::lookup(name) {
            live.insert(name, value);
        }
    }
    let from_live = OverrideResolver.resolve(&base, &overrides, &live).unwrap();
    let from_snapshot = OverrideResolver
        .resolve(&base, &overrides, &state::restore(&state::capture()))
        .unwrap();

    assert_eq!(from_live, from_snapshot);
    assert_eq!(from_snapshot.get("model.size"), Some(&Value::from(42)));
    assert_eq!(from_snapshot.get("label"), Some(&Value::from("sweep-42")));

    state::unregister("state_test.answer");
    state::unregister("state_test.name");
    assert_eq!(state::lookup("state_test.answer"), None);
}

#[test]
pub fn private_registry_is_independent() {
    let mut registry = Registry::new();
    registry.insert("x", Value::from(1));

    let mut copy = registry.clone();
    copy.insert("x", Value::from(2));
    copy.remove("missing");

    assert_eq!(registry.get("x"), Some(&Value::from(1)));
    assert_eq!(copy.get("x"), Some(&Value::from(2)));
    assert_eq!(registry.len(), 1);
}

#[test]
pub fn captured_state_serializes_as_mapping() {
    let mut registry = Registry::new();
    registry.insert("lr", Value::from(0.1));

    let rendered = serde_yaml::to_string(&registry).unwrap();
    assert_eq!(rendered.trim(), "lr: 0.1");

    let parsed: Registry = serde_yaml::from_str(&rendered).unwrap();
    assert_eq!(parsed, registry);
}
