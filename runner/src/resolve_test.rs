use crate::{
    resolve::{override_key, ConfigResolver, OverrideResolver, ResolveError},
    state::Registry,
};
use serde_yaml::Value;

fn base() -> Value {
    serde_yaml::from_str(
        r#"
model:
  lr: 0.1
  layers: 2
name: baseline
tags: [a, b]
"#,
    )
    .unwrap()
}

fn overrides(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|raw| raw.to_string()).collect()
}

#[test]
pub fn set_existing_and_nested_keys() {
    let config = OverrideResolver
        .resolve(
            &base(),
            &overrides(&["model.lr=0.5", "optim.name=adam", "name=run 1"]),
            &Registry::new(),
        )
        .unwrap();

    assert_eq!(config.get("model.lr"), Some(&Value::from(0.5)));
    assert_eq!(config.get("model.layers"), Some(&Value::from(2)));
    assert_eq!(config.get("optim.name"), Some(&Value::from("adam")));
    assert_eq!(config.get("name"), Some(&Value::from("run 1")));
    assert_eq!(config.job.overrides.len(), 3);
    assert_eq!(config.job.id, None);
}

#[test]
pub fn add_and_remove_keys() {
    let config = OverrideResolver
        .resolve(
            &base(),
            &overrides(&["+seed=3", "~model.layers", "~tags"]),
            &Registry::new(),
        )
        .unwrap();

    assert_eq!(config.get("seed"), Some(&Value::from(3)));
    assert_eq!(config.get("model.layers"), None);
    assert_eq!(config.get("tags"), None);
    assert_eq!(config.get("model.lr"), Some(&Value::from(0.1)));
}

#[test]
pub fn invalid_overrides() {
    let resolve = |raw: &str| OverrideResolver.resolve(&base(), &overrides(&[raw]), &Registry::new());

    assert_eq!(
        resolve("+name=other").unwrap_err(),
        ResolveError::AlreadyExists(String::from("+name=other"))
    );
    assert_eq!(
        resolve("~missing").unwrap_err(),
        ResolveError::Missing(String::from("~missing"))
    );
    assert_eq!(
        resolve("no_value").unwrap_err(),
        ResolveError::MalformedOverride(String::from("no_value"))
    );
    assert_eq!(
        resolve("name.inner=1").unwrap_err(),
        ResolveError::NotAMapping(String::from("name.inner=1"))
    );
    assert_eq!(
        resolve("model..lr=1").unwrap_err(),
        ResolveError::MalformedOverride(String::from("model..lr=1"))
    );
}

#[test]
pub fn null_base_becomes_mapping() {
    let config = OverrideResolver
        .resolve(&Value::Null, &overrides(&["x=1"]), &Registry::new())
        .unwrap();

    assert_eq!(config.get("x"), Some(&Value::from(1)));
}

#[test]
pub fn state_references() {
    let mut registry = Registry::new();
    registry.insert("lr", Value::from(0.25));
    registry.insert("dataset", Value::from("mnist"));
    registry.insert("sizes", serde_yaml::from_str("[1, 2]").unwrap());

    let config = OverrideResolver
        .resolve(
            &base(),
            &overrides(&[
                "model.lr=${state:lr}",
                "data=/data/${state:dataset}/train",
                "sizes=${state:sizes}",
            ]),
            &registry,
        )
        .unwrap();

    // a lone reference keeps the type of the value
    assert_eq!(config.get("model.lr"), Some(&Value::from(0.25)));
    assert_eq!(config.get("data"), Some(&Value::from("/data/mnist/train")));
    assert_eq!(
        config.get("sizes"),
        Some(&serde_yaml::from_str::<Value>("[1, 2]").unwrap())
    );
}

#[test]
pub fn state_reference_errors() {
    let mut registry = Registry::new();
    registry.insert("sizes", serde_yaml::from_str("[1, 2]").unwrap());

    let resolve = |raw: &str| OverrideResolver.resolve(&base(), &overrides(&[raw]), &registry);

    assert_eq!(
        resolve("x=${state:unknown}").unwrap_err(),
        ResolveError::UnknownState(String::from("unknown"))
    );
    assert_eq!(
        resolve("x=a${state:sizes}").unwrap_err(),
        ResolveError::NonScalarState(String::from("sizes"))
    );
    assert_eq!(
        resolve("x=a${state:sizes").unwrap_err(),
        ResolveError::Unterminated(String::from("a${state:sizes"))
    );
}

#[test]
pub fn set_job_variables() {
    let mut config = OverrideResolver
        .resolve(&base(), &[], &Registry::new())
        .unwrap();
    config.set_job("1234_0", 5);

    assert_eq!(config.job.id.as_deref(), Some("1234_0"));
    assert_eq!(config.job.num, Some(5));
}

#[test]
pub fn override_keys() {
    assert_eq!(override_key("a.b=1"), "a.b");
    assert_eq!(override_key("+a=1"), "a");
    assert_eq!(override_key("~a.b"), "a.b");
    assert_eq!(override_key("launcher.x=y=z"), "launcher.x");
}
