//! Environment-driven activation: variables flow through `load_from` into a
//! root run's disruptor registration.

use std::collections::HashMap;

use environment::{load_from, EnvError, DISRUPTORS_VAR, FINAL_RETRIES_VAR, VERBOSE_VAR};
use harness::{Activation, ConfigError, Configurable, Disruptor, Run};

struct Latency;

impl Disruptor for Latency {
    fn env_value(&self) -> &str {
        "latency"
    }

    fn as_configurable(&mut self) -> Option<&mut dyn Configurable> {
        Some(self)
    }
}

impl Configurable for Latency {
    fn configure(&mut self, config: &str) -> anyhow::Result<()> {
        anyhow::ensure!(config.starts_with("ms="), "expected ms=<n>");
        Ok(())
    }
}

struct Partition;

impl Disruptor for Partition {
    fn env_value(&self) -> &str {
        "partition"
    }
}

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

fn candidates() -> Vec<Box<dyn Disruptor>> {
    vec![Box::new(Latency), Box::new(Partition)]
}

#[test]
fn environment_selects_and_configures_disruptors() {
    let config = load_from(env(&[
        (DISRUPTORS_VAR, "partition; latency:ms=250"),
        (VERBOSE_VAR, "true"),
        (FINAL_RETRIES_VAR, "3"),
    ]))
    .unwrap();
    assert!(config.verbose);
    assert_eq!(config.final_retries, 3);

    let root = Run::root("suite", config);
    let activation = root.allow_disruptors(candidates()).unwrap();

    assert_eq!(
        activation,
        Activation::Active {
            names: vec!["partition".to_string(), "latency".to_string()]
        }
    );
}

#[test]
fn unknown_disruptor_skips_the_suite() {
    let config = load_from(env(&[(DISRUPTORS_VAR, "latency:ms=1;dns")])).unwrap();
    let root = Run::root("suite", config);

    let activation = root.allow_disruptors(candidates()).unwrap();

    assert!(matches!(activation, Activation::Skipped { .. }));
    assert!(root.is_skipped());
}

#[test]
fn rejected_disruptor_config_is_an_error() {
    let config = load_from(env(&[(DISRUPTORS_VAR, "latency:fast")])).unwrap();
    let root = Run::root("suite", config);

    let err = root.allow_disruptors(candidates()).unwrap_err();

    assert!(err.to_string().contains("latency"));
}

#[test]
fn malformed_variables_are_reported() {
    let err = load_from(env(&[(DISRUPTORS_VAR, "latency;:ms=1")])).unwrap_err();
    assert!(matches!(
        err,
        EnvError::Invalid {
            var: DISRUPTORS_VAR,
            source: ConfigError::EmptyDisruptorName { .. },
        }
    ));

    let err = load_from(env(&[(FINAL_RETRIES_VAR, "many")])).unwrap_err();
    assert!(matches!(
        err,
        EnvError::Invalid {
            var: FINAL_RETRIES_VAR,
            ..
        }
    ));
}
