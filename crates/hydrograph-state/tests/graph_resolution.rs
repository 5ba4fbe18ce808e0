//! Dependency-graph behavior of the store, driven through counting
//! evaluators.

use hydrograph_core::{CompositeVector, ConfigError, FieldShape, Key, KeyTag, ParameterList, StateError, Tag};
use hydrograph_state::{EvalContext, Evaluator, StateStore};
use hydrograph_test_utils::{single_column_store, ChainBuilder, CountingEvaluator};
use proptest::prelude::*;

fn at(key: &str) -> KeyTag {
    Key::from(key).at(&Tag::NEXT)
}

fn cells(store: &mut StateStore, key: &str) -> Vec<f64> {
    store.get_field(&at(key)).unwrap().view("cell").unwrap().to_vec()
}

#[test]
fn second_update_without_changes_recomputes_nothing() {
    let (mut store, log) = ChainBuilder::new(2)
        .primary("a")
        .link("b", &["a"])
        .link("c", &["b"])
        .build()
        .unwrap();
    store.set_scalar(&at("a"), 1.0).unwrap();

    assert!(store.update(&at("c"), "test").unwrap());
    assert_eq!(log.take(), vec!["b", "c"]);
    assert!(!store.update(&at("c"), "test").unwrap());
    assert!(log.calls().is_empty());
    assert_eq!(cells(&mut store, "c"), vec![1.0, 1.0]);
}

#[test]
fn change_is_reported_per_requester() {
    let (mut store, _log) = ChainBuilder::new(1).primary("a").link("b", &["a"]).build().unwrap();
    store.set_scalar(&at("a"), 1.0).unwrap();
    assert!(store.update(&at("b"), "flow").unwrap());
    assert!(store.update(&at("b"), "energy").unwrap());
    assert!(!store.update(&at("b"), "flow").unwrap());
}

#[test]
fn dependencies_run_before_dependents() {
    let (mut store, log) = ChainBuilder::new(1)
        .primary("a")
        .link("b", &["a"])
        .link("c", &["a", "b"])
        .link("d", &["c", "b"])
        .build()
        .unwrap();
    store.set_scalar(&at("a"), 2.0).unwrap();
    store.update(&at("d"), "test").unwrap();
    // Each evaluator runs once even though b is reached twice.
    assert_eq!(log.calls(), vec!["b", "c", "d"]);
    assert_eq!(cells(&mut store, "d"), vec![(2.0 + 2.0) + 2.0]);
}

#[test]
fn only_downstream_of_a_change_recomputes() {
    let (mut store, log) = ChainBuilder::new(1)
        .primary("a")
        .primary("x")
        .link("b", &["a"])
        .link("y", &["x"])
        .link("c", &["b", "y"])
        .build()
        .unwrap();
    store.set_scalar(&at("a"), 1.0).unwrap();
    store.set_scalar(&at("x"), 1.0).unwrap();
    store.update(&at("c"), "test").unwrap();
    log.take();

    store.set_scalar(&at("x"), 5.0).unwrap();
    assert!(store.update(&at("c"), "test").unwrap());
    assert_eq!(log.calls(), vec!["y", "c"]);
    assert_eq!(cells(&mut store, "c"), vec![6.0]);
}

#[test]
fn derivative_outside_the_closure_is_zero() {
    let (mut store, log) = ChainBuilder::new(3)
        .primary("a")
        .primary("x")
        .link("b", &["a"])
        .build()
        .unwrap();
    store.set_scalar(&at("a"), 1.0).unwrap();
    store.set_scalar(&at("x"), 1.0).unwrap();
    store.update(&at("b"), "test").unwrap();
    log.take();

    assert!(!store.is_dependency(&at("b"), &at("x")));
    let d = store.get_derivative(&at("b"), &at("x")).unwrap();
    assert_eq!(d.view("cell").unwrap(), &[0.0; 3]);
    assert!(log.calls().is_empty());
}

#[test]
fn derivative_with_respect_to_itself_is_one() {
    let (mut store, _log) = ChainBuilder::new(2).primary("a").link("b", &["a"]).build().unwrap();
    store.set_scalar(&at("a"), 3.0).unwrap();
    let d = store.get_derivative(&at("b"), &at("b")).unwrap();
    assert_eq!(d.view("cell").unwrap(), &[1.0, 1.0]);
}

#[test]
fn chain_rule_sums_every_path() {
    // b = a + a, c = b + a: dc/da = 2 + 1.
    let (mut store, _log) = ChainBuilder::new(1)
        .primary("a")
        .link("b", &["a", "a"])
        .link("c", &["b", "a"])
        .build()
        .unwrap();
    store.set_scalar(&at("a"), 1.0).unwrap();
    assert_eq!(store.get_derivative(&at("b"), &at("a")).unwrap().view("cell").unwrap(), &[2.0]);
    assert_eq!(store.get_derivative(&at("c"), &at("a")).unwrap().view("cell").unwrap(), &[3.0]);
}

#[test]
fn cycle_is_rejected_at_setup() {
    match ChainBuilder::new(1).link("b", &["c"]).link("c", &["b"]).build() {
        Err(StateError::CyclicDependency { cycle }) => {
            assert!(cycle.len() >= 3, "cycle {cycle:?}");
            assert_eq!(cycle.first(), cycle.last());
        }
        other => panic!("expected CyclicDependency, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn reading_a_stale_primary_fails() {
    let (mut store, _log) = ChainBuilder::new(1).primary("a").link("b", &["a"]).build().unwrap();
    match store.update(&at("b"), "test") {
        Err(StateError::StaleDependency { field, .. }) => assert_eq!(field, at("a")),
        other => panic!("expected StaleDependency, got {other:?}"),
    }
}

/// Declares `a` but reads `x`.
struct Sneaky {
    provides: [KeyTag; 1],
    deps: [KeyTag; 1],
}

impl Evaluator for Sneaky {
    fn name(&self) -> &str {
        "sneaky"
    }

    fn provides(&self) -> &[KeyTag] {
        &self.provides
    }

    fn dependencies(&self) -> &[KeyTag] {
        &self.deps
    }

    fn evaluate(&self, ctx: &EvalContext<'_>, results: &mut [CompositeVector]) -> Result<(), StateError> {
        let x = ctx.view(&at("x"), "cell")?;
        results[0].view_mut("cell")?.copy_from_slice(x);
        Ok(())
    }
}

#[test]
fn undeclared_read_fails() {
    let mut store = single_column_store(1);
    for p in ["a", "x"] {
        store.require(at(p), FieldShape::cells("domain"), None).unwrap();
        store
            .register_evaluator(Box::new(hydrograph_state::PrimaryVariable::new(p, Tag::NEXT)))
            .unwrap();
    }
    store.require(at("s"), FieldShape::cells("domain"), None).unwrap();
    store
        .register_evaluator(Box::new(Sneaky {
            provides: [at("s")],
            deps: [at("a")],
        }))
        .unwrap();
    store.setup().unwrap();
    store.set_scalar(&at("a"), 1.0).unwrap();
    store.set_scalar(&at("x"), 1.0).unwrap();
    match store.update(&at("s"), "test") {
        Err(StateError::UndeclaredDependency { consumer, field }) => {
            assert_eq!(consumer, "sneaky");
            assert_eq!(field, at("x"));
        }
        other => panic!("expected UndeclaredDependency, got {other:?}"),
    }
}

#[test]
fn unknown_evaluator_type_fails_at_setup() {
    let list =
        ParameterList::from_json("field evaluators", r#"{"b": {"field evaluator type": "quantum foam"}}"#).unwrap();
    let mut store = single_column_store(1).with_evaluator_list(list);
    store.require(at("b"), FieldShape::cells("domain"), None).unwrap();
    match store.setup() {
        Err(StateError::Config(ConfigError::UnknownType { type_name })) => assert_eq!(type_name, "quantum foam"),
        other => panic!("expected UnknownType, got {other:?}"),
    }
}

#[test]
fn second_owner_is_rejected() {
    let mut store = single_column_store(1);
    store.require(at("b"), FieldShape::cells("domain"), None).unwrap();
    let log = hydrograph_test_utils::CallLog::new();
    store
        .register_evaluator(Box::new(CountingEvaluator::new(at("b"), vec![], log.clone())))
        .unwrap();
    match store.register_evaluator(Box::new(CountingEvaluator::new(at("b"), vec![], log))) {
        Err(StateError::DuplicateOwner { field, .. }) => assert_eq!(field, at("b")),
        other => panic!("expected DuplicateOwner, got {other:?}"),
    }
}

proptest! {
    #[test]
    fn chain_value_is_sum_of_offsets(a in -1.0e3f64..1.0e3, offsets in prop::collection::vec(-10.0f64..10.0, 1..6)) {
        let mut builder = ChainBuilder::new(1).primary("k0");
        let names: Vec<String> = (0..=offsets.len()).map(|i| format!("k{i}")).collect();
        for (i, off) in offsets.iter().enumerate() {
            builder = builder.link_with_offset(&names[i + 1], &[names[i].as_str()], *off);
        }
        let (mut store, log) = builder.build().unwrap();
        store.set_scalar(&at("k0"), a).unwrap();
        let last = names.last().unwrap();
        let got = cells(&mut store, last)[0];
        let expected = a + offsets.iter().sum::<f64>();
        prop_assert!((got - expected).abs() <= 1e-9 * expected.abs().max(1.0));
        prop_assert_eq!(log.calls().len(), offsets.len());
        // Every link has unit slope.
        let d = store.get_derivative(&at(last), &at("k0")).unwrap().view("cell").unwrap()[0];
        prop_assert_eq!(d, 1.0);
    }
}
