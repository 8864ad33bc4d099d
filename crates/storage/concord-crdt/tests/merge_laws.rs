//! Merge must be commutative, associative and idempotent for every type

use concord_crdt::{ActorId, CrdtValue, LwwRegister, Mergeable, OrSet, PnCounter};
use proptest::prelude::*;
use serde_json::json;

#[derive(Debug, Clone)]
enum SetOp {
    Add(u8),
    Remove(u8),
}

fn counter_ops() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(-50i64..50, 0..12)
}

fn set_ops() -> impl Strategy<Value = Vec<SetOp>> {
    prop::collection::vec(
        prop_oneof![(0u8..6).prop_map(SetOp::Add), (0u8..6).prop_map(SetOp::Remove)],
        0..16,
    )
}

fn build_counter(actor: &str, ops: &[i64]) -> PnCounter {
    let actor = ActorId::from(actor);
    let mut counter = PnCounter::new();
    for delta in ops {
        counter.apply(&actor, *delta);
    }
    counter
}

/// Replicas start from a shared base so removes can observe foreign tags
fn build_set(base: &OrSet<String>, actor: &str, ops: &[SetOp]) -> OrSet<String> {
    let actor = ActorId::from(actor);
    let mut set = base.clone();
    for op in ops {
        match op {
            SetOp::Add(e) => {
                set.add(&actor, format!("e{e}"));
            }
            SetOp::Remove(e) => {
                set.remove(&format!("e{e}"));
            }
        }
    }
    set
}

fn build_register(actor: &str, writes: &[u8]) -> LwwRegister<serde_json::Value> {
    let actor = ActorId::from(actor);
    let mut reg = LwwRegister::new();
    for w in writes {
        reg.set(&actor, json!(w));
    }
    reg
}

fn check_laws<T>(a: &T, b: &T, c: &T) -> Result<(), TestCaseError>
where
    T: Mergeable + PartialEq + std::fmt::Debug,
{
    prop_assert_eq!(a.merged(b), b.merged(a));
    prop_assert_eq!(a.merged(b).merged(c), a.merged(&b.merged(c)));
    prop_assert_eq!(a.merged(a), a.clone());
    let ab = a.merged(b);
    prop_assert_eq!(ab.merged(&b.merged(a)), ab);
    Ok(())
}

proptest! {
    #[test]
    fn counter_laws(x in counter_ops(), y in counter_ops(), z in counter_ops()) {
        let (a, b, c) = (build_counter("a", &x), build_counter("b", &y), build_counter("c", &z));
        check_laws(&a, &b, &c)?;
        let sum: i64 = x.iter().chain(&y).chain(&z).sum();
        prop_assert_eq!(a.merged(&b).merged(&c).value(), sum);
    }

    #[test]
    fn or_set_laws(seed in set_ops(), x in set_ops(), y in set_ops(), z in set_ops()) {
        let base = build_set(&OrSet::new(), "origin", &seed);
        let (a, b, c) = (
            build_set(&base, "a", &x),
            build_set(&base, "b", &y),
            build_set(&base, "c", &z),
        );
        check_laws(&a, &b, &c)?;
    }

    #[test]
    fn or_set_local_add_survives_merge(x in set_ops(), y in set_ops(), element in 0u8..6) {
        let base = OrSet::new();
        let mut a = build_set(&base, "a", &x);
        let b = build_set(&base, "b", &y);
        a.add(&ActorId::from("a"), format!("e{element}"));
        // b never observed a's fresh tag, so its removes cannot cancel it
        let expected = format!("e{}", element);
        prop_assert!(a.merged(&b).contains(&expected));
    }

    #[test]
    fn register_laws(
        x in prop::collection::vec(any::<u8>(), 0..6),
        y in prop::collection::vec(any::<u8>(), 0..6),
        z in prop::collection::vec(any::<u8>(), 0..6),
    ) {
        let (a, b, c) = (build_register("a", &x), build_register("b", &y), build_register("c", &z));
        check_laws(&a, &b, &c)?;
    }

    #[test]
    fn tagged_value_merge_is_commutative(x in counter_ops(), y in counter_ops()) {
        let a = CrdtValue::Counter(build_counter("a", &x));
        let b = CrdtValue::Counter(build_counter("b", &y));
        prop_assert_eq!(a.merged(&b).unwrap(), b.merged(&a).unwrap());
        let encoded = a.merged(&b).unwrap().to_json().unwrap();
        prop_assert_eq!(CrdtValue::from_json(&encoded).unwrap(), a.merged(&b).unwrap());
    }
}
