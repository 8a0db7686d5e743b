//! Content-addressed call identity
//!
//! A call's id is a SHA-256 digest over its node reference and argument
//! slots. Embedded calls contribute their own (already computed) ids, so the
//! hash is a Merkle hash over the whole argument tree and recursion
//! terminates at literals. Identity-by-content is what gives memoization for
//! free: the same value used in ten slots is one call, and re-registering an
//! identical invocation lands on the existing record.
//!
//! Canonical form: keyword slots iterate in lexicographic key order,
//! positional order is preserved, every field is length-prefixed, and
//! literals are encoded as JSON (object keys are already sorted because this
//! workspace builds `serde_json` without `preserve_order`). The encoder runs
//! twice per id; a literal whose two encodings differ is flagged as
//! non-deterministic rather than silently producing unstable identities.

use crate::call::Slot;
use crate::error::{MyceliaError, Result};
use mycelia_adapters::{CallId, NodeRef};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Domain separation tag; bump the suffix when the encoding changes.
const DOMAIN_TAG: &[u8] = b"mycelia.call.v1";

/// Compute the content id of a call from its parts.
///
/// Children referenced by [`Slot::Call`] must already carry their ids.
pub(crate) fn call_id(
    node: &NodeRef,
    args: &[Slot],
    kwargs: &BTreeMap<String, Slot>,
) -> Result<CallId> {
    let first = encode(node, args, kwargs)?;
    let second = encode(node, args, kwargs)?;
    if first != second {
        return Err(MyceliaError::NonDeterministicArgument(node.node.clone()));
    }

    let mut hasher = Sha256::new();
    hasher.update(&first);
    Ok(CallId::from_bytes(hasher.finalize().into()))
}

fn encode(node: &NodeRef, args: &[Slot], kwargs: &BTreeMap<String, Slot>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    frame(&mut buf, DOMAIN_TAG);
    frame(&mut buf, node.graph.as_bytes());
    frame(&mut buf, node.node.as_bytes());

    buf.extend_from_slice(&(args.len() as u64).to_be_bytes());
    for slot in args {
        encode_slot(&mut buf, node, slot)?;
    }

    buf.extend_from_slice(&(kwargs.len() as u64).to_be_bytes());
    for (key, slot) in kwargs {
        frame(&mut buf, key.as_bytes());
        encode_slot(&mut buf, node, slot)?;
    }

    Ok(buf)
}

fn encode_slot(buf: &mut Vec<u8>, node: &NodeRef, slot: &Slot) -> Result<()> {
    match slot {
        Slot::Literal(value) => {
            buf.push(0);
            let bytes = serde_json::to_vec(value).map_err(|error| {
                MyceliaError::NonSerializableArgument {
                    node: node.node.clone(),
                    reason: error.to_string(),
                }
            })?;
            frame(buf, &bytes);
        }
        Slot::Call(call) => {
            buf.push(1);
            buf.extend_from_slice(call.id().as_bytes());
        }
    }
    Ok(())
}

fn frame(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    buf.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Call;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn node() -> NodeRef {
        NodeRef::new("graph", "node")
    }

    fn literal(value: Value) -> Slot {
        Slot::Literal(value)
    }

    #[test]
    fn test_identical_parts_hash_identically() {
        let args = vec![literal(json!(1)), literal(json!("two"))];
        let a = call_id(&node(), &args, &BTreeMap::new()).unwrap();
        let b = call_id(&node(), &args, &BTreeMap::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_argument_changes_the_id() {
        let a = call_id(&node(), &[literal(json!(1))], &BTreeMap::new()).unwrap();
        let b = call_id(&node(), &[literal(json!(2))], &BTreeMap::new()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_positional_order_matters() {
        let ab = vec![literal(json!("a")), literal(json!("b"))];
        let ba = vec![literal(json!("b")), literal(json!("a"))];
        assert_ne!(
            call_id(&node(), &ab, &BTreeMap::new()).unwrap(),
            call_id(&node(), &ba, &BTreeMap::new()).unwrap()
        );
    }

    #[test]
    fn test_kwarg_insertion_order_does_not_matter() {
        let mut first = BTreeMap::new();
        first.insert("alpha".to_string(), literal(json!(1)));
        first.insert("beta".to_string(), literal(json!(2)));

        let mut second = BTreeMap::new();
        second.insert("beta".to_string(), literal(json!(2)));
        second.insert("alpha".to_string(), literal(json!(1)));

        assert_eq!(
            call_id(&node(), &[], &first).unwrap(),
            call_id(&node(), &[], &second).unwrap()
        );
    }

    #[test]
    fn test_node_name_separates_identical_arguments() {
        let args = vec![literal(json!(0))];
        let a = call_id(&NodeRef::new("g", "left"), &args, &BTreeMap::new()).unwrap();
        let b = call_id(&NodeRef::new("g", "right"), &args, &BTreeMap::new()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_child_call_contributes_its_id() {
        let child_a = Call::new(NodeRef::new("g", "child"), vec![literal(json!(1))], BTreeMap::new()).unwrap();
        let child_b = Call::new(NodeRef::new("g", "child"), vec![literal(json!(2))], BTreeMap::new()).unwrap();

        let parent_a = call_id(&node(), &[Slot::Call(child_a)], &BTreeMap::new()).unwrap();
        let parent_b = call_id(&node(), &[Slot::Call(child_b)], &BTreeMap::new()).unwrap();
        assert_ne!(parent_a, parent_b);
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,8}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_hash_is_deterministic(values in prop::collection::vec(arb_value(), 0..4)) {
            let args: Vec<Slot> = values.iter().cloned().map(Slot::Literal).collect();
            let a = call_id(&node(), &args, &BTreeMap::new()).unwrap();
            let b = call_id(&node(), &args, &BTreeMap::new()).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
