//! Deferred call values
//!
//! A [`Call`] is one invocation of one node with fully-specified arguments,
//! not yet executed. It is an immutable, cheaply cloneable tree: each
//! argument slot holds either a literal value or another call, and the
//! content id is computed at construction (children first, so the Merkle
//! recursion comes for free). Two calls that compare equal by id are the
//! same entity; no interning table is needed beyond the scheduler's id map.
//!
//! A [`Deferred`] is the opaque stand-in for a node's eventual return value:
//! either a call or a concrete value. Node bodies return one (`Value` to
//! resolve, `Call` to tail-call into a successor), and argument slots accept
//! both. User code may store it, forward it, or pass it along, but not look
//! inside.

use crate::error::{MyceliaError, Result};
use crate::identity;
use mycelia_adapters::{CallId, CallRecord, NodeRef, SlotRecord};
use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Marker key identifying a serialized deferred call.
///
/// The argument walker rejects any literal containing this key: a deferred
/// call buried inside a container cannot become a dependency edge.
pub(crate) const CALL_MARKER: &str = "$mycelia.call";

/// One argument slot: a literal value or an embedded call
#[derive(Clone, Debug)]
pub enum Slot {
    Literal(Value),
    Call(Call),
}

struct CallInner {
    id: CallId,
    node: NodeRef,
    args: Vec<Slot>,
    kwargs: BTreeMap<String, Slot>,
}

/// A deferred invocation of a node, identified by content hash
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    /// Build a call from its parts, computing the content id.
    pub(crate) fn new(
        node: NodeRef,
        args: Vec<Slot>,
        kwargs: BTreeMap<String, Slot>,
    ) -> Result<Self> {
        let id = identity::call_id(&node, &args, &kwargs)?;
        Ok(Self {
            inner: Arc::new(CallInner {
                id,
                node,
                args,
                kwargs,
            }),
        })
    }

    /// Content id of this call.
    pub fn id(&self) -> CallId {
        self.inner.id
    }

    /// The node this call targets.
    pub fn node(&self) -> &NodeRef {
        &self.inner.node
    }

    /// Direct child calls, in slot order (positionals first, then keywords).
    pub(crate) fn child_calls(&self) -> impl Iterator<Item = &Call> {
        self.inner
            .args
            .iter()
            .chain(self.inner.kwargs.values())
            .filter_map(|slot| match slot {
                Slot::Call(call) => Some(call),
                Slot::Literal(_) => None,
            })
    }

    /// Storage record for this call, with children collapsed to id refs.
    pub(crate) fn to_record(&self) -> CallRecord {
        let args = self.inner.args.iter().map(slot_record).collect();
        let kwargs = self
            .inner
            .kwargs
            .iter()
            .map(|(key, slot)| (key.clone(), slot_record(slot)))
            .collect();
        CallRecord::new(self.inner.id, self.inner.node.clone(), args, kwargs)
    }

    /// Serialize the whole call tree for transport inside a broker event.
    pub fn to_wire(&self) -> Value {
        json!({
            "node": { "graph": self.inner.node.graph, "node": self.inner.node.node },
            "args": self.inner.args.iter().map(slot_wire).collect::<Vec<_>>(),
            "kwargs": self
                .inner
                .kwargs
                .iter()
                .map(|(key, slot)| (key.clone(), slot_wire(slot)))
                .collect::<Map<String, Value>>(),
        })
    }

    /// Rebuild a call tree from its wire form, recomputing ids.
    pub fn from_wire(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| MyceliaError::MalformedCall("expected an object".into()))?;

        let node = object
            .get("node")
            .and_then(Value::as_object)
            .ok_or_else(|| MyceliaError::MalformedCall("missing node reference".into()))?;
        let graph = node
            .get("graph")
            .and_then(Value::as_str)
            .ok_or_else(|| MyceliaError::MalformedCall("missing graph name".into()))?;
        let name = node
            .get("node")
            .and_then(Value::as_str)
            .ok_or_else(|| MyceliaError::MalformedCall("missing node name".into()))?;

        let args = object
            .get("args")
            .and_then(Value::as_array)
            .ok_or_else(|| MyceliaError::MalformedCall("missing args".into()))?
            .iter()
            .map(slot_from_wire)
            .collect::<Result<Vec<_>>>()?;

        let kwargs = object
            .get("kwargs")
            .and_then(Value::as_object)
            .ok_or_else(|| MyceliaError::MalformedCall("missing kwargs".into()))?
            .iter()
            .map(|(key, slot)| Ok((key.clone(), slot_from_wire(slot)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Call::new(NodeRef::new(graph, name), args, kwargs)
    }
}

fn slot_record(slot: &Slot) -> SlotRecord {
    match slot {
        Slot::Literal(value) => SlotRecord::Literal(value.clone()),
        Slot::Call(call) => SlotRecord::Ref(call.id()),
    }
}

fn slot_wire(slot: &Slot) -> Value {
    match slot {
        Slot::Literal(value) => json!({ "kind": "literal", "value": value }),
        Slot::Call(call) => json!({ "kind": "call", "value": call.to_wire() }),
    }
}

fn slot_from_wire(value: &Value) -> Result<Slot> {
    let object = value
        .as_object()
        .ok_or_else(|| MyceliaError::MalformedCall("expected a slot object".into()))?;
    let kind = object
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| MyceliaError::MalformedCall("slot missing kind".into()))?;
    let inner = object
        .get("value")
        .ok_or_else(|| MyceliaError::MalformedCall("slot missing value".into()))?;

    match kind {
        "literal" => Ok(Slot::Literal(inner.clone())),
        "call" => Ok(Slot::Call(Call::from_wire(inner)?)),
        other => Err(MyceliaError::MalformedCall(format!(
            "unknown slot kind '{}'",
            other
        ))),
    }
}

impl PartialEq for Call {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Call {}

impl Hash for Call {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Call {
    // a call tree can be arbitrarily deep; keep Debug shallow
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.inner.id)
            .field("node", &self.inner.node)
            .field("args", &self.inner.args.len())
            .field("kwargs", &self.inner.kwargs.len())
            .finish()
    }
}

/// Opaque stand-in for a node's eventual return value
///
/// Either a concrete value or a deferred call. Node bodies return one;
/// argument slots accept one. Treat it as opaque: it can be stored,
/// forwarded, or passed as an argument, but not inspected.
#[derive(Clone, Debug)]
pub struct Deferred {
    repr: DeferredRepr,
}

#[derive(Clone, Debug)]
pub(crate) enum DeferredRepr {
    Call(Call),
    Value(Value),
}

impl Deferred {
    /// A deferred that is already a concrete value.
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            repr: DeferredRepr::Value(value.into()),
        }
    }

    pub(crate) fn into_repr(self) -> DeferredRepr {
        self.repr
    }
}

impl From<Call> for Deferred {
    fn from(call: Call) -> Self {
        Self {
            repr: DeferredRepr::Call(call),
        }
    }
}

impl From<&Call> for Deferred {
    fn from(call: &Call) -> Self {
        Self {
            repr: DeferredRepr::Call(call.clone()),
        }
    }
}

impl From<Value> for Deferred {
    fn from(value: Value) -> Self {
        Self {
            repr: DeferredRepr::Value(value),
        }
    }
}

impl Serialize for Deferred {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match &self.repr {
            DeferredRepr::Value(value) => value.serialize(serializer),
            DeferredRepr::Call(call) => {
                // reserved marker form; the walker refuses it inside literals
                let mut map = Map::new();
                map.insert(CALL_MARKER.to_string(), Value::String(call.id().to_string()));
                Value::Object(map).serialize(serializer)
            }
        }
    }
}
