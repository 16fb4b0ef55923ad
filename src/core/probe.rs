//! Purpose: Locate and exercise optional engine capabilities by ordered probing.
//! Exports: `Capability`, `Shape`, `Introspect`, `Field`, `Method`, `Returned`,
//! `RawPayload`, `Unavailable`, `set_flag`, `call_accessor`, capability tables.
//! Role: Version-tolerance seam between the control surface and engine adapters.
//! Invariants: Candidates are tried strictly in table order; first structural
//! match wins, no scoring across matches.
//! Invariants: A panicking probed call is contained per attempt and never
//! escapes to the caller.
//! Notes: Engine adapters expose their optional surface through `Introspect`;
//! names follow the engine's own field/method names for each release.
use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;
use tracing::{debug, trace};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Shape {
    /// A boolean field that can be assigned.
    SettableFlag,
    /// A zero-argument method returning data, optionally paired with an error.
    Accessor,
}

#[derive(Clone, Copy, Debug)]
pub struct Capability {
    pub name: &'static str,
    pub shape: Shape,
    pub candidates: &'static [&'static str],
}

/// Per-connection tracking switch on the stats options.
pub const CONNECTION_TRACKING: Capability = Capability {
    name: "connection tracking",
    shape: Shape::SettableFlag,
    candidates: &[
        "EnableNekorayConnections",
        "NekorayConnections",
        "EnableConnections",
        "Connections",
    ],
};

/// Connection listing on the stats subsystem.
pub const CONNECTION_LISTING: Capability = Capability {
    name: "connection listing",
    shape: Shape::Accessor,
    candidates: &[
        "ListConnections",
        "Connections",
        "GetConnections",
        "NekorayConnections",
        "DumpConnections",
    ],
};

impl Capability {
    pub fn unavailable(&self) -> Unavailable {
        Unavailable {
            capability: self.name,
        }
    }
}

/// A named field as seen by the prober.
pub enum Field<'a> {
    Bool(&'a mut bool),
    /// Present and boolean, but not assignable from outside the engine.
    ReadOnlyBool(bool),
    /// Present with some other type.
    Other,
}

/// A named method as seen by the prober.
pub struct Method<'a> {
    arity: usize,
    call: Option<Box<dyn Fn() -> Returned + 'a>>,
}

impl<'a> Method<'a> {
    pub fn accessor(call: impl Fn() -> Returned + 'a) -> Self {
        Self {
            arity: 0,
            call: Some(Box::new(call)),
        }
    }

    /// Signature-only entry for a method that takes arguments. The prober
    /// never invokes these.
    pub fn requiring(arity: usize) -> Self {
        Self { arity, call: None }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }
}

/// What a zero-argument accessor handed back.
pub enum Returned {
    Unit,
    Value(RawPayload),
    Fallible(Result<RawPayload, String>),
}

pub trait EncodeJson {
    fn encode_json(&self) -> serde_json::Result<String>;
}

impl<T: Serialize> EncodeJson for T {
    fn encode_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub enum RawPayload {
    Text(String),
    Bytes(Vec<u8>),
    Structured(Box<dyn EncodeJson + Send>),
}

impl RawPayload {
    pub fn structured<T: Serialize + Send + 'static>(value: T) -> Self {
        Self::Structured(Box::new(value))
    }
}

impl fmt::Debug for RawPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Structured(_) => f.write_str("Structured(..)"),
        }
    }
}

/// Optional surface of an engine object, addressed by name.
pub trait Introspect {
    fn field_mut(&mut self, _name: &str) -> Option<Field<'_>> {
        None
    }

    fn method(&self, _name: &str) -> Option<Method<'_>> {
        None
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Unavailable {
    pub capability: &'static str,
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "capability unavailable: {}", self.capability)
    }
}

impl StdError for Unavailable {}

/// Assigns `value` to the first candidate that is an assignable boolean field.
///
/// Returns the name that matched.
pub fn set_flag(
    capability: &Capability,
    target: &mut (impl Introspect + ?Sized),
    value: bool,
) -> Result<&'static str, Unavailable> {
    if capability.shape != Shape::SettableFlag {
        return Err(capability.unavailable());
    }
    for &candidate in capability.candidates {
        match target.field_mut(candidate) {
            Some(Field::Bool(slot)) => {
                *slot = value;
                debug!(capability = capability.name, candidate, value, "flag set");
                return Ok(candidate);
            }
            Some(Field::ReadOnlyBool(_)) | Some(Field::Other) => {
                trace!(capability = capability.name, candidate, "shape mismatch");
            }
            None => {}
        }
    }
    debug!(capability = capability.name, "no candidate matched");
    Err(capability.unavailable())
}

/// Invokes zero-argument accessors in candidate order and hands their output
/// to `accept`.
///
/// A candidate is skipped when its call reports an error, panics, returns
/// nothing, or `accept` rejects the output; the next candidate is then tried
/// once. The first accepted output is returned.
pub fn call_accessor<T>(
    capability: &Capability,
    target: &(impl Introspect + ?Sized),
    mut accept: impl FnMut(RawPayload) -> Option<T>,
) -> Result<T, Unavailable> {
    if capability.shape != Shape::Accessor {
        return Err(capability.unavailable());
    }
    for &candidate in capability.candidates {
        let Some(method) = target.method(candidate) else {
            continue;
        };
        let Some(call) = method.call.as_ref().filter(|_| method.arity == 0) else {
            trace!(
                capability = capability.name,
                candidate,
                arity = method.arity,
                "not an accessor"
            );
            continue;
        };

        let attempt = panic::catch_unwind(AssertUnwindSafe(|| match call() {
            Returned::Unit => None,
            Returned::Value(raw) | Returned::Fallible(Ok(raw)) => accept(raw),
            Returned::Fallible(Err(reason)) => {
                debug!(capability = capability.name, candidate, %reason, "accessor reported error");
                None
            }
        }));
        match attempt {
            Ok(Some(output)) => {
                trace!(capability = capability.name, candidate, "accessor accepted");
                return Ok(output);
            }
            Ok(None) => {
                debug!(capability = capability.name, candidate, "no usable data");
            }
            Err(payload) => {
                debug!(
                    capability = capability.name,
                    candidate,
                    panic = panic_message(payload.as_ref()),
                    "probed call faulted"
                );
            }
        }
    }
    Err(capability.unavailable())
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
