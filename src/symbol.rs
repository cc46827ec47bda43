//! Identifiers and values for the working-memory engine.
//!
//! Every entity the engine tracks (objects, facts, preferences, slots,
//! instantiations, dependency sets) is addressed by a niche-optimized
//! identifier. Identifiers are handed out by an [`IdAllocator`] owned by the
//! engine; they are never reused within one run, which is what lets fact and
//! preference identifiers double as creation timestamps.

use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use crate::error::{ResourceError, WmResult};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name(NonZeroU64);

        impl $name {
            /// Create an identifier from a raw `u64`. Returns `None` for zero.
            pub fn new(raw: u64) -> Option<Self> {
                NonZeroU64::new(raw).map($name)
            }

            /// Get the underlying `u64` value.
            pub fn get(self) -> u64 {
                self.0.get()
            }
        }

        impl From<NonZeroU64> for $name {
            fn from(raw: NonZeroU64) -> Self {
                $name(raw)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(
    /// An object reference (identifier): a node that can own slots.
    ObjectId,
    "obj:"
);
define_id!(
    /// A fact's timetag. Monotonic, so it also orders facts by creation.
    FactId,
    "t"
);
define_id!(
    /// A preference. Monotonic, so it also orders preferences by creation.
    PreferenceId,
    "pref:"
);
define_id!(
    /// One concrete rule firing.
    InstantiationId,
    "inst:"
);
define_id!(
    /// One (object, attribute) slot.
    SlotId,
    "slot:"
);
define_id!(
    /// A goal dependency set.
    GdsId,
    "gds:"
);

/// A value in working memory: the attribute or value position of a fact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// A reference to another object. These are the edges ownership walks.
    Object(ObjectId),
    /// A symbolic constant.
    Sym(String),
    /// An integer constant.
    Int(i64),
}

impl Value {
    /// Shorthand for a symbolic constant.
    pub fn sym(s: impl Into<String>) -> Self {
        Value::Sym(s.into())
    }

    /// The referenced object, if this value is an object reference.
    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    /// True if this value is the given symbolic constant.
    pub fn is_sym(&self, s: &str) -> bool {
        matches!(self, Value::Sym(v) if v == s)
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Object(id)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Sym(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Object(id) => write!(f, "{id}"),
            Value::Sym(s) => write!(f, "{s}"),
            Value::Int(n) => write!(f, "{n}"),
        }
    }
}

/// Monotonic identifier allocator, scoped to one engine.
///
/// Starts at 1 and never reuses a value, so identifiers from one allocator
/// are totally ordered by creation.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    /// Create a new allocator that starts from 1.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Allocate the next identifier.
    ///
    /// Returns an error if the identifier space is exhausted.
    pub fn next_id<T: From<NonZeroU64>>(&mut self) -> WmResult<T> {
        let raw = NonZeroU64::new(self.next).ok_or(ResourceError::AllocatorExhausted)?;
        self.next = self.next.checked_add(1).unwrap_or(0);
        Ok(T::from(raw))
    }

    /// Return the next raw value that *would* be allocated.
    pub fn peek_next(&self) -> u64 {
        self.next
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
