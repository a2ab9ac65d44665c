//! Approximate memory accounting for cached values
//!
//! Estimates are heuristics, not allocator-exact numbers. Strings and byte
//! buffers count their length, scalars their natural width, and containers
//! recurse into their elements. Allocator slack, hash-table buckets, and
//! pointer overhead are ignored.

use std::collections::{BTreeMap, HashMap};
use std::mem::size_of;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

/// Per-element estimate for JSON numbers, booleans, and nulls
pub const JSON_SCALAR_ESTIMATE: usize = 8;

/// Best-effort size of a value in bytes
pub trait EstimateSize {
    /// Estimated bytes held by this value
    fn estimated_size(&self) -> usize;
}

macro_rules! fixed_width {
    ($($t:ty),* $(,)?) => {
        $(
            impl EstimateSize for $t {
                fn estimated_size(&self) -> usize {
                    size_of::<$t>()
                }
            }
        )*
    };
}

fixed_width!(bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

impl EstimateSize for str {
    fn estimated_size(&self) -> usize {
        self.len()
    }
}

impl EstimateSize for String {
    fn estimated_size(&self) -> usize {
        self.len()
    }
}

impl EstimateSize for Bytes {
    fn estimated_size(&self) -> usize {
        self.len()
    }
}

impl<T: EstimateSize> EstimateSize for [T] {
    fn estimated_size(&self) -> usize {
        self.iter().map(EstimateSize::estimated_size).sum()
    }
}

impl<T: EstimateSize> EstimateSize for Vec<T> {
    fn estimated_size(&self) -> usize {
        self.as_slice().estimated_size()
    }
}

impl<T: EstimateSize> EstimateSize for Option<T> {
    fn estimated_size(&self) -> usize {
        self.as_ref().map_or(0, EstimateSize::estimated_size)
    }
}

impl<T: EstimateSize + ?Sized> EstimateSize for Box<T> {
    fn estimated_size(&self) -> usize {
        (**self).estimated_size()
    }
}

impl<T: EstimateSize + ?Sized> EstimateSize for Arc<T> {
    fn estimated_size(&self) -> usize {
        (**self).estimated_size()
    }
}

impl<K: EstimateSize, V: EstimateSize, S> EstimateSize for HashMap<K, V, S> {
    fn estimated_size(&self) -> usize {
        self.iter()
            .map(|(k, v)| k.estimated_size() + v.estimated_size())
            .sum()
    }
}

impl<K: EstimateSize, V: EstimateSize> EstimateSize for BTreeMap<K, V> {
    fn estimated_size(&self) -> usize {
        self.iter()
            .map(|(k, v)| k.estimated_size() + v.estimated_size())
            .sum()
    }
}

impl EstimateSize for Value {
    fn estimated_size(&self) -> usize {
        match self {
            Value::Null | Value::Bool(_) | Value::Number(_) => JSON_SCALAR_ESTIMATE,
            Value::String(s) => s.len(),
            Value::Array(items) => {
                let (scalars, nested): (Vec<&Value>, Vec<&Value>) =
                    items.iter().partition(|v| is_json_scalar(v));
                estimate_elements(scalars.len(), JSON_SCALAR_ESTIMATE)
                    + nested.into_iter().map(EstimateSize::estimated_size).sum::<usize>()
            }
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| k.len() + v.estimated_size())
                .sum(),
        }
    }
}

fn is_json_scalar(value: &Value) -> bool {
    matches!(value, Value::Null | Value::Bool(_) | Value::Number(_))
}

/// Estimate for `count` elements of an opaque type
#[must_use]
pub fn estimate_elements(count: usize, per_element: usize) -> usize {
    count.saturating_mul(per_element)
}
