//! Conversion between host values and interpreter values.
//!
//! The [`ValueBridge`] is the single chokepoint where dynamically typed script
//! values become [`BridgedValue`] trees. Anything outside the closed value
//! model is rejected instead of coerced.
//!
//! Numeric policy: integers that do not fit `i64` are rejected with
//! [`BridgeError::NumericOverflow`]. Script maps are ordered by key, so
//! mappings coming back from a script list their keys in sorted order.

use super::error::BridgeError;
use super::types::{BridgedMap, BridgedValue};
use crate::constants::DEFAULT_MAX_VALUE_DEPTH;
use rhai::{Array, Blob, Dynamic, ImmutableString, Map, FLOAT, INT};

/// Converts values across the script boundary.
#[derive(Debug, Clone, Copy)]
pub struct ValueBridge {
    max_depth: usize,
}

impl Default for ValueBridge {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_VALUE_DEPTH)
    }
}

impl ValueBridge {
    /// Creates a bridge that rejects values nested deeper than `max_depth`.
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Converts an interpreter value into a host value.
    pub fn to_host(&self, value: &Dynamic) -> Result<BridgedValue, BridgeError> {
        let mut path = Vec::new();
        self.convert(value, 0, &mut path)
    }

    /// Converts a host value into an interpreter value.
    pub fn to_embedded(&self, value: &BridgedValue) -> Dynamic {
        match value {
            BridgedValue::Null => Dynamic::UNIT,
            BridgedValue::Bool(b) => Dynamic::from_bool(*b),
            BridgedValue::Int(i) => Dynamic::from_int(*i as INT),
            BridgedValue::Float(f) => Dynamic::from_float(*f as FLOAT),
            BridgedValue::Text(s) => Dynamic::from(ImmutableString::from(s.as_str())),
            BridgedValue::Sequence(items) => {
                let array: Array = items.iter().map(|item| self.to_embedded(item)).collect();
                Dynamic::from_array(array)
            }
            BridgedValue::Mapping(entries) => {
                let mut map = Map::new();
                for (key, item) in entries {
                    map.insert(key.as_str().into(), self.to_embedded(item));
                }
                Dynamic::from_map(map)
            }
        }
    }

    /// `path` holds the identities of shared cells currently being converted;
    /// meeting one of them again means the value refers to itself.
    fn convert(
        &self,
        value: &Dynamic,
        depth: usize,
        path: &mut Vec<usize>,
    ) -> Result<BridgedValue, BridgeError> {
        if depth > self.max_depth {
            return Err(BridgeError::DepthExceeded {
                limit: self.max_depth,
            });
        }

        if value.is_shared() {
            let (cell, inner) = match value.read_lock::<Dynamic>() {
                Some(guard) => (&*guard as *const Dynamic as usize, (*guard).clone()),
                None => {
                    return Err(BridgeError::UnsupportedShape {
                        type_name: value.type_name().to_string(),
                    })
                }
            };
            if path.contains(&cell) {
                return Err(BridgeError::CyclicValue);
            }
            path.push(cell);
            let result = self.convert(&inner, depth, path);
            path.pop();
            return result;
        }

        if value.is_unit() {
            return Ok(BridgedValue::Null);
        }
        if let Ok(b) = value.as_bool() {
            return Ok(BridgedValue::Bool(b));
        }
        if let Ok(i) = value.as_int() {
            return Ok(BridgedValue::Int(i as i64));
        }
        if let Ok(f) = value.as_float() {
            return Ok(BridgedValue::Float(f as f64));
        }
        if let Ok(c) = value.as_char() {
            return Ok(BridgedValue::Text(c.to_string()));
        }
        if let Some(s) = value.read_lock::<ImmutableString>() {
            return Ok(BridgedValue::Text(s.to_string()));
        }
        if let Some(array) = value.read_lock::<Array>() {
            let mut items = Vec::with_capacity(array.len());
            for item in array.iter() {
                items.push(self.convert(item, depth + 1, path)?);
            }
            return Ok(BridgedValue::Sequence(items));
        }
        if let Some(blob) = value.read_lock::<Blob>() {
            return Ok(BridgedValue::Sequence(
                blob.iter().map(|b| BridgedValue::Int(i64::from(*b))).collect(),
            ));
        }
        if let Some(map) = value.read_lock::<Map>() {
            let mut entries = BridgedMap::with_capacity(map.len());
            for (key, item) in map.iter() {
                entries.insert(key.to_string(), self.convert(item, depth + 1, path)?);
            }
            return Ok(BridgedValue::Mapping(entries));
        }

        self.convert_wide_integer(value)
    }

    /// Integers of other widths reach scripts only through host-registered
    /// values; they are accepted when they fit `i64`.
    fn convert_wide_integer(&self, value: &Dynamic) -> Result<BridgedValue, BridgeError> {
        let wide: Option<i128> = if let Some(v) = value.read_lock::<u64>() {
            Some(i128::from(*v))
        } else if let Some(v) = value.read_lock::<i128>() {
            Some(*v)
        } else if let Some(v) = value.read_lock::<u128>() {
            match i128::try_from(*v) {
                Ok(v) => Some(v),
                Err(_) => {
                    return Err(BridgeError::NumericOverflow {
                        value: v.to_string(),
                    })
                }
            }
        } else if let Some(v) = value.read_lock::<u32>() {
            Some(i128::from(*v))
        } else if let Some(v) = value.read_lock::<i32>() {
            Some(i128::from(*v))
        } else {
            None
        };

        match wide {
            Some(v) => i64::try_from(v)
                .map(BridgedValue::Int)
                .map_err(|_| BridgeError::NumericOverflow {
                    value: v.to_string(),
                }),
            None => Err(BridgeError::UnsupportedShape {
                type_name: value.type_name().to_string(),
            }),
        }
    }
}
