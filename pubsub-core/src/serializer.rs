//! Bidirectional mapping of arbitrary payload graphs to a `(json, metaList)` pair.
//!
//! The default JSON mapping loses information for a handful of value
//! shapes: dates, values outside `f64`'s safe integer range, byte buffers,
//! sets, maps with non-string keys, and an explicit "undefined" sentinel.
//! Since a generic `T: Serialize` has already lost its original Rust type by
//! the time it reaches `serde_json::Value`, producers that want one of these
//! types preserved emit a single-key marker object for it (`{"$date":
//! "<rfc3339>"}`, `{"$bigint": "<decimal>"}`, `{"$bytes": "<base64>"}`,
//! `{"$set": [...]}`, `{"$map": [[key, value], ...]}`, `{"$undefined":
//! true}`) — the same structural-condition approach [`CustomType`] uses, just
//! built in. [`walk_and_tag`] recognizes these markers, strips them down to
//! the plain JSON shape documented on each [`TypeTag`] variant, and records
//! the position in an ordered `metaList` of `(type_tag, path)` entries so a
//! receiver can reconstruct the original marker on [`deserialize`].
//! Everything else round-trips through plain JSON.
//!
//! Applications can extend the built-in type coverage by registering a
//! [`CustomType`] with a caller-chosen `type_tag` that does not collide
//! with the built-in tags in [`TypeTag`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Errors raised while serializing or deserializing a payload graph.
#[derive(Error, Debug)]
pub enum SerializerError {
    /// The payload could not be converted to a JSON value.
    #[error("failed to encode payload as json: {0}")]
    Encode(#[from] serde_json::Error),

    /// A `metaList` entry referenced a path that does not exist in the JSON value.
    #[error("meta entry path {path:?} not found in decoded json")]
    PathNotFound {
        /// The path that failed to resolve.
        path: Vec<PathSegment>,
    },

    /// A custom type's `type_tag` collided with a built-in tag.
    #[error("custom type tag {0} collides with a built-in type tag")]
    ReservedTypeTag(i32),

    /// A registered custom type's deserializer failed.
    #[error("custom type {0} failed to deserialize: {1}")]
    CustomTypeDeserialize(i32, String),
}

/// Built-in type tags used in `metaList` entries.
///
/// Negative values are reserved for built-ins; custom registrations must
/// use non-negative tags.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i32)]
pub enum TypeTag {
    /// An RFC 3339 date/time, stored as a string in the JSON value.
    Date = -1,
    /// An arbitrary-precision integer outside `f64`'s safe range, stored as a decimal string.
    BigInt = -2,
    /// A byte buffer, stored base64-encoded as a string.
    ByteBuffer = -3,
    /// A set, stored as a JSON array of its elements.
    Set = -4,
    /// A mapping with non-string keys, stored as a JSON array of `[key, value]` pairs.
    NonStringKeyMap = -5,
    /// The `undefined` sentinel (as distinct from JSON `null`), stored as JSON `null`.
    Undefined = -6,
    /// A caller-registered custom type. The actual tag value lives in [`MetaEntry::custom_tag`].
    Custom = 0,
}

impl TypeTag {
    const fn is_reserved(tag: i32) -> bool {
        tag < 0
    }
}

/// A single segment of a path into a JSON value: either an object key or an array index.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// An object key.
    Key(String),
    /// An array index.
    Index(usize),
}

/// One entry in the `metaList`: a type tag and the path at which it applies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaEntry {
    /// `None` for built-in tags (identified by [`TypeTag`] discriminant); `Some(tag)` for
    /// custom-registered types, where `tag` is the registrant-chosen, non-negative value.
    pub custom_tag: Option<i32>,

    /// Built-in tag, present when `custom_tag` is `None`.
    pub builtin_tag: Option<TypeTag>,

    /// Path to the position in the JSON value this entry describes.
    pub path: Vec<PathSegment>,
}

/// The `(jsonValue, metaList)` pair produced by serializing a payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerializedPayload {
    /// The JSON-representable value.
    pub json: Value,
    /// Positions where `json` alone would lose type information.
    pub meta_list: Vec<MetaEntry>,
}

/// A caller-registered mapping for a type the built-in serializer does not cover.
///
/// `condition` decides whether a given JSON value (as produced by the
/// default serde_json encoding) should be reinterpreted by this type;
/// `serialize`/`deserialize` perform the actual conversion.
pub struct CustomType {
    /// Non-negative tag identifying this type in `metaList` entries. Must not collide
    /// with another registered tag.
    pub type_tag: i32,
    /// Returns `true` if `value` should be handled by this registration.
    pub condition: Box<dyn Fn(&Value) -> bool + Send + Sync>,
    /// Converts a matched value into its wire JSON representation.
    pub serialize: Box<dyn Fn(&Value) -> Value + Send + Sync>,
    /// Reconstructs the original value from its wire JSON representation.
    pub deserialize: Box<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>,
}

impl fmt::Debug for CustomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomType")
            .field("type_tag", &self.type_tag)
            .finish_non_exhaustive()
    }
}

/// Registry of [`CustomType`] entries consulted during serialization.
#[derive(Default)]
pub struct TypeRegistry {
    types: Vec<CustomType>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self { types: Vec::new() }
    }

    /// Registers a custom type.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::ReservedTypeTag`] if `custom.type_tag` is negative
    /// (the built-in tags occupy the negative range) or already registered.
    pub fn register(&mut self, custom: CustomType) -> Result<(), SerializerError> {
        if TypeTag::is_reserved(custom.type_tag) {
            return Err(SerializerError::ReservedTypeTag(custom.type_tag));
        }
        if self.types.iter().any(|t| t.type_tag == custom.type_tag) {
            return Err(SerializerError::ReservedTypeTag(custom.type_tag));
        }
        self.types.push(custom);
        Ok(())
    }

    fn find_matching(&self, value: &Value) -> Option<&CustomType> {
        self.types.iter().find(|t| (t.condition)(value))
    }

    fn find_by_tag(&self, tag: i32) -> Option<&CustomType> {
        self.types.iter().find(|t| t.type_tag == tag)
    }
}

const DATE_MARKER: &str = "$date";
const BIGINT_MARKER: &str = "$bigint";
const BYTES_MARKER: &str = "$bytes";
const SET_MARKER: &str = "$set";
const MAP_MARKER: &str = "$map";
const UNDEFINED_MARKER: &str = "$undefined";

/// Recognizes a built-in marker object (`{"$date": ...}` and friends) and
/// returns the tag plus the plain JSON value it unwraps to, or `None` if
/// `value` is not one of the reserved single-key marker shapes.
fn detect_builtin(value: &Value) -> Option<(TypeTag, Value)> {
    let Value::Object(map) = value else {
        return None;
    };
    if map.len() != 1 {
        return None;
    }
    let (key, inner) = map.iter().next()?;
    match key.as_str() {
        DATE_MARKER if inner.is_string() => Some((TypeTag::Date, inner.clone())),
        BIGINT_MARKER if inner.is_string() => Some((TypeTag::BigInt, inner.clone())),
        BYTES_MARKER if inner.is_string() => Some((TypeTag::ByteBuffer, inner.clone())),
        SET_MARKER if inner.is_array() => Some((TypeTag::Set, inner.clone())),
        MAP_MARKER if inner.is_array() => Some((TypeTag::NonStringKeyMap, inner.clone())),
        UNDEFINED_MARKER => Some((TypeTag::Undefined, Value::Null)),
        _ => None,
    }
}

/// Re-wraps a built-in tag's plain JSON value back into its marker object.
fn rewrap_builtin(tag: TypeTag, inner: Value) -> Value {
    let key = match tag {
        TypeTag::Date => DATE_MARKER,
        TypeTag::BigInt => BIGINT_MARKER,
        TypeTag::ByteBuffer => BYTES_MARKER,
        TypeTag::Set => SET_MARKER,
        TypeTag::NonStringKeyMap => MAP_MARKER,
        TypeTag::Undefined => UNDEFINED_MARKER,
        TypeTag::Custom => {
            // `deserialize` only calls this for `entry.builtin_tag`, which is
            // never `Custom` (custom entries carry `custom_tag` instead).
            return inner;
        }
    };
    let mut map = serde_json::Map::new();
    map.insert(key.to_string(), if tag == TypeTag::Undefined { Value::Bool(true) } else { inner });
    Value::Object(map)
}

/// Serializes a JSON-encodable value into a `(json, metaList)` pair.
///
/// Built-in lossy shapes are recognized structurally via the marker-object
/// convention documented on the module, then stripped down to the plain
/// representation described on each [`TypeTag`] variant. Callers working
/// with richer source types should emit the relevant marker (or register a
/// [`CustomType`] for it) before calling [`serialize`].
///
/// # Errors
///
/// Returns [`SerializerError::Encode`] if `value` cannot be encoded as JSON.
pub fn serialize<T: Serialize>(
    value: &T,
    registry: &TypeRegistry,
) -> Result<SerializedPayload, SerializerError> {
    let json = serde_json::to_value(value)?;
    let mut meta_list = Vec::new();
    let mut out = json.clone();
    walk_and_tag(&mut out, &mut Vec::new(), &mut meta_list, registry);
    Ok(SerializedPayload {
        json: out,
        meta_list,
    })
}

fn walk_and_tag(
    value: &mut Value,
    path: &mut Vec<PathSegment>,
    meta_list: &mut Vec<MetaEntry>,
    registry: &TypeRegistry,
) {
    if let Some((tag, inner)) = detect_builtin(value) {
        *value = inner;
        meta_list.push(MetaEntry {
            custom_tag: None,
            builtin_tag: Some(tag),
            path: path.clone(),
        });
        return;
    }

    if let Some(custom) = registry.find_matching(value) {
        let encoded = (custom.serialize)(value);
        *value = encoded;
        meta_list.push(MetaEntry {
            custom_tag: Some(custom.type_tag),
            builtin_tag: None,
            path: path.clone(),
        });
        return;
    }

    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                path.push(PathSegment::Key(key.clone()));
                walk_and_tag(child, path, meta_list, registry);
                path.pop();
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter_mut().enumerate() {
                path.push(PathSegment::Index(index));
                walk_and_tag(child, path, meta_list, registry);
                path.pop();
            }
        }
        _ => {}
    }
}

/// Reconstructs a JSON value from a `(json, metaList)` pair produced by [`serialize`].
///
/// # Errors
///
/// Returns [`SerializerError::PathNotFound`] if a `metaList` entry's path does not
/// resolve in `payload.json`, or [`SerializerError::CustomTypeDeserialize`] if a
/// registered custom type's decoder fails.
pub fn deserialize(
    payload: &SerializedPayload,
    registry: &TypeRegistry,
) -> Result<Value, SerializerError> {
    let mut out = payload.json.clone();
    for entry in &payload.meta_list {
        if let Some(tag) = entry.custom_tag {
            let custom = registry
                .find_by_tag(tag)
                .ok_or(SerializerError::ReservedTypeTag(tag))?;
            let slot = resolve_path_mut(&mut out, &entry.path)
                .ok_or_else(|| SerializerError::PathNotFound {
                    path: entry.path.clone(),
                })?;
            let decoded = (custom.deserialize)(slot)
                .map_err(|e| SerializerError::CustomTypeDeserialize(tag, e))?;
            *slot = decoded;
        } else if let Some(builtin_tag) = entry.builtin_tag {
            let slot = resolve_path_mut(&mut out, &entry.path)
                .ok_or_else(|| SerializerError::PathNotFound {
                    path: entry.path.clone(),
                })?;
            *slot = rewrap_builtin(builtin_tag, slot.clone());
        }
    }
    Ok(out)
}

fn resolve_path_mut<'a>(value: &'a mut Value, path: &[PathSegment]) -> Option<&'a mut Value> {
    let mut current = value;
    for segment in path {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get_mut(key)?,
            (PathSegment::Index(index), Value::Array(items)) => items.get_mut(*index)?,
            _ => return None,
        };
    }
    Some(current)
}
