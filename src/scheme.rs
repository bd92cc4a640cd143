//! Typed object & scheme system (spec §3, §4.A).
//!
//! A [`Scheme`] maps type identifiers to constructors for concrete Rust
//! types, the way the Go reference maps them to `reflect.Type`s. Reverse
//! lookup (`type_for_prototype`) uses `std::any::TypeId`, which is Rust's
//! own analogue of that reflection key.

use std::any::{Any, TypeId as RustTypeId};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use color_eyre::eyre::{bail, ensure, eyre, Context};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::OcmError;
use crate::Result;

/// A type identifier: `name` optionally followed by `/version`.
///
/// ```
/// # use std::str::FromStr;
/// use ocm_core::scheme::TypeId;
/// let t = TypeId::from_str("OCIRepository/v1").unwrap();
/// assert_eq!(t.name(), "OCIRepository");
/// assert_eq!(t.version(), Some("v1"));
/// assert_eq!(t.to_string(), "OCIRepository/v1");
///
/// let unversioned = TypeId::from_str("GenericConfig").unwrap();
/// assert_eq!(unversioned.version(), None);
/// assert_eq!(unversioned.to_string(), "GenericConfig");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId {
    name: String,
    version: Option<String>,
}

impl TypeId {
    /// Construct a type id directly, validating the grammar.
    pub fn new(name: impl Into<String>, version: Option<String>) -> Result<Self> {
        let name = name.into();
        ensure!(!name.is_empty(), "type name cannot be empty");
        ensure!(!name.contains('/'), "type name cannot contain '/': {name}");
        if let Some(v) = &version {
            ensure!(!v.is_empty(), "type version cannot be empty");
            ensure!(
                v.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')),
                "invalid version characters: {v}"
            );
        }
        Ok(Self { name, version })
    }

    /// The unversioned name component.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The version component, if any.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

impl FromStr for TypeId {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((name, version)) => Self::new(name, Some(version.to_string())),
            None => Self::new(s, None),
        }
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}/{v}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl Serialize for TypeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for TypeId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A decoded, self-describing object: every registered variant and the
/// [`Raw`] catch-all implement this.
pub trait TypedObject: fmt::Debug + Send + Sync {
    /// The type identifier currently stamped on this object.
    fn object_type(&self) -> TypeId;

    /// Stamp a type identifier onto this object (used by [`Scheme::default_type`]
    /// and by decode/convert when switching variants).
    fn set_type(&mut self, t: TypeId);

    /// Re-encode this object as a generic JSON tree, for [`Scheme::convert`]
    /// and for transport serialization.
    fn to_json(&self) -> serde_json::Result<Value>;

    /// Narrow to `&dyn Any` for downcasting to the concrete variant.
    fn as_any(&self) -> &dyn Any;
}

/// Implement [`TypedObject`] for a struct with a `r#type: TypeId` field.
#[macro_export]
macro_rules! typed_object {
    ($ty:ty) => {
        impl $crate::scheme::TypedObject for $ty {
            fn object_type(&self) -> $crate::scheme::TypeId {
                self.r#type.clone()
            }

            fn set_type(&mut self, t: $crate::scheme::TypeId) {
                self.r#type = t;
            }

            fn to_json(&self) -> serde_json::Result<serde_json::Value> {
                serde_json::to_value(self)
            }

            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }
    };
}

/// An object of unrecognized type, retained verbatim for round-tripping
/// (I-S3) when a [`Scheme`] has `allow_unknown` set.
#[derive(Debug, Clone, PartialEq)]
pub struct Raw {
    r#type: TypeId,
    body: Value,
}

impl Raw {
    /// The original type string that did not resolve to a registered variant.
    pub fn raw_type(&self) -> &TypeId {
        &self.r#type
    }

    /// The original decoded JSON body, including the `type` field.
    pub fn body(&self) -> &Value {
        &self.body
    }
}

impl TypedObject for Raw {
    fn object_type(&self) -> TypeId {
        self.r#type.clone()
    }

    fn set_type(&mut self, t: TypeId) {
        self.r#type = t.clone();
        if let Value::Object(map) = &mut self.body {
            map.insert("type".to_string(), Value::String(t.to_string()));
        }
    }

    fn to_json(&self) -> serde_json::Result<Value> {
        Ok(self.body.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type NewObjectFn = fn() -> Box<dyn TypedObject>;
type DecodeFn = fn(Value) -> Result<Box<dyn TypedObject>>;

struct VariantEntry {
    canonical: TypeId,
    new_object: NewObjectFn,
    decode: DecodeFn,
    schema: Option<Value>,
}

/// A type registry: canonical types, aliases, prototypes, and (optionally)
/// JSON Schemas, per spec §3/§4.A.
#[derive(Default)]
pub struct Scheme {
    variants: HashMap<TypeId, VariantEntry>,
    alias_to_canonical: HashMap<TypeId, TypeId>,
    by_rust_type: HashMap<RustTypeId, TypeId>,
    allow_unknown: bool,
}

impl fmt::Debug for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheme")
            .field("canonical_types", &self.variants.keys().collect::<Vec<_>>())
            .field("allow_unknown", &self.allow_unknown)
            .finish()
    }
}

impl Scheme {
    /// Create an empty scheme. By default unknown types fail to decode;
    /// see [`Scheme::allow_unknown`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable (or disable) decoding unrecognized types into [`Raw`] instead
    /// of failing with [`OcmError::UnknownType`].
    pub fn allow_unknown(mut self, allow: bool) -> Self {
        self.allow_unknown = allow;
        self
    }

    /// Register a concrete type `T` under a canonical type plus any
    /// number of aliases. Fails if any of the given types are already
    /// claimed, or if `T` has already been registered under a different
    /// canonical type (I-S1 requires both directions be unambiguous).
    pub fn register_with_alias<T>(&mut self, types: impl IntoIterator<Item = TypeId>) -> Result<()>
    where
        T: TypedObject + Default + DeserializeOwned + Serialize + 'static,
    {
        let mut types = types.into_iter();
        let canonical = types
            .next()
            .ok_or_else(|| eyre!("register_with_alias requires at least one type"))?;

        let rust_type = RustTypeId::of::<T>();
        ensure!(
            !self.by_rust_type.contains_key(&rust_type),
            "prototype already registered under a different type"
        );
        ensure!(
            !self.variants.contains_key(&canonical),
            "type already registered: {canonical}"
        );
        ensure!(
            !self.alias_to_canonical.contains_key(&canonical),
            "type already registered as an alias: {canonical}"
        );

        let aliases: Vec<TypeId> = types.collect();
        for alias in &aliases {
            ensure!(
                !self.variants.contains_key(alias),
                "type already registered: {alias}"
            );
            ensure!(
                !self.alias_to_canonical.contains_key(alias),
                "type already registered as an alias: {alias}"
            );
        }

        let entry = VariantEntry {
            canonical: canonical.clone(),
            new_object: || Box::<T>::default(),
            decode: |v: Value| -> Result<Box<dyn TypedObject>> {
                let obj: T = serde_json::from_value(v).context("decode typed object")?;
                Ok(Box::new(obj))
            },
            schema: None,
        };

        self.variants.insert(canonical.clone(), entry);
        self.alias_to_canonical
            .insert(canonical.clone(), canonical.clone());
        for alias in aliases {
            self.alias_to_canonical.insert(alias, canonical.clone());
        }
        self.by_rust_type.insert(rust_type, canonical);
        Ok(())
    }

    /// Attach a JSON Schema to an already-registered canonical type, used by
    /// the plugin transport layer (§4.D) to validate inbound requests.
    pub fn set_schema(&mut self, canonical: &TypeId, schema: Value) -> Result<()> {
        let entry = self
            .variants
            .get_mut(canonical)
            .ok_or_else(|| OcmError::UnknownType {
                type_name: canonical.to_string(),
            })?;
        entry.schema = Some(schema);
        Ok(())
    }

    /// Resolve an alias (or canonical type) to its canonical form.
    pub fn canonicalize(&self, t: &TypeId) -> Result<TypeId> {
        self.alias_to_canonical
            .get(t)
            .cloned()
            .ok_or_else(|| {
                OcmError::UnknownType {
                    type_name: t.to_string(),
                }
                .into()
            })
    }

    /// The JSON Schema registered for a type, if any.
    pub fn schema_for(&self, t: &TypeId) -> Result<Option<&Value>> {
        let canonical = self.canonicalize(t)?;
        Ok(self.variants.get(&canonical).and_then(|e| e.schema.as_ref()))
    }

    /// Construct a zero-value instance of the variant registered for `t`.
    pub fn new_object(&self, t: &TypeId) -> Result<Box<dyn TypedObject>> {
        let canonical = self.canonicalize(t)?;
        let entry = self.variants.get(&canonical).expect("canonicalized type must be present");
        let mut obj = (entry.new_object)();
        obj.set_type(canonical);
        Ok(obj)
    }

    /// Reverse lookup: the canonical type registered for Rust type `T`.
    pub fn type_for_prototype<T: 'static>(&self) -> Result<TypeId> {
        self.by_rust_type
            .get(&RustTypeId::of::<T>())
            .cloned()
            .ok_or_else(|| eyre!("no type registered for this Rust type"))
    }

    /// Stamp the canonical type for `T` onto `obj` if it doesn't already
    /// carry a type (spec §4.A `default_type`).
    pub fn default_type<T: 'static>(&self, obj: &mut dyn TypedObject) -> Result<()> {
        let canonical = self.type_for_prototype::<T>()?;
        obj.set_type(canonical);
        Ok(())
    }

    /// Decode a generic JSON value per the algorithm in spec §4.A:
    /// extract `type`, resolve the variant (or produce [`Raw`] when
    /// `allow_unknown` is set), and deserialize the full value into it.
    pub fn decode_value(&self, mut value: Value) -> Result<Box<dyn TypedObject>> {
        let type_str = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| eyre!("decoded object is missing a 'type' field"))?
            .to_string();
        let t = TypeId::from_str(&type_str).context("parse type field")?;

        match self.canonicalize(&t) {
            Ok(canonical) => {
                if let Value::Object(map) = &mut value {
                    map.insert("type".to_string(), Value::String(canonical.to_string()));
                }
                let entry = self.variants.get(&canonical).expect("resolved canonical must exist");
                (entry.decode)(value).with_context(|| format!("decode '{canonical}'"))
            }
            Err(_) if self.allow_unknown => Ok(Box::new(Raw { r#type: t, body: value })),
            Err(_) => bail!(OcmError::UnknownType { type_name: t.to_string() }),
        }
    }

    /// Decode a JSON document from a reader.
    pub fn decode_json(&self, reader: impl std::io::Read) -> Result<Box<dyn TypedObject>> {
        let value: Value = serde_json::from_reader(reader)
            .map_err(|e| OcmError::Decode { detail: e.to_string() })?;
        self.decode_value(value)
    }

    /// Decode a YAML document from a reader (spec §3: "decodes heterogeneous
    /// JSON/YAML documents").
    pub fn decode_yaml(&self, reader: impl std::io::Read) -> Result<Box<dyn TypedObject>> {
        let value: Value = serde_yaml::from_reader(reader)
            .map_err(|e| OcmError::Decode { detail: e.to_string() })?;
        self.decode_value(value)
    }

    /// Re-encode `src` and decode the result as `into_type`, crossing
    /// between [`Raw`] and concrete variants (spec §4.A `convert`).
    pub fn convert(&self, src: &dyn TypedObject, into_type: &TypeId) -> Result<Box<dyn TypedObject>> {
        let mut value = src.to_json().context("encode source object")?;
        let canonical = self.canonicalize(into_type)?;
        if let Value::Object(map) = &mut value {
            map.insert("type".to_string(), Value::String(canonical.to_string()));
        }
        self.decode_value(value)
    }

    /// Validate a JSON value against the schema registered for `t`, if any
    /// (spec §4.D: "every inbound request is schema-validated").
    pub fn validate(&self, t: &TypeId, value: &Value) -> Result<()> {
        let Some(schema) = self.schema_for(t)? else {
            return Ok(());
        };
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| eyre!("invalid schema for {t}: {e}"))?;
        if let Err(e) = validator.validate(value) {
            bail!(OcmError::SchemaValidation { detail: e.to_string() });
        }
        Ok(())
    }
}
