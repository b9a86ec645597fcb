//! Participant references, federation packages and the global spec.
//!
//! Packages arrive from untrusted content-addressed storage, so decoding goes
//! through an explicit field schema ([`decode_package`]) before any value is
//! trusted.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MalformedFailure;

/// Content identifier as published on the gateway (CIDv0 or CIDv1).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    pub const MAX_LEN: usize = 128;

    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() || raw.len() > Self::MAX_LEN || !raw.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(raw.to_string());
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl TryFrom<String> for ContentHash {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).map_err(|bad| format!("invalid content hash {bad:?}"))
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> Self { h.0 }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "ContentHash({})", self.0) }
}

/// Base64-encoded symmetric key supplied by the registry. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyMaterial(String);

impl KeyMaterial {
    pub fn new(b64: impl Into<String>) -> Self { Self(b64.into()) }
    pub fn expose(&self) -> &str { &self.0 }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("KeyMaterial(<redacted>)") }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantReference {
    pub participant_id: String,
    #[serde(alias = "paramHash")]
    pub content_hash: ContentHash,
    #[serde(alias = "paramKey")]
    pub key_material: KeyMaterial,
}

/// Raw bytes fetched from the gateway, tagged with the hash they were fetched under.
#[derive(Clone)]
pub struct EncryptedBlob {
    pub content_hash: ContentHash,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedBlob").field("content_hash", &self.content_hash).field("len", &self.bytes.len()).finish()
    }
}

/// Categorical `max_features` hyperparameter, never averaged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxFeatures {
    Count(u64),
    Named(String),
}

impl fmt::Display for MaxFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self { MaxFeatures::Count(n) => write!(f, "{n}"), MaxFeatures::Named(s) => f.write_str(s) }
    }
}

/// Tree depth limit. `Unbounded` travels as JSON `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<u32>", into = "Option<u32>")]
pub enum MaxDepth {
    Limited(u32),
    Unbounded,
}

impl MaxDepth {
    pub fn limit(&self) -> Option<u32> {
        match self { MaxDepth::Limited(d) => Some(*d), MaxDepth::Unbounded => None }
    }
}

impl From<Option<u32>> for MaxDepth {
    fn from(v: Option<u32>) -> Self {
        match v { Some(d) if d > 0 => MaxDepth::Limited(d), _ => MaxDepth::Unbounded }
    }
}

impl From<MaxDepth> for Option<u32> {
    fn from(d: MaxDepth) -> Self { d.limit() }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameterPackage {
    pub predictions: Vec<f64>,
    pub feature_importances: Vec<f64>,
    pub n_estimators: u32,
    pub max_features: MaxFeatures,
    pub max_depth: MaxDepth,
}

/// A package together with the participant that published it.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantPackage {
    pub participant_id: String,
    pub package: ModelParameterPackage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalModelSpec {
    pub n_estimators: u32,
    pub max_features: MaxFeatures,
    pub max_depth: MaxDepth,
    pub predictions: Vec<f64>,
    pub feature_importances: Vec<f64>,
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind { NumberArray, PositiveInt, IntOrString, PositiveIntOrNull }

impl FieldKind {
    fn expected(&self) -> &'static str {
        match self {
            FieldKind::NumberArray => "an array of finite numbers",
            FieldKind::PositiveInt => "a positive integer",
            FieldKind::IntOrString => "a string or a positive integer",
            FieldKind::PositiveIntOrNull => "a positive integer or null",
        }
    }

    fn accepts(&self, v: &Value) -> bool {
        match self {
            FieldKind::NumberArray => v.as_array().map_or(false, |a| a.iter().all(|x| x.as_f64().map_or(false, f64::is_finite))),
            FieldKind::PositiveInt => positive_u32(v).is_some(),
            FieldKind::IntOrString => v.is_string() || v.as_u64().map_or(false, |n| n > 0),
            FieldKind::PositiveIntOrNull => v.is_null() || positive_u32(v).is_some(),
        }
    }
}

fn positive_u32(v: &Value) -> Option<u32> {
    v.as_u64().filter(|n| *n > 0).and_then(|n| u32::try_from(n).ok())
}

const SCHEMA: &[(&str, FieldKind)] = &[
    ("predictions", FieldKind::NumberArray),
    ("feature_importances", FieldKind::NumberArray),
    ("n_estimators", FieldKind::PositiveInt),
    ("max_features", FieldKind::IntOrString),
    ("max_depth", FieldKind::PositiveIntOrNull),
];

/// Decodes a decrypted payload into a package, checking presence, then types,
/// then unknown fields, in that order.
pub fn decode_package(bytes: &[u8]) -> Result<ModelParameterPackage, MalformedFailure> {
    let root: Value = serde_json::from_slice(bytes).map_err(|e| MalformedFailure::Syntax(e.to_string()))?;
    let obj = root.as_object().ok_or(MalformedFailure::WrongType { field: "<root>", expected: "a JSON object" })?;
    check_schema(obj)?;
    // every field was checked above, so the typed conversion below cannot observe anything unexpected
    let numbers = |field: &str| -> Vec<f64> {
        obj[field].as_array().map(|a| a.iter().filter_map(Value::as_f64).collect()).unwrap_or_default()
    };
    let max_features = match &obj["max_features"] {
        Value::String(s) => MaxFeatures::Named(s.clone()),
        other => MaxFeatures::Count(other.as_u64().unwrap_or(1)),
    };
    Ok(ModelParameterPackage {
        predictions: numbers("predictions"),
        feature_importances: numbers("feature_importances"),
        n_estimators: positive_u32(&obj["n_estimators"]).unwrap_or(1),
        max_features,
        max_depth: positive_u32(&obj["max_depth"]).map_or(MaxDepth::Unbounded, MaxDepth::Limited),
    })
}

fn check_schema(obj: &Map<String, Value>) -> Result<(), MalformedFailure> {
    if let Some((field, _)) = SCHEMA.iter().find(|(f, _)| !obj.contains_key(*f)) {
        return Err(MalformedFailure::MissingField(*field));
    }
    for &(field, kind) in SCHEMA {
        if !kind.accepts(&obj[field]) {
            return Err(MalformedFailure::WrongType { field, expected: kind.expected() });
        }
    }
    if let Some(extra) = obj.keys().find(|k| !SCHEMA.iter().any(|(f, _)| *f == k.as_str())) {
        return Err(MalformedFailure::UnexpectedField(extra.clone()));
    }
    Ok(())
}

/// Encodes a package in the wire format accepted by [`decode_package`].
pub fn encode_package(pkg: &ModelParameterPackage) -> serde_json::Result<Vec<u8>> { serde_json::to_vec(pkg) }
