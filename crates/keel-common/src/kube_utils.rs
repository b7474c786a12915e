//! Kubernetes utility functions shared by the engine and the operator

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::Resource;
use serde::Serialize;
use serde_json::Value;

use crate::Error;

/// Parse an apiVersion into (group, version)
///
/// ```
/// use keel_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Pluralize a Kubernetes resource kind using the API server's simple rules
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Build an `ApiResource` for a type that has no Rust binding (e.g. a third-party CRD)
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Convert a typed resource into its `ApiResource` and a `DynamicObject`
pub fn to_dynamic<K>(obj: &K) -> Result<(ApiResource, DynamicObject), Error>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let ar = ApiResource::erase::<K>(&());
    let mut value = serde_json::to_value(obj)
        .map_err(|e| Error::serialization_for_kind(ar.kind.clone(), e.to_string()))?;
    // k8s-openapi serializes apiVersion/kind, hand-built values may not
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".to_string(), Value::String(ar.api_version.clone()));
        map.insert("kind".to_string(), Value::String(ar.kind.clone()));
    }
    let dynamic = serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(ar.kind.clone(), e.to_string()))?;
    Ok((ar, dynamic))
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 for stability across Rust toolchain versions.
/// `DefaultHasher` is NOT guaranteed stable across Rust releases, so this
/// function should be used whenever the hash is persisted (e.g., status fields).
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Serialize a JSON value with object keys sorted at every level.
///
/// Two values that differ only in map ordering produce the same string.
/// `serde_json::Map` only sorts while the `preserve_order` feature is off, and
/// any crate in the build can turn it on; persisted hashes must not depend on
/// that, so keys are sorted here explicitly.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Set the value at a JSON pointer, creating intermediate objects as needed.
///
/// Returns `false` when a non-object value sits on the path.
pub fn set_json_pointer(target: &mut Value, pointer: &str, value: Value) -> bool {
    let segments: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect();
    let Some((last, parents)) = segments.split_last() else {
        *target = value;
        return true;
    };

    let mut current = target;
    for segment in parents {
        let Some(map) = current.as_object_mut() else {
            return false;
        };
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    match current.as_object_mut() {
        Some(map) => {
            map.insert(last.clone(), value);
            true
        }
        None => false,
    }
}

/// Fill fields missing from `desired` with the values found in `live`.
///
/// Objects are merged recursively; any other value in `desired` wins.
pub fn fill_missing(desired: &mut Value, live: &Value) {
    if let (Some(desired_map), Some(live_map)) = (desired.as_object_mut(), live.as_object()) {
        for (key, live_value) in live_map {
            match desired_map.get_mut(key) {
                Some(desired_value) => fill_missing(desired_value, live_value),
                None => {
                    desired_map.insert(key.clone(), live_value.clone());
                }
            }
        }
    }
}
