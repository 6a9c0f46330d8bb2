//! Small accessors over `DynamicObject` metadata and spec.

use kube::core::DynamicObject;
use serde_json::{Map, Value as Json};

pub fn annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str).filter(|v| !v.is_empty())
}

pub fn set_annotation(obj: &mut DynamicObject, key: &str, value: &str) {
    obj.metadata.annotations.get_or_insert_with(Default::default).insert(key.to_string(), value.to_string());
}

pub fn remove_annotation(obj: &mut DynamicObject, key: &str) -> Option<String> {
    let annos = obj.metadata.annotations.as_mut()?;
    let removed = annos.remove(key);
    if annos.is_empty() { obj.metadata.annotations = None; }
    removed
}

pub fn has_finalizer(obj: &DynamicObject, finalizer: &str) -> bool {
    obj.metadata.finalizers.as_ref().map(|f| f.iter().any(|x| x == finalizer)).unwrap_or(false)
}

/// Returns true when the finalizer was added.
pub fn add_finalizer(obj: &mut DynamicObject, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) { return false; }
    obj.metadata.finalizers.get_or_insert_with(Vec::new).push(finalizer.to_string());
    true
}

/// Returns true when the finalizer was present.
pub fn remove_finalizer(obj: &mut DynamicObject, finalizer: &str) -> bool {
    let Some(list) = obj.metadata.finalizers.as_mut() else { return false };
    let before = list.len();
    list.retain(|f| f != finalizer);
    let changed = list.len() != before;
    if list.is_empty() { obj.metadata.finalizers = None; }
    changed
}

pub fn is_deleting(obj: &DynamicObject) -> bool { obj.metadata.deletion_timestamp.is_some() }

pub fn spec(obj: &DynamicObject) -> Option<&Json> { obj.data.get("spec") }

pub fn spec_field<'a>(obj: &'a DynamicObject, field: &str) -> Option<&'a Json> { spec(obj).and_then(|s| s.get(field)) }

/// Set (or with `None`, remove) a top-level spec field.
pub fn set_spec_field(obj: &mut DynamicObject, field: &str, value: Option<Json>) {
    if !obj.data.is_object() { obj.data = Json::Object(Map::new()); }
    let Some(root) = obj.data.as_object_mut() else { return };
    let spec = root.entry("spec").or_insert_with(|| Json::Object(Map::new()));
    if !spec.is_object() { *spec = Json::Object(Map::new()); }
    if let Some(map) = spec.as_object_mut() {
        match value {
            Some(v) => { map.insert(field.to_string(), v); }
            None => { map.remove(field); }
        }
    }
}

/// Copy of `spec` without the listed top-level fields.
pub fn spec_without(obj: &DynamicObject, skip: &[String]) -> Option<Json> {
    let mut s = spec(obj)?.clone();
    if let Some(map) = s.as_object_mut() {
        for f in skip { map.remove(f); }
    }
    Some(s)
}

/// True when every field of `want` has the same value in `have`; `have` may carry more.
pub fn covers(have: &Json, want: &Json) -> bool {
    match (have, want) {
        (Json::Object(have), Json::Object(want)) => {
            want.iter().all(|(k, w)| have.get(k).is_some_and(|h| covers(h, w)))
        }
        _ => have == want,
    }
}

/// Drop server-populated metadata, ownership links and status before writing to another cluster.
pub fn strip_server_fields(obj: &mut DynamicObject) {
    let m = &mut obj.metadata;
    m.uid = None;
    m.resource_version = None;
    m.managed_fields = None;
    m.generation = None;
    m.creation_timestamp = None;
    m.deletion_timestamp = None;
    m.deletion_grace_period_seconds = None;
    m.finalizers = None;
    m.owner_references = None;
    m.self_link = None;
    if let Some(root) = obj.data.as_object_mut() { root.remove("status"); }
}
