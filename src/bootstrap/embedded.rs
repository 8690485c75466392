use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::accessor::GroupKind;

pub const LOCAL_OBJECT_REF_SUFFIX: &str = "LocalObjectRef";

fn parse_ref(value: &Value) -> Option<(GroupKind, String)> {
    let kind = value.get("kind")?.as_str()?;
    let name = value.get("name")?.as_str()?;
    if kind.is_empty() || name.is_empty() {
        return None;
    }
    let group = value.get("apiGroup").and_then(Value::as_str).unwrap_or_default();
    Some((GroupKind::new(group, kind), name.to_string()))
}

fn walk(value: &Value, found: &mut BTreeMap<GroupKind, BTreeSet<String>>) {
    match value {
        Value::Object(fields) => {
            for (field, inner) in fields {
                if field.ends_with(LOCAL_OBJECT_REF_SUFFIX) {
                    let refs = match inner {
                        Value::Array(items) => items.iter().filter_map(parse_ref).collect(),
                        other => parse_ref(other).into_iter().collect::<Vec<_>>(),
                    };
                    for (gk, name) in refs {
                        found.entry(gk).or_default().insert(name);
                    }
                } else {
                    walk(inner, found);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| walk(item, found)),
        _ => {}
    }
}

/// Every embedded reference in `content`, grouped by group/kind.
pub fn find_embedded_refs(content: &Value) -> BTreeMap<GroupKind, BTreeSet<String>> {
    let mut found = BTreeMap::new();
    walk(content, &mut found);
    found
}
