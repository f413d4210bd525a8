//! Vigil diff engine: field-level changes between two snapshots of the same
//! logical resource.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vigil_core::{Error, ResourceSnapshot};

/// One changed field. `before`/`after` are `None` when the field is absent on
/// that side (appeared or disappeared).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldDiff {
    pub path: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Compute all field-level differences between two snapshots of the same
/// resource. Fails with `InvalidComparison` when the kinds differ. Output is
/// sorted by field path so results are reproducible.
pub fn diff(previous: &ResourceSnapshot, current: &ResourceSnapshot) -> Result<Vec<FieldDiff>, Error> {
    if previous.kind() != current.kind() {
        return Err(Error::InvalidComparison {
            left: previous.kind().to_string(),
            right: current.kind().to_string(),
        });
    }
    let mut out = Vec::new();
    walk("", Some(previous.raw()), Some(current.raw()), &mut out);
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

fn walk(path: &str, before: Option<&Value>, after: Option<&Value>, out: &mut Vec<FieldDiff>) {
    match (before, after) {
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            for (k, av) in a.iter() {
                walk(&join(path, k), Some(av), b.get(k), out);
            }
            for (k, bv) in b.iter() {
                if !a.contains_key(k) {
                    walk(&join(path, k), None, Some(bv), out);
                }
            }
        }
        (Some(Value::Array(a)), Some(Value::Array(b))) => {
            let len = a.len().max(b.len());
            for i in 0..len {
                walk(&format!("{}[{}]", path, i), a.get(i), b.get(i), out);
            }
        }
        // Scalars, type changes, or one side absent.
        (x, y) => {
            if x != y {
                out.push(FieldDiff {
                    path: path.to_string(),
                    before: x.cloned(),
                    after: y.cloned(),
                });
            }
        }
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

/// True when any diff touches one of the monitored field names. A name
/// matches a diff whose path contains it as a segment (array indices
/// stripped), so "image" catches `spec.template.spec.containers[0].image`.
pub fn matches_monitored_fields(diffs: &[FieldDiff], monitored: &[String]) -> bool {
    diffs.iter().any(|d| {
        d.path
            .split('.')
            .map(|seg| seg.split('[').next().unwrap_or(seg))
            .any(|seg| monitored.iter().any(|m| m == seg))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(v: Value) -> ResourceSnapshot {
        ResourceSnapshot::new(v)
    }

    fn deploy(image: &str, replicas: u64) -> ResourceSnapshot {
        snap(serde_json::json!({
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "prod" },
            "spec": {
                "replicas": replicas,
                "template": { "spec": { "containers": [ { "name": "app", "image": image } ] } }
            }
        }))
    }

    #[test]
    fn identical_snapshots_have_no_diff() {
        let a = deploy("nginx:1.25", 3);
        assert!(diff(&a, &a.clone()).unwrap().is_empty());
    }

    #[test]
    fn scalar_change_is_reported_with_full_path() {
        let a = deploy("nginx:1.25", 3);
        let b = deploy("nginx:1.26", 3);
        let ds = diff(&a, &b).unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds[0].path, "spec.template.spec.containers[0].image");
        assert_eq!(ds[0].before, Some(Value::String("nginx:1.25".into())));
        assert_eq!(ds[0].after, Some(Value::String("nginx:1.26".into())));
    }

    #[test]
    fn appearing_and_disappearing_fields() {
        let a = snap(serde_json::json!({ "kind": "ConfigMap", "data": { "old": "1" } }));
        let b = snap(serde_json::json!({ "kind": "ConfigMap", "data": { "new": "2" } }));
        let ds = diff(&a, &b).unwrap();
        assert_eq!(ds.len(), 2);
        // Lexical path order: data.new before data.old
        assert_eq!(ds[0].path, "data.new");
        assert_eq!(ds[0].before, None);
        assert_eq!(ds[1].path, "data.old");
        assert_eq!(ds[1].after, None);
    }

    #[test]
    fn type_change_is_a_single_diff() {
        let a = snap(serde_json::json!({ "kind": "ConfigMap", "data": { "k": "1" } }));
        let b = snap(serde_json::json!({ "kind": "ConfigMap", "data": { "k": 1 } }));
        let ds = diff(&a, &b).unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds[0].path, "data.k");
        assert_eq!(ds[0].before, Some(Value::String("1".into())));
        assert_eq!(ds[0].after, Some(serde_json::json!(1)));
    }

    #[test]
    fn kind_mismatch_is_an_error() {
        let a = snap(serde_json::json!({ "kind": "Pod", "metadata": { "name": "x" } }));
        let b = snap(serde_json::json!({ "kind": "Deployment", "metadata": { "name": "x" } }));
        assert!(matches!(diff(&a, &b), Err(Error::InvalidComparison { .. })));
    }

    #[test]
    fn monitored_field_matches_by_segment() {
        let a = deploy("nginx:1.25", 3);
        let b = deploy("nginx:1.26", 3);
        let ds = diff(&a, &b).unwrap();
        assert!(matches_monitored_fields(&ds, &["image".to_string()]));
        assert!(!matches_monitored_fields(&ds, &["replicas".to_string()]));
        // Segment match, not substring match of the rendered path.
        assert!(!matches_monitored_fields(&ds, &["imag".to_string()]));
    }

    #[test]
    fn array_growth_reports_tail_elements() {
        let a = snap(serde_json::json!({ "kind": "Pod", "spec": { "containers": [ { "name": "a" } ] } }));
        let b = snap(serde_json::json!({ "kind": "Pod", "spec": { "containers": [ { "name": "a" }, { "name": "b" } ] } }));
        let ds = diff(&a, &b).unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds[0].path, "spec.containers[1]");
        assert_eq!(ds[0].before, None);
    }
}
