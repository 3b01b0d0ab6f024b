//! Index key generation from documents.

use std::collections::BTreeSet;

use errors::ErrorMetadata;
use serde_json::Value as JsonValue;

use crate::types::{
    Document,
    FieldPath,
    FilterExpression,
    IndexKey,
    IndexSpec,
    KeyValue,
    MultikeyPaths,
};

#[derive(Debug)]
pub struct GeneratedKeys {
    pub keys: BTreeSet<IndexKey>,
    pub multikey_paths: MultikeyPaths,
}

impl GeneratedKeys {
    pub fn is_multikey(&self) -> bool {
        self.multikey_paths.is_multikey()
    }
}

/// Generate the index keys a document contributes to an index. An array
/// along a key path fans out into one key per element and marks the path
/// component as multikey. Failures here are "key generation errors": under
/// relaxed constraints the caller records the document in the skipped-record
/// tracker instead of failing the build.
pub fn generate_keys(spec: &IndexSpec, doc: &Document) -> anyhow::Result<GeneratedKeys> {
    let mut multikey_paths = MultikeyPaths::new(spec.fields.len());
    let mut per_field: Vec<Vec<KeyValue>> = Vec::with_capacity(spec.fields.len());
    for (field_pos, field) in spec.fields.iter().enumerate() {
        let mut values = Vec::new();
        extract_values(
            field,
            &mut field.components(),
            0,
            &JsonValue::Object(doc.clone()),
            &mut values,
            &mut multikey_paths.0[field_pos],
        )?;
        per_field.push(values);
    }

    // Two array-valued fields in one key would require a full cartesian
    // product, so we reject the document instead.
    let num_fanned_out = per_field.iter().filter(|values| values.len() > 1).count();
    if num_fanned_out > 1 {
        anyhow::bail!(ErrorMetadata::bad_request(
            "CannotIndexParallelArrays",
            format!(
                "cannot index parallel arrays in index {}: more than one field of a document \
                 is an array",
                spec.name
            ),
        ));
    }

    let mut keys = BTreeSet::new();
    let fan_out = per_field.iter().map(Vec::len).max().unwrap_or(0);
    for i in 0..fan_out.max(1) {
        let key: Vec<KeyValue> = per_field
            .iter()
            .map(|values| match values.len() {
                0 => KeyValue::Null,
                1 => values[0].clone(),
                _ => values[i].clone(),
            })
            .collect();
        keys.insert(IndexKey(key));
    }

    Ok(GeneratedKeys {
        keys,
        multikey_paths,
    })
}

fn extract_values<'a>(
    field: &FieldPath,
    components: &mut impl Iterator<Item = &'a str>,
    depth: usize,
    value: &JsonValue,
    out: &mut Vec<KeyValue>,
    multikey_components: &mut BTreeSet<usize>,
) -> anyhow::Result<()> {
    let Some(component) = components.next() else {
        out.push(leaf_value(field, value)?);
        return Ok(());
    };
    match value {
        JsonValue::Object(map) => match map.get(component) {
            Some(inner) => match inner {
                JsonValue::Array(elements) if components_remaining(field, depth) == 1 => {
                    // Array at the leaf component: fan out one key per
                    // element.
                    multikey_components.insert(depth);
                    for element in elements {
                        out.push(leaf_value(field, element)?);
                    }
                    Ok(())
                },
                _ => extract_values(
                    field,
                    components,
                    depth + 1,
                    inner,
                    out,
                    multikey_components,
                ),
            },
            None => {
                out.push(KeyValue::Null);
                Ok(())
            },
        },
        // Path descends below a non-object; value is missing.
        _ => {
            out.push(KeyValue::Null);
            Ok(())
        },
    }
}

fn components_remaining(field: &FieldPath, depth: usize) -> usize {
    field.components().count() - depth
}

fn leaf_value(field: &FieldPath, value: &JsonValue) -> anyhow::Result<KeyValue> {
    match value {
        JsonValue::Null => Ok(KeyValue::Null),
        JsonValue::Bool(b) => Ok(KeyValue::Bool(*b)),
        JsonValue::Number(n) => n.as_i64().map(KeyValue::Int).ok_or_else(|| {
            ErrorMetadata::bad_request(
                "CannotIndexValue",
                format!("cannot index non-integer number {n} at {field}"),
            )
            .into()
        }),
        JsonValue::String(s) => Ok(KeyValue::String(s.clone())),
        JsonValue::Array(_) | JsonValue::Object(_) => Err(ErrorMetadata::bad_request(
            "CannotIndexValue",
            format!("cannot index nested container value at {field}"),
        )
        .into()),
    }
}

pub fn filter_matches(filter: &FilterExpression, doc: &Document) -> bool {
    lookup(&JsonValue::Object(doc.clone()), &filter.field)
        .map(|v| *v == filter.equals)
        .unwrap_or(false)
}

fn lookup<'a>(value: &'a JsonValue, field: &FieldPath) -> Option<&'a JsonValue> {
    let mut current = value;
    for component in field.components() {
        current = current.as_object()?.get(component)?;
    }
    Some(current)
}

/// True when an array along any indexed path holds heterogeneous element
/// types. Collections carry a "may contain mixed schema" flag that the build
/// clears at commit if no such document was seen.
pub fn document_has_mixed_schema(doc: &Document, fields: &[FieldPath]) -> bool {
    fn type_tag(value: &JsonValue) -> u8 {
        match value {
            JsonValue::Null => 0,
            JsonValue::Bool(_) => 1,
            JsonValue::Number(_) => 2,
            JsonValue::String(_) => 3,
            JsonValue::Array(_) => 4,
            JsonValue::Object(_) => 5,
        }
    }
    let root = JsonValue::Object(doc.clone());
    fields.iter().any(|field| {
        let Some(JsonValue::Array(elements)) = lookup(&root, field) else {
            return false;
        };
        let mut tags = elements.iter().map(type_tag);
        let Some(first) = tags.next() else {
            return false;
        };
        tags.any(|tag| tag != first)
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use errors::ErrorMetadataAnyhowExt;
    use serde_json::json;

    use super::{
        document_has_mixed_schema,
        filter_matches,
        generate_keys,
    };
    use crate::types::{
        Document,
        FilterExpression,
        IndexKey,
        IndexSpec,
        KeyValue,
    };

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_simple_compound_key() {
        let spec = IndexSpec::ordered("a_b", vec!["a".into(), "b".into()]);
        let generated =
            generate_keys(&spec, &doc(json!({"a": 1, "b": "x", "c": true}))).unwrap();
        assert_eq!(
            generated.keys,
            BTreeSet::from([IndexKey(vec![
                KeyValue::Int(1),
                KeyValue::String("x".to_string())
            ])]),
        );
        assert!(!generated.is_multikey());
    }

    #[test]
    fn test_missing_field_indexes_null() {
        let spec = IndexSpec::ordered("a", vec!["a.b".into()]);
        let generated = generate_keys(&spec, &doc(json!({"a": {"c": 2}}))).unwrap();
        assert_eq!(
            generated.keys,
            BTreeSet::from([IndexKey(vec![KeyValue::Null])]),
        );
    }

    #[test]
    fn test_array_fans_out_and_marks_multikey() {
        let spec = IndexSpec::ordered("tags", vec!["tags".into(), "n".into()]);
        let generated =
            generate_keys(&spec, &doc(json!({"tags": ["x", "y"], "n": 3}))).unwrap();
        assert_eq!(generated.keys.len(), 2);
        assert!(generated.is_multikey());
        assert_eq!(generated.multikey_paths.0[0], BTreeSet::from([0]));
        assert!(generated.multikey_paths.0[1].is_empty());
    }

    #[test]
    fn test_parallel_arrays_rejected() {
        let spec = IndexSpec::ordered("a_b", vec!["a".into(), "b".into()]);
        let err = generate_keys(&spec, &doc(json!({"a": [1, 2], "b": [3, 4]}))).unwrap_err();
        assert_eq!(err.short_msg(), "CannotIndexParallelArrays");
    }

    #[test]
    fn test_nested_container_is_key_generation_error() {
        let spec = IndexSpec::ordered("a", vec!["a".into()]);
        let err = generate_keys(&spec, &doc(json!({"a": {"nested": true}}))).unwrap_err();
        assert!(err.is_bad_request());
    }

    #[test]
    fn test_filter_matches() {
        let filter = FilterExpression {
            field: "kind".into(),
            equals: json!("user"),
        };
        assert!(filter_matches(&filter, &doc(json!({"kind": "user"}))));
        assert!(!filter_matches(&filter, &doc(json!({"kind": "system"}))));
        assert!(!filter_matches(&filter, &doc(json!({}))));
    }

    #[test]
    fn test_mixed_schema_detection() {
        let fields = vec!["vals".into()];
        assert!(document_has_mixed_schema(
            &doc(json!({"vals": [1, "x"]})),
            &fields
        ));
        assert!(!document_has_mixed_schema(
            &doc(json!({"vals": [1, 2]})),
            &fields
        ));
        assert!(!document_has_mixed_schema(&doc(json!({"vals": 1})), &fields));
    }
}
