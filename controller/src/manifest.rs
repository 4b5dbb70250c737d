//! Manifest decodes resource blobs into kubernetes objects.

use kube::api::DynamicObject;
use serde_json::Value;

use crate::{Error, Result};

/// Decode parses `data` as either a stream of YAML documents or a stream of
/// concatenated JSON objects, eagerly, into dynamic objects.
///
/// Empty streams are an error; manifests are expected to be small, and apply
/// wants random access for concurrency.
pub fn decode(data: &[u8]) -> Result<Vec<DynamicObject>> {
    let values = if looks_like_json(data) {
        decode_json(data)?
    } else {
        decode_yaml(data)?
    };

    let mut out = Vec::with_capacity(values.len());
    for v in values {
        if v.is_null() {
            continue;
        }
        let obj: DynamicObject = serde_json::from_value(v)
            .map_err(|err| Error::Decode(format!("not a kubernetes object: {err}")))?;
        out.push(obj);
    }
    if out.is_empty() {
        return Err(Error::Decode("empty manifest stream".into()));
    }
    Ok(out)
}

fn looks_like_json(data: &[u8]) -> bool {
    data.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{' || *b == b'[')
}

fn decode_json(data: &[u8]) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    for doc in serde_json::Deserializer::from_slice(data).into_iter::<Value>() {
        let doc = doc.map_err(|err| Error::Decode(format!("bad JSON document: {err}")))?;
        match doc {
            Value::Array(items) => out.extend(items),
            doc => out.push(doc),
        }
    }
    Ok(out)
}

fn decode_yaml(data: &[u8]) -> Result<Vec<Value>> {
    use serde::Deserialize;
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_slice(data) {
        let doc = Value::deserialize(doc)
            .map_err(|err| Error::Decode(format!("bad YAML document: {err}")))?;
        out.push(doc);
    }
    Ok(out)
}
