//! Recognizes `$reql_type$`-tagged pseudotypes in decoded rows and converts
//! them to a JSON shape `serde` can deserialize directly into ordinary Rust
//! types, so the caller's target type never needs to know about the wire
//! encoding.
//!
//! spec.md §4.5/§4.8 names four pseudotypes: `TIME`, `BINARY`,
//! `GROUPED_DATA`, and `GEOMETRY`. See `DESIGN.md` for the per-type
//! normalization this module implements.

use serde_json::{Map, Value};

use crate::{crypto, error::Result};

const TAG: &str = "$reql_type$";

/// Walks `value` recursively, converting every recognized pseudotype node
/// in place. Unrecognized `$reql_type$` tags (future server additions) are
/// left untouched so callers can still see the raw tagged object.
pub fn normalize(value: Value) -> Result<Value> {
    match value {
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(normalize(item)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => match map.get(TAG).and_then(Value::as_str) {
            Some("TIME") => normalize_time(map),
            Some("BINARY") => normalize_binary(map),
            Some("GROUPED_DATA") => normalize_grouped_data(map),
            Some("GEOMETRY") => normalize_geometry(map),
            _ => {
                let mut out = Map::with_capacity(map.len());
                for (key, val) in map {
                    out.insert(key, normalize(val)?);
                }
                Ok(Value::Object(out))
            }
        },
        other => Ok(other),
    }
}

fn normalize_time(map: Map<String, Value>) -> Result<Value> {
    let epoch = map
        .get("epoch_time")
        .cloned()
        .unwrap_or(Value::Null);
    let timezone = map
        .get("timezone")
        .cloned()
        .unwrap_or_else(|| Value::String("+00:00".to_string()));
    Ok(serde_json::json!({ "epoch": epoch, "timezone": timezone }))
}

fn normalize_binary(map: Map<String, Value>) -> Result<Value> {
    let data = map
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| crate::error::Error::protocol("BINARY pseudotype missing `data`"))?;
    let bytes = crypto::base64_decode(data)
        .map_err(|_| crate::error::Error::protocol("BINARY pseudotype has invalid base64"))?;
    Ok(Value::Array(bytes.into_iter().map(Value::from).collect()))
}

fn normalize_grouped_data(map: Map<String, Value>) -> Result<Value> {
    let pairs = map
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| crate::error::Error::protocol("GROUPED_DATA pseudotype missing `data`"))?;

    let mut groups = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let pair = pair
            .as_array()
            .ok_or_else(|| crate::error::Error::protocol("GROUPED_DATA entry is not a pair"))?;
        let (group, reduction) = match pair.as_slice() {
            [group, reduction] => (group.clone(), reduction.clone()),
            _ => {
                return Err(crate::error::Error::protocol(
                    "GROUPED_DATA entry is not a [group, reduction] pair",
                ))
            }
        };
        groups.push(serde_json::json!({
            "group": normalize(group)?,
            "reduction": normalize(reduction)?,
        }));
    }
    Ok(Value::Array(groups))
}

fn normalize_geometry(mut map: Map<String, Value>) -> Result<Value> {
    map.remove(TAG);
    let mut out = Map::with_capacity(map.len());
    for (key, val) in map {
        out.insert(key, normalize(val)?);
    }
    Ok(Value::Object(out))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn time_becomes_epoch_and_timezone() {
        let tagged = serde_json::json!({
            "$reql_type$": "TIME",
            "epoch_time": 1_523_000_000.5,
            "timezone": "+00:00",
        });
        let out = normalize(tagged).unwrap();
        assert_eq!(out, serde_json::json!({ "epoch": 1_523_000_000.5, "timezone": "+00:00" }));
    }

    #[test]
    fn binary_decodes_to_byte_array() {
        let tagged = serde_json::json!({
            "$reql_type$": "BINARY",
            "data": crypto::base64_encode(b"hello"),
        });
        let out = normalize(tagged).unwrap();
        assert_eq!(out, serde_json::json!([104, 101, 108, 108, 111]));
    }

    #[test]
    fn grouped_data_becomes_group_reduction_objects() {
        let tagged = serde_json::json!({
            "$reql_type$": "GROUPED_DATA",
            "data": [["a", 1], ["b", 2]],
        });
        let out = normalize(tagged).unwrap();
        assert_eq!(
            out,
            serde_json::json!([
                { "group": "a", "reduction": 1 },
                { "group": "b", "reduction": 2 },
            ])
        );
    }

    #[test]
    fn geometry_passes_through_without_tag() {
        let tagged = serde_json::json!({
            "$reql_type$": "GEOMETRY",
            "type": "Point",
            "coordinates": [-122.0, 37.0],
        });
        let out = normalize(tagged).unwrap();
        assert_eq!(
            out,
            serde_json::json!({ "type": "Point", "coordinates": [-122.0, 37.0] })
        );
    }

    #[test]
    fn nested_pseudotypes_inside_plain_objects_are_normalized() {
        let tagged = serde_json::json!({
            "name": "event",
            "at": { "$reql_type$": "TIME", "epoch_time": 1.0, "timezone": "+00:00" },
        });
        let out = normalize(tagged).unwrap();
        assert_eq!(out["at"], serde_json::json!({ "epoch": 1.0, "timezone": "+00:00" }));
    }

    #[test]
    fn unknown_pseudotype_tag_is_left_untouched() {
        let tagged = serde_json::json!({ "$reql_type$": "FUTURE_TYPE", "x": 1 });
        let out = normalize(tagged.clone()).unwrap();
        assert_eq!(out, tagged);
    }
}
