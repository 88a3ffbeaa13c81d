//! Xcom value decoding.
//!
//! Airflow stores xcom values either as UTF-8 JSON or, when pickling is
//! enabled, as a pickled string that itself holds JSON.

use serde_json::Value;
use serde_pickle::{DeOptions, Value as PickleValue};
use tracing::{debug, error};

use dagmetrics_source::XComRow;

use crate::family::{Family, GaugeFamily};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XComEncoding {
    Json,
    Pickle,
}

impl XComEncoding {
    pub fn from_pickling(enabled: bool) -> Self {
        if enabled {
            XComEncoding::Pickle
        } else {
            XComEncoding::Json
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid pickle: {0}")]
    Pickle(#[from] serde_pickle::Error),

    #[error("unpickled value is not a string")]
    NotAString,
}

pub fn try_decode(raw: &[u8], encoding: XComEncoding) -> Result<Value, DecodeError> {
    match encoding {
        XComEncoding::Json => Ok(serde_json::from_slice(raw)?),
        XComEncoding::Pickle => match serde_pickle::value_from_slice(raw, DeOptions::new())? {
            PickleValue::String(s) => Ok(serde_json::from_str(&s)?),
            PickleValue::Bytes(b) => Ok(serde_json::from_slice(&b)?),
            _ => Err(DecodeError::NotAString),
        },
    }
}

/// Decode a stored value, falling back to an empty object.
pub fn decode(raw: &[u8], encoding: XComEncoding) -> Value {
    match try_decode(raw, encoding) {
        Ok(value) => value,
        Err(e) => {
            match encoding {
                XComEncoding::Json => error!(
                    error = %e,
                    "could not deserialize xcom value from JSON; enable xcom_pickling if values are pickled"
                ),
                XComEncoding::Pickle => error!(error = %e, "could not deserialize pickled xcom value"),
            }
            Value::Object(Default::default())
        }
    }
}

/// Numeric reading of a decoded value, if it has one.
pub fn gauge_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// `xcom_parameter`: one sample per row whose value reads as a number.
pub fn xcom_parameter(rows: &[XComRow], encoding: XComEncoding) -> GaugeFamily {
    let mut family = GaugeFamily::new(Family::XComParameter);
    for row in rows {
        let decoded = decode(&row.value, encoding);
        match gauge_value(&decoded) {
            Some(v) => family.add(
                vec![row.dag_id.clone(), row.task_id.clone(), row.key.clone()],
                v,
            ),
            None => debug!(
                dag_id = %row.dag_id,
                task_id = %row.task_id,
                key = %row.key,
                "skipping non-numeric xcom value"
            ),
        }
    }
    family
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serde_pickle::SerOptions;

    fn row(key: &str, value: &[u8]) -> XComRow {
        XComRow {
            dag_id: "etl".to_string(),
            task_id: "load".to_string(),
            key: key.to_string(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn json_bytes_decode() {
        let original = json!({"rows": 12, "ok": true});
        let raw = serde_json::to_vec(&original).unwrap();
        assert_eq!(decode(&raw, XComEncoding::Json), original);
    }

    #[test]
    fn invalid_json_is_empty_object() {
        assert_eq!(decode(b"\x80\x04not json", XComEncoding::Json), json!({}));
    }

    #[test]
    fn pickled_json_string_decodes() {
        let raw = serde_pickle::to_vec(&"42.5", SerOptions::new()).unwrap();
        assert_eq!(decode(&raw, XComEncoding::Pickle), json!(42.5));
    }

    #[test]
    fn pickled_non_string_is_empty_object() {
        let raw = serde_pickle::to_vec(&vec![1, 2, 3], SerOptions::new()).unwrap();
        assert!(matches!(
            try_decode(&raw, XComEncoding::Pickle),
            Err(DecodeError::NotAString)
        ));
        assert_eq!(decode(&raw, XComEncoding::Pickle), json!({}));
    }

    #[test]
    fn numeric_readings() {
        assert_eq!(gauge_value(&json!(7)), Some(7.0));
        assert_eq!(gauge_value(&json!(true)), Some(1.0));
        assert_eq!(gauge_value(&json!(false)), Some(0.0));
        assert_eq!(gauge_value(&json!(" 3.25 ")), Some(3.25));
        assert_eq!(gauge_value(&json!("abc")), None);
        assert_eq!(gauge_value(&json!({})), None);
        assert_eq!(gauge_value(&json!([1])), None);
        assert_eq!(gauge_value(&Value::Null), None);
    }

    #[test]
    fn family_skips_unusable_rows() {
        let rows = vec![
            row("rows_loaded", b"1200"),
            row("summary", br#"{"a": 1}"#),
            row("broken", b"{"),
        ];
        let family = xcom_parameter(&rows, XComEncoding::Json);
        assert_eq!(family.samples.len(), 1);
        assert_eq!(family.get(&["etl", "load", "rows_loaded"]), Some(1200.0));
    }
}
