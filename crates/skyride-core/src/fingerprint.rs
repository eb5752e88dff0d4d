//! Request fingerprints
//!
//! A fingerprint is the JSON form of the request fields that matter to the
//! workflow. It is stored on the key when the key is created and compared on
//! every replay. Comparison is structural after normalization: object key
//! order and number representation (`0` vs `0.0`) do not matter, so two
//! payloads that decode to the same request always match regardless of how
//! the client or the database serialized them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(Value);

impl Fingerprint {
    /// Fingerprint of a request payload
    pub fn of<T: Serialize>(request: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(request).map(Self)
    }

    /// Wrap a value read back from storage
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Whether both fingerprints describe the same request
    pub fn matches(&self, other: &Fingerprint) -> bool {
        normalized_eq(&self.0, &other.0)
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

fn normalized_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| normalized_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| normalized_eq(x, y)))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_is_ignored() {
        let a: Value = serde_json::from_str(r#"{"origin_lat":1.5,"target_lat":2.5}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"target_lat":2.5,"origin_lat":1.5}"#).unwrap();
        assert!(Fingerprint::from_value(a).matches(&Fingerprint::from_value(b)));
    }

    #[test]
    fn test_integer_and_float_forms_match() {
        let a = Fingerprint::from_value(json!({"origin_lat": 0, "origin_lon": 0}));
        let b = Fingerprint::from_value(json!({"origin_lat": 0.0, "origin_lon": 0.0}));
        assert!(a.matches(&b));
    }

    #[test]
    fn test_different_values_do_not_match() {
        let a = Fingerprint::from_value(json!({"origin_lat": 0.0}));
        let b = Fingerprint::from_value(json!({"origin_lat": 0.1}));
        assert!(!a.matches(&b));
    }

    #[test]
    fn test_missing_or_extra_fields_do_not_match() {
        let a = Fingerprint::from_value(json!({"origin_lat": 0.0}));
        let b = Fingerprint::from_value(json!({"origin_lat": 0.0, "origin_lon": 0.0}));
        assert!(!a.matches(&b));
        assert!(!b.matches(&a));
    }

    #[test]
    fn test_nested_arrays_compare_elementwise() {
        let a = Fingerprint::from_value(json!({"stops": [[1, 2], [3, 4]]}));
        let b = Fingerprint::from_value(json!({"stops": [[1.0, 2.0], [3.0, 4.0]]}));
        let c = Fingerprint::from_value(json!({"stops": [[3, 4], [1, 2]]}));
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }
}
