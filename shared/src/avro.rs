use std::borrow::Cow;

use apache_avro::types::Value;
use serde_json::{Map, Number, Value as JsonValue};

pub trait AvroValueExt {
    fn as_str(&self) -> Option<&str>;
    fn as_text_lossy(&self) -> Option<Cow<'_, str>>;
    fn is_null(&self) -> bool;

    fn get(&self, field: &str) -> Option<&Value>;
    fn get_nested(&self, path: &str) -> Option<&Value>;

    fn unwrap_union(&self) -> &Value;

    /// Converts the value to JSON without ever failing. Byte sequences are
    /// decoded as UTF-8 with invalid sequences replaced, values with no JSON
    /// counterpart are stringified.
    fn to_json_lossy(&self) -> JsonValue;
}

impl AvroValueExt for Value {
    fn as_str(&self) -> Option<&str> {
        match self.unwrap_union() {
            Value::String(s) => Some(s),
            Value::Enum(_, s) => Some(s),
            _ => None,
        }
    }

    fn as_text_lossy(&self) -> Option<Cow<'_, str>> {
        match self.unwrap_union() {
            Value::String(s) => Some(Cow::Borrowed(s.as_str())),
            Value::Bytes(b) | Value::Fixed(_, b) => Some(String::from_utf8_lossy(b)),
            _ => None,
        }
    }

    fn is_null(&self) -> bool {
        matches!(self.unwrap_union(), Value::Null)
    }

    fn get(&self, field: &str) -> Option<&Value> {
        match self.unwrap_union() {
            Value::Record(ref vals) => vals.iter().find(|(k, _)| k == field).map(|(_, v)| v),
            Value::Map(ref vals) => vals.get(field),
            _ => None,
        }
    }

    fn get_nested(&self, path: &str) -> Option<&Value> {
        let mut curval = self;
        for part in path.split('.') {
            curval = curval.get(part)?;
        }
        Some(curval)
    }

    fn unwrap_union(&self) -> &Value {
        match self {
            Value::Union(_, v) => v.unwrap_union(),
            _ => self,
        }
    }

    fn to_json_lossy(&self) -> JsonValue {
        match self.unwrap_union() {
            Value::Null => JsonValue::Null,
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Long(i) => JsonValue::from(*i),
            Value::Float(f) => float_to_json(*f as f64),
            Value::Double(f) => float_to_json(*f),
            Value::Bytes(b) | Value::Fixed(_, b) => {
                JsonValue::String(String::from_utf8_lossy(b).into_owned())
            }
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Enum(_, s) => JsonValue::String(s.clone()),
            Value::Array(items) => {
                JsonValue::Array(items.iter().map(AvroValueExt::to_json_lossy).collect())
            }
            Value::Map(entries) => {
                // HashMap order is arbitrary; sort so the serialized text is stable.
                let mut keys = entries.keys().collect::<Vec<_>>();
                keys.sort();
                JsonValue::Object(
                    keys.into_iter()
                        .map(|k| (k.clone(), entries[k].to_json_lossy()))
                        .collect::<Map<_, _>>(),
                )
            }
            Value::Record(fields) => JsonValue::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_lossy()))
                    .collect::<Map<_, _>>(),
            ),
            Value::Date(d) => JsonValue::from(*d),
            Value::TimeMillis(t) => JsonValue::from(*t),
            Value::TimeMicros(t) | Value::TimestampMillis(t) | Value::TimestampMicros(t) => {
                JsonValue::from(*t)
            }
            other => JsonValue::String(format!("{:?}", other)),
        }
    }
}

fn float_to_json(f: f64) -> JsonValue {
    Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(f.to_string()))
}
