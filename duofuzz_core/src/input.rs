use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::fmt;

/// A single value carried by a [`Payload`] field.
///
/// Seeds only ever produce `Text`, `Number`, `Blob` and `Structured`; `Raw` exists so the
/// mutation engine can splice serialization-breaking fragments into the wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    /// A JSON numeric literal, written to the wire verbatim so oversize integers survive.
    Number(String),
    /// Opaque bytes. Rendered as a JSON array of integers in the range 0-255.
    Blob(Vec<u8>),
    /// Any JSON value, e.g. an object-shaped substitution.
    Structured(JsonValue),
    /// Written to the wire without escaping.
    Raw(String),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn number(value: impl fmt::Display) -> Self {
        FieldValue::Number(value.to_string())
    }

    /// Converts a decoded JSON value into a field value.
    ///
    /// A non-empty array made only of integers 0-255 is treated as a blob, which is how
    /// command byte sequences appear in seed files.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::String(s) => FieldValue::Text(s),
            JsonValue::Number(n) => FieldValue::Number(n.to_string()),
            JsonValue::Array(items) => match blob_from_items(&items) {
                Some(bytes) => FieldValue::Blob(bytes),
                None => FieldValue::Structured(JsonValue::Array(items)),
            },
            other => FieldValue::Structured(other),
        }
    }

    /// Best-effort JSON view of the value, used for reports.
    ///
    /// Numeric literals that `serde_json` cannot represent and raw fragments come back as strings.
    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Text(s) | FieldValue::Raw(s) => JsonValue::String(s.clone()),
            FieldValue::Number(literal) => match serde_json::from_str::<JsonValue>(literal) {
                Ok(number @ JsonValue::Number(_)) => number,
                _ => JsonValue::String(literal.clone()),
            },
            FieldValue::Blob(bytes) => {
                JsonValue::Array(bytes.iter().map(|b| JsonValue::from(*b)).collect())
            }
            FieldValue::Structured(value) => value.clone(),
        }
    }

    fn write_wire(&self, out: &mut String) {
        match self {
            FieldValue::Text(s) => out.push_str(&JsonValue::String(s.clone()).to_string()),
            FieldValue::Number(literal) | FieldValue::Raw(literal) => out.push_str(literal),
            FieldValue::Blob(bytes) => {
                out.push('[');
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&b.to_string());
                }
                out.push(']');
            }
            FieldValue::Structured(value) => out.push_str(&value.to_string()),
        }
    }

    /// True for numeric literals and for text that reads as a finite number (`"20"`).
    pub fn is_numeric(&self) -> bool {
        match self {
            FieldValue::Number(_) => true,
            FieldValue::Text(s) => {
                let trimmed = s.trim();
                !trimmed.is_empty() && trimmed.parse::<f64>().is_ok_and(f64::is_finite)
            }
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Number(_) => "number",
            FieldValue::Blob(_) => "blob",
            FieldValue::Structured(_) => "structured",
            FieldValue::Raw(_) => "raw",
        }
    }
}

fn blob_from_items(items: &[JsonValue]) -> Option<Vec<u8>> {
    if items.is_empty() {
        return None;
    }
    items
        .iter()
        .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}

/// An ordered mapping from field name to [`FieldValue`].
///
/// Field names are unique: setting an existing name replaces its value in place, keeping the
/// original position.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    fields: Vec<(String, FieldValue)>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.set(name.into(), value);
        self
    }

    pub(crate) fn set(&mut self, name: String, value: FieldValue) {
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn from_json_object(object: JsonMap<String, JsonValue>) -> Self {
        object
            .into_iter()
            .map(|(name, value)| (name, FieldValue::from_json(value)))
            .collect()
    }

    /// Renders the JSON object text sent to a target. Raw values are spliced in unescaped,
    /// so the result is not guaranteed to parse.
    pub fn to_wire(&self) -> String {
        let mut out = String::from("{");
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&JsonValue::String(name.clone()).to_string());
            out.push(':');
            value.write_wire(&mut out);
        }
        out.push('}');
        out
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.fields
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }

    /// MD5 hex digest of the wire form.
    pub fn digest(&self) -> String {
        format!("{:x}", md5::compute(self.to_wire().as_bytes()))
    }
}

impl FromIterator<(String, FieldValue)> for Payload {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        let mut payload = Payload::new();
        for (name, value) in iter {
            payload.set(name, value);
        }
        payload
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let object = JsonMap::<String, JsonValue>::deserialize(deserializer)?;
        Ok(Payload::from_json_object(object))
    }
}
