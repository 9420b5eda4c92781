//! Hand-written action input schemas.
//!
//! Action inputs are small flat-ish objects, so the schema language is a
//! list of typed field specs rather than a general schema interpreter.
//! Validation reports the first offending field in lexicographic order,
//! matching the payload validator's tie-break.

use serde_json::{json, Value};

use courier_schema::SchemaViolation;

/// Type of one action input field.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// UTF-8 string
    String,
    /// Integer
    Integer,
    /// Number (integer or float)
    Number,
    /// Boolean
    Boolean,
    /// Nested object, uninspected
    Object,
    /// Array of strings
    StringArray,
    /// String restricted to a closed set
    Enum(&'static [&'static str]),
}

/// One field of an action input schema.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Field name
    pub name: &'static str,
    /// Expected type
    pub kind: FieldKind,
    /// Whether the field must be present
    pub required: bool,
}

impl FieldSpec {
    /// Required field of the given kind.
    pub fn required(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind, required: true }
    }

    /// Optional field of the given kind.
    pub fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind, required: false }
    }

    fn type_matches(&self, value: &Value) -> bool {
        match &self.kind {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.as_i64().is_some(),
            FieldKind::Number => value.as_f64().is_some(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::StringArray => value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false),
            FieldKind::Enum(members) => value
                .as_str()
                .map(|s| members.contains(&s))
                .unwrap_or(false),
        }
    }

    fn expectation(&self) -> String {
        match &self.kind {
            FieldKind::String => "must be a string".to_string(),
            FieldKind::Integer => "must be an integer".to_string(),
            FieldKind::Number => "must be a number".to_string(),
            FieldKind::Boolean => "must be a boolean".to_string(),
            FieldKind::Object => "must be an object".to_string(),
            FieldKind::StringArray => "must be an array of strings".to_string(),
            FieldKind::Enum(members) => format!("must be one of {}", members.join(", ")),
        }
    }
}

/// Input schema for one action.
#[derive(Debug, Clone, Default)]
pub struct ActionSchema {
    /// Fields in declaration order
    pub fields: Vec<FieldSpec>,
}

impl ActionSchema {
    /// Build a schema from field specs.
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// Validate `input`, reporting the first offending field
    /// lexicographically. Unknown fields are rejected.
    pub fn validate(&self, action_name: &str, input: &Value) -> Result<(), SchemaViolation> {
        let mut violations: Vec<SchemaViolation> = Vec::new();
        let mut push = |path: String, message: String| {
            violations.push(SchemaViolation {
                schema_pointer: format!("action:{action_name}#/{path}"),
                path,
                message,
            });
        };

        let Some(map) = input.as_object() else {
            push(String::new(), "input must be a JSON object".to_string());
            return Err(violations.remove(0));
        };

        for spec in &self.fields {
            match map.get(spec.name) {
                Some(value) => {
                    if !spec.type_matches(value) {
                        push(spec.name.to_string(), spec.expectation());
                    }
                }
                None if spec.required => {
                    push(spec.name.to_string(), "required field is missing".to_string());
                }
                None => {}
            }
        }
        for key in map.keys() {
            if !self.fields.iter().any(|spec| spec.name == key) {
                push(key.clone(), "unknown field".to_string());
            }
        }

        if violations.is_empty() {
            return Ok(());
        }
        violations.sort_by(|a, b| a.path.cmp(&b.path));
        Err(violations.remove(0))
    }

    /// JSON descriptor of the schema for discovery endpoints.
    pub fn describe(&self) -> Value {
        let fields: Vec<Value> = self
            .fields
            .iter()
            .map(|spec| {
                let kind = match &spec.kind {
                    FieldKind::String => json!("string"),
                    FieldKind::Integer => json!("integer"),
                    FieldKind::Number => json!("number"),
                    FieldKind::Boolean => json!("boolean"),
                    FieldKind::Object => json!("object"),
                    FieldKind::StringArray => json!("string[]"),
                    FieldKind::Enum(members) => json!({"enum": members}),
                };
                json!({"name": spec.name, "type": kind, "required": spec.required})
            })
            .collect();
        json!({"fields": fields})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ActionSchema {
        ActionSchema::new(vec![
            FieldSpec::required("recipients", FieldKind::StringArray),
            FieldSpec::required("subject", FieldKind::String),
            FieldSpec::optional("priority", FieldKind::Enum(&["low", "normal", "high"])),
            FieldSpec::optional("data", FieldKind::Object),
        ])
    }

    #[test]
    fn test_valid_input_passes() {
        let input = json!({
            "recipients": ["ops@example.test"],
            "subject": "hello",
            "priority": "high"
        });
        assert!(schema().validate("send_email", &input).is_ok());
    }

    #[test]
    fn test_missing_required_field() {
        let input = json!({"subject": "hello"});
        let err = schema().validate("send_email", &input).unwrap_err();
        assert_eq!(err.path, "recipients");
    }

    #[test]
    fn test_type_mismatch_and_enum() {
        let input = json!({"recipients": ["a"], "subject": 5});
        let err = schema().validate("send_email", &input).unwrap_err();
        assert_eq!(err.path, "subject");

        let input = json!({"recipients": ["a"], "subject": "s", "priority": "urgent"});
        let err = schema().validate("send_email", &input).unwrap_err();
        assert_eq!(err.path, "priority");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let input = json!({"recipients": ["a"], "subject": "s", "bcc_all": true});
        let err = schema().validate("send_email", &input).unwrap_err();
        assert_eq!(err.path, "bcc_all");
    }

    #[test]
    fn test_mixed_type_array_rejected() {
        let input = json!({"recipients": ["a", 7], "subject": "s"});
        let err = schema().validate("send_email", &input).unwrap_err();
        assert_eq!(err.path, "recipients");
    }
}
