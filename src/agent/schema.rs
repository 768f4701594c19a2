use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// JSON type a schema field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }

    fn json_type(self) -> Option<&'static str> {
        match self {
            FieldKind::String => Some("string"),
            FieldKind::Number => Some("number"),
            FieldKind::Integer => Some("integer"),
            FieldKind::Boolean => Some("boolean"),
            FieldKind::Array => Some("array"),
            FieldKind::Object => Some("object"),
            FieldKind::Any => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSpec {
    pub fn required(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
            nullable: false,
            description: None,
        }
    }

    pub fn optional(name: &str, kind: FieldKind) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

/// Declared shape of an agent's input or output payload.
///
/// Deliberately shallow: only top-level fields are typed. Nested structure is
/// checked by whoever consumes the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default = "default_true")]
    pub allow_additional: bool,
}

impl Schema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self {
            fields,
            allow_additional: true,
        }
    }

    /// Accepts any JSON value.
    pub fn any() -> Self {
        Self::new(Vec::new())
    }

    pub fn strict(mut self) -> Self {
        self.allow_additional = false;
        self
    }

    /// Check `value` against the schema, returning the first violation.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        if self.fields.is_empty() && self.allow_additional {
            return Ok(());
        }

        let object = value
            .as_object()
            .ok_or_else(|| format!("expected an object, got {}", type_name(value)))?;

        for field in &self.fields {
            match object.get(&field.name) {
                None if field.required => {
                    return Err(format!("missing required field '{}'", field.name));
                }
                None => {}
                Some(Value::Null) if field.nullable || !field.required => {}
                Some(Value::Null) => {
                    return Err(format!("field '{}' must not be null", field.name));
                }
                Some(v) if !field.kind.matches(v) => {
                    return Err(format!(
                        "field '{}' expected {:?}, got {}",
                        field.name,
                        field.kind,
                        type_name(v)
                    ));
                }
                Some(_) => {}
            }
        }

        if !self.allow_additional {
            if let Some(extra) = object
                .keys()
                .find(|k| !self.fields.iter().any(|f| &f.name == *k))
            {
                return Err(format!("unexpected field '{extra}'"));
            }
        }

        Ok(())
    }

    /// Render as a JSON Schema document for provider structured output.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for field in &self.fields {
            let mut prop = Map::new();
            if let Some(ty) = field.kind.json_type() {
                if field.nullable {
                    prop.insert("type".to_string(), json!([ty, "null"]));
                } else {
                    prop.insert("type".to_string(), json!(ty));
                }
            }
            if let Some(desc) = &field.description {
                prop.insert("description".to_string(), json!(desc));
            }
            properties.insert(field.name.clone(), Value::Object(prop));
            if field.required {
                required.push(json!(field.name));
            }
        }

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": self.allow_additional,
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn default_true() -> bool {
    true
}
