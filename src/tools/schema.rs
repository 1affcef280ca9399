//! Tool declarations and argument validation
//!
//! A tool declares its parameters once; the same declaration is advertised to
//! the model (rendered as JSON Schema) and used to check the arguments of
//! every call before dispatch.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// JSON type of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

/// One named parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    pub description: String,
    pub required: bool,
    /// Lower bound for integer parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<i64>,
}

/// Name, description and parameter list of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParamSpec>,
}

/// Arguments that do not match a schema
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid arguments for `{tool}`: {}", .problems.join("; "))]
pub struct ArgumentError {
    pub tool: String,
    pub problems: Vec<String>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn required(
        mut self,
        name: impl Into<String>,
        ty: ParamType,
        description: impl Into<String>,
    ) -> Self {
        self.parameters.push(ParamSpec {
            name: name.into(),
            ty,
            description: description.into(),
            required: true,
            minimum: None,
        });
        self
    }

    pub fn optional(
        mut self,
        name: impl Into<String>,
        ty: ParamType,
        description: impl Into<String>,
    ) -> Self {
        self.parameters.push(ParamSpec {
            name: name.into(),
            ty,
            description: description.into(),
            required: false,
            minimum: None,
        });
        self
    }

    /// Lower bound for the most recently declared parameter
    pub fn at_least(mut self, minimum: i64) -> Self {
        if let Some(param) = self.parameters.last_mut() {
            param.minimum = Some(minimum);
        }
        self
    }

    /// JSON Schema object for the parameter list
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.parameters {
            let mut property = json!({
                "type": param.ty.as_str(),
                "description": param.description,
            });
            if let Some(minimum) = param.minimum {
                property["minimum"] = json!(minimum);
            }
            properties.insert(param.name.clone(), property);
        }
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check arguments against the declared parameters
    ///
    /// `null` is treated as an empty argument object. Every problem is
    /// reported, not just the first, so the model can fix them in one retry.
    pub fn validate(&self, arguments: &Value) -> Result<(), ArgumentError> {
        let empty = Map::new();
        let object = match arguments {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(self.error(vec![format!(
                    "arguments must be an object, got {}",
                    json_type_name(other)
                )]))
            }
        };

        let mut problems = Vec::new();
        for param in &self.parameters {
            match object.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    problems.push(format!("missing required argument `{}`", param.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !param.ty.accepts(value) => problems.push(format!(
                    "argument `{}` must be {}, got {}",
                    param.name,
                    param.ty.as_str(),
                    json_type_name(value)
                )),
                Some(value) => {
                    if let Some(problem) = below_minimum(param, value) {
                        problems.push(problem);
                    }
                }
            }
        }
        for key in object.keys() {
            if !self.parameters.iter().any(|p| &p.name == key) {
                problems.push(format!("unknown argument `{}`", key));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(self.error(problems))
        }
    }

    fn error(&self, problems: Vec<String>) -> ArgumentError {
        ArgumentError {
            tool: self.name.clone(),
            problems,
        }
    }
}

fn below_minimum(param: &ParamSpec, value: &Value) -> Option<String> {
    let minimum = param.minimum?;
    // Anything that does not fit in i64 is far above any bound
    let actual = value.as_i64()?;
    (actual < minimum).then(|| {
        format!(
            "argument `{}` must be at least {}, got {}",
            param.name, minimum, actual
        )
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
