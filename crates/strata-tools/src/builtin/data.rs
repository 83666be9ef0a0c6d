use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use strata_core::error::{Result, StrataError};
use strata_core::traits::Tool;
use strata_core::types::{ToolContext, ToolResult};

// ── JsonQueryTool ───────────────────────────────────────────────

pub struct JsonQueryTool;

#[derive(Deserialize)]
struct JsonQueryInput {
    /// A JSON value, or a string holding JSON text.
    json: Value,
    path: String,
}

impl Tool for JsonQueryTool {
    fn name(&self) -> &str {
        "json_query"
    }
    fn description(&self) -> &str {
        "Query a JSON value by dot-notation path (e.g. 'foo.bar[0].baz')."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "json": { "description": "JSON value or JSON text to query" },
                "path": { "type": "string", "description": "Dot-notation path (e.g. 'items[0].name')" }
            },
            "required": ["json", "path"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: JsonQueryInput = serde_json::from_value(input)
                .map_err(|e| StrataError::Validation(e.to_string()))?;
            let value = match p.json {
                Value::String(text) => serde_json::from_str(&text)
                    .map_err(|e| StrataError::Validation(format!("Invalid JSON: {}", e)))?,
                other => other,
            };
            let result = json_path_query(&value, &p.path);
            Ok(ToolResult::success(serde_json::json!({ "result": result })))
        })
    }
}

/// Resolve a dot path with optional `[n]` indexes. Missing segments yield null.
pub fn json_path_query(value: &Value, path: &str) -> Value {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        let (key, index) = match segment.find('[') {
            Some(pos) if segment.ends_with(']') => {
                (&segment[..pos], segment[pos + 1..segment.len() - 1].parse::<usize>().ok())
            }
            _ => (segment, None),
        };
        if !key.is_empty() {
            match current.get(key) {
                Some(v) => current = v,
                None => return Value::Null,
            }
        }
        if let Some(idx) = index {
            match current.get(idx) {
                Some(v) => current = v,
                None => return Value::Null,
            }
        }
    }
    current.clone()
}

// ── TemplateTool ────────────────────────────────────────────────

pub struct TemplateTool;

#[derive(Deserialize)]
struct TemplateInput {
    template: String,
    /// Placeholder values. Defaults to the whole input object.
    #[serde(default)]
    values: Value,
    /// Fail on placeholders with no value instead of rendering them empty.
    #[serde(default)]
    strict: bool,
}

impl Tool for TemplateTool {
    fn name(&self) -> &str {
        "template"
    }
    fn description(&self) -> &str {
        "Render a template, replacing {{key}} placeholders with values (dot paths allowed)."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "template": { "type": "string" },
                "values": { "type": "object" },
                "strict": { "type": "boolean" }
            },
            "required": ["template"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let mut p: TemplateInput = serde_json::from_value(input.clone())
                .map_err(|e| StrataError::Validation(e.to_string()))?;
            if p.values.is_null() {
                p.values = input;
            }
            let re = regex::Regex::new(r"\{\{\s*([\w.\[\]]+)\s*\}\}")
                .map_err(|e| StrataError::Validation(format!("Invalid regex: {}", e)))?;

            let mut missing = Vec::new();
            let rendered = re.replace_all(&p.template, |caps: &regex::Captures| {
                match json_path_query(&p.values, &caps[1]) {
                    Value::Null => {
                        missing.push(caps[1].to_string());
                        String::new()
                    }
                    Value::String(s) => s,
                    other => other.to_string(),
                }
            });

            if p.strict && !missing.is_empty() {
                return Ok(ToolResult::error(format!(
                    "Missing template values: {}",
                    missing.join(", ")
                )));
            }
            Ok(ToolResult::success(serde_json::json!({
                "text": rendered.to_string(),
                "missing": missing,
            })))
        })
    }
}
