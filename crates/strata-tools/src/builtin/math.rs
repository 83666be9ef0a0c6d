use futures::future::BoxFuture;
use serde::Deserialize;

use strata_core::error::{Result, StrataError};
use strata_core::traits::Tool;
use strata_core::types::{ToolContext, ToolResult};

pub struct MathTool;

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum MathOp {
    Sum,
    Min,
    Max,
    Avg,
    Count,
}

#[derive(Deserialize)]
struct MathInput {
    op: MathOp,
    values: Vec<serde_json::Value>,
}

impl Tool for MathTool {
    fn name(&self) -> &str {
        "math"
    }
    fn description(&self) -> &str {
        "Aggregate a list of numbers: sum, min, max, avg or count."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "op": { "type": "string", "enum": ["sum", "min", "max", "avg", "count"] },
                "values": { "type": "array", "items": { "type": ["number", "string"] } }
            },
            "required": ["op", "values"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: MathInput = serde_json::from_value(input)
                .map_err(|e| StrataError::Validation(e.to_string()))?;

            let mut numbers = Vec::with_capacity(p.values.len());
            for v in &p.values {
                let n = match v {
                    serde_json::Value::Number(n) => n.as_f64(),
                    serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                match n {
                    Some(n) => numbers.push(n),
                    None => return Ok(ToolResult::error(format!("Not a number: {}", v))),
                }
            }

            let result = match p.op {
                MathOp::Count => Some(numbers.len() as f64),
                MathOp::Sum => Some(numbers.iter().sum()),
                MathOp::Min => numbers.iter().copied().reduce(f64::min),
                MathOp::Max => numbers.iter().copied().reduce(f64::max),
                MathOp::Avg if numbers.is_empty() => None,
                MathOp::Avg => Some(numbers.iter().sum::<f64>() / numbers.len() as f64),
            };

            match result {
                Some(r) => Ok(ToolResult::success(serde_json::json!({ "result": r }))),
                None => Ok(ToolResult::error("No values to aggregate")),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_core::types::RunId;

    async fn run(input: serde_json::Value) -> ToolResult {
        let ctx = ToolContext {
            run_id: RunId::from("run-1"),
            step_id: "s1".into(),
        };
        MathTool.execute(input, ctx).await.unwrap()
    }

    #[tokio::test]
    async fn aggregates() {
        assert_eq!(run(json!({"op": "sum", "values": [1, 2, "3"]})).await.output["result"], json!(6.0));
        assert_eq!(run(json!({"op": "max", "values": [1, 7, 3]})).await.output["result"], json!(7.0));
        assert_eq!(run(json!({"op": "avg", "values": [2, 4]})).await.output["result"], json!(3.0));
        assert_eq!(run(json!({"op": "count", "values": []})).await.output["result"], json!(0.0));
    }

    #[tokio::test]
    async fn bad_values_are_tool_errors() {
        assert!(run(json!({"op": "sum", "values": [1, "x"]})).await.is_error);
        assert!(run(json!({"op": "min", "values": []})).await.is_error);
    }
}
