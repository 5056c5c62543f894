//! Built-in task definitions. Task definitions are ordinary Rust values
//! rather than dynamically discovered plugins; this module supplies the
//! demo task used by integration tests and as the default manifest for the
//! `taskhub-api` binary.

use std::sync::Arc;

use serde_json::json;

use crate::error::ValidationError;
use crate::registry::TaskDefinition;

/// `demo_v2`: loops `count` times printing a progress event, then writes a
/// CSV artifact and an `artifacts.json` index.
pub fn demo_task() -> TaskDefinition {
    TaskDefinition {
        task_id: "demo_v2".to_string(),
        name: "Demo task v2".to_string(),
        description: "Loops, emits progress events, and produces a CSV artifact".to_string(),
        tags: vec!["demo".to_string()],
        version: "1.0.0".to_string(),
        params_schema: json!({
            "type": "object",
            "properties": {
                "count": {"type": "integer", "minimum": 1, "default": 5},
                "message": {"type": "string", "default": "Hello"}
            },
            "additionalProperties": false
        }),
        concurrency_limit: Some(2),
        timeout_seconds: Some(300),
        is_enabled: true,
        command_builder: Arc::new(build_demo_command),
    }
}

fn build_demo_command(params: &serde_json::Value) -> Result<Vec<String>, ValidationError> {
    let count = params
        .get("count")
        .and_then(|v| v.as_i64())
        .unwrap_or(5)
        .max(1);
    let message = params
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("Hello")
        .to_string();

    let script = format!(
        r#"
set -eu
echo "task starting, message: {message}"
mkdir -p files
i=1
while [ "$i" -le {count} ]; do
  pct=$(( i * 100 / {count} ))
  echo "TASKHUB_EVENT {{\"type\":\"progress\",\"data\":{{\"pct\":$pct,\"stage\":\"computing\"}}}}"
  echo "step $i: working..."
  i=$((i + 1))
done

csv="files/result.csv"
echo "id,value" > "$csv"
i=0
while [ "$i" -lt {count} ]; do
  echo "$i,$((i * 10))" >> "$csv"
  i=$((i + 1))
done
size=$(wc -c < "$csv" | tr -d ' ')

cat > artifacts.json <<EOF
{{"run_id": "${{TASKHUB_RUN_ID:-unknown}}", "items": [{{"artifact_id": "res_csv", "kind": "file", "title": "computed CSV", "file_id": "f_result_csv", "path": "$csv", "mime": "text/csv", "size_bytes": $size}}]}}
EOF

echo "TASKHUB_EVENT {{\"type\":\"artifact\",\"data\":{{\"title\":\"computed CSV\"}}}}"
echo "artifact generation complete"
"#
    );

    Ok(vec!["/bin/sh".to_string(), "-c".to_string(), script])
}
