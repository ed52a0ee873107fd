//! File-level metadata: which variables a file holds and the values of its
//! time coordinate. Nothing here interprets scientific content.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    process::Stdio,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

#[async_trait]
pub trait FileInspector: Send + Sync {
    async fn variables(&self, path: &Path) -> Result<BTreeSet<String>>;

    /// Values of a character time coordinate such as `xtime_startMonthly`,
    /// in record order.
    async fn time_values(&self, path: &Path, variable: &str) -> Result<Vec<String>>;
}

/// The part of an `ncks --jsn` document that is read here.
#[derive(Debug, Deserialize)]
struct NcksDump {
    variables: BTreeMap<String, NcksVariable>,
}

#[derive(Debug, Deserialize)]
struct NcksVariable {
    #[serde(default)]
    data: Option<Value>,
}

/// Reads metadata through `ncks --jsn`.
#[derive(Debug, Clone)]
pub struct NcksInspector {
    program: String,
}

impl Default for NcksInspector {
    fn default() -> Self {
        Self::new("ncks")
    }
}

impl NcksInspector {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn dump(&self, args: &[&str], path: &Path) -> Result<NcksDump> {
        let program = which::which(&self.program).map_err(|source| Error::ToolNotFound {
            program: self.program.clone(),
            source,
        })?;

        let output = Command::new(&program)
            .args(args)
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::ToolExecutionFailed {
                command: format!("{} {} {}", self.program, args.join(" "), path.display()),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        debug!(program = %self.program, path = %path.display(), "read file metadata");
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[async_trait]
impl FileInspector for NcksInspector {
    async fn variables(&self, path: &Path) -> Result<BTreeSet<String>> {
        let dump = self.dump(&["--jsn", "-m"], path).await?;
        Ok(dump.variables.into_keys().collect())
    }

    async fn time_values(&self, path: &Path, variable: &str) -> Result<Vec<String>> {
        let dump = self.dump(&["--jsn", "-v", variable], path).await?;
        strings_from_dump(&dump, variable)
    }
}

fn strings_from_dump(dump: &NcksDump, variable: &str) -> Result<Vec<String>> {
    let data = dump
        .variables
        .get(variable)
        .and_then(|var| var.data.as_ref())
        .ok_or_else(|| {
            Error::Parse(format!("ncks output has no data for variable '{}'", variable))
        })?;

    let mut values = Vec::new();
    collect_strings(data, &mut values);
    Ok(values)
}

// Character arrays may come back either as strings or as arrays of single
// characters, depending on the NCO version.
fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.trim_end_matches('\0').trim().to_string()),
        Value::Array(items) if is_char_array(items) => {
            let joined: String = items.iter().filter_map(Value::as_str).collect();
            out.push(joined.trim_end_matches('\0').trim().to_string());
        }
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        _ => {}
    }
}

fn is_char_array(items: &[Value]) -> bool {
    !items.is_empty()
        && items
            .iter()
            .all(|item| item.as_str().is_some_and(|s| s.chars().count() <= 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> serde_json::Result<NcksDump> {
        serde_json::from_value(value)
    }

    #[test]
    fn test_dump_lists_variables() {
        let dump = parse(json!({
            "dimensions": {"Time": 2},
            "variables": {
                "xtime_startMonthly": {"type": "char"},
                "timeMonthly_avg_ssh": {"type": "float"}
            }
        }))
        .unwrap();

        assert!(dump.variables.contains_key("xtime_startMonthly"));
        assert!(dump.variables.contains_key("timeMonthly_avg_ssh"));
        assert!(parse(json!({})).is_err());
    }

    #[test]
    fn test_strings_from_dump() {
        let dump = parse(json!({
            "variables": {
                "xtime_startMonthly": {
                    "data": ["0001-01-01_00:00:00", "0001-02-01_00:00:00"]
                }
            }
        }))
        .unwrap();
        assert_eq!(
            strings_from_dump(&dump, "xtime_startMonthly").unwrap(),
            vec!["0001-01-01_00:00:00", "0001-02-01_00:00:00"]
        );

        let chars = parse(json!({
            "variables": {
                "xtime": {"data": [["0", "0", "0", "2", "-", "0", "3"]]}
            }
        }))
        .unwrap();
        assert_eq!(strings_from_dump(&chars, "xtime").unwrap(), vec!["0002-03"]);

        assert!(strings_from_dump(&dump, "missing").is_err());
    }
}
