//! Decides how much of a derived product has to be (re)computed.
//!
//! A product that already holds every required variable is only ever
//! extended with the months it does not have yet; a product missing a
//! variable is discarded and rebuilt from all candidate files.

use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
};

use crate::{
    catalog::{InputFileSet, YearMonth},
    error::Result,
    inspect::FileInspector,
};

/// What is known about a derived product already on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputProduct {
    pub path: PathBuf,
    pub variables: BTreeSet<String>,
    pub time_values: Vec<String>,
}

impl OutputProduct {
    /// Returns `None` when nothing exists at `path` yet.
    pub async fn inspect(
        path: &Path,
        inspector: &dyn FileInspector,
        time_variable: Option<&str>,
    ) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let variables = inspector.variables(path).await?;
        let time_values = match time_variable {
            Some(name) if variables.contains(name) => inspector.time_values(path, name).await?,
            _ => Vec::new(),
        };

        Ok(Some(Self {
            path: path.to_path_buf(),
            variables,
            time_values,
        }))
    }

    pub fn missing_variables(&self, required: &BTreeSet<String>) -> Vec<String> {
        required
            .iter()
            .filter(|name| !self.variables.contains(*name))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    Absent,
    MissingVariables(Vec<String>),
    NoRecords,
    UnreadableTime(String),
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildReason::Absent => write!(f, "no existing output"),
            RebuildReason::MissingVariables(names) => {
                write!(f, "existing output lacks {}", names.join(", "))
            }
            RebuildReason::NoRecords => write!(f, "existing output has no time records"),
            RebuildReason::UnreadableTime(value) => {
                write!(f, "existing output has an unreadable time stamp '{}'", value)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDecision {
    /// The product is complete and current.
    NoOp,
    /// Append exactly these files; never empty.
    Extend(InputFileSet),
    /// Discard whatever exists and compute from every candidate file.
    Rebuild(RebuildReason),
}

impl CacheDecision {
    pub fn describe(&self) -> String {
        match self {
            CacheDecision::NoOp => "up to date".to_string(),
            CacheDecision::Extend(delta) => format!("extend with {} file(s)", delta.len()),
            CacheDecision::Rebuild(reason) => format!("rebuild ({})", reason),
        }
    }
}

/// Decision for an appendable time series.
pub fn decide(
    existing: Option<&OutputProduct>,
    required: &BTreeSet<String>,
    candidates: &InputFileSet,
) -> CacheDecision {
    let product = match existing {
        Some(product) => product,
        None => return CacheDecision::Rebuild(RebuildReason::Absent),
    };

    let missing = product.missing_variables(required);
    if !missing.is_empty() {
        return CacheDecision::Rebuild(RebuildReason::MissingVariables(missing));
    }

    let last = match product.time_values.last() {
        Some(value) => value,
        None => return CacheDecision::Rebuild(RebuildReason::NoRecords),
    };

    let last_total = match YearMonth::from_stamp(last) {
        Ok(ym) => ym.total_months(),
        Err(_) => return CacheDecision::Rebuild(RebuildReason::UnreadableTime(last.clone())),
    };

    let delta = candidates.filter(|file| file.year_month().total_months() > last_total);

    if delta.is_empty() {
        CacheDecision::NoOp
    } else {
        CacheDecision::Extend(delta)
    }
}

/// Decision for a product whose window is fixed by its file name, such as a
/// climatology: it can be kept or rebuilt, but never extended.
pub fn decide_fixed(existing: Option<&OutputProduct>, required: &BTreeSet<String>) -> CacheDecision {
    match existing {
        None => CacheDecision::Rebuild(RebuildReason::Absent),
        Some(product) => {
            let missing = product.missing_variables(required);
            if missing.is_empty() {
                CacheDecision::NoOp
            } else {
                CacheDecision::Rebuild(RebuildReason::MissingVariables(missing))
            }
        }
    }
}
