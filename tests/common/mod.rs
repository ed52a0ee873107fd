//! Shared fixtures: plain-text stand-ins for model output files, an inspector
//! that reads them, and a shell script that concatenates them.
//!
//! A fixture file holds one `var:<name>` line per variable and one
//! `time:<stamp>` line per record.

#![allow(dead_code)]

use std::{
    collections::BTreeSet,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tempfile::TempDir;
use tsclim::{
    catalog::InputFileIndex,
    config::ConfigScope,
    coverage::CoverageResolver,
    error::Result,
    inspect::FileInspector,
    task::Services,
    tool::{ExternalTool, ToolCommand},
};

pub const STREAM: &str = "timeSeriesStatsMonthlyOutput";
pub const SSH: &str = "timeMonthly_avg_ssh";
pub const SST: &str = "timeMonthly_avg_sst";

pub struct LineInspector;

#[async_trait]
impl FileInspector for LineInspector {
    async fn variables(&self, path: &Path) -> Result<BTreeSet<String>> {
        let contents = fs::read_to_string(path)?;
        Ok(contents
            .lines()
            .filter_map(|line| line.strip_prefix("var:"))
            .map(str::to_string)
            .collect())
    }

    async fn time_values(&self, path: &Path, _variable: &str) -> Result<Vec<String>> {
        let contents = fs::read_to_string(path)?;
        Ok(contents
            .lines()
            .filter_map(|line| line.strip_prefix("time:"))
            .map(str::to_string)
            .collect())
    }
}

pub struct Workspace {
    pub temp: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("run")).unwrap();
        fs::create_dir_all(temp.path().join("bin")).unwrap();
        Self { temp }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root().join("run")
    }

    pub fn tool_log(&self) -> PathBuf {
        self.root().join("tool.log")
    }

    /// Calls the fake tool received, one line of arguments each.
    pub fn tool_calls(&self) -> Vec<String> {
        fs::read_to_string(self.tool_log())
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn write_month(&self, year: i32, month: u32, variables: &[&str]) -> PathBuf {
        let path = self.run_dir().join(format!(
            "am.timeSeriesStatsMonthly.{:04}-{:02}-01.nc",
            year, month
        ));
        let mut contents = String::new();
        for variable in variables
            .iter()
            .chain(["xtime_startMonthly", "xtime_endMonthly"].iter())
        {
            contents.push_str(&format!("var:{}\n", variable));
        }
        contents.push_str(&format!("time:{:04}-{:02}-01_00:00:00\n", year, month));
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn write_years(&self, first: i32, last: i32, variables: &[&str]) {
        for year in first..=last {
            for month in 1..=12 {
                self.write_month(year, month, variables);
            }
        }
    }

    /// Appends every input file to the last argument and logs the call.
    pub fn concatenating_tool(&self) -> String {
        self.script(
            "fakecat",
            &format!(
                r#"echo "$*" >> '{log}'
while [ "$#" -gt 0 ]; do
  case "$1" in
    -v) shift 2 ;;
    -*) shift ;;
    *) break ;;
  esac
done
n=$#
i=1
for arg in "$@"; do
  if [ "$i" -eq "$n" ]; then out="$arg"; fi
  i=$((i + 1))
done
i=1
for arg in "$@"; do
  if [ "$i" -lt "$n" ]; then cat "$arg" >> "$out"; fi
  i=$((i + 1))
done
echo "wrote $out""#,
                log = self.tool_log().display()
            ),
        )
    }

    pub fn failing_tool(&self) -> String {
        self.script(
            "brokencat",
            &format!(
                "echo \"$*\" >> '{}'\necho 'ERROR: unknown variable' >&2\nexit 2",
                self.tool_log().display()
            ),
        )
    }

    fn script(&self, name: &str, body: &str) -> String {
        let path = self.root().join("bin").join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// A configuration with the given extra sections appended.
    pub fn scope(&self, extra: &str) -> ConfigScope {
        let text = format!(
            r#"[input]
baseDirectory = '{run}'
component = "ocean"

[streams]
{stream} = "am.timeSeriesStatsMonthly.$Y-$M-$D.nc"

[output]
baseDirectory = '{out}'
timeSeriesSubdirectory = "timeseries"
climatologySubdirectory = "clim"

{extra}
"#,
            run = self.run_dir().display(),
            out = self.root().join("out").display(),
            stream = STREAM,
            extra = extra,
        );
        ConfigScope::from_toml_str(&text).unwrap()
    }

    pub fn services(&self, scope: &ConfigScope, tool: &str) -> Arc<Services> {
        Arc::new(Services {
            index: InputFileIndex::from_scope(scope).unwrap(),
            inspector: Arc::new(LineInspector),
            concatenate: ExternalTool::new(ToolCommand::concatenate(tool)),
            average: ExternalTool::new(ToolCommand::average(tool)),
            resolver: CoverageResolver::default(),
        })
    }

    pub fn time_series_file(&self) -> PathBuf {
        self.root()
            .join("out")
            .join("timeseries")
            .join("mpasTimeSeriesOcean.nc")
    }
}

pub fn records(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter_map(|line| line.strip_prefix("time:"))
        .map(str::to_string)
        .collect()
}

pub fn variables(path: &Path) -> BTreeSet<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter_map(|line| line.strip_prefix("var:"))
        .map(str::to_string)
        .collect()
}
