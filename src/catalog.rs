//! Resolution of raw stream output files.
//!
//! Streams are declared with a filename template such as
//! `analysis_members/timeSeriesStatsMonthly.$Y-$M-$D.nc`. The template is used
//! twice: as a glob to list candidates and as a regex to recover each file's
//! date stamp. Files are ordered by that stamp, not by path.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    path::{Path, PathBuf},
};

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use regex::Regex;
use tracing::debug;

use crate::{
    config::ConfigScope,
    error::{Error, Result},
};

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d_%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d"];

/// Parses the date strings used throughout the analysis configuration.
pub fn parse_date(text: &str) -> Result<NaiveDateTime> {
    let text = text.trim();

    for format in &DATE_FORMATS[..2] {
        if let Ok(stamp) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(stamp);
        }
    }

    NaiveDate::parse_from_str(text, DATE_FORMATS[2])
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| Error::Parse(format!("Invalid date '{}'", text)))
}

pub fn year_start(year: i32) -> String {
    format!("{:04}-01-01_00:00:00", year)
}

pub fn year_end(year: i32) -> String {
    format!("{:04}-12-31_23:59:59", year)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    /// Months since year zero; consecutive months differ by exactly one.
    pub fn total_months(&self) -> i64 {
        12 * i64::from(self.year) + i64::from(self.month)
    }

    /// Reads the leading `YYYY-MM` of a time-coordinate value.
    pub fn from_stamp(text: &str) -> Result<Self> {
        let text = text.trim();
        let (year, rest) = text
            .split_once('-')
            .ok_or_else(|| Error::Parse(format!("Invalid time stamp '{}'", text)))?;
        let month = rest.get(0..2).unwrap_or(rest);

        match (year.parse::<i32>(), month.parse::<u32>()) {
            (Ok(year), Ok(month)) if (1..=12).contains(&month) => Ok(Self { year, month }),
            _ => Err(Error::Parse(format!("Invalid time stamp '{}'", text))),
        }
    }

    pub fn to_stamp(&self) -> String {
        format!("{:04}-{:02}-01_00:00:00", self.year, self.month)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub path: PathBuf,
    pub stamp: NaiveDateTime,
}

impl InputFile {
    pub fn new(path: impl Into<PathBuf>, year: i32, month: u32) -> Result<Self> {
        let stamp = NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .ok_or_else(|| Error::Parse(format!("Invalid year/month {}-{}", year, month)))?;

        Ok(Self {
            path: path.into(),
            stamp,
        })
    }

    pub fn year(&self) -> i32 {
        self.stamp.year()
    }

    pub fn month(&self) -> u32 {
        self.stamp.month()
    }

    pub fn year_month(&self) -> YearMonth {
        YearMonth::new(self.year(), self.month())
    }
}

/// Time-ordered, duplicate-free list of stream files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputFileSet {
    files: Vec<InputFile>,
}

impl InputFileSet {
    pub fn new(files: Vec<InputFile>) -> Self {
        let mut files = files;
        files.sort_by(|a, b| a.stamp.cmp(&b.stamp).then_with(|| a.path.cmp(&b.path)));

        let mut seen = HashSet::new();
        files.retain(|file| seen.insert(file.path.clone()));

        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &[InputFile] {
        &self.files
    }

    pub fn iter(&self) -> std::slice::Iter<'_, InputFile> {
        self.files.iter()
    }

    pub fn first(&self) -> Option<&InputFile> {
        self.files.first()
    }

    pub fn last(&self) -> Option<&InputFile> {
        self.files.last()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|file| file.path.clone()).collect()
    }

    pub fn year_months(&self) -> Vec<YearMonth> {
        self.files.iter().map(InputFile::year_month).collect()
    }

    pub fn merge(&self, other: &InputFileSet) -> InputFileSet {
        let mut files = self.files.clone();
        files.extend(other.files.iter().cloned());
        InputFileSet::new(files)
    }

    pub fn filter<F>(&self, predicate: F) -> InputFileSet
    where
        F: Fn(&InputFile) -> bool,
    {
        InputFileSet {
            files: self.files.iter().filter(|&f| predicate(f)).cloned().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a InputFileSet {
    type Item = &'a InputFile;
    type IntoIter = std::slice::Iter<'a, InputFile>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.iter()
    }
}

#[derive(Debug, Clone)]
struct StreamTemplate {
    template: String,
    glob: String,
    regex: Regex,
}

impl StreamTemplate {
    fn parse(base_dir: &Path, template: &str) -> Result<Self> {
        let full = base_dir.join(template).to_string_lossy().into_owned();

        let mut glob = String::with_capacity(full.len());
        let mut pattern = String::from("^");
        let mut seen = HashSet::new();
        let mut chars = full.chars().peekable();
        let mut literal = String::new();

        while let Some(c) = chars.next() {
            let token = match (c, chars.peek()) {
                ('$', Some(&t)) if "YMDhms".contains(t) => t,
                _ => {
                    literal.push(c);
                    continue;
                }
            };
            chars.next();

            pattern.push_str(&regex::escape(&literal));
            glob.push_str(&literal);
            literal.clear();

            let digits = if token == 'Y' { r"\d+" } else { r"\d{2}" };
            if seen.insert(token) {
                pattern.push_str(&format!("(?P<{}>{})", token_group(token), digits));
            } else {
                pattern.push_str(digits);
            }
            glob.push('*');
        }

        pattern.push_str(&regex::escape(&literal));
        pattern.push('$');
        glob.push_str(&literal);

        if !seen.contains(&'Y') {
            return Err(Error::Config(format!(
                "Stream template '{}' has no $Y token",
                template
            )));
        }

        let regex = Regex::new(&pattern)
            .map_err(|e| Error::Config(format!("Invalid stream template '{}': {}", template, e)))?;

        Ok(Self {
            template: template.to_string(),
            glob,
            regex,
        })
    }

    fn stamp(&self, path: &Path) -> Option<NaiveDateTime> {
        let path_str = path.to_string_lossy();
        let caps = self.regex.captures(&path_str)?;
        let field = |name: &str, default: u32| -> Option<u32> {
            match caps.name(name) {
                Some(m) => m.as_str().parse().ok(),
                None => Some(default),
            }
        };

        let year: i32 = caps.name("year")?.as_str().parse().ok()?;
        NaiveDate::from_ymd_opt(year, field("month", 1)?, field("day", 1)?)?.and_hms_opt(
            field("hour", 0)?,
            field("minute", 0)?,
            field("second", 0)?,
        )
    }
}

fn token_group(token: char) -> &'static str {
    match token {
        'Y' => "year",
        'M' => "month",
        'D' => "day",
        'h' => "hour",
        'm' => "minute",
        _ => "second",
    }
}

/// Lists stream files and their true date stamps.
#[derive(Debug, Clone)]
pub struct InputFileIndex {
    base_dir: PathBuf,
    streams: BTreeMap<String, StreamTemplate>,
}

impl InputFileIndex {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            streams: BTreeMap::new(),
        }
    }

    /// Builds the index from `[input] baseDirectory` and the `[streams]` section.
    pub fn from_scope(scope: &ConfigScope) -> Result<Self> {
        let mut index = Self::new(scope.get("input", "baseDirectory")?);
        for stream in scope.keys("streams") {
            let template = scope.get("streams", &stream)?;
            index = index.with_stream(&stream, &template)?;
        }
        Ok(index)
    }

    pub fn with_stream(mut self, name: &str, template: &str) -> Result<Self> {
        let parsed = StreamTemplate::parse(&self.base_dir, template)?;
        self.streams.insert(name.to_string(), parsed);
        Ok(self)
    }

    /// Every file of the stream, whatever its date.
    pub fn available(&self, stream: &str) -> Result<InputFileSet> {
        let template = self
            .streams
            .get(stream)
            .ok_or_else(|| Error::UnknownStream(stream.to_string()))?;

        let mut files = Vec::new();
        for entry in glob::glob(&template.glob)? {
            let path = entry?;
            if !path.is_file() {
                continue;
            }

            match template.stamp(&path) {
                Some(stamp) => files.push(InputFile { path, stamp }),
                None => debug!(
                    stream,
                    path = %path.display(),
                    template = %template.template,
                    "skipping file without a date stamp"
                ),
            }
        }

        Ok(InputFileSet::new(files))
    }

    /// Files of the stream stamped inside `[start, end]`.
    pub fn resolve(&self, stream: &str, start: &str, end: &str) -> Result<InputFileSet> {
        let start_stamp = parse_date(start)?;
        let end_stamp = parse_date(end)?;

        let files = self
            .available(stream)?
            .filter(|file| file.stamp >= start_stamp && file.stamp <= end_stamp);

        if files.is_empty() {
            return Err(Error::NoInputFiles {
                stream: stream.to_string(),
                start: start.to_string(),
                end: end.to_string(),
            });
        }

        debug!(stream, count = files.len(), start, end, "resolved input files");
        Ok(files)
    }
}
