use std::fmt;

use chrono::Datelike;

use crate::{
    catalog::{YearMonth, parse_date, year_end, year_start},
    config::ConfigScope,
    error::{Error, Result},
};

/// The window a task asked for, as read from its configuration section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageRequest {
    pub section: String,
    pub start_year: i32,
    pub end_year: i32,
    pub start_date: String,
    pub end_date: String,
}

impl CoverageRequest {
    pub fn new(section: &str, start_date: &str, end_date: &str) -> Result<Self> {
        let start_year = parse_date(start_date)?.year();
        let end_year = parse_date(end_date)?.year();

        Ok(Self {
            section: section.to_string(),
            start_year,
            end_year,
            start_date: start_date.to_string(),
            end_date: end_date.to_string(),
        })
    }

    /// Reads `startYear`/`endYear` and `startDate`/`endDate`, deriving
    /// whichever pair is missing from the other.
    pub fn from_scope(scope: &ConfigScope, section: &str) -> Result<Self> {
        let start_year = scope.get_int_opt(section, "startYear")?;
        let end_year = scope.get_int_opt(section, "endYear")?;

        let start_date = match (scope.get_opt(section, "startDate")?, start_year) {
            (Some(date), _) => date,
            (None, Some(year)) => year_start(year),
            (None, None) => {
                return Err(Error::Config(format!(
                    "Section [{}] needs startYear or startDate",
                    section
                )));
            }
        };
        let end_date = match (scope.get_opt(section, "endDate")?, end_year) {
            (Some(date), _) => date,
            (None, Some(year)) => year_end(year),
            (None, None) => {
                return Err(Error::Config(format!(
                    "Section [{}] needs endYear or endDate",
                    section
                )));
            }
        };

        let mut request = Self::new(section, &start_date, &end_date)?;
        if let Some(year) = start_year {
            request.start_year = year;
        }
        if let Some(year) = end_year {
            request.end_year = year;
        }
        Ok(request)
    }

    fn start(&self) -> Result<YearMonth> {
        let stamp = parse_date(&self.start_date)?;
        Ok(YearMonth::new(stamp.year(), stamp.month()))
    }
}

/// A span of complete years for which every month has source data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageWindow {
    pub start_year: i32,
    pub end_year: i32,
    pub start_date: String,
    pub end_date: String,
}

impl CoverageWindow {
    pub fn for_years(start_year: i32, end_year: i32) -> Self {
        Self {
            start_year,
            end_year,
            start_date: year_start(start_year),
            end_date: year_end(end_year),
        }
    }

    /// Derives a scope whose `section` agrees with this window.
    pub fn apply_to(&self, scope: &ConfigScope, section: &str) -> ConfigScope {
        scope
            .with_overrides()
            .set(section, "startYear", self.start_year.to_string())
            .set(section, "endYear", self.end_year.to_string())
            .set(section, "startDate", self.start_date.as_str())
            .set(section, "endDate", self.end_date.as_str())
            .build()
    }

    pub fn contains(&self, ym: YearMonth) -> bool {
        ym.year >= self.start_year && ym.year <= self.end_year
    }
}

impl fmt::Display for CoverageWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:04}", self.start_year, self.end_year)
    }
}

/// Diagnostic emitted when the achievable window differs from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Narrowing {
    pub section: String,
    pub requested: (i32, i32),
    pub actual: (i32, i32),
}

impl fmt::Display for Narrowing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} start and/or end year different from requested (requested: {:04}-{:04}, actual: {:04}-{:04})",
            self.section, self.requested.0, self.requested.1, self.actual.0, self.actual.1
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageResolution {
    pub window: CoverageWindow,
    pub narrowing: Option<Narrowing>,
}

#[derive(Debug, Clone, Copy)]
pub struct CoverageResolver {
    first_month: u32,
    last_month: u32,
}

impl Default for CoverageResolver {
    fn default() -> Self {
        Self {
            first_month: 1,
            last_month: 12,
        }
    }
}

impl CoverageResolver {
    pub fn new(first_month: u32, last_month: u32) -> Self {
        Self {
            first_month,
            last_month,
        }
    }

    /// Narrows `request` to the complete years present in `available`.
    ///
    /// Files before the requested start month are ignored, as are files in
    /// years after the requested end year. Inside the resulting window the
    /// months must be strictly consecutive.
    pub fn resolve(
        &self,
        request: &CoverageRequest,
        available: &[YearMonth],
    ) -> Result<CoverageResolution> {
        let insufficient = |reason: String| Error::InsufficientCoverage {
            section: request.section.clone(),
            reason,
        };

        let requested_start = request.start()?;
        let months: Vec<YearMonth> = available
            .iter()
            .copied()
            .filter(|ym| *ym >= requested_start && ym.year <= request.end_year)
            .collect();

        if let Some(pair) = months.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(insufficient(format!(
                "file months are not strictly increasing ({} is followed by {})",
                pair[0], pair[1]
            )));
        }

        let first = months.iter().position(|ym| ym.month == self.first_month);
        let last = months.iter().rposition(|ym| ym.month == self.last_month);

        let (first, last) = match (first, last) {
            (Some(first), Some(last)) if first < last => (first, last),
            _ => {
                return Err(insufficient(format!(
                    "no complete year between {} and {} in {} available file(s)",
                    request.start_date,
                    request.end_date,
                    months.len()
                )));
            }
        };

        if let Some(pair) = months[first..=last]
            .windows(2)
            .find(|pair| pair[1].total_months() - pair[0].total_months() != 1)
        {
            return Err(insufficient(format!(
                "missing months between {} and {}",
                pair[0], pair[1]
            )));
        }

        let start_year = months[first].year;
        let end_year = months[last].year;

        if start_year == request.start_year && end_year == request.end_year {
            return Ok(CoverageResolution {
                window: CoverageWindow {
                    start_year,
                    end_year,
                    start_date: request.start_date.clone(),
                    end_date: request.end_date.clone(),
                },
                narrowing: None,
            });
        }

        Ok(CoverageResolution {
            window: CoverageWindow::for_years(start_year, end_year),
            narrowing: Some(Narrowing {
                section: request.section.clone(),
                requested: (request.start_year, request.end_year),
                actual: (start_year, end_year),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn months(from: (i32, u32), to: (i32, u32)) -> Vec<YearMonth> {
        let start = YearMonth::new(from.0, from.1).total_months();
        let end = YearMonth::new(to.0, to.1).total_months();
        (start..=end)
            .map(|total| {
                let year = ((total - 1) / 12) as i32;
                let month = ((total - 1) % 12 + 1) as u32;
                YearMonth::new(year, month)
            })
            .collect()
    }

    #[test]
    fn test_partial_request_narrows_to_full_years() {
        let request =
            CoverageRequest::new("timeSeries", "2000-03-01_00:00:00", "2002-10-31_23:59:59")
                .unwrap();
        let available = months((2000, 1), (2002, 12));

        let resolution = CoverageResolver::default()
            .resolve(&request, &available)
            .unwrap();

        assert_eq!(resolution.window, CoverageWindow::for_years(2001, 2002));
        assert_eq!(resolution.window.start_date, "2001-01-01_00:00:00");
        assert_eq!(resolution.window.end_date, "2002-12-31_23:59:59");

        let narrowing = resolution.narrowing.unwrap();
        assert_eq!(narrowing.requested, (2000, 2002));
        assert_eq!(narrowing.actual, (2001, 2002));
    }

    #[test]
    fn test_exact_request_keeps_dates() {
        let request = CoverageRequest::new("climatology", "0001-01-01", "0003-12-31_23:59:59")
            .unwrap();
        let available = months((1, 1), (3, 12));

        let resolution = CoverageResolver::default()
            .resolve(&request, &available)
            .unwrap();

        assert!(resolution.narrowing.is_none());
        assert_eq!(resolution.window.start_date, "0001-01-01");
        assert_eq!(resolution.window.start_year, 1);
        assert_eq!(resolution.window.end_year, 3);
    }

    #[test]
    fn test_window_always_spans_full_years() {
        let request = CoverageRequest::new("timeSeries", "0001-01-01", "0009-12-31").unwrap();
        let resolver = CoverageResolver::default();

        for (from, to) in [((1, 5), (4, 7)), ((1, 1), (2, 11)), ((2, 12), (6, 12))] {
            let available = months(from, to);
            match resolver.resolve(&request, &available) {
                Ok(resolution) => {
                    let first = available
                        .iter()
                        .find(|ym| ym.year == resolution.window.start_year)
                        .unwrap();
                    assert!(available.contains(&YearMonth::new(first.year, 1)));
                    assert!(
                        available.contains(&YearMonth::new(resolution.window.end_year, 12))
                    );
                }
                Err(err) => assert!(matches!(err, Error::InsufficientCoverage { .. })),
            }
        }
    }

    #[test]
    fn test_no_full_year_is_insufficient() {
        let request = CoverageRequest::new("timeSeries", "0001-01-01", "0001-12-31").unwrap();
        let available = months((1, 2), (1, 11));

        let err = CoverageResolver::default()
            .resolve(&request, &available)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientCoverage { .. }));
    }

    #[test]
    fn test_gap_is_insufficient() {
        let request = CoverageRequest::new("timeSeries", "0001-01-01", "0002-12-31").unwrap();
        let mut available = months((1, 1), (2, 12));
        available.retain(|ym| *ym != YearMonth::new(1, 7));

        let err = CoverageResolver::default()
            .resolve(&request, &available)
            .unwrap_err();
        assert!(err.to_string().contains("missing months"));
    }

    #[test]
    fn test_unsorted_months_are_rejected() {
        let request = CoverageRequest::new("timeSeries", "0001-01-01", "0002-12-31").unwrap();
        let mut available = months((1, 1), (2, 12));
        available.swap(3, 4);

        let err = CoverageResolver::default()
            .resolve(&request, &available)
            .unwrap_err();
        assert!(err.to_string().contains("not strictly increasing"));
    }

    #[test]
    fn test_request_from_scope_and_apply() {
        let scope = ConfigScope::from_toml_str(
            "[timeSeries]\nstartYear = 2\nendYear = 4\n",
        )
        .unwrap();

        let request = CoverageRequest::from_scope(&scope, "timeSeries").unwrap();
        assert_eq!(request.start_date, "0002-01-01_00:00:00");
        assert_eq!(request.end_date, "0004-12-31_23:59:59");

        let narrowed = CoverageWindow::for_years(3, 4).apply_to(&scope, "timeSeries");
        assert_eq!(narrowed.get_int("timeSeries", "startYear").unwrap(), 3);
        assert_eq!(scope.get_int("timeSeries", "startYear").unwrap(), 2);
    }
}
