use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::{Error, Result};

pub fn parse_timeout(timeout_str: Option<&str>, default_timeout: Option<&str>) -> Result<Option<Duration>> {
    let timeout_to_parse = match timeout_str.or(default_timeout) {
        Some(value) => value.trim(),
        None => return Ok(None),
    };

    if timeout_to_parse == "0" || timeout_to_parse.is_empty() {
        return Ok(None);
    }

    timeout_to_parse
        .parse::<humantime::Duration>()
        .map(|duration| Some(duration.into()))
        .map_err(|e| {
            Error::Config(format!(
                "Invalid timeout format '{}': {} (use durations like '5m', '30s', '1h30m')",
                timeout_to_parse, e
            ))
        })
}

pub fn make_directories(path: &Path) -> Result<PathBuf> {
    fs::create_dir_all(path)?;
    Ok(path.to_path_buf())
}

/// Removes a derived product so it can be recomputed from scratch.
pub fn remove_product(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }

    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }

    Ok(true)
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout(None, None).unwrap(), None);
        assert_eq!(parse_timeout(Some("0"), Some("5m")).unwrap(), None);
        assert_eq!(
            parse_timeout(None, Some("1h30m")).unwrap(),
            Some(Duration::from_secs(5400))
        );
        assert!(parse_timeout(Some("soon"), None).is_err());
    }

    #[test]
    fn test_remove_product() {
        let temp = TempDir::new().unwrap();
        let product = temp.path().join("series.nc");

        assert!(!remove_product(&product).unwrap());

        fs::write(&product, b"data").unwrap();
        assert!(remove_product(&product).unwrap());
        assert!(!product.exists());
    }
}
