use std::path::PathBuf;

use clap::Parser;

use crate::output::OutputMode;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Incremental time series and climatologies from monthly model output",
    long_about = None
)]
pub struct Cli {
    /// Configuration file to use
    #[arg(short = 'f', long = "file", default_value = "tsclim.toml")]
    pub file: PathBuf,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Override number of tasks that may run at once
    #[arg(short = 'j', long = "workers")]
    pub workers: Option<usize>,

    /// Override the external tool timeout (e.g., "5m", "30s", "1h30m")
    #[arg(short = 't', long = "timeout")]
    pub timeout: Option<String>,

    /// Prepare tasks and show the commands that would run
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Stop starting new tasks after the first failure
    #[arg(long = "fail-fast")]
    pub fail_fast: bool,

    /// How to relay external tool output
    #[arg(long = "output", value_enum)]
    pub output: Option<OutputMode>,

    /// Tasks to generate (all, all_<tag>, no_<task-or-tag>, <task-or-tag>);
    /// defaults to [output] generate
    pub generate: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        let cli = Cli::parse_from([
            "tsclim",
            "-f",
            "run.toml",
            "-j",
            "3",
            "--output",
            "stream",
            "--fail-fast",
            "all_timeSeries",
            "no_sst",
        ]);

        assert_eq!(cli.file, PathBuf::from("run.toml"));
        assert_eq!(cli.workers, Some(3));
        assert_eq!(cli.output, Some(OutputMode::Stream));
        assert!(cli.fail_fast);
        assert!(!cli.dry_run);
        assert_eq!(cli.generate, vec!["all_timeSeries", "no_sst"]);
    }
}
