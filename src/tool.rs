//! The external concatenation/averaging boundary.
//!
//! A tool is run as
//! `program <format-flag> <append-flag> <extra args> -v <var1,var2,...> <inputs...> <output>`.
//! Everything the tool writes to stdout and stderr is handed to a
//! [`DiagnosticSink`] before the exit status is looked at, so a failure is
//! always preceded by the tool's own messages.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Mutex,
    time::Duration,
};

use clap::ValueEnum;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};
use tracing::{error, info, warn};

use crate::{
    config::ConfigScope,
    error::{Error, Result},
    output::OutputMode,
    util::{file_name, parse_timeout},
};

/// Receives diagnostics on behalf of one task.
pub trait DiagnosticSink: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards diagnostics to `tracing`, tagged with the task name.
#[derive(Debug, Clone)]
pub struct TracingSink {
    task: String,
}

impl TracingSink {
    pub fn new(task: impl Into<String>) -> Self {
        Self { task: task.into() }
    }
}

impl DiagnosticSink for TracingSink {
    fn info(&self, message: &str) {
        info!(task = %self.task, "{}", message);
    }

    fn warn(&self, message: &str) {
        warn!(task = %self.task, "{}", message);
    }

    fn error(&self, message: &str) {
        error!(task = %self.task, "{}", message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Keeps every diagnostic in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(Severity, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(Severity, String)> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn push(&self, severity: Severity, message: &str) {
        let mut lines = self
            .lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        lines.push((severity, message.to_string()));
    }
}

impl DiagnosticSink for MemorySink {
    fn info(&self, message: &str) {
        self.push(Severity::Info, message);
    }

    fn warn(&self, message: &str) {
        self.push(Severity::Warn, message);
    }

    fn error(&self, message: &str) {
        self.push(Severity::Error, message);
    }
}

/// Command-line shape of one external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub format_flag: Option<String>,
    pub append_flag: Option<String>,
    pub extra_args: Vec<String>,
    pub variable_selector: String,
}

impl ToolCommand {
    /// `ncrcat -4 --record_append --no_tmp_fl -v ...`
    pub fn concatenate(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            format_flag: Some("-4".to_string()),
            append_flag: Some("--record_append".to_string()),
            extra_args: vec!["--no_tmp_fl".to_string()],
            variable_selector: "-v".to_string(),
        }
    }

    /// `ncra -4 --no_tmp_fl -v ...`
    pub fn average(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            format_flag: Some("-4".to_string()),
            append_flag: None,
            extra_args: vec!["--no_tmp_fl".to_string()],
            variable_selector: "-v".to_string(),
        }
    }

    pub fn args(&self, variables: &[String], inputs: &[PathBuf], output: &Path) -> Vec<String> {
        let mut args = Vec::new();
        args.extend(self.format_flag.iter().cloned());
        args.extend(self.append_flag.iter().cloned());
        args.extend(self.extra_args.iter().cloned());
        args.push(self.variable_selector.clone());
        args.push(variables.join(","));
        args.extend(inputs.iter().map(|p| p.to_string_lossy().into_owned()));
        args.push(output.to_string_lossy().into_owned());
        args
    }

    /// The command with the input list elided, for logs.
    pub fn summary(&self, variables: &[String], inputs: &[PathBuf], output: &Path) -> String {
        let mut head = vec![self.program.clone()];
        head.extend(self.args(variables, &[], output));
        head.pop();

        let inputs = match inputs {
            [] => String::new(),
            [only] => only.display().to_string(),
            [first, .., last] => format!("{} ... {}", first.display(), last.display()),
        };

        format!("{} {} {}", head.join(" "), inputs, output.display())
    }
}

#[derive(Debug, Clone)]
pub struct ExternalTool {
    command: ToolCommand,
    mode: OutputMode,
    timeout: Option<Duration>,
}

impl ExternalTool {
    pub fn new(command: ToolCommand) -> Self {
        Self {
            command,
            mode: OutputMode::default(),
            timeout: None,
        }
    }

    /// Reads `<key>Command` from `[execution]`, falling back to `default_program`.
    pub fn from_scope(
        scope: &ConfigScope,
        key: &str,
        build: fn(String) -> ToolCommand,
        default_program: &str,
    ) -> Result<Self> {
        let program = scope.get_or("execution", &format!("{}Command", key), default_program)?;
        let mode = match scope.get_opt("execution", "toolOutput")? {
            Some(value) => <OutputMode as ValueEnum>::from_str(value.trim(), true).map_err(|_| {
                Error::Config(format!("Unknown toolOutput '{}' (use stream or group)", value))
            })?,
            None => OutputMode::default(),
        };
        let timeout = scope.get_opt("execution", "toolTimeout")?;

        Ok(Self::new(build(program))
            .with_mode(mode)
            .with_timeout(parse_timeout(timeout.as_deref(), None)?))
    }

    pub fn with_mode(mut self, mode: OutputMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &ToolCommand {
        &self.command
    }

    /// Finds the executable on `PATH` (or at the configured path).
    pub fn locate(&self) -> Result<PathBuf> {
        which::which(&self.command.program).map_err(|source| Error::ToolNotFound {
            program: self.command.program.clone(),
            source,
        })
    }

    pub async fn invoke(
        &self,
        variables: &[String],
        inputs: &[PathBuf],
        output: &Path,
        sink: &dyn DiagnosticSink,
    ) -> Result<()> {
        if inputs.is_empty() {
            return Err(Error::NotPrepared(format!(
                "{} was asked to write {} without any input files",
                self.command.program,
                file_name(output)
            )));
        }

        let program = self.locate()?;
        let summary = self.command.summary(variables, inputs, output);
        sink.info(&format!("running: {}", summary));

        let mut child = Command::new(&program)
            .args(self.command.args(variables, inputs, output))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stream = self.mode == OutputMode::Stream;
        let out_lines = Mutex::new(Vec::new());
        let err_lines = Mutex::new(Vec::new());

        let relay = async {
            let (out, err) = tokio::join!(
                read_lines(stdout, &out_lines, stream.then_some((sink, Severity::Info))),
                read_lines(stderr, &err_lines, stream.then_some((sink, Severity::Error))),
            );
            out?;
            err
        };

        let run = async {
            relay.await?;
            Ok::<_, Error>(child.wait().await?)
        };

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result?,
                Err(_) => {
                    if !stream {
                        relay_collected(sink, &locked(&out_lines), &locked(&err_lines));
                    }
                    return Err(Error::ToolTimedOut {
                        command: summary,
                        timeout: limit,
                    });
                }
            },
            None => run.await?,
        };

        let out_lines = locked(&out_lines);
        let err_lines = locked(&err_lines);
        if !stream {
            relay_collected(sink, &out_lines, &err_lines);
        }

        if !status.success() {
            return Err(Error::ToolExecutionFailed {
                command: summary,
                exit_code: status.code(),
                stderr: err_lines.join("\n"),
            });
        }

        Ok(())
    }
}

fn locked(lines: &Mutex<Vec<String>>) -> Vec<String> {
    lines
        .lock()
        .map(|lines| lines.clone())
        .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
}

fn relay_collected(sink: &dyn DiagnosticSink, out_lines: &[String], err_lines: &[String]) {
    for line in out_lines {
        sink.info(line);
    }
    for line in err_lines {
        sink.error(line);
    }
}

/// Reads `pipe` line by line into `collected`. Bytes that are not UTF-8
/// are replaced rather than ending the read.
async fn read_lines<R>(
    pipe: Option<R>,
    collected: &Mutex<Vec<String>>,
    relay: Option<(&dyn DiagnosticSink, Severity)>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return Ok(());
    };

    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }

        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            continue;
        }
        if let Some((sink, severity)) = relay {
            match severity {
                Severity::Info => sink.info(line),
                Severity::Warn => sink.warn(line),
                Severity::Error => sink.error(line),
            }
        }
        match collected.lock() {
            Ok(mut lines) => lines.push(line.to_string()),
            Err(poisoned) => poisoned.into_inner().push(line.to_string()),
        }
    }

    Ok(())
}
