use clap::ValueEnum;

/// How lines from an external tool reach the diagnostic sink.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Relay each line as the tool writes it.
    Stream,
    /// Relay all lines as one block once the tool exits.
    #[default]
    Group,
}

impl OutputMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputMode::Stream => "stream",
            OutputMode::Group => "group",
        }
    }
}
