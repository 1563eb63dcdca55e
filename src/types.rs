use std::str::FromStr;
use serde::Deserialize;

/// What happens to undispatched requests when the kernel is restarted.
///
/// - `Drain`: discard every queued request together with the in-flight one
///   (default). Nothing submitted before the restart runs on the new kernel.
/// - `Keep`: keep the queued requests and dispatch them to the fresh kernel
///   once it reports `ready`. The in-flight request is still released, since
///   the bridge abandons it on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartQueuePolicy {
    Drain,
    Keep,
}

impl Default for RestartQueuePolicy {
    fn default() -> Self {
        RestartQueuePolicy::Drain
    }
}

impl FromStr for RestartQueuePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drain" => Ok(RestartQueuePolicy::Drain),
            "keep" => Ok(RestartQueuePolicy::Keep),
            other => Err(format!(
                "invalid restart_queue: {other} (expected \"drain\" or \"keep\")"
            )),
        }
    }
}

/// Output channel of a streamed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Stdout,
    Stderr,
}

impl Default for Channel {
    fn default() -> Self {
        Channel::Stdout
    }
}

impl Channel {
    /// Stderr output is presented error-styled.
    pub fn is_error(self) -> bool {
        matches!(self, Channel::Stderr)
    }
}
