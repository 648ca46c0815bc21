//! Progress events emitted by the installation pipeline.

use serde::Serialize;

/// Identifiers touched by one installation job, grouped by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallSummary {
    /// Pulled successfully during this job
    pub installed: Vec<String>,
    /// Present before the job started
    pub already_present: Vec<String>,
    /// Pull failed
    pub failed: Vec<String>,
}

/// One step of an installation job.
///
/// A stream always ends with exactly one of [`ProgressEvent::BatchComplete`]
/// or [`ProgressEvent::Cancelled`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    AlreadyPresent { model: String },
    InstallStarted { model: String },
    Progress { model: String, line: String },
    InstallSucceeded { model: String },
    InstallFailed { model: String, reason: String },
    BatchComplete { summary: InstallSummary },
    Cancelled,
}

impl ProgressEvent {
    /// The model this event belongs to, if any.
    pub fn model(&self) -> Option<&str> {
        match self {
            ProgressEvent::AlreadyPresent { model }
            | ProgressEvent::InstallStarted { model }
            | ProgressEvent::Progress { model, .. }
            | ProgressEvent::InstallSucceeded { model }
            | ProgressEvent::InstallFailed { model, .. } => Some(model),
            ProgressEvent::BatchComplete { .. } | ProgressEvent::Cancelled => None,
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::BatchComplete { .. } | ProgressEvent::Cancelled)
    }

    /// Human readable text of the event.
    pub fn message(&self) -> String {
        match self {
            ProgressEvent::AlreadyPresent { model } => format!("Model {} already exists.", model),
            ProgressEvent::InstallStarted { model } => format!("Installing model {}...", model),
            ProgressEvent::Progress { line, .. } => line.clone(),
            ProgressEvent::InstallSucceeded { model } => {
                format!("Model {} installed successfully.", model)
            }
            ProgressEvent::InstallFailed { model, reason } => {
                format!("Failed to install model {}: {}", model, reason)
            }
            ProgressEvent::BatchComplete { .. } => "Installation process completed.".to_string(),
            ProgressEvent::Cancelled => "Installation cancelled.".to_string(),
        }
    }

    /// Server-sent-events frame for this event.
    pub fn to_sse(&self) -> String {
        sse_frame(&self.message())
    }
}

impl std::fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

/// Frame `text` as one SSE event: a `data: ` line per text line and a blank
/// line terminator.
pub fn sse_frame(text: &str) -> String {
    let mut frame = String::with_capacity(text.len() + 8);
    let mut lines = text.lines().peekable();
    if lines.peek().is_none() {
        frame.push_str("data: \n");
    }
    for line in lines {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_single_line() {
        let event = ProgressEvent::InstallStarted {
            model: "llama3:8b".to_string(),
        };
        assert_eq!(event.to_sse(), "data: Installing model llama3:8b...\n\n");
    }

    #[test]
    fn test_sse_multi_line() {
        let event = ProgressEvent::InstallFailed {
            model: "x".to_string(),
            reason: "exit status 1\nError: pull model manifest: file does not exist".to_string(),
        };
        assert_eq!(
            event.to_sse(),
            "data: Failed to install model x: exit status 1\n\
             data: Error: pull model manifest: file does not exist\n\n"
        );
        assert_eq!(sse_frame(""), "data: \n\n");
    }

    #[test]
    fn test_terminal_sentinels() {
        let done = ProgressEvent::BatchComplete {
            summary: InstallSummary::default(),
        };
        assert!(done.is_terminal());
        assert!(ProgressEvent::Cancelled.is_terminal());
        assert_eq!(done.to_sse(), "data: Installation process completed.\n\n");
        assert!(!ProgressEvent::Progress {
            model: "a".into(),
            line: "pulling".into()
        }
        .is_terminal());
        assert_eq!(done.model(), None);
    }

    #[test]
    fn test_json_shape() {
        let event = ProgressEvent::Progress {
            model: "a".to_string(),
            line: "pulling manifest".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "progress");
        assert_eq!(json["model"], "a");
        assert_eq!(json["line"], "pulling manifest");
    }
}
