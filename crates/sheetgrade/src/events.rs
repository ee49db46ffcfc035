use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Progress states published while a sheet is graded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Processing,
    Aligning,
    RecognitionFailed,
    RecognitionSuccess,
    Matching,
    Complete,
    Warning,
    Error,
}

/// One outbound progress message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: Status,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl StatusEvent {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Receiver of progress events. Batch runs log them; live sessions forward
/// them to the client.
pub trait EventSink {
    fn emit(&mut self, event: StatusEvent);
}

impl<F: FnMut(StatusEvent)> EventSink for F {
    fn emit(&mut self, event: StatusEvent) {
        self(event)
    }
}

/// Sink that forwards events to the `log` facade at debug level.
#[derive(Debug, Default)]
pub struct LogSink {
    pub source: String,
}

impl EventSink for LogSink {
    fn emit(&mut self, event: StatusEvent) {
        match event.status {
            Status::Warning => log::warn!("{}: {}", self.source, event.message),
            Status::Error | Status::RecognitionFailed => {
                log::debug!("{}: {}", self.source, event.message)
            }
            _ => log::debug!("{}: {:?} {}", self.source, event.status, event.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_snake_case_status() {
        let ev = StatusEvent::new(Status::RecognitionSuccess, "codes read")
            .with_details(json!({"sbd": "123456"}));
        let v = serde_json::to_value(&ev).expect("json");
        assert_eq!(v["status"], "recognition_success");
        assert_eq!(v["details"]["sbd"], "123456");
    }

    #[test]
    fn closures_are_sinks() {
        let mut seen = Vec::new();
        {
            let mut sink = |e: StatusEvent| seen.push(e.status);
            sink.emit(StatusEvent::new(Status::Processing, ""));
            sink.emit(StatusEvent::new(Status::Complete, ""));
        }
        assert_eq!(seen, vec![Status::Processing, Status::Complete]);
    }
}
