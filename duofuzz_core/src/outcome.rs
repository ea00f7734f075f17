use crate::input::Payload;
use crate::mutator::MutationKind;
use serde::{Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// Classification of a single send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// The target accepted the payload.
    Success,
    /// The target received the payload and rejected it with a structured error.
    ApplicationError,
    /// The payload never got an answer: connection refused, timeout, disconnect.
    TransportError,
    /// Anything else. Flagged for manual triage.
    Exception,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Success,
        Status::ApplicationError,
        Status::TransportError,
        Status::Exception,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::ApplicationError => "application-error",
            Status::TransportError => "transport-error",
            Status::Exception => "exception",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, Status::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn as_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

/// One characteristic write issued by the BLE adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteRecord {
    pub field: String,
    pub characteristic: Uuid,
    #[serde(serialize_with = "as_hex")]
    pub written: Vec<u8>,
    /// `"ack"` or the error reported for this write.
    pub result: String,
}

/// Transport-specific description of what came back from the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum ResponseDescriptor {
    Http {
        /// `None` when no response was received.
        status_code: Option<u16>,
        body: String,
    },
    Ble {
        writes: Vec<WriteRecord>,
        #[serde(serialize_with = "as_hex")]
        returned: Vec<u8>,
        /// Set when a value had to be re-encoded or truncated to fit a characteristic.
        encoding_degraded: bool,
    },
    /// The adapter produced nothing, e.g. it panicked mid-send.
    Unavailable { reason: String },
}

impl ResponseDescriptor {
    /// One-line rendering used by the text report.
    pub fn summary(&self) -> String {
        match self {
            ResponseDescriptor::Http {
                status_code: Some(code),
                body,
            } => format!("HTTP {code}: {body}"),
            ResponseDescriptor::Http {
                status_code: None,
                body,
            } => format!("no response: {body}"),
            ResponseDescriptor::Ble {
                writes,
                returned,
                encoding_degraded,
            } => {
                let results: Vec<String> = writes
                    .iter()
                    .map(|w| format!("{}={} [{}]", w.field, hex::encode(&w.written), w.result))
                    .collect();
                let mut line = format!(
                    "writes: {}; returned: {}",
                    results.join(", "),
                    if returned.is_empty() {
                        "-".to_string()
                    } else {
                        hex::encode(returned)
                    }
                );
                if *encoding_degraded {
                    line.push_str(" (encoding degraded)");
                }
                line
            }
            ResponseDescriptor::Unavailable { reason } => format!("unavailable: {reason}"),
        }
    }
}

/// The classified result of sending one mutated payload to one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub kind: MutationKind,
    pub payload: Payload,
    pub status: Status,
    pub response: ResponseDescriptor,
    /// Error text for non-success outcomes that carry one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub elapsed_ms: u64,
}

impl Outcome {
    pub fn new(
        kind: MutationKind,
        payload: Payload,
        status: Status,
        response: ResponseDescriptor,
    ) -> Self {
        Self {
            kind,
            payload,
            status,
            response,
            detail: None,
            elapsed_ms: 0,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    /// MD5 hex digest of the payload's wire form, used to count distinct failing inputs.
    pub fn input_hash(&self) -> String {
        self.payload.digest()
    }
}
