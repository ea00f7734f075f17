use super::TargetAdapter;
use crate::input::{FieldValue, Payload};
use crate::mutator::MutationKind;
use crate::outcome::{Outcome, ResponseDescriptor, Status, WriteRecord};
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

/// Largest value a single ATT attribute can hold.
pub const DEFAULT_MAX_WRITE_LEN: usize = 512;

pub const ATT_INSUFFICIENT_AUTHENTICATION: u8 = 0x05;
pub const ATT_INVALID_ATTRIBUTE_LENGTH: u8 = 0x0d;

const WHOLE_PAYLOAD_FIELD: &str = "*";

/// Expected-state value marking a seed the lock should refuse.
pub const ERROR_STATE: &str = "error";

/// Failures a GATT link can report for one operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    /// The peripheral answered with an ATT error response.
    #[error("ATT error 0x{code:02x}: {reason}")]
    Att { code: u8, reason: String },
    #[error("Link disconnected: {0}")]
    Disconnected(String),
    #[error("GATT operation timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

impl GattError {
    fn status(&self) -> Status {
        match self {
            GattError::Att { .. } => Status::ApplicationError,
            GattError::Disconnected(_) | GattError::Timeout => Status::TransportError,
            GattError::Other(_) => Status::Exception,
        }
    }
}

/// A ready-to-use handle on a connected peripheral.
///
/// Scanning, connecting and pairing happen before a link is handed to the adapter.
pub trait GattLink: Send {
    /// Writes `value` to `characteristic` with response and returns any bytes the peripheral
    /// sent back (notification or read-back), possibly empty.
    fn write(&mut self, characteristic: Uuid, value: &[u8]) -> Result<Vec<u8>, GattError>;

    /// Re-establishes the link after a disconnect.
    fn reconnect(&mut self) -> Result<(), GattError> {
        Ok(())
    }
}

/// Routes one payload field to one characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicBinding {
    pub field: String,
    pub characteristic: Uuid,
}

#[derive(Debug, Clone)]
pub struct BleTargetConfig {
    /// Writes happen in binding order.
    pub bindings: Vec<CharacteristicBinding>,
    pub max_write_len: usize,
    /// Leading status bytes in a reply that mean the peripheral rejected the write.
    pub error_codes: Vec<u8>,
    /// Payload field naming the state the lock should reach. An acknowledged write whose
    /// expected state is [`ERROR_STATE`] is an application error.
    pub expected_state_field: Option<String>,
}

/// Sends payloads as characteristic writes over a [`GattLink`].
pub struct BleAdapter<L: GattLink> {
    link: L,
    config: BleTargetConfig,
}

impl<L: GattLink> BleAdapter<L> {
    pub fn new(link: L, config: BleTargetConfig) -> Self {
        Self { link, config }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Builds the list of writes for `payload` and whether any value had to be re-encoded.
    fn plan(&self, payload: &Payload) -> (Vec<(String, Uuid, Vec<u8>)>, bool) {
        let mut degraded = false;
        let mut writes = Vec::new();
        for binding in &self.config.bindings {
            if let Some(value) = payload.get(&binding.field) {
                let (bytes, lossy) = encode_value(value, self.config.max_write_len);
                degraded |= lossy;
                writes.push((binding.field.clone(), binding.characteristic, bytes));
            }
        }

        if writes.is_empty() {
            if let Some(first) = self.config.bindings.first() {
                let (bytes, _) = fit(payload.to_wire().into_bytes(), self.config.max_write_len);
                writes.push((WHOLE_PAYLOAD_FIELD.to_string(), first.characteristic, bytes));
                degraded = true;
            }
        }
        (writes, degraded)
    }

    /// The expected-state field, if `payload` says the lock should refuse it.
    fn expects_rejection(&self, payload: &Payload) -> Option<&str> {
        let field = self.config.expected_state_field.as_deref()?;
        match payload.get(field)? {
            FieldValue::Text(state) if state.eq_ignore_ascii_case(ERROR_STATE) => Some(field),
            _ => None,
        }
    }
}

/// Blobs go out as is; anything else is written as its UTF-8 text and flagged.
fn encode_value(value: &FieldValue, max_len: usize) -> (Vec<u8>, bool) {
    let (bytes, reencoded) = match value {
        FieldValue::Blob(bytes) => (bytes.clone(), false),
        FieldValue::Text(s) | FieldValue::Number(s) | FieldValue::Raw(s) => {
            (s.as_bytes().to_vec(), true)
        }
        FieldValue::Structured(json) => (json.to_string().into_bytes(), true),
    };
    let (bytes, truncated) = fit(bytes, max_len);
    (bytes, reencoded || truncated)
}

fn fit(mut bytes: Vec<u8>, max_len: usize) -> (Vec<u8>, bool) {
    if bytes.len() > max_len {
        bytes.truncate(max_len);
        (bytes, true)
    } else {
        (bytes, false)
    }
}

impl<L: GattLink> TargetAdapter for BleAdapter<L> {
    fn name(&self) -> &'static str {
        "ble"
    }

    fn send(&mut self, kind: MutationKind, payload: Payload) -> Outcome {
        let (plan, encoding_degraded) = self.plan(&payload);
        if plan.is_empty() {
            return Outcome::new(
                kind,
                payload,
                Status::Exception,
                ResponseDescriptor::Unavailable {
                    reason: "no characteristic bindings configured".to_string(),
                },
            );
        }
        if encoding_degraded {
            log::warn!("{kind}: payload does not fit the characteristic encoding, sending best-effort bytes");
        }

        let started = Instant::now();
        let mut status = Status::Success;
        let mut detail = None;
        let mut returned = Vec::new();
        let mut writes = Vec::with_capacity(plan.len());

        for (field, characteristic, bytes) in plan {
            log::debug!("--> {characteristic} {field}: {}", hex::encode(&bytes));
            let result = match self.link.write(characteristic, &bytes) {
                Ok(reply) => {
                    log::debug!("<-- {}", hex::encode(&reply));
                    let rejected = reply
                        .first()
                        .copied()
                        .filter(|code| self.config.error_codes.contains(code));
                    let result = match rejected {
                        Some(code) => {
                            status = Status::ApplicationError;
                            let message = format!("peripheral status 0x{code:02x}");
                            detail = Some(message.clone());
                            message
                        }
                        None => "ack".to_string(),
                    };
                    returned = reply;
                    result
                }
                Err(err) => {
                    status = err.status();
                    detail = Some(err.to_string());
                    err.to_string()
                }
            };
            writes.push(WriteRecord {
                field,
                characteristic,
                written: bytes,
                result,
            });
            if status != Status::Success {
                break;
            }
        }

        if status == Status::Success {
            if let Some(field) = self.expects_rejection(&payload) {
                status = Status::ApplicationError;
                detail = Some(format!(
                    "lock accepted a write whose {field} is '{ERROR_STATE}'"
                ));
            }
        }

        let outcome = Outcome::new(
            kind,
            payload,
            status,
            ResponseDescriptor::Ble {
                writes,
                returned,
                encoding_degraded,
            },
        )
        .with_elapsed_ms(started.elapsed().as_millis() as u64);
        match detail {
            Some(detail) => outcome.with_detail(detail),
            None => outcome,
        }
    }

    fn recover(&mut self) -> Result<(), anyhow::Error> {
        log::warn!("Reconnecting BLE link after transport failure...");
        self.link
            .reconnect()
            .map_err(|e| anyhow::anyhow!("BLE reconnect failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const COMMAND_CHAR: Uuid = Uuid::from_u128(0x0000_fff1_0000_1000_8000_0080_5f9b_34fb);
    const PIN_CHAR: Uuid = Uuid::from_u128(0x0000_fff2_0000_1000_8000_0080_5f9b_34fb);

    #[derive(Default)]
    struct ScriptedLink {
        replies: VecDeque<Result<Vec<u8>, GattError>>,
        writes: Vec<(Uuid, Vec<u8>)>,
        reconnects: usize,
    }

    impl GattLink for ScriptedLink {
        fn write(&mut self, characteristic: Uuid, value: &[u8]) -> Result<Vec<u8>, GattError> {
            self.writes.push((characteristic, value.to_vec()));
            self.replies.pop_front().unwrap_or(Ok(Vec::new()))
        }

        fn reconnect(&mut self) -> Result<(), GattError> {
            self.reconnects += 1;
            Ok(())
        }
    }

    fn adapter(replies: Vec<Result<Vec<u8>, GattError>>) -> BleAdapter<ScriptedLink> {
        BleAdapter::new(
            ScriptedLink {
                replies: replies.into(),
                ..ScriptedLink::default()
            },
            BleTargetConfig {
                bindings: vec![
                    CharacteristicBinding {
                        field: "command".to_string(),
                        characteristic: COMMAND_CHAR,
                    },
                    CharacteristicBinding {
                        field: "pin".to_string(),
                        characteristic: PIN_CHAR,
                    },
                ],
                max_write_len: 8,
                error_codes: vec![0xee],
                expected_state_field: Some("to_state".to_string()),
            },
        )
    }

    fn lock_command(bytes: Vec<u8>) -> Payload {
        Payload::new()
            .with_field("from_state", FieldValue::text("any"))
            .with_field("to_state", FieldValue::text("Locked"))
            .with_field("command", FieldValue::Blob(bytes))
    }

    #[test]
    fn acknowledged_write_is_success() {
        let mut adapter = adapter(vec![Ok(vec![0x00, 0x01])]);
        let outcome = adapter.send(MutationKind::BitFlip, lock_command(vec![1, 2, 3]));

        assert_eq!(outcome.status, Status::Success);
        assert_eq!(adapter.link().writes, vec![(COMMAND_CHAR, vec![1, 2, 3])]);
        match outcome.response {
            ResponseDescriptor::Ble {
                writes,
                returned,
                encoding_degraded,
            } => {
                assert_eq!(writes.len(), 1);
                assert_eq!(writes[0].result, "ack");
                assert_eq!(returned, vec![0x00, 0x01]);
                assert!(!encoding_degraded);
            }
            other => panic!("Expected BLE descriptor, got {other:?}"),
        }
    }

    #[test]
    fn att_error_is_application_error() {
        let mut adapter = adapter(vec![Err(GattError::Att {
            code: ATT_INVALID_ATTRIBUTE_LENGTH,
            reason: "invalid attribute value length".to_string(),
        })]);
        let outcome = adapter.send(MutationKind::TruncateBytes, lock_command(vec![1]));
        assert_eq!(outcome.status, Status::ApplicationError);
        assert!(outcome.detail.unwrap().contains("0x0d"));
    }

    #[test]
    fn peripheral_status_byte_is_application_error() {
        let mut adapter = adapter(vec![Ok(vec![0xee, 0x01])]);
        let outcome = adapter.send(MutationKind::ByteBoundary, lock_command(vec![0xff]));
        assert_eq!(outcome.status, Status::ApplicationError);
    }

    #[test]
    fn accepted_write_expected_to_fail_is_application_error() {
        let mut adapter = adapter(vec![Ok(vec![0x00]), Ok(vec![0xee])]);
        let expects_error = lock_command(vec![1]).with_field("to_state", FieldValue::text("Error"));

        let accepted = adapter.send(MutationKind::BitFlip, expects_error.clone());
        assert_eq!(accepted.status, Status::ApplicationError);
        assert_eq!(
            accepted.detail.as_deref(),
            Some("lock accepted a write whose to_state is 'error'")
        );

        let refused = adapter.send(MutationKind::BitFlip, expects_error);
        assert_eq!(refused.status, Status::ApplicationError);
        assert_eq!(refused.detail.as_deref(), Some("peripheral status 0xee"));
    }

    #[test]
    fn expected_state_check_can_be_disabled() {
        let mut adapter = adapter(vec![Ok(vec![0x00])]);
        adapter.config.expected_state_field = None;
        let payload = lock_command(vec![1]).with_field("to_state", FieldValue::text("error"));
        let outcome = adapter.send(MutationKind::BitFlip, payload);
        assert_eq!(outcome.status, Status::Success);
    }

    #[test]
    fn link_failures_are_transport_errors_and_other_failures_exceptions() {
        let mut adapter = adapter(vec![
            Err(GattError::Disconnected("peer closed".to_string())),
            Err(GattError::Timeout),
            Err(GattError::Other("adapter powered off".to_string())),
        ]);
        let statuses: Vec<Status> = (0..3)
            .map(|_| adapter.send(MutationKind::BitFlip, lock_command(vec![1])).status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                Status::TransportError,
                Status::TransportError,
                Status::Exception
            ]
        );

        adapter.recover().unwrap();
        assert_eq!(adapter.link().reconnects, 1);
    }

    #[test]
    fn multiple_bindings_write_in_order_and_stop_on_failure() {
        let mut adapter = adapter(vec![Err(GattError::Att {
            code: ATT_INSUFFICIENT_AUTHENTICATION,
            reason: "insufficient authentication".to_string(),
        })]);
        let payload = lock_command(vec![9]).with_field("pin", FieldValue::Blob(vec![1, 2, 3, 4]));
        let outcome = adapter.send(MutationKind::BitFlip, payload);

        assert_eq!(outcome.status, Status::ApplicationError);
        assert_eq!(adapter.link().writes.len(), 1);
        assert_eq!(adapter.link().writes[0].0, COMMAND_CHAR);
    }

    #[test]
    fn non_blob_values_are_encoded_best_effort_and_flagged() {
        let mut adapter = adapter(vec![]);
        let payload = lock_command(vec![]).with_field(
            "command",
            FieldValue::Structured(serde_json::json!([0, "invalid", 2])),
        );
        let outcome = adapter.send(MutationKind::TypeSubstitution, payload);

        assert_eq!(outcome.status, Status::Success);
        assert_eq!(adapter.link().writes[0].1, b"[0,\"inva".to_vec());
        assert!(matches!(
            outcome.response,
            ResponseDescriptor::Ble {
                encoding_degraded: true,
                ..
            }
        ));
    }

    #[test]
    fn oversize_blob_is_truncated_and_flagged() {
        let mut adapter = adapter(vec![]);
        let outcome = adapter.send(MutationKind::OversizeValue, lock_command(vec![0x41; 100]));
        assert_eq!(adapter.link().writes[0].1.len(), 8);
        assert!(matches!(
            outcome.response,
            ResponseDescriptor::Ble {
                encoding_degraded: true,
                ..
            }
        ));
    }

    #[test]
    fn payload_without_bound_fields_is_written_whole() {
        let mut adapter = adapter(vec![]);
        let payload = Payload::new().with_field("a", FieldValue::number(1));
        let outcome = adapter.send(MutationKind::EmptyValue, payload);

        assert_eq!(outcome.status, Status::Success);
        assert_eq!(adapter.link().writes[0], (COMMAND_CHAR, b"{\"a\":1}".to_vec()));
    }

    #[test]
    fn missing_bindings_is_an_exception() {
        let mut adapter = BleAdapter::new(
            ScriptedLink::default(),
            BleTargetConfig {
                bindings: vec![],
                max_write_len: DEFAULT_MAX_WRITE_LEN,
                error_codes: vec![],
                expected_state_field: None,
            },
        );
        let outcome = adapter.send(MutationKind::BitFlip, lock_command(vec![1]));
        assert_eq!(outcome.status, Status::Exception);
        assert!(adapter.link().writes.is_empty());
    }
}
