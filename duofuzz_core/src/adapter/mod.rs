//! Target adapters: the transport-specific half of a send.
//!
//! The run controller only ever sees [`TargetAdapter`]; HTTP and BLE plug in behind it.

pub mod ble;
pub mod bridge;
pub mod http;

use crate::input::Payload;
use crate::mutator::MutationKind;
use crate::outcome::Outcome;

pub use ble::{BleAdapter, BleTargetConfig, CharacteristicBinding, GattError, GattLink};
pub use bridge::BridgeLink;
pub use http::{HttpAdapter, HttpTargetConfig};

/// Delivers one mutated payload to a target and classifies what happened.
///
/// `send` never fails: every transport or target error is folded into the returned
/// [`Outcome`]'s status tag. Implementations issue exactly one exchange per call and never
/// retry.
pub trait TargetAdapter: Send {
    /// Short label used in logs and reports (`"http"`, `"ble"`).
    fn name(&self) -> &'static str;

    fn send(&mut self, kind: MutationKind, payload: Payload) -> Outcome;

    /// Called by the run controller after a transport error.
    ///
    /// Adapters with a stateful link re-establish it here. The default does nothing.
    fn recover(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

impl<T: TargetAdapter + ?Sized> TargetAdapter for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn send(&mut self, kind: MutationKind, payload: Payload) -> Outcome {
        (**self).send(kind, payload)
    }

    fn recover(&mut self) -> Result<(), anyhow::Error> {
        (**self).recover()
    }
}
