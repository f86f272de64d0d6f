//! Client library for the Tuya Smart BLE protocol.
//!
//! Speaks the encrypted, framed request/response protocol used between a
//! controller and Tuya's BLE-connected smart-home endpoints: the
//! symmetric-key handshake and session-key derivation, MTU-fragmented
//! message framing, the datapoint data model with batched updates, and
//! auto-reply to device-originated time-sync requests. BLE transport and
//! credential persistence are supplied by the caller through the
//! [`transport::Transport`] and [`transport::CredentialsStore`] traits.

pub mod advertisement;
pub mod codec;
pub mod correlator;
pub mod crypto;
pub mod datapoint;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod fragment;
pub mod opcode;
pub mod session;
pub mod transport;
pub mod varint;

pub use datapoint::{DataPoint, DataPointCollection, DataPointType, DataPointValue};
pub use device::Device;
pub use error::{Error, FormatError, Result};
pub use session::SessionState;
pub use transport::{Credentials, CredentialsStore, JsonFileStore, Transport, TransportError};

/// Initializes a `tracing` subscriber for test output; safe to call from
/// every test, only the first call takes effect.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("tuya_ble=debug")
            .try_init();
    });
}
