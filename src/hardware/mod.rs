//! # Device drivers
//!
//! Drivers move values between hardware and the process image. They are
//! called by the engine during CAPTURE and WRITE, always under a timeout, and
//! report failures as values instead of unwinding into the control loop.

pub mod factory;
#[cfg(feature = "sim")]
pub mod simulated;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::channel::Value;

pub use factory::{DeviceFactory, HardwareMode};
#[cfg(feature = "sim")]
pub use simulated::{SimulatedEss, SimulatedEssConfig};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    #[error("Communication error: {0}")]
    Communication(String),
    #[error("Device reported a fault: {0}")]
    Device(String),
    #[error("Unsupported channel: {0}")]
    Unsupported(String),
}

/// A device behind one component id.
///
/// `read` returns fresh values for the driver's channels; channels missing
/// from the result keep their last value. `write` receives the setpoints the
/// engine committed this cycle.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    fn id(&self) -> &str;

    /// Channel ids this driver refreshes on every read.
    fn channels(&self) -> Vec<String>;

    async fn read(&self) -> Result<Vec<(String, Value)>, DriverError>;

    async fn write(&self, values: &[(String, Value)]) -> Result<(), DriverError>;
}

/// Result of one bounded driver call.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverOutcome<T> {
    Ok(T),
    TimedOut,
    DeviceError(String),
}

impl<T> DriverOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, DriverOutcome::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            DriverOutcome::Ok(value) => Some(value),
            _ => None,
        }
    }
}

/// Runs a driver call, turning timeouts and errors into a [`DriverOutcome`].
pub async fn call_with_timeout<T, F>(timeout: Duration, call: F) -> DriverOutcome<T>
where
    F: Future<Output = Result<T, DriverError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => DriverOutcome::Ok(value),
        Ok(Err(e)) => DriverOutcome::DeviceError(e.to_string()),
        Err(_) => DriverOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_with_timeout() {
        let ok = call_with_timeout(Duration::from_millis(50), async { Ok::<_, DriverError>(7) }).await;
        assert_eq!(ok, DriverOutcome::Ok(7));

        let err = call_with_timeout(Duration::from_millis(50), async {
            Err::<i32, _>(DriverError::Device("overtemp".into()))
        })
        .await;
        assert_eq!(err, DriverOutcome::DeviceError("Device reported a fault: overtemp".into()));

        let slow = call_with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, DriverError>(1)
        })
        .await;
        assert_eq!(slow, DriverOutcome::TimedOut);
        assert!(slow.ok().is_none());
    }
}
