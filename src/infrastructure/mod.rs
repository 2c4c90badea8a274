//! Infrastructure layer: Bluetooth links and logging.

pub mod bluetooth;
pub mod logging;
