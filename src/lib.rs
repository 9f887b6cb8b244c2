//! Host-side driver for CP210x-bridged USB-CAN adapters.
//!
//! These adapters pair a CAN controller with a Silicon Labs CP210x USB-UART
//! bridge and speak a small delimited frame protocol over the serial link:
//! every message is a 16-byte logical payload, escaped and wrapped in
//! `AA AA ... <checksum> 55 55`. This crate provides the wire codec, a
//! streaming frame reassembler for the bulk read path, and an async device
//! handle that performs the USB bring-up and initialization sequence.
//!
//! ```no_run
//! use cp210x_can::{Cp210xCan, Cp210xCanConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cp210x_can::IoError> {
//!     let mut adapter = Cp210xCan::open(Cp210xCanConfig::default()).await?;
//!     let mut frames = adapter.start()?;
//!
//!     adapter.send_frame(0x123, [1, 2, 3, 4, 5, 6, 7, 8]).await?;
//!
//!     while let Some(frame) = frames.recv().await {
//!         println!("{:08X}: {:02X?}", frame.arbitration_id, frame.data);
//!     }
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod checksum;
pub mod codec;
pub mod device;
pub mod error;
pub mod framer;

pub use codec::ControlCommand;
pub use device::{list_devices, Cp210xCan, Cp210xCanConfig, Cp210xDeviceInfo};
pub use error::IoError;
pub use framer::{ChunkBuffer, StreamFramer};

/// A received or transmitted CAN frame.
///
/// The adapter hardware always carries 8 data bytes on the wire; frames with a
/// shorter DLC arrive zero-padded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// Arbitration ID (11-bit standard or 29-bit extended).
    pub arbitration_id: u32,
    /// Payload bytes.
    pub data: [u8; 8],
    /// Host receive timestamp in microseconds since the Unix epoch.
    pub timestamp_us: u64,
}

/// Current time in microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
