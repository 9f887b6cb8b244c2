// src/device.rs
//
// CP210x USB driver: enumeration, UART bring-up, adapter initialization, and
// the bulk receive/transmit paths.
//
// The adapter is a CAN controller glued to a Silicon Labs CP210x USB-UART
// bridge. There is no kernel driver involvement here; the interface is
// claimed directly and configured through the CP210x vendor control requests,
// after which everything flows over the bulk pair as wire frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hex::ToHex;
use nusb::transfer::{Bulk, ControlOut, ControlType, In, Out, Recipient};
use nusb::Interface;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::codec::{decode_data_frame, encode_can_frame, encode_control_frame, ControlCommand};
use crate::error::IoError;
use crate::framer::{ChunkBuffer, StreamFramer};
use crate::CanFrame;

// ============================================================================
// USB Constants
// ============================================================================

/// Silicon Labs vendor ID.
pub const CP210X_VID: u16 = 0x10C4;
/// CP2102 product ID.
pub const CP210X_PID: u16 = 0xEA60;

/// CP210x vendor request: enable the UART interface.
const CP210X_IFC_ENABLE: u8 = 0x00;
/// CP210x vendor request: set the baud-rate divisor.
const CP210X_SET_BAUDDIV: u8 = 0x01;
/// CP210x vendor request: set modem handshake signals.
const CP210X_SET_MHS: u8 = 0x07;

/// Baud generator frequency the divisor is derived from.
const BAUD_RATE_GEN_FREQ: u32 = 0x38_4000;

/// SET_MHS value: assert DTR and RTS, with both write-enable bits set.
const MHS_DTR_RTS: u16 = 0x0001 | 0x0002 | 0x0100 | 0x0200;

/// The CP2102 exposes one bulk pair on endpoint 2.
const BULK_IN_EP: u8 = 0x82;
const BULK_OUT_EP: u8 = 0x02;

/// Bulk transfers are 64-byte max-packet on this device.
const READ_CHUNK_LEN: usize = 64;

/// Timeout for USB control transfers.
const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

// ============================================================================
// Device Enumeration
// ============================================================================

/// Information about a detected adapter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cp210xDeviceInfo {
    /// USB bus number (0 where the platform reports non-numeric bus IDs).
    pub bus: u8,
    /// USB device address.
    pub address: u8,
    /// Product name from the USB descriptor.
    pub product: String,
    /// Serial number, if the descriptor carries one.
    pub serial: Option<String>,
}

/// List all CP210x CAN adapters on the system.
pub async fn list_devices() -> Result<Vec<Cp210xDeviceInfo>, IoError> {
    let devices = nusb::list_devices()
        .await
        .map_err(|e| IoError::connection("usb", format!("failed to list USB devices: {}", e)))?
        .filter(|dev| dev.vendor_id() == CP210X_VID && dev.product_id() == CP210X_PID)
        .map(|dev| Cp210xDeviceInfo {
            bus: dev.bus_id().parse::<u8>().unwrap_or(0),
            address: dev.device_address(),
            product: dev.product_string().unwrap_or_default().to_string(),
            serial: dev.serial_number().map(|s| s.to_string()),
        })
        .collect();

    Ok(devices)
}

// ============================================================================
// Configuration
// ============================================================================

/// Adapter configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cp210xCanConfig {
    /// USB serial number to select among multiple attached adapters.
    /// None opens the first match.
    #[serde(default)]
    pub serial: Option<String>,
    /// Bit rate of the UART link between bridge and CAN controller.
    #[serde(default = "default_serial_rate")]
    pub serial_rate: u32,
    /// CAN bus bit rate in bits/second.
    #[serde(default = "default_can_bitrate")]
    pub can_bitrate: u32,
    /// Capacity of the received-frame channel handed out by [`Cp210xCan::start`].
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_serial_rate() -> u32 {
    115_200
}

fn default_can_bitrate() -> u32 {
    1_000_000
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for Cp210xCanConfig {
    fn default() -> Self {
        Self {
            serial: None,
            serial_rate: default_serial_rate(),
            can_bitrate: default_can_bitrate(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Compute the SET_BAUDDIV divisor for a serial rate.
fn baud_divisor(serial_rate: u32) -> Result<u16, IoError> {
    if serial_rate == 0 {
        return Err(IoError::configuration("serial rate must be nonzero"));
    }
    let divisor = BAUD_RATE_GEN_FREQ / serial_rate;
    if divisor == 0 || divisor > u16::MAX as u32 {
        return Err(IoError::configuration(format!(
            "serial rate {} is out of range for the baud generator",
            serial_rate
        )));
    }
    Ok(divisor as u16)
}

// ============================================================================
// Adapter Handle
// ============================================================================

/// One write queued for the bulk OUT endpoint.
struct WriteRequest {
    data: Vec<u8>,
    result_tx: oneshot::Sender<Result<(), IoError>>,
}

/// An open, initialized adapter.
///
/// Created by [`Cp210xCan::open`], which claims the interface, brings up the
/// CP210x UART, and runs the adapter initialization commands. Call
/// [`start`](Cp210xCan::start) to spawn the receive stream and obtain the
/// channel of decoded CAN frames; send with [`send_frame`](Cp210xCan::send_frame).
pub struct Cp210xCan {
    interface: Interface,
    label: String,
    config: Cp210xCanConfig,
    write_tx: mpsc::Sender<WriteRequest>,
    cancel_flag: Arc<AtomicBool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Cp210xCan {
    /// Find, open, and initialize an adapter.
    ///
    /// Runs the fixed bring-up sequence, each step awaited before the next:
    /// IFC_ENABLE, SET_MHS (DTR+RTS), SET_BAUDDIV, then the CAN reset,
    /// serial-rate, and CAN-bitrate control frames. Any failure is fatal; no
    /// retry is attempted.
    pub async fn open(config: Cp210xCanConfig) -> Result<Self, IoError> {
        let divisor = baud_divisor(config.serial_rate)?;

        let device_info = nusb::list_devices()
            .await
            .map_err(|e| IoError::connection("usb", format!("failed to list USB devices: {}", e)))?
            .find(|dev| {
                dev.vendor_id() == CP210X_VID
                    && dev.product_id() == CP210X_PID
                    && config
                        .serial
                        .as_deref()
                        .map_or(true, |wanted| dev.serial_number() == Some(wanted))
            })
            .ok_or(IoError::DeviceNotFound)?;

        let label = format!(
            "cp210x({}:{})",
            device_info.bus_id(),
            device_info.device_address()
        );

        let device = device_info
            .open()
            .await
            .map_err(|e| IoError::connection(label.as_str(), format!("failed to open device: {}", e)))?;

        let interface = device.claim_interface(0).await.map_err(|e| {
            IoError::connection(label.as_str(), format!("failed to claim interface: {}", e))
        })?;

        // UART bring-up via vendor control requests.
        control_out(&interface, &label, CP210X_IFC_ENABLE, 0x0001).await?;
        control_out(&interface, &label, CP210X_SET_MHS, MHS_DTR_RTS).await?;
        control_out(&interface, &label, CP210X_SET_BAUDDIV, divisor).await?;

        // The writer task owns the bulk OUT endpoint; queueing through it
        // keeps a single write in flight so frames never interleave.
        let bulk_out = interface
            .endpoint::<Bulk, Out>(BULK_OUT_EP)
            .map_err(|e| {
                IoError::connection(label.as_str(), format!("failed to open bulk OUT endpoint: {}", e))
            })?;
        let (write_tx, write_rx) = mpsc::channel::<WriteRequest>(32);
        tokio::spawn(run_write_queue(bulk_out, write_rx, label.clone()));

        let adapter = Self {
            interface,
            label,
            config: config.clone(),
            write_tx,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            task_handle: None,
        };

        adapter.send_command(ControlCommand::Reset).await?;
        adapter
            .send_command(ControlCommand::SetSerialRate(config.serial_rate))
            .await?;
        adapter
            .send_command(ControlCommand::SetCanBitrate(config.can_bitrate))
            .await?;

        info!(
            device = %adapter.label,
            serial_rate = config.serial_rate,
            can_bitrate = config.can_bitrate,
            "adapter initialized"
        );

        Ok(adapter)
    }

    /// Spawn the receive stream and return the channel of decoded CAN frames.
    ///
    /// Frames arrive in wire order, one channel send per completed frame. The
    /// stream ends when [`stop`](Cp210xCan::stop) is called, the receiver is
    /// dropped, or the transfer fails.
    pub fn start(&mut self) -> Result<mpsc::Receiver<CanFrame>, IoError> {
        if self.task_handle.is_some() {
            return Err(IoError::invalid_state("receive stream is already running"));
        }

        self.cancel_flag.store(false, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let handle = tokio::spawn(run_receive_stream(
            self.interface.clone(),
            self.label.clone(),
            self.cancel_flag.clone(),
            tx,
        ));
        self.task_handle = Some(handle);

        Ok(rx)
    }

    /// Stop the receive stream. A frame mid-accumulation is discarded.
    pub async fn stop(&mut self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }

    /// Transmit one CAN frame.
    ///
    /// The adapter always carries 8 data bytes; shorter frames must be padded
    /// by the caller. Completion of the underlying bulk write is awaited, so
    /// sequential callers get strictly serialized frames on the wire.
    pub async fn send_frame(&self, arbitration_id: u32, data: [u8; 8]) -> Result<(), IoError> {
        debug!(
            device = %self.label,
            arbitration_id = format_args!("{:08X}", arbitration_id),
            data = %data.encode_hex::<String>(),
            "transmitting CAN frame"
        );
        self.enqueue_write(encode_can_frame(arbitration_id, &data))
            .await
    }

    /// Send a vendor control command frame.
    pub async fn send_command(&self, command: ControlCommand) -> Result<(), IoError> {
        debug!(device = %self.label, ?command, "sending control command");
        self.enqueue_write(encode_control_frame(command)).await
    }

    async fn enqueue_write(&self, data: Vec<u8>) -> Result<(), IoError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.write_tx
            .send(WriteRequest { data, result_tx })
            .await
            .map_err(|_| IoError::connection(self.label.as_str(), "write queue closed"))?;
        result_rx
            .await
            .map_err(|_| IoError::connection(self.label.as_str(), "write abandoned"))?
    }
}

/// Issue one CP210x vendor control request (recipient: device, wIndex 0).
async fn control_out(
    interface: &Interface,
    label: &str,
    request: u8,
    value: u16,
) -> Result<(), IoError> {
    interface
        .control_out(
            ControlOut {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request,
                value,
                index: 0,
                data: &[],
            },
            CONTROL_TIMEOUT,
        )
        .await
        .map_err(|e| {
            IoError::protocol(
                label,
                format!("control request 0x{:02X} failed: {:?}", request, e),
            )
        })
}

// ============================================================================
// Write Queue
// ============================================================================

async fn run_write_queue(
    mut bulk_out: nusb::Endpoint<Bulk, Out>,
    mut write_rx: mpsc::Receiver<WriteRequest>,
    label: String,
) {
    while let Some(request) = write_rx.recv().await {
        trace!(device = %label, len = request.data.len(), "bulk write");

        let mut buffer = bulk_out.allocate(request.data.len());
        buffer.extend_from_slice(&request.data);
        bulk_out.submit(buffer);

        let result = match bulk_out.next_complete().await.status {
            Ok(()) => Ok(()),
            Err(e) => Err(IoError::connection(
                label.as_str(),
                format!("bulk write failed: {:?}", e),
            )),
        };

        // Caller may have given up waiting; that is not our problem.
        let _ = request.result_tx.send(result);
    }

    trace!(device = %label, "write queue closed");
}

// ============================================================================
// Receive Stream
// ============================================================================

async fn run_receive_stream(
    interface: Interface,
    label: String,
    cancel_flag: Arc<AtomicBool>,
    tx: mpsc::Sender<CanFrame>,
) {
    let mut bulk_in = match interface.endpoint::<Bulk, In>(BULK_IN_EP) {
        Ok(ep) => ep,
        Err(e) => {
            warn!(device = %label, "failed to open bulk IN endpoint: {}", e);
            return;
        }
    };

    // Pre-submit several reads so the device never stalls waiting for the
    // host to post a buffer.
    for _ in 0..4 {
        bulk_in.submit(bulk_in.allocate(READ_CHUNK_LEN));
    }

    let mut framer = StreamFramer::new();
    let mut chunks = ChunkBuffer::new();

    'stream: loop {
        if cancel_flag.load(Ordering::Relaxed) {
            trace!(device = %label, "receive stream stopped");
            break;
        }

        // Bounded wait so the cancel flag is polled even on a silent bus.
        let completion =
            match tokio::time::timeout(Duration::from_millis(100), bulk_in.next_complete()).await {
                Ok(completion) => completion,
                Err(_) => continue,
            };

        if let Err(e) = completion.status {
            warn!(device = %label, "bulk read failed: {:?}", e);
            break;
        }

        let chunk = &completion.buffer[..completion.actual_len];
        trace!(device = %label, len = chunk.len(), "bulk read");
        chunks.extend(chunk);

        let mut completed: Vec<CanFrame> = Vec::new();
        let consumed = framer.process(chunks.as_slice(), |raw| {
            if let Some(frame) = decode_data_frame(raw) {
                completed.push(frame);
            }
        });
        chunks.consume(consumed);

        for frame in completed {
            trace!(
                device = %label,
                arbitration_id = format_args!("{:08X}", frame.arbitration_id),
                data = %frame.data.encode_hex::<String>(),
                "received CAN frame"
            );
            if tx.send(frame).await.is_err() {
                trace!(device = %label, "frame receiver dropped");
                break 'stream;
            }
        }

        bulk_in.submit(bulk_in.allocate(READ_CHUNK_LEN));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_divisor_common_rates() {
        // 0x384000 = 3_686_400
        assert_eq!(baud_divisor(115_200).unwrap(), 32);
        assert_eq!(baud_divisor(57_600).unwrap(), 64);
        assert_eq!(baud_divisor(921_600).unwrap(), 4);
    }

    #[test]
    fn test_baud_divisor_rejects_zero() {
        assert!(baud_divisor(0).is_err());
    }

    #[test]
    fn test_baud_divisor_rejects_out_of_range() {
        // A rate so low the divisor no longer fits wValue.
        assert!(baud_divisor(56).is_err());
        // A rate above the generator frequency truncates to divisor 0.
        assert!(baud_divisor(4_000_000).is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = Cp210xCanConfig::default();
        assert_eq!(config.serial_rate, 115_200);
        assert_eq!(config.can_bitrate, 1_000_000);
        assert_eq!(config.channel_capacity, 256);
        assert!(config.serial.is_none());
    }

    #[test]
    fn test_mhs_value_matches_wire_protocol() {
        // DTR | RTS | WRITE_DTR | WRITE_RTS
        assert_eq!(MHS_DTR_RTS, 0x0303);
    }
}
