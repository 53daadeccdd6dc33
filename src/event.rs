//! Events produced by the interrupt handler

use usb_device::endpoint::EndpointAddress;

/// How a transfer ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransferResult {
    Success,
}

/// Something the USB stack must handle.
///
/// The interrupt handler queues events; drain them with `poll()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The host reset the bus. EP0 is ready for the next SETUP.
    Reset,
    /// The bus has been idle long enough to suspend.
    Suspend,
    /// The host resumed the bus.
    Resume,
    /// Eight bytes of a SETUP packet, as received.
    Setup([u8; 8]),
    /// A submitted transfer finished.
    TransferComplete {
        address: EndpointAddress,
        /// Bytes moved across the whole transfer.
        bytes: usize,
        result: TransferResult,
    },
    /// Start of frame, with the 11-bit frame number.
    StartOfFrame(u16),
}

/// How many events the driver buffers between polls.
pub const EVENT_QUEUE_CAPACITY: usize = 64;
