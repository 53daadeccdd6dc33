//! The control endpoint's receive buffer

use core::cell::UnsafeCell;

use crate::EP0_MAX_PACKET_SIZE;

/// Driver-owned memory that receives every EP0 OUT packet
///
/// SETUP packets and control data stages both land here. The driver then
/// copies the bytes out to the 8-byte setup buffer, or to the caller's
/// pending buffer.
#[repr(align(4))]
pub struct Ep0Buffer(UnsafeCell<[u8; EP0_MAX_PACKET_SIZE]>);

// Safety: only the driver that took the owning `ControllerState` accesses
// the buffer, and the controller only writes it while an EP0 OUT
// descriptor is armed.
unsafe impl Sync for Ep0Buffer {}

impl Ep0Buffer {
    pub const fn new() -> Self {
        Ep0Buffer(UnsafeCell::new([0; EP0_MAX_PACKET_SIZE]))
    }

    /// The address given to the EP0 OUT descriptors
    pub fn as_ptr(&self) -> *mut u8 {
        self.0.get().cast()
    }

    /// Copy received bytes into `dst`
    ///
    /// Returns the number of bytes copied, the smaller of `dst.len()` and
    /// `received`. `received` is clamped to the buffer size.
    pub fn read(&self, dst: &mut [u8], received: usize) -> usize {
        let size = dst.len().min(received).min(EP0_MAX_PACKET_SIZE);
        dst.iter_mut()
            .take(size)
            .fold(self.as_ptr().cast_const(), |src, dst| unsafe {
                *dst = src.read_volatile();
                src.add(1)
            });
        size
    }

    /// Copy received bytes to the raw memory at `dst`
    ///
    /// Returns the number of bytes copied.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `len` byte writes.
    pub unsafe fn copy_to(&self, dst: *mut u8, len: usize, received: usize) -> usize {
        let size = len.min(received).min(EP0_MAX_PACKET_SIZE);
        core::ptr::copy_nonoverlapping(self.as_ptr().cast_const(), dst, size);
        size
    }
}
