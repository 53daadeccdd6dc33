//! Per-endpoint transfer state
//!
//! An `Endpoint` tracks one direction of one endpoint number. It decides
//! which descriptors to arm when a transfer starts, and what to do when
//! the controller completes one of them. The driver owns the register
//! side of things; this module only touches the endpoint's descriptor
//! pair.

use core::ptr::NonNull;

use crate::bdt::{BufferDescriptor, DataToggle, Slot, MAX_BYTE_COUNT};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection, UsbError,
};

/// A USB endpoint direction
pub struct Endpoint {
    address: EndpointAddress,
    kind: Option<EndpointType>,
    max_packet_size: usize,
    /// Caller's transfer buffer. Borrowed until the transfer completes.
    buffer: NonNull<u8>,
    length: usize,
    remaining: usize,
    /// The slot, and toggle, of the next packet the controller completes.
    next_slot: Slot,
    next_toggle: DataToggle,
    active: bool,
    zlt: bool,
    zlp_pending: bool,
    /// EP0 OUT only: bytes received before anyone asked for them.
    unclaimed: Option<usize>,
}

impl Endpoint {
    pub const fn new(address: EndpointAddress) -> Self {
        Endpoint {
            address,
            kind: None,
            max_packet_size: 0,
            buffer: NonNull::dangling(),
            length: 0,
            remaining: 0,
            next_slot: Slot::Even,
            next_toggle: DataToggle::Data0,
            active: false,
            zlt: false,
            zlp_pending: false,
            unclaimed: None,
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    pub fn is_open(&self) -> bool {
        self.kind.is_some()
    }

    /// Indicates if a submitted transfer hasn't completed
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Bytes requested by the active transfer
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn next_slot(&self) -> Slot {
        self.next_slot
    }

    #[cfg(test)]
    pub fn next_toggle(&self) -> DataToggle {
        self.next_toggle
    }

    /// Open the endpoint for transfers of `kind`
    ///
    /// The caller checks that the packet size fits in a descriptor.
    pub fn open(&mut self, kind: EndpointType, max_packet_size: usize) {
        debug_assert!(max_packet_size > 0 && max_packet_size <= MAX_BYTE_COUNT);
        self.discard();
        self.kind = Some(kind);
        self.max_packet_size = max_packet_size;
    }

    /// Close the endpoint, discarding any transfer
    ///
    /// The next slot is preserved. Only a bus reset moves the controller's
    /// own ping-pong pointer back to EVEN.
    pub fn close(&mut self) {
        self.discard();
        self.kind = None;
        self.max_packet_size = 0;
        self.zlt = false;
    }

    /// Return to the state right after a bus reset
    pub fn reset(&mut self) {
        self.close();
        self.next_slot = Slot::Even;
        self.next_toggle = DataToggle::Data0;
    }

    fn discard(&mut self) {
        self.buffer = NonNull::dangling();
        self.length = 0;
        self.remaining = 0;
        self.active = false;
        self.zlp_pending = false;
        self.unclaimed = None;
    }

    /// Terminate IN transfers that are a multiple of the packet size with
    /// a zero-length packet
    pub fn enable_zlt(&mut self) {
        self.zlt = true;
    }

    /// Record that the controller completed `slot` with `toggle`
    pub fn advance(&mut self, slot: Slot, toggle: DataToggle) {
        self.next_slot = slot.other();
        self.next_toggle = toggle.flip();
    }

    /// Set the toggle for the next packet
    pub fn set_next_toggle(&mut self, toggle: DataToggle) {
        self.next_toggle = toggle;
    }

    /// Reclaim both descriptors, and start the next transfer with DATA0
    pub fn clear_stall(&mut self, pair: &[BufferDescriptor; 2]) {
        pair.iter().for_each(|bd| {
            bd.reclaim();
        });
        self.discard();
        self.next_toggle = DataToggle::Data0;
    }

    /// Start a transfer of `len` bytes at `buffer`
    ///
    /// Arms the next slot. If the transfer needs more than one packet, the
    /// other slot is armed first with the second packet, so the controller
    /// can move from one packet to the next without waiting on software.
    ///
    /// Returns `WouldBlock` if a slot that the transfer needs is still owned
    /// by the controller. Nothing changes in that case.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for `len` bytes until the transfer completes,
    /// or until the endpoint is closed or reset.
    pub unsafe fn submit(
        &mut self,
        pair: &[BufferDescriptor; 2],
        buffer: NonNull<u8>,
        len: usize,
    ) -> Result<(), UsbError> {
        if !self.is_open() {
            return Err(UsbError::InvalidEndpoint);
        }

        let max = self.max_packet_size;
        let first = pair[self.next_slot as usize]
            .software()
            .ok_or(UsbError::WouldBlock)?;

        let second = if len > max {
            let second = pair[self.next_slot.other() as usize]
                .software()
                .ok_or(UsbError::WouldBlock)?;
            Some(second)
        } else {
            None
        };

        self.buffer = buffer;
        self.length = len;
        self.remaining = len;
        self.zlp_pending = false;
        self.active = true;

        let ptr = buffer.as_ptr().cast_const();
        if let Some(second) = second {
            second.arm(self.next_toggle.flip(), ptr.add(max), (len - max).min(max));
            first.arm(self.next_toggle, ptr, max);
        } else {
            first.arm(self.next_toggle, ptr, len);
        }

        Ok(())
    }

    /// Handle the completion of a descriptor in `slot`
    ///
    /// The descriptor must already be back in software's hands. Returns the
    /// number of bytes moved once the transfer completes, or `None` while
    /// the transfer continues.
    pub fn on_token(
        &mut self,
        pair: &[BufferDescriptor; 2],
        slot: Slot,
        toggle: DataToggle,
        size: usize,
    ) -> Option<usize> {
        self.advance(slot, toggle);

        if !self.active {
            warn!("EP{} token without a transfer", self.address.index() as u8);
            return None;
        }

        if self.zlp_pending {
            return Some(self.finish(0));
        }

        let max = self.max_packet_size;
        let remaining = self.remaining.saturating_sub(size);
        if remaining > 0 && size == max {
            self.remaining = remaining;
            if remaining > max {
                // The other slot holds the next packet. This slot takes the
                // one after it.
                let offset = self.length - remaining + max;
                let len = (remaining - max).min(max);
                // Safety: offset < length, and the caller guaranteed the
                // buffer is valid for length bytes.
                let ptr = unsafe { self.buffer.as_ptr().cast_const().add(offset) };
                if !pair[slot as usize].arm(toggle, ptr, len) {
                    warn!("EP{} completed slot still busy", self.address.index() as u8);
                }
            }
            return None;
        }

        if self.zlt
            && self.address.direction() == UsbDirection::In
            && remaining == 0
            && self.length > 0
            && self.length % max == 0
        {
            self.remaining = 0;
            self.zlp_pending = true;
            if pair[self.next_slot as usize].arm(self.next_toggle, self.buffer.as_ptr(), 0) {
                return None;
            }
            warn!("EP{} cannot arm ZLP", self.address.index() as u8);
        }

        // A short packet can end an OUT transfer while the other slot still
        // waits for a packet that won't come.
        if remaining > 0 && pair[self.next_slot as usize].is_busy() {
            pair[self.next_slot as usize].reclaim();
        }

        Some(self.finish(remaining))
    }

    fn finish(&mut self, remaining: usize) -> usize {
        let bytes = self.length - remaining;
        self.discard();
        bytes
    }

    /// EP0 OUT: register a destination for the next data packet
    pub fn set_pending(&mut self, buffer: NonNull<u8>, len: usize) {
        self.buffer = buffer;
        self.length = len;
        self.remaining = len;
        self.active = true;
    }

    /// EP0 OUT: the registered destination, if any
    pub fn pending(&self) -> Option<(NonNull<u8>, usize)> {
        self.active.then_some((self.buffer, self.length))
    }

    /// EP0 OUT: forget the registered destination
    pub fn clear_pending(&mut self) {
        self.discard();
    }

    /// EP0 OUT: remember that `size` bytes wait in the shared buffer
    pub fn latch_unclaimed(&mut self, size: usize) {
        self.unclaimed = Some(size);
    }

    /// EP0 OUT: take the size of the waiting data
    pub fn take_unclaimed(&mut self) -> Option<usize> {
        self.unclaimed.take()
    }
}

#[cfg(test)]
mod tests {
    use super::Endpoint;
    use crate::bdt::{BufferDescriptor, DataToggle, Slot};
    use core::ptr::NonNull;
    use usb_device::{
        endpoint::{EndpointAddress, EndpointType},
        UsbDirection, UsbError,
    };

    fn ep1_in() -> EndpointAddress {
        EndpointAddress::from_parts(1, UsbDirection::In)
    }

    fn ep2_out() -> EndpointAddress {
        EndpointAddress::from_parts(2, UsbDirection::Out)
    }

    fn pair() -> [BufferDescriptor; 2] {
        [BufferDescriptor::new(), BufferDescriptor::new()]
    }

    /// Pretend the controller finished the descriptor.
    fn complete(bd: &BufferDescriptor, bytes: usize) -> (DataToggle, usize) {
        assert!(bd.is_busy());
        let toggle = bd.toggle();
        let mut owned = bd.reclaim();
        owned.clear();
        (toggle, bytes)
    }

    fn opened(address: EndpointAddress) -> Endpoint {
        let mut ep = Endpoint::new(address);
        ep.open(EndpointType::Bulk, 64);
        ep
    }

    #[test]
    fn submit_closed() {
        let mut ep = Endpoint::new(ep1_in());
        let bds = pair();
        let mut buffer = [0u8; 8];
        let result = unsafe { ep.submit(&bds, NonNull::from(&mut buffer).cast(), 8) };
        assert_eq!(result, Err(UsbError::InvalidEndpoint));
        assert!(!bds[0].is_busy());
    }

    #[test]
    fn single_packet() {
        let mut ep = opened(ep1_in());
        let bds = pair();
        let mut buffer = [0u8; 10];
        unsafe { ep.submit(&bds, NonNull::from(&mut buffer).cast(), 10) }.unwrap();

        assert!(bds[0].is_busy());
        assert!(!bds[1].is_busy());
        assert_eq!(bds[0].byte_count(), 10);
        assert_eq!(bds[0].toggle(), DataToggle::Data0);

        let (toggle, size) = complete(&bds[0], 10);
        assert_eq!(ep.on_token(&bds, Slot::Even, toggle, size), Some(10));
        assert!(!ep.is_active());
        assert_eq!(ep.next_slot(), Slot::Odd);
        assert_eq!(ep.next_toggle(), DataToggle::Data1);
    }

    #[test]
    fn multi_packet_alternates_toggles() {
        let mut ep = opened(ep1_in());
        let bds = pair();
        let mut buffer = [0u8; 150];
        let base = buffer.as_ptr() as usize as u32;
        unsafe { ep.submit(&bds, NonNull::from(&mut buffer).cast(), 150) }.unwrap();

        assert_eq!(bds[0].byte_count(), 64);
        assert_eq!(bds[0].toggle(), DataToggle::Data0);
        assert_eq!(bds[0].address(), base);
        assert_eq!(bds[1].byte_count(), 64);
        assert_eq!(bds[1].toggle(), DataToggle::Data1);
        assert_eq!(bds[1].address(), base + 64);

        let (toggle, size) = complete(&bds[0], 64);
        assert_eq!(ep.on_token(&bds, Slot::Even, toggle, size), None);
        assert_eq!(bds[0].byte_count(), 22);
        assert_eq!(bds[0].toggle(), DataToggle::Data0);
        assert_eq!(bds[0].address(), base + 128);

        let (toggle, size) = complete(&bds[1], 64);
        assert_eq!(ep.on_token(&bds, Slot::Odd, toggle, size), None);
        assert!(!bds[1].is_busy());

        let (toggle, size) = complete(&bds[0], 22);
        assert_eq!(ep.on_token(&bds, Slot::Even, toggle, size), Some(150));
        assert_eq!(ep.next_toggle(), DataToggle::Data1);
        assert_eq!(ep.next_slot(), Slot::Odd);
    }

    #[test]
    fn busy_slot_blocks() {
        let mut ep = opened(ep1_in());
        let bds = pair();
        let mut buffer = [0u8; 100];
        assert!(bds[1].arm(DataToggle::Data1, core::ptr::null(), 3));

        let result = unsafe { ep.submit(&bds, NonNull::from(&mut buffer).cast(), 100) };
        assert_eq!(result, Err(UsbError::WouldBlock));
        assert!(!bds[0].is_busy());
        assert_eq!(bds[1].byte_count(), 3);
        assert!(!ep.is_active());
    }

    #[test]
    fn zero_length_termination() {
        let mut ep = opened(ep1_in());
        ep.enable_zlt();
        let bds = pair();
        let mut buffer = [0u8; 64];
        unsafe { ep.submit(&bds, NonNull::from(&mut buffer).cast(), 64) }.unwrap();

        let (toggle, size) = complete(&bds[0], 64);
        assert_eq!(ep.on_token(&bds, Slot::Even, toggle, size), None);
        assert!(bds[1].is_busy());
        assert_eq!(bds[1].byte_count(), 0);
        assert_eq!(bds[1].toggle(), DataToggle::Data1);

        let (toggle, size) = complete(&bds[1], 0);
        assert_eq!(ep.on_token(&bds, Slot::Odd, toggle, size), Some(64));
    }

    #[test]
    fn no_zlt_for_short_transfers() {
        let mut ep = opened(ep1_in());
        ep.enable_zlt();
        let bds = pair();
        let mut buffer = [0u8; 65];
        unsafe { ep.submit(&bds, NonNull::from(&mut buffer).cast(), 65) }.unwrap();
        let (toggle, size) = complete(&bds[0], 64);
        assert_eq!(ep.on_token(&bds, Slot::Even, toggle, size), None);
        let (toggle, size) = complete(&bds[1], 1);
        assert_eq!(ep.on_token(&bds, Slot::Odd, toggle, size), Some(65));
        assert!(!bds[0].is_busy());
    }

    #[test]
    fn short_out_packet_releases_other_slot() {
        let mut ep = opened(ep2_out());
        let bds = pair();
        let mut buffer = [0u8; 128];
        unsafe { ep.submit(&bds, NonNull::from(&mut buffer).cast(), 128) }.unwrap();

        let (toggle, _) = complete(&bds[0], 0);
        assert_eq!(ep.on_token(&bds, Slot::Even, toggle, 5), Some(5));
        assert!(!bds[1].is_busy());

        // The next transfer starts in the released slot.
        unsafe { ep.submit(&bds, NonNull::from(&mut buffer).cast(), 8) }.unwrap();
        assert!(bds[1].is_busy());
        assert_eq!(bds[1].toggle(), DataToggle::Data1);
    }

    #[test]
    fn clear_stall_resets_toggle() {
        let mut ep = opened(ep1_in());
        let bds = pair();
        let mut buffer = [0u8; 8];
        unsafe { ep.submit(&bds, NonNull::from(&mut buffer).cast(), 8) }.unwrap();
        let (toggle, size) = complete(&bds[0], 8);
        ep.on_token(&bds, Slot::Even, toggle, size);
        assert_eq!(ep.next_toggle(), DataToggle::Data1);

        ep.clear_stall(&bds);
        assert_eq!(ep.next_toggle(), DataToggle::Data0);
        assert_eq!(ep.next_slot(), Slot::Odd);
    }

    #[test]
    fn close_keeps_slot_reset_does_not() {
        let mut ep = opened(ep1_in());
        let bds = pair();
        let mut buffer = [0u8; 8];
        unsafe { ep.submit(&bds, NonNull::from(&mut buffer).cast(), 8) }.unwrap();
        let (toggle, size) = complete(&bds[0], 8);
        ep.on_token(&bds, Slot::Even, toggle, size);

        ep.close();
        assert!(!ep.is_open());
        assert_eq!(ep.next_slot(), Slot::Odd);

        ep.reset();
        assert_eq!(ep.next_slot(), Slot::Even);
        assert_eq!(ep.next_toggle(), DataToggle::Data0);
    }

    #[test]
    fn unclaimed_latch() {
        let mut ep = Endpoint::new(EndpointAddress::from_parts(0, UsbDirection::Out));
        assert_eq!(ep.take_unclaimed(), None);
        ep.latch_unclaimed(12);
        assert_eq!(ep.take_unclaimed(), Some(12));
        assert_eq!(ep.take_unclaimed(), None);
    }
}
