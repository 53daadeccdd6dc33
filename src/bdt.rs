//! Buffer descriptors (BD) and the buffer descriptor table (BDT)
//!
//! Every endpoint direction owns two descriptors, EVEN and ODD. A
//! descriptor is either owned by software or by the controller. The
//! [`SoftwareOwned`] handle is the only way to change a descriptor, and
//! you can only acquire one while the controller isn't using the
//! descriptor. Arming consumes the handle, which hands the descriptor to
//! the controller.
//!
//! The table layout matches the controller's DMA access pattern,
//! `[endpoint][direction][slot]`, so that the `FSSTAT` register, shifted
//! right by two, indexes the descriptor of the token that just completed.

#![allow(non_snake_case, non_upper_case_globals)]

use core::sync::atomic::{self, Ordering};

use crate::{ral, vcell::VCell, ENDPOINT_COUNT};
use usb_device::UsbDirection;

/// One of the two descriptors of an endpoint direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Slot {
    Even = 0,
    Odd = 1,
}

impl Slot {
    /// Returns the other slot.
    pub const fn other(self) -> Self {
        match self {
            Slot::Even => Slot::Odd,
            Slot::Odd => Slot::Even,
        }
    }

    pub(crate) const fn from_bit(bit: u32) -> Self {
        if bit == 0 {
            Slot::Even
        } else {
            Slot::Odd
        }
    }
}

/// The DATA0 / DATA1 PID that accompanies a data packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DataToggle {
    Data0 = 0,
    Data1 = 1,
}

impl DataToggle {
    /// Returns the opposite toggle.
    pub const fn flip(self) -> Self {
        match self {
            DataToggle::Data0 => DataToggle::Data1,
            DataToggle::Data1 => DataToggle::Data0,
        }
    }
}

/// The token that completed a descriptor.
///
/// Written by the controller when it returns the descriptor to software.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenPid {
    Out,
    In,
    Setup,
    /// Not a token the device controller reports, or the descriptor was
    /// never used.
    Null,
}

impl TokenPid {
    const fn from_bits(pid: u32) -> Self {
        match pid {
            0x1 => TokenPid::Out,
            0x9 => TokenPid::In,
            0xD => TokenPid::Setup,
            _ => TokenPid::Null,
        }
    }
}

/// The largest byte count a descriptor can describe.
pub const MAX_BYTE_COUNT: usize = 0x3FF;

/// A buffer descriptor
///
/// The control word and the buffer address. The controller reads both when
/// a token targets the descriptor, and updates the control word when the
/// token completes.
#[repr(C)]
pub struct BufferDescriptor {
    HEAD: VCell<u32>,
    ADDR: VCell<u32>,
}

impl BufferDescriptor {
    /// A software-owned, zero-length descriptor
    pub const fn new() -> Self {
        BufferDescriptor {
            HEAD: VCell::new(0),
            ADDR: VCell::new(0),
        }
    }

    /// Indicates if the controller owns this descriptor
    pub fn is_busy(&self) -> bool {
        ral::read_reg!(crate::bdt, self, HEAD, OWN == 1)
    }

    /// Acquire the descriptor for software
    ///
    /// Returns `None` if the controller owns the descriptor.
    pub fn software(&self) -> Option<SoftwareOwned<'_>> {
        (!self.is_busy()).then_some(SoftwareOwned { bd: self })
    }

    /// Arm the descriptor, handing it to the controller
    ///
    /// Returns `false`, and changes nothing, if the controller already owns
    /// the descriptor. See [`SoftwareOwned::arm`] for the other parameters.
    pub fn arm(&self, toggle: DataToggle, buffer: *const u8, len: usize) -> bool {
        match self.software() {
            Some(bd) => {
                bd.arm(toggle, buffer, len);
                true
            }
            None => false,
        }
    }

    /// Force the descriptor back to software, zero length
    ///
    /// Only use this when tearing down an endpoint that the controller
    /// can no longer address, or when the bus is resetting.
    pub fn reclaim(&self) -> SoftwareOwned<'_> {
        self.HEAD.write(0);
        SoftwareOwned { bd: self }
    }

    /// Returns the buffer address last given to the controller
    pub fn address(&self) -> u32 {
        self.ADDR.read()
    }

    /// Returns the byte count, whatever the owner
    pub fn byte_count(&self) -> usize {
        ral::read_reg!(crate::bdt, self, HEAD, BC) as usize
    }

    /// Returns the data toggle, whatever the owner
    pub fn toggle(&self) -> DataToggle {
        if ral::read_reg!(crate::bdt, self, HEAD, DATA01 == 1) {
            DataToggle::Data1
        } else {
            DataToggle::Data0
        }
    }

    /// Indicates if the descriptor is marked to STALL
    pub fn is_stalled(&self) -> bool {
        ral::read_reg!(crate::bdt, self, HEAD, BDT_STALL == 1)
    }
}

#[cfg(test)]
impl BufferDescriptor {
    /// Hand the descriptor back to software, as the controller does after
    /// a token.
    pub(crate) fn complete(&self, pid: u32, bytes: usize) {
        let toggle = ral::read_reg!(crate::bdt, self, HEAD, DATA01);
        ral::write_reg!(crate::bdt, self, HEAD, TOK_PID: pid, BC: bytes as u32, DATA01: toggle);
    }
}

impl Default for BufferDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// A descriptor that the controller doesn't own
///
/// Obtained from [`BufferDescriptor::software`]. While you hold this,
/// you may inspect and change the descriptor.
pub struct SoftwareOwned<'a> {
    bd: &'a BufferDescriptor,
}

impl SoftwareOwned<'_> {
    /// The token that the controller completed with this descriptor
    pub fn token(&self) -> TokenPid {
        TokenPid::from_bits(ral::read_reg!(crate::bdt, self.bd, HEAD, TOK_PID))
    }

    /// The number of bytes in the descriptor
    ///
    /// After an OUT or SETUP token, this is the number of bytes the
    /// controller received.
    pub fn byte_count(&self) -> usize {
        self.bd.byte_count()
    }

    /// Zero the control word
    pub fn clear(&mut self) {
        self.bd.HEAD.write(0);
    }

    /// Mark (`true`) or unmark (`false`) the descriptor to STALL
    pub fn set_stalled(&mut self, stall: bool) {
        ral::modify_reg!(crate::bdt, self.bd, HEAD, BDT_STALL: stall as u32);
    }

    /// Describe `len` bytes at `buffer`, then hand the descriptor to the
    /// controller
    ///
    /// The control word is written without the ownership bit first, so the
    /// controller never observes a partially-configured descriptor.
    ///
    /// `buffer` must stay valid for `len` bytes until the controller returns
    /// the descriptor.
    pub fn arm(self, toggle: DataToggle, buffer: *const u8, len: usize) {
        debug_assert!(len <= MAX_BYTE_COUNT);
        self.bd.ADDR.write(buffer as usize as u32);
        ral::write_reg!(crate::bdt, self.bd, HEAD, BC: len as u32, DATA01: toggle as u32);
        atomic::fence(Ordering::SeqCst);
        ral::modify_reg!(crate::bdt, self.bd, HEAD, OWN: 1);
    }
}

#[allow(dead_code)]
mod HEAD {
    pub mod OWN {
        pub const offset: u32 = 7;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DATA01 {
        pub const offset: u32 = 6;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod KEEP {
        pub const offset: u32 = 5;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod NINC {
        pub const offset: u32 = 4;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DTS {
        pub const offset: u32 = 3;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod BDT_STALL {
        pub const offset: u32 = 2;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Overlaps KEEP through BDT_STALL once the controller hands the
    /// descriptor back.
    pub mod TOK_PID {
        pub const offset: u32 = 2;
        pub const mask: u32 = 0xF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod BC {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0x3FF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<BufferDescriptor>() == 8) as usize];

/// Converts a direction into the table's direction index.
///
/// The controller calls IN "transmit," which is index 1.
pub(crate) const fn direction_index(dir: UsbDirection) -> usize {
    match dir {
        UsbDirection::Out => 0,
        UsbDirection::In => 1,
    }
}

/// The buffer descriptor table
///
/// The controller requires a 512 byte alignment.
#[repr(C, align(512))]
pub struct Bdt([[[BufferDescriptor; 2]; 2]; ENDPOINT_COUNT]);

/// Required alignment of the BDT base address.
pub const BDT_ALIGNMENT: usize = 512;

impl Bdt {
    /// A table of software-owned, zero-length descriptors
    #[allow(clippy::declare_interior_mutable_const)] // Usage is legit here.
    pub const fn new() -> Self {
        const BD: BufferDescriptor = BufferDescriptor::new();
        const PAIR: [BufferDescriptor; 2] = [BD; 2];
        const ENDPOINT: [[BufferDescriptor; 2]; 2] = [PAIR; 2];
        Bdt([ENDPOINT; ENDPOINT_COUNT])
    }

    /// The base address to program into the controller
    pub fn as_ptr(&self) -> *const () {
        (self as *const Self).cast()
    }

    /// Returns both descriptors for the endpoint direction
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a valid endpoint number.
    pub fn pair(&self, index: usize, dir: UsbDirection) -> &[BufferDescriptor; 2] {
        &self.0[index][direction_index(dir)]
    }

    /// Returns one descriptor
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a valid endpoint number.
    pub fn descriptor(&self, index: usize, dir: UsbDirection, slot: Slot) -> &BufferDescriptor {
        &self.pair(index, dir)[slot as usize]
    }

    /// Force every descriptor back to software
    pub fn reclaim_all(&self) {
        self.0
            .iter()
            .flatten()
            .flatten()
            .for_each(|bd| {
                bd.reclaim();
            });
    }
}

impl Default for Bdt {
    fn default() -> Self {
        Self::new()
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Bdt>() == 512) as usize];
