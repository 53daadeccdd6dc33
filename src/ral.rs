//! Register access layer for the full-speed USB controller
//!
//! The register block and field definitions follow the `ral-registers`
//! conventions, so you can use `read_reg!`, `write_reg!` and `modify_reg!`
//! on the controller. Registers are `VCell`s, which lets the tests build
//! a register block in plain memory.

#![allow(dead_code, non_snake_case, non_upper_case_globals, clippy::upper_case_acronyms)]

pub use ral_registers::{modify_reg, read_reg, write_reg};

use crate::vcell::VCell;

/// Full-speed USB controller registers.
pub mod usb {
    use super::VCell;
    use crate::ENDPOINT_COUNT;

    /// USB controller register block.
    ///
    /// Every register is 32 bits wide, though only the low byte is
    /// implemented on most of them.
    #[repr(C)]
    pub struct RegisterBlock {
        pub PERID: VCell<u32>,
        pub IDCOMP: VCell<u32>,
        pub REV: VCell<u32>,
        pub ADDINFO: VCell<u32>,
        pub OTGISTAT: VCell<u32>,
        pub OTGICR: VCell<u32>,
        pub OTGSTAT: VCell<u32>,
        pub OTGCTL: VCell<u32>,
        _reserved0: [u32; 24],
        pub FSINTSTAT: VCell<u32>,
        pub FSINTENB: VCell<u32>,
        pub FSERRSTAT: VCell<u32>,
        pub FSERRENB: VCell<u32>,
        pub FSSTAT: VCell<u32>,
        pub FSCTL: VCell<u32>,
        pub FSADDR: VCell<u32>,
        pub FSBDTPAGE1: VCell<u32>,
        pub FSFRMNUML: VCell<u32>,
        pub FSFRMNUMH: VCell<u32>,
        pub FSTOKEN: VCell<u32>,
        pub FSSOFTHLD: VCell<u32>,
        pub FSBDTPAGE2: VCell<u32>,
        pub FSBDTPAGE3: VCell<u32>,
        _reserved1: [u32; 2],
        pub FSEPCTL: [VCell<u32>; ENDPOINT_COUNT],
    }

    impl RegisterBlock {
        /// A register block with every register reset to zero.
        ///
        /// Real hardware never needs this; it exists so that tests can
        /// place a register block in memory.
        #[cfg(test)]
        pub const fn new() -> Self {
            #[allow(clippy::declare_interior_mutable_const)]
            const R: VCell<u32> = VCell::new(0);
            RegisterBlock {
                PERID: R,
                IDCOMP: R,
                REV: R,
                ADDINFO: R,
                OTGISTAT: R,
                OTGICR: R,
                OTGSTAT: R,
                OTGCTL: R,
                _reserved0: [0; 24],
                FSINTSTAT: R,
                FSINTENB: R,
                FSERRSTAT: R,
                FSERRENB: R,
                FSSTAT: R,
                FSCTL: R,
                FSADDR: R,
                FSBDTPAGE1: R,
                FSFRMNUML: R,
                FSFRMNUMH: R,
                FSTOKEN: R,
                FSSOFTHLD: R,
                FSBDTPAGE2: R,
                FSBDTPAGE3: R,
                _reserved1: [0; 2],
                FSEPCTL: [R; ENDPOINT_COUNT],
            }
        }
    }

    const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x100) as usize];

    macro_rules! field {
        ($name:ident, $offset:expr, $width:expr) => {
            pub mod $name {
                pub const offset: u32 = $offset;
                pub const mask: u32 = ((1 << $width) - 1) << offset;
                pub mod RW {}
                pub mod R {}
                pub mod W {}
            }
        };
    }

    /// Interrupt status, write 1 to clear
    pub mod FSINTSTAT {
        field!(USBRST, 0, 1);
        field!(ERROR, 1, 1);
        field!(SOFTOK, 2, 1);
        field!(TOKDNE, 3, 1);
        field!(SLEEP, 4, 1);
        field!(RESUME, 5, 1);
        field!(ATTACH, 6, 1);
        field!(STALL, 7, 1);
    }

    /// Interrupt enable, same layout as the status register
    pub mod FSINTENB {
        pub use super::FSINTSTAT::*;
    }

    /// Error interrupt status, write 1 to clear
    pub mod FSERRSTAT {
        field!(PIDERR, 0, 1);
        field!(CRC5EOF, 1, 1);
        field!(CRC16, 2, 1);
        field!(DFN8, 3, 1);
        field!(BTOERR, 4, 1);
        field!(DMAERR, 5, 1);
        field!(BTSERR, 7, 1);
    }

    pub mod FSERRENB {
        pub use super::FSERRSTAT::*;
    }

    /// Status of the most recent token, valid while TOKDNE is pending
    pub mod FSSTAT {
        field!(ODD, 2, 1);
        field!(TX, 3, 1);
        field!(ENDP, 4, 4);
    }

    pub mod FSCTL {
        field!(USBEN, 0, 1);
        field!(ODDRST, 1, 1);
        field!(RESUME, 2, 1);
        field!(HOSTMODEEN, 3, 1);
        field!(RESET, 4, 1);
        field!(TXDSUSPENDTOKENBUSY, 5, 1);
        field!(SE0, 6, 1);
        field!(JSTATE, 7, 1);
    }

    pub mod FSADDR {
        field!(ADDR, 0, 7);
        field!(LSEN, 7, 1);
    }

    /// BDT base address bits 15:9
    pub mod FSBDTPAGE1 {
        field!(BDTBA, 1, 7);
    }

    /// BDT base address bits 23:16
    pub mod FSBDTPAGE2 {
        field!(BDTBA, 0, 8);
    }

    /// BDT base address bits 31:24
    pub mod FSBDTPAGE3 {
        field!(BDTBA, 0, 8);
    }

    pub mod FSFRMNUML {
        field!(FRM, 0, 8);
    }

    pub mod FSFRMNUMH {
        field!(FRM, 0, 3);
    }

    pub mod FSEPCTL {
        field!(EPHSHK, 0, 1);
        field!(EPSTALL, 1, 1);
        field!(EPTXEN, 2, 1);
        field!(EPRXEN, 3, 1);
        field!(EPCTLDIS, 4, 1);
    }
}

/// The RAL API requires a named register for every access. The endpoint
/// control registers form an array, so this module gives one of them a name.
pub mod endpoint_control {
    use super::{usb, VCell};

    #[allow(non_snake_case)]
    pub struct EpCtl<'a> {
        pub FSEPCTL: &'a VCell<u32>,
    }

    #[allow(non_snake_case)]
    pub mod FSEPCTL {
        pub use super::usb::FSEPCTL::*;
    }

    /// Returns the control register for endpoint `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a valid endpoint number.
    pub fn register(usb: &usb::RegisterBlock, index: usize) -> EpCtl<'_> {
        EpCtl {
            FSEPCTL: &usb.FSEPCTL[index],
        }
    }
}

/// An owned handle to the controller registers.
pub struct Instance {
    ptr: *const usb::RegisterBlock,
}

// Safety: the register block is only accessed through the single driver
// that owns this instance.
unsafe impl Send for Instance {}

impl core::ops::Deref for Instance {
    type Target = usb::RegisterBlock;
    fn deref(&self) -> &Self::Target {
        // Safety: Peripherals implementation guarantees a valid pointer.
        unsafe { &*self.ptr }
    }
}

/// Take the register block from the user's peripherals.
pub fn instance<P: crate::Peripherals>(peripherals: P) -> Instance {
    Instance {
        ptr: peripherals.usb().cast(),
    }
}

#[cfg(test)]
mod tests {
    use super::{endpoint_control, usb};

    #[test]
    fn bdt_page_fields() {
        let regs = usb::RegisterBlock::new();
        let addr: u32 = 0x2000_1200;
        super::write_reg!(usb, &regs, FSBDTPAGE1, BDTBA: addr >> 9);
        super::write_reg!(usb, &regs, FSBDTPAGE2, BDTBA: addr >> 16);
        super::write_reg!(usb, &regs, FSBDTPAGE3, BDTBA: addr >> 24);
        assert_eq!(regs.FSBDTPAGE1.read(), 0x12);
        assert_eq!(regs.FSBDTPAGE2.read(), 0x00);
        assert_eq!(regs.FSBDTPAGE3.read(), 0x20);
    }

    #[test]
    fn stat_fields() {
        let regs = usb::RegisterBlock::new();
        regs.FSSTAT.write(0b1011_1100);
        assert_eq!(super::read_reg!(usb, &regs, FSSTAT, ENDP), 0b1011);
        assert_eq!(super::read_reg!(usb, &regs, FSSTAT, TX), 1);
        assert_eq!(super::read_reg!(usb, &regs, FSSTAT, ODD), 1);
    }

    #[test]
    fn endpoint_control_register() {
        let regs = usb::RegisterBlock::new();
        let epctl = endpoint_control::register(&regs, 3);
        super::modify_reg!(endpoint_control, &epctl, FSEPCTL, EPSTALL: 1, EPTXEN: 1);
        assert_eq!(regs.FSEPCTL[3].read(), 0b0110);
        assert_eq!(regs.FSEPCTL[2].read(), 0);
        assert!(super::read_reg!(endpoint_control, &epctl, FSEPCTL, EPSTALL == 1));
    }
}
