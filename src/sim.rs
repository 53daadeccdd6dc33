//! A simulated controller for host tests
//!
//! `Sim` plays the controller's part. It holds the register block and the
//! driver's static state, finishes armed descriptors, and raises interrupt
//! status before calling the driver's interrupt handler. Declare one
//! `static` per test.

use crate::{
    bdt::{Bdt, BufferDescriptor, Slot},
    buffer::Ep0Buffer,
    driver::{Config, Driver},
    ral::usb::{self, RegisterBlock},
    state::ControllerState,
    Peripherals,
};
use usb_device::UsbDirection;

pub const PID_OUT: u32 = 0x1;
pub const PID_IN: u32 = 0x9;
pub const PID_SETUP: u32 = 0xD;

pub struct Sim {
    regs: RegisterBlock,
    state: ControllerState,
}

// Safety: tests use a Sim from one thread.
unsafe impl Sync for Sim {}

struct SimUsb(&'static RegisterBlock);

unsafe impl Peripherals for SimUsb {
    fn usb(&self) -> *const () {
        (self.0 as *const RegisterBlock).cast()
    }
}

impl Sim {
    pub const fn new() -> Self {
        Sim {
            regs: RegisterBlock::new(),
            state: ControllerState::new(),
        }
    }

    pub fn regs(&self) -> &RegisterBlock {
        &self.regs
    }

    pub fn bdt(&self) -> &Bdt {
        self.state.shared().0
    }

    pub fn ep0_buffer(&self) -> &Ep0Buffer {
        self.state.shared().1
    }

    pub fn descriptor(&self, index: usize, dir: UsbDirection, slot: Slot) -> &BufferDescriptor {
        self.bdt().descriptor(index, dir, slot)
    }

    /// An initialized driver, with interrupts enabled.
    pub fn driver(&'static self, config: Config) -> Driver {
        let mut driver = Driver::new(SimUsb(&self.regs), &self.state, config);
        driver.initialize();
        driver.set_interrupts(true);
        driver
    }

    /// Raise one interrupt status bit, and run the handler.
    pub fn interrupt(&self, driver: &mut Driver, status: u32) {
        self.regs.FSINTSTAT.write(status);
        driver.on_interrupt();
    }

    pub fn bus_reset(&self, driver: &mut Driver) {
        self.interrupt(driver, usb::FSINTSTAT::USBRST::mask);
    }

    /// Finish the armed descriptor with a token that moved `bytes`.
    ///
    /// # Panics
    ///
    /// Panics if the driver didn't arm the descriptor.
    pub fn complete(
        &self,
        driver: &mut Driver,
        index: usize,
        dir: UsbDirection,
        slot: Slot,
        pid: u32,
        bytes: usize,
    ) {
        let bd = self.descriptor(index, dir, slot);
        assert!(bd.is_busy(), "EP{index} {dir:?} {slot:?} isn't armed");
        bd.complete(pid, bytes);

        let tx = (dir == UsbDirection::In) as u32;
        self.regs
            .FSSTAT
            .write((index as u32) << 4 | tx << 3 | (slot as u32) << 2);
        self.interrupt(driver, usb::FSINTSTAT::TOKDNE::mask);
    }

    /// Receive a SETUP packet on EP0.
    pub fn setup(&self, driver: &mut Driver, slot: Slot, packet: [u8; 8]) {
        self.receive(packet.as_slice());
        self.complete(driver, 0, UsbDirection::Out, slot, PID_SETUP, packet.len());
    }

    /// Receive a data packet on EP0 OUT.
    pub fn ep0_out(&self, driver: &mut Driver, slot: Slot, data: &[u8]) {
        self.receive(data);
        self.complete(driver, 0, UsbDirection::Out, slot, PID_OUT, data.len());
    }

    /// Send the packet armed on EP0 IN.
    pub fn ep0_in(&self, driver: &mut Driver, slot: Slot) {
        let bytes = self.descriptor(0, UsbDirection::In, slot).byte_count();
        self.complete(driver, 0, UsbDirection::In, slot, PID_IN, bytes);
    }

    fn receive(&self, data: &[u8]) {
        let dst = self.ep0_buffer().as_ptr();
        for (i, byte) in data.iter().enumerate() {
            unsafe { dst.add(i).write_volatile(*byte) };
        }
    }

    /// Every descriptor the driver handed to the controller, as
    /// (endpoint, direction, slot).
    pub fn armed(&self) -> impl Iterator<Item = (usize, UsbDirection, Slot)> + '_ {
        let dirs = [UsbDirection::Out, UsbDirection::In];
        (0..crate::ENDPOINT_COUNT)
            .flat_map(move |index| dirs.into_iter().map(move |dir| (index, dir)))
            .flat_map(|(index, dir)| [Slot::Even, Slot::Odd].map(|slot| (index, dir, slot)))
            .filter(|&(index, dir, slot)| self.descriptor(index, dir, slot).is_busy())
    }
}
