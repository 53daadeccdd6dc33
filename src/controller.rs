//! Interrupt-safe driver wrapper

use core::{cell::RefCell, ptr::NonNull};

use crate::{
    driver::{BusSignal, Config, Driver},
    event::Event,
    state::ControllerState,
};
use cortex_m::interrupt::{self, Mutex};
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbError,
};

/// A USB device controller
///
/// The `Controller` wraps a [`Driver`] in a critical section. Every call,
/// including [`on_interrupt`](Controller::on_interrupt), runs with
/// interrupts disabled, so you can share a `Controller` between your main
/// loop and the USB interrupt handler.
///
/// # Requirements
///
/// The driver assumes that you've enabled the USB clock, and that the clock
/// runs at 48MHz. Use the same EP0 max packet size in your [`Config`] and in
/// your device descriptor.
///
/// # Example
///
/// Share the controller with the interrupt handler through a `static`.
///
/// ```no_run
/// use mm32_usbd::{Config, Controller, ControllerState, Peripherals};
///
/// struct Usb;
/// unsafe impl Peripherals for Usb {
///     fn usb(&self) -> *const () {
///         0x4001_0000 as *const ()
///     }
/// }
///
/// static STATE: ControllerState = ControllerState::new();
///
/// let controller = Controller::new(Usb, &STATE, Config::new());
/// controller.set_interrupts(true);
/// // Unmask the USB interrupt, then call controller.on_interrupt()
/// // from the handler...
/// ```
pub struct Controller {
    driver: Mutex<RefCell<Driver>>,
}

impl Controller {
    /// Create and initialize the controller
    ///
    /// # Panics
    ///
    /// Panics if `state` is already in use by another controller.
    pub fn new<P: crate::Peripherals>(
        peripherals: P,
        state: &'static ControllerState,
        config: Config,
    ) -> Self {
        let mut driver = Driver::new(peripherals, state, config);
        driver.initialize();
        Controller {
            driver: Mutex::new(RefCell::new(driver)),
        }
    }

    /// Interrupt-safe, immutable access to the driver
    fn with_driver<R>(&self, func: impl FnOnce(&Driver) -> R) -> R {
        interrupt::free(|cs| {
            let driver = self.driver.borrow(cs);
            let driver = driver.borrow();
            func(&driver)
        })
    }

    /// Interrupt-safe, mutable access to the driver
    fn with_driver_mut<R>(&self, func: impl FnOnce(&mut Driver) -> R) -> R {
        interrupt::free(|cs| {
            let driver = self.driver.borrow(cs);
            let mut driver = driver.borrow_mut();
            func(&mut driver)
        })
    }

    /// Enable (`true`) or disable (`false`) USB interrupts
    pub fn set_interrupts(&self, interrupts: bool) {
        self.with_driver_mut(|driver| driver.set_interrupts(interrupts));
    }

    /// Enable (`true`) or disable (`false`) start of frame events
    pub fn set_sof_enabled(&self, enable: bool) {
        self.with_driver_mut(|driver| driver.set_sof_enabled(enable));
    }

    /// Service the USB interrupt
    ///
    /// Call this from your USB interrupt handler.
    pub fn on_interrupt(&self) {
        self.with_driver_mut(Driver::on_interrupt);
    }

    /// Take the oldest event
    pub fn poll(&self) -> Option<Event> {
        self.with_driver_mut(Driver::poll)
    }

    /// See [`Driver::open_endpoint`].
    pub fn open_endpoint(
        &self,
        addr: EndpointAddress,
        kind: EndpointType,
        max_packet_size: usize,
    ) -> Result<(), UsbError> {
        self.with_driver_mut(|driver| driver.open_endpoint(addr, kind, max_packet_size))
    }

    /// See [`Driver::close_endpoint`].
    pub fn close_endpoint(&self, addr: EndpointAddress) -> Result<(), UsbError> {
        self.with_driver_mut(|driver| driver.close_endpoint(addr))
    }

    /// Close every endpoint except the control endpoint
    pub fn close_all(&self) {
        self.with_driver_mut(Driver::close_all);
    }

    /// Submit a transfer
    ///
    /// # Safety
    ///
    /// See [`Driver::submit`].
    pub unsafe fn submit(
        &self,
        addr: EndpointAddress,
        buffer: NonNull<u8>,
        len: usize,
    ) -> Result<(), UsbError> {
        self.with_driver_mut(|driver| driver.submit(addr, buffer, len))
    }

    pub fn stall(&self, addr: EndpointAddress) -> Result<(), UsbError> {
        self.with_driver_mut(|driver| driver.stall(addr))
    }

    pub fn clear_stall(&self, addr: EndpointAddress) -> Result<(), UsbError> {
        self.with_driver_mut(|driver| driver.clear_stall(addr))
    }

    pub fn is_stalled(&self, addr: EndpointAddress) -> bool {
        self.with_driver(|driver| driver.is_stalled(addr))
    }

    /// See [`Driver::set_address`].
    pub fn set_address(&self, address: u8) -> Result<(), UsbError> {
        self.with_driver_mut(|driver| driver.set_address(address))
    }

    pub fn enable_zlt(&self, addr: EndpointAddress) {
        self.with_driver_mut(|driver| driver.enable_zlt(addr));
    }

    pub fn frame_number(&self) -> u16 {
        self.with_driver(Driver::frame_number)
    }

    pub fn bus_signal(&self) -> BusSignal {
        self.with_driver(Driver::bus_signal)
    }

    pub fn dropped_events(&self) -> usize {
        self.with_driver(Driver::dropped_events)
    }

    /// Signal remote wakeup to the host
    ///
    /// Drives the resume signal for 10ms. This busy-waits, with interrupts
    /// enabled, for the whole signal.
    pub fn remote_wakeup(&self) {
        let cycles = self.with_driver_mut(|driver| {
            driver.set_resume_signal(true);
            driver.config().remote_wakeup_cycles()
        });
        cortex_m::asm::delay(cycles);
        self.with_driver_mut(|driver| driver.set_resume_signal(false));
        debug!("REMOTE WAKEUP");
    }
}
