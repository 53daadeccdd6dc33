//! A USB full-speed device driver for MindMotion MM32 microcontrollers
//!
//! `mm32-usbd` drives the full-speed OTG controller found on MM32F0160-class
//! parts in device mode. It translates "move N bytes on endpoint E" requests
//! into buffer descriptor table (BDT) operations, and translates the
//! controller's token-done interrupts back into [`Event`]s for a USB protocol
//! stack to consume.
//!
//! To interface the library, you must define a safe implementation of [`Peripherals`].
//! See the peripherals documentation for more information.
//!
//! # Usage
//!
//! 1. Allocate a `static` [`ControllerState`]. It holds the hardware-aligned
//!    BDT and the control endpoint's receive buffer.
//! 2. Create a [`Controller`] from your `Peripherals`, the state, and a [`Config`].
//! 3. Enable interrupts with [`Controller::set_interrupts`], and unmask the USB
//!    interrupt in the NVIC.
//! 4. Call [`Controller::on_interrupt`] from the USB interrupt handler.
//! 5. Drain events with [`Controller::poll`] from your main loop, and feed them
//!    to your protocol stack.
//!
//! ```no_run
//! use mm32_usbd::{Config, Controller, ControllerState, Event, Peripherals};
//!
//! struct Usb;
//! unsafe impl Peripherals for Usb {
//!     fn usb(&self) -> *const () {
//!         0x4001_0000 as *const ()
//!     }
//! }
//!
//! static STATE: ControllerState = ControllerState::new();
//!
//! let controller = Controller::new(Usb, &STATE, Config::new());
//! controller.set_interrupts(true);
//!
//! loop {
//!     while let Some(event) = controller.poll() {
//!         match event {
//!             Event::Setup(_setup) => { /* hand to the protocol stack */ }
//!             _ => {}
//!         }
//!     }
//! }
//! ```
//!
//! # Design
//!
//! The controller fetches packets through a BDT: two descriptors (EVEN and
//! ODD) per endpoint, per direction. Software arms a descriptor by handing its
//! ownership to the controller, and the controller hands it back when the
//! token completes. The driver never touches a descriptor owned by the
//! controller. See the [`bdt`] module for the descriptor ownership API.
//!
//! Transfers longer than one packet keep both descriptors busy, so the
//! controller can move the next packet while the driver re-arms the
//! previous descriptor. Each transfer produces exactly one
//! [`Event::TransferComplete`].

#![no_std]

#[macro_use]
mod log;

pub mod bdt;
mod buffer;
mod controller;
mod driver;
mod endpoint;
mod event;
mod ral;
mod state;
mod vcell;

#[cfg(test)]
mod sim;

pub use controller::Controller;
pub use driver::{BusSignal, Config, Driver};
pub use event::{Event, TransferResult};
pub use state::ControllerState;

/// Sixteen endpoint numbers. Each has an IN and an OUT direction.
pub const ENDPOINT_COUNT: usize = 16;

/// The largest control endpoint packet for a full-speed device.
pub const EP0_MAX_PACKET_SIZE: usize = 64;

/// A type that owns the USB controller register block
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that
/// owns the USB controller registers. The pointer returned by
/// the method is assumed to be valid, and will be cast to a
/// register definition.
///
/// # Example
///
/// A safe implementation of `Peripherals` that works with a
/// PAC-style singleton. Assume that `pac` is shorthand for your
/// device crate.
///
/// ```
/// # mod pac {
/// #   pub struct USB { _p: () }
/// #   impl USB { pub const PTR: *const () = 0x4001_0000 as *const (); }
/// #   pub fn take() -> Option<USB> { Some(USB { _p: () }) }
/// # }
/// use mm32_usbd::Peripherals;
///
/// struct Instances {
///     _usb: pac::USB,
/// }
///
/// unsafe impl Peripherals for Instances {
///     fn usb(&self) -> *const () {
///         pac::USB::PTR
///     }
/// }
///
/// let instances = Instances { _usb: pac::take().unwrap() };
/// assert_eq!(instances.usb(), 0x4001_0000 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the USB controller registers
    fn usb(&self) -> *const ();
}
