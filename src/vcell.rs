//! Volatile cell that conforms to the RAL's register API
//!
//! Used for both the memory-mapped controller registers and the
//! buffer descriptors, which live in RAM but are read and written
//! by the controller's DMA engine.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }
}

impl<T: Copy> VCell<T> {
    #[inline(always)]
    pub fn read(&self) -> T {
        // Safety: pointer from a live UnsafeCell. The value is Copy,
        // and a volatile load never creates a reference to the contents.
        unsafe { self.0.get().read_volatile() }
    }

    #[inline(always)]
    pub fn write(&self, val: T) {
        // Safety: see read().
        unsafe { self.0.get().write_volatile(val) }
    }
}
