//! Static memory shared between the driver and the controller

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{bdt::Bdt, buffer::Ep0Buffer};

/// Memory that the controller accesses through DMA.
///
/// Each USB driver needs a `ControllerState`. Allocate a `static` object
/// and supply it to your USB constructor. Make sure that states are not
/// shared across USB instances; otherwise, the driver constructor panics.
///
/// The state holds the buffer descriptor table, which the controller
/// requires at a 512 byte boundary, and the control endpoint's receive
/// buffer.
///
/// ```
/// use mm32_usbd::ControllerState;
///
/// static STATE: ControllerState = ControllerState::new();
/// ```
pub struct ControllerState {
    bdt: Bdt,
    ep0_buffer: Ep0Buffer,
    taken: AtomicBool,
}

// Safety: the contents are only reachable after take(), which succeeds
// at most once.
unsafe impl Sync for ControllerState {}

impl ControllerState {
    /// Allocate the controller state.
    pub const fn new() -> Self {
        Self {
            bdt: Bdt::new(),
            ep0_buffer: Ep0Buffer::new(),
            taken: AtomicBool::new(false),
        }
    }

    /// Acquire the BDT and EP0 buffer.
    ///
    /// Returns `None` if the state was already taken.
    pub(crate) fn take(&self) -> Option<(&Bdt, &Ep0Buffer)> {
        let taken = self.taken.swap(true, Ordering::SeqCst);
        (!taken).then_some((&self.bdt, &self.ep0_buffer))
    }

    /// Look at the memory while a driver owns it, as the controller would.
    #[cfg(test)]
    pub(crate) fn shared(&self) -> (&Bdt, &Ep0Buffer) {
        (&self.bdt, &self.ep0_buffer)
    }
}

impl Default for ControllerState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::ControllerState;

    #[test]
    fn acquire_state() {
        let state = ControllerState::new();
        state.take().unwrap();
        for _ in 0..10 {
            assert!(state.take().is_none());
        }
    }

    #[test]
    fn bdt_alignment() {
        let state = ControllerState::new();
        let (bdt, _) = state.take().unwrap();
        assert_eq!(bdt.as_ptr() as usize % crate::bdt::BDT_ALIGNMENT, 0);
    }
}
