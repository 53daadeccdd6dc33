//! USB driver
//!
//! `Driver` owns the controller registers, the buffer descriptor table, and
//! the state of every endpoint. It exposes the operations a USB device
//! stack needs, and services the controller's interrupts. It has no
//! interior synchronization; see [`Controller`](crate::Controller) for a
//! wrapper that you can share with an interrupt handler.

use core::ptr::NonNull;

use crate::{
    bdt::{self, Bdt, DataToggle, Slot, TokenPid},
    buffer::Ep0Buffer,
    endpoint::Endpoint,
    event::{Event, TransferResult, EVENT_QUEUE_CAPACITY},
    ral,
    state::ControllerState,
    ENDPOINT_COUNT, EP0_MAX_PACKET_SIZE,
};
use heapless::Deque;
use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection, UsbError,
};

/// Direct index to the OUT control endpoint
fn ctrl_ep0_out() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

/// Direct index to the IN control endpoint
fn ctrl_ep0_in() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::In)
}

/// A SETUP packet is always eight bytes.
const SETUP_LEN: usize = 8;

/// Driver configuration
///
/// ```
/// use mm32_usbd::Config;
///
/// const CONFIG: Config = Config::new()
///     .with_ep0_max_packet_size(64)
///     .with_core_clock_hz(72_000_000);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    ep0_max_packet_size: u8,
    core_clock_hz: u32,
    zero_length_termination: bool,
}

impl Config {
    /// 64 byte control packets, a 96MHz core, and no zero-length
    /// termination.
    pub const fn new() -> Self {
        Config {
            ep0_max_packet_size: EP0_MAX_PACKET_SIZE as u8,
            core_clock_hz: 96_000_000,
            zero_length_termination: false,
        }
    }

    /// Set the control endpoint's max packet size
    ///
    /// Use the same value as your device descriptor.
    ///
    /// # Panics
    ///
    /// Panics if `size` isn't one of 8, 16, 32, or 64.
    pub const fn with_ep0_max_packet_size(self, size: u8) -> Self {
        assert!(
            matches!(size, 8 | 16 | 32 | 64),
            "EP0 max packet size must be 8, 16, 32, or 64"
        );
        Config {
            ep0_max_packet_size: size,
            ..self
        }
    }

    /// Set the core clock frequency
    ///
    /// Only used to time the remote wakeup signal.
    pub const fn with_core_clock_hz(self, core_clock_hz: u32) -> Self {
        Config {
            core_clock_hz,
            ..self
        }
    }

    /// Enable zero-length termination for every endpoint that you open
    ///
    /// See [`Driver::enable_zlt`] for what that means.
    pub const fn with_zero_length_termination(self, zlt: bool) -> Self {
        Config {
            zero_length_termination: zlt,
            ..self
        }
    }

    pub const fn ep0_max_packet_size(&self) -> usize {
        self.ep0_max_packet_size as usize
    }

    pub const fn core_clock_hz(&self) -> u32 {
        self.core_clock_hz
    }

    pub const fn zero_length_termination(&self) -> bool {
        self.zero_length_termination
    }

    /// Core clock cycles in the 10ms remote wakeup signal
    pub const fn remote_wakeup_cycles(&self) -> u32 {
        self.core_clock_hz / 100
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// The state of the bus lines
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusSignal {
    /// Both lines low.
    Se0,
    /// The idle state of a full-speed bus.
    J,
    Other,
}

bitflags::bitflags! {
    /// Controller interrupt sources, as found in the status and enable
    /// registers
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interrupts: u32 {
        const RESET = ral::usb::FSINTSTAT::USBRST::mask;
        const ERROR = ral::usb::FSINTSTAT::ERROR::mask;
        const START_OF_FRAME = ral::usb::FSINTSTAT::SOFTOK::mask;
        const TOKEN_DONE = ral::usb::FSINTSTAT::TOKDNE::mask;
        const SLEEP = ral::usb::FSINTSTAT::SLEEP::mask;
        const RESUME = ral::usb::FSINTSTAT::RESUME::mask;
        const ATTACH = ral::usb::FSINTSTAT::ATTACH::mask;
        const STALL = ral::usb::FSINTSTAT::STALL::mask;
    }
}

impl Interrupts {
    /// The sources enabled by `set_interrupts`.
    const DEVICE: Self = Self::RESET
        .union(Self::TOKEN_DONE)
        .union(Self::SLEEP)
        .union(Self::RESUME)
        .union(Self::STALL)
        .union(Self::ERROR);
}

/// Returns `Some(index)` if the address names an endpoint this controller has.
fn endpoint_index(addr: EndpointAddress) -> Option<usize> {
    let index = addr.index();
    (index < ENDPOINT_COUNT).then_some(index)
}

/// A USB driver
///
/// After you allocate a `Driver` with [`new()`](Driver::new), you must
/// call [`initialize()`](Driver::initialize) once.
pub struct Driver {
    usb: ral::Instance,
    bdt: &'static Bdt,
    ep0_buffer: &'static Ep0Buffer,
    setup: [u8; SETUP_LEN],
    /// Indexed by endpoint number, then OUT (0) or IN (1).
    endpoints: [[Endpoint; 2]; ENDPOINT_COUNT],
    /// Applied once the status stage's IN ZLP completes. Zero means none.
    pending_address: u8,
    events: Deque<Event, EVENT_QUEUE_CAPACITY>,
    dropped_events: usize,
    config: Config,
    sof_enabled: bool,
}

// Safety: the driver is the only user of the static state it took, and
// the register instance is unique.
unsafe impl Send for Driver {}

impl Driver {
    /// Create a new `Driver`
    ///
    /// Creation does nothing except for assign static memory to the driver.
    /// After creating the driver, call [`initialize()`](Driver::initialize).
    ///
    /// # Panics
    ///
    /// Panics if the state has already been assigned to another USB driver.
    pub fn new<P: crate::Peripherals>(
        peripherals: P,
        state: &'static ControllerState,
        config: Config,
    ) -> Self {
        let usb = ral::instance(peripherals);
        let (bdt, ep0_buffer) = state.take().expect("Controller state already assigned");
        Driver {
            usb,
            bdt,
            ep0_buffer,
            setup: [0; SETUP_LEN],
            endpoints: core::array::from_fn(|index| {
                [
                    Endpoint::new(EndpointAddress::from_parts(index, UsbDirection::Out)),
                    Endpoint::new(EndpointAddress::from_parts(index, UsbDirection::In)),
                ]
            }),
            pending_address: 0,
            events: Deque::new(),
            dropped_events: 0,
            config,
            sof_enabled: false,
        }
    }

    /// Program the BDT address, and enable the controller
    ///
    /// Interrupts stay disabled. The device starts to work after the host
    /// resets the bus.
    ///
    /// # Panics
    ///
    /// Panics if the BDT isn't aligned to 512 bytes.
    pub fn initialize(&mut self) {
        let bdt_addr = self.bdt.as_ptr() as usize;
        assert!(
            bdt_addr % bdt::BDT_ALIGNMENT == 0,
            "BDT must be aligned to 512 bytes"
        );
        let bdt_addr = bdt_addr as u32;

        ral::write_reg!(ral::usb, self.usb, FSINTENB, 0);
        ral::write_reg!(ral::usb, self.usb, FSERRENB, 0);
        ral::write_reg!(ral::usb, self.usb, FSINTSTAT, u32::from(u8::MAX));
        ral::write_reg!(ral::usb, self.usb, FSERRSTAT, u32::from(u8::MAX));

        ral::write_reg!(ral::usb, self.usb, FSBDTPAGE1, BDTBA: bdt_addr >> 9);
        ral::write_reg!(ral::usb, self.usb, FSBDTPAGE2, BDTBA: bdt_addr >> 16);
        ral::write_reg!(ral::usb, self.usb, FSBDTPAGE3, BDTBA: bdt_addr >> 24);

        self.bdt.reclaim_all();
        self.endpoints.iter_mut().flatten().for_each(Endpoint::reset);

        ral::write_reg!(ral::usb, self.usb, FSADDR, 0);
        ral::modify_reg!(ral::usb, self.usb, FSCTL, HOSTMODEEN: 0, USBEN: 1);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Enable (`true`) or disable (`false`) USB interrupts
    ///
    /// This covers reset, token done, sleep, resume, stall, and error
    /// interrupts. Start of frame has its own switch,
    /// [`set_sof_enabled`](Driver::set_sof_enabled).
    pub fn set_interrupts(&mut self, interrupts: bool) {
        let device = Interrupts::DEVICE.bits();
        if interrupts {
            ral::write_reg!(ral::usb, self.usb, FSERRENB, u32::from(u8::MAX));
            ral::modify_reg!(ral::usb, self.usb, FSINTENB, |enb| enb | device);
        } else {
            ral::modify_reg!(ral::usb, self.usb, FSINTENB, |enb| enb & !device);
            ral::write_reg!(ral::usb, self.usb, FSERRENB, 0);
        }
    }

    /// Enable (`true`) or disable (`false`) start of frame events
    pub fn set_sof_enabled(&mut self, enable: bool) {
        self.sof_enabled = enable;
        ral::modify_reg!(ral::usb, self.usb, FSINTENB, SOFTOK: enable as u32);
    }

    /// Enable zero-length termination (ZLT) for the given endpoint
    ///
    /// When ZLT is enabled, an IN transfer whose length is a non-zero multiple
    /// of the max packet size ends with a zero-length packet. By default, ZLT
    /// is off, and the USB stack is expected to submit these packets itself.
    ///
    /// This call does nothing if the endpoint isn't open.
    pub fn enable_zlt(&mut self, addr: EndpointAddress) {
        if let Some(ep) = self.endpoint_mut(addr).filter(|ep| ep.is_open()) {
            ep.enable_zlt();
        }
    }

    fn endpoint_mut(&mut self, addr: EndpointAddress) -> Option<&mut Endpoint> {
        let index = endpoint_index(addr)?;
        Some(&mut self.endpoints[index][bdt::direction_index(addr.direction())])
    }

    fn endpoint(&self, addr: EndpointAddress) -> Option<&Endpoint> {
        let index = endpoint_index(addr)?;
        Some(&self.endpoints[index][bdt::direction_index(addr.direction())])
    }

    /// Indicates if the endpoint is open
    pub fn is_open(&self, addr: EndpointAddress) -> bool {
        self.endpoint(addr).map_or(false, Endpoint::is_open)
    }

    /// Open an endpoint
    ///
    /// Returns `InvalidEndpoint`, and changes nothing, if the endpoint
    /// number is out of range, or if the packet size doesn't fit in a
    /// descriptor.
    pub fn open_endpoint(
        &mut self,
        addr: EndpointAddress,
        kind: EndpointType,
        max_packet_size: usize,
    ) -> Result<(), UsbError> {
        let index = endpoint_index(addr).ok_or(UsbError::InvalidEndpoint)?;
        if max_packet_size == 0 || max_packet_size > bdt::MAX_BYTE_COUNT {
            return Err(UsbError::InvalidEndpoint);
        }

        let zlt = self.config.zero_length_termination;
        let ep = &mut self.endpoints[index][bdt::direction_index(addr.direction())];
        ep.open(kind, max_packet_size);
        if zlt {
            ep.enable_zlt();
        }

        let (handshake, control_disabled): (u32, u32) = match kind {
            EndpointType::Control => (1, 0),
            EndpointType::Bulk | EndpointType::Interrupt => (1, 1),
            EndpointType::Isochronous { .. } => (0, 1),
        };
        let epctl = ral::endpoint_control::register(&self.usb, index);
        match addr.direction() {
            UsbDirection::In => ral::modify_reg!(
                ral::endpoint_control,
                &epctl,
                FSEPCTL,
                EPHSHK: handshake,
                EPCTLDIS: control_disabled,
                EPTXEN: 1
            ),
            UsbDirection::Out => ral::modify_reg!(
                ral::endpoint_control,
                &epctl,
                FSEPCTL,
                EPHSHK: handshake,
                EPCTLDIS: control_disabled,
                EPRXEN: 1
            ),
        }

        debug!(
            "OPEN EP{} IN={} MPS={}",
            index as u8,
            addr.direction() == UsbDirection::In,
            max_packet_size as u32
        );
        Ok(())
    }

    /// Close an endpoint, discarding any transfer
    ///
    /// The endpoint's descriptors return to software, and the controller
    /// stops serving the direction.
    pub fn close_endpoint(&mut self, addr: EndpointAddress) -> Result<(), UsbError> {
        let index = endpoint_index(addr).ok_or(UsbError::InvalidEndpoint)?;
        let dir = addr.direction();

        let epctl = ral::endpoint_control::register(&self.usb, index);
        match dir {
            UsbDirection::In => ral::modify_reg!(ral::endpoint_control, &epctl, FSEPCTL, EPTXEN: 0),
            UsbDirection::Out => ral::modify_reg!(ral::endpoint_control, &epctl, FSEPCTL, EPRXEN: 0),
        }

        self.bdt.pair(index, dir).iter().for_each(|bd| {
            bd.reclaim();
        });
        let [out, inn] = &mut self.endpoints[index];
        match dir {
            UsbDirection::In => inn.close(),
            UsbDirection::Out => out.close(),
        }
        if !out.is_open() && !inn.is_open() {
            ral::write_reg!(ral::endpoint_control, &epctl, FSEPCTL, 0);
        }

        debug!("CLOSE EP{} IN={}", index as u8, dir == UsbDirection::In);
        Ok(())
    }

    /// Close every endpoint except the control endpoint
    pub fn close_all(&mut self) {
        for index in 1..ENDPOINT_COUNT {
            for dir in [UsbDirection::Out, UsbDirection::In] {
                // Index is always in range.
                let _ = self.close_endpoint(EndpointAddress::from_parts(index, dir));
            }
        }
    }

    /// Submit a transfer of `len` bytes at `buffer`
    ///
    /// The transfer completes with an [`Event::TransferComplete`] for this
    /// endpoint. Returns `WouldBlock` if the endpoint's descriptors are still
    /// busy with a previous transfer; try again later. Returns
    /// `InvalidEndpoint` if the endpoint isn't open.
    ///
    /// EP0 OUT never blocks. If a data packet already arrived, it's copied
    /// into `buffer` right away, and the completion event is queued before
    /// this call returns.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for reads (IN) or writes (OUT) of `len` bytes,
    /// and must not move, until the transfer's completion event is observed,
    /// or until the endpoint is closed or the bus resets.
    pub unsafe fn submit(
        &mut self,
        addr: EndpointAddress,
        buffer: NonNull<u8>,
        len: usize,
    ) -> Result<(), UsbError> {
        let index = endpoint_index(addr).ok_or(UsbError::InvalidEndpoint)?;
        let dir = addr.direction();
        if index == 0 && dir == UsbDirection::Out {
            return self.submit_ep0_out(buffer, len);
        }

        let bdt = self.bdt;
        let ep = &mut self.endpoints[index][bdt::direction_index(dir)];
        ep.submit(bdt.pair(index, dir), buffer, len).map_err(|err| {
            if err == UsbError::WouldBlock {
                debug!("EP{} IN={} BUSY", index as u8, dir == UsbDirection::In);
            }
            err
        })?;

        trace!("EP{} IN={} SUBMIT {}", index as u8, dir == UsbDirection::In, len as u32);
        Ok(())
    }

    /// EP0 OUT shares one driver-owned buffer for SETUP and DATA packets, and
    /// it's always armed, so a submit only registers the destination.
    unsafe fn submit_ep0_out(&mut self, buffer: NonNull<u8>, len: usize) -> Result<(), UsbError> {
        let ep = &mut self.endpoints[0][0];
        if !ep.is_open() {
            return Err(UsbError::InvalidEndpoint);
        }

        match ep.take_unclaimed() {
            Some(received) => {
                let bytes = self.ep0_buffer.copy_to(buffer.as_ptr(), len, received);
                trace!("EP0 OUT CLAIM {}", bytes as u32);
                self.push(Event::TransferComplete {
                    address: ctrl_ep0_out(),
                    bytes,
                    result: TransferResult::Success,
                });
            }
            None => ep.set_pending(buffer, len),
        }
        Ok(())
    }

    /// Stall an endpoint
    ///
    /// A control endpoint's stall clears itself once the controller sends
    /// the STALL handshake.
    pub fn stall(&mut self, addr: EndpointAddress) -> Result<(), UsbError> {
        let index = endpoint_index(addr).ok_or(UsbError::InvalidEndpoint)?;
        let epctl = ral::endpoint_control::register(&self.usb, index);
        ral::modify_reg!(ral::endpoint_control, &epctl, FSEPCTL, EPSTALL: 1);

        for bd in self.bdt.pair(index, addr.direction()) {
            if let Some(mut bd) = bd.software() {
                bd.set_stalled(true);
            }
        }

        debug!("STALL EP{} IN={}", index as u8, addr.direction() == UsbDirection::In);
        Ok(())
    }

    /// Clear an endpoint's stall
    ///
    /// The endpoint's next packet uses DATA0. Any transfer in progress is
    /// discarded, and never produces a completion event.
    pub fn clear_stall(&mut self, addr: EndpointAddress) -> Result<(), UsbError> {
        let index = endpoint_index(addr).ok_or(UsbError::InvalidEndpoint)?;
        let dir = addr.direction();
        let epctl = ral::endpoint_control::register(&self.usb, index);
        ral::modify_reg!(ral::endpoint_control, &epctl, FSEPCTL, EPSTALL: 0);

        let bdt = self.bdt;
        self.endpoints[index][bdt::direction_index(dir)].clear_stall(bdt.pair(index, dir));

        debug!("UNSTALL EP{} IN={}", index as u8, dir == UsbDirection::In);
        Ok(())
    }

    /// Indicates if the endpoint is stalled
    ///
    /// Returns `false` for an endpoint number that's out of range.
    pub fn is_stalled(&self, addr: EndpointAddress) -> bool {
        endpoint_index(addr).map_or(false, |index| {
            let epctl = ral::endpoint_control::register(&self.usb, index);
            ral::read_reg!(ral::endpoint_control, &epctl, FSEPCTL, EPSTALL == 1)
        })
    }

    /// Set the device address after the status stage
    ///
    /// The address register keeps the old address until the zero-length IN
    /// packet of the status stage completes. If the USB stack hasn't already
    /// submitted that packet, this call submits it.
    ///
    /// Returns `InvalidState` if a previous address is still pending.
    pub fn set_address(&mut self, address: u8) -> Result<(), UsbError> {
        if self.pending_address != 0 {
            return Err(UsbError::InvalidState);
        }

        let ep0_in = &self.endpoints[0][1];
        if !(ep0_in.is_active() && ep0_in.length() == 0) {
            // Safety: a zero-length transfer never touches the buffer.
            unsafe { self.submit(ctrl_ep0_in(), NonNull::dangling(), 0) }?;
        }

        self.pending_address = address;
        debug!("ADDRESS PENDING {}", address);
        Ok(())
    }

    /// Drive (`true`) or release (`false`) the resume signal
    ///
    /// Remote wakeup requires the signal for 10ms.
    pub fn set_resume_signal(&mut self, resume: bool) {
        ral::modify_reg!(ral::usb, self.usb, FSCTL, RESUME: resume as u32);
    }

    /// The 11-bit number of the most recent frame
    pub fn frame_number(&self) -> u16 {
        let low = ral::read_reg!(ral::usb, self.usb, FSFRMNUML, FRM);
        let high = ral::read_reg!(ral::usb, self.usb, FSFRMNUMH, FRM);
        (low | high << 8) as u16
    }

    /// The current state of the bus lines
    pub fn bus_signal(&self) -> BusSignal {
        let (se0, j) = ral::read_reg!(ral::usb, self.usb, FSCTL, SE0, JSTATE);
        match (se0, j) {
            (1, 0) => BusSignal::Se0,
            (0, 1) => BusSignal::J,
            _ => BusSignal::Other,
        }
    }

    /// Take the oldest event
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// The number of events dropped because nobody polled them
    pub fn dropped_events(&self) -> usize {
        self.dropped_events
    }

    fn push(&mut self, event: Event) {
        if self.events.push_back(event).is_err() {
            self.dropped_events = self.dropped_events.wrapping_add(1);
            warn!("EVENT QUEUE FULL, DROPPED {}", self.dropped_events as u32);
        }
    }

    /// Service the USB interrupt
    ///
    /// A token completion is handled alone; any other pending sources fire
    /// the interrupt again.
    pub fn on_interrupt(&mut self) {
        let status = ral::read_reg!(ral::usb, self.usb, FSINTSTAT);
        let enabled = ral::read_reg!(ral::usb, self.usb, FSINTENB);
        let flags = Interrupts::from_bits_truncate(status & enabled);

        if flags.contains(Interrupts::TOKEN_DONE) {
            self.on_token_done();
            // Every re-arm is done. Releasing the status lets the next
            // token through.
            ral::write_reg!(ral::usb, self.usb, FSINTSTAT, TOKDNE: 1);
            return;
        }

        if flags.contains(Interrupts::RESET) {
            self.bus_reset();
            ral::write_reg!(ral::usb, self.usb, FSINTSTAT, USBRST: 1);
        }

        if flags.contains(Interrupts::SLEEP) {
            ral::write_reg!(ral::usb, self.usb, FSINTSTAT, SLEEP: 1);
            debug!("SUSPEND");
            self.push(Event::Suspend);
        }

        if flags.contains(Interrupts::RESUME) {
            ral::write_reg!(ral::usb, self.usb, FSINTSTAT, RESUME: 1);
            debug!("RESUME");
            self.push(Event::Resume);
        }

        if flags.contains(Interrupts::STALL) {
            self.on_ep0_stall();
            ral::write_reg!(ral::usb, self.usb, FSINTSTAT, STALL: 1);
        }

        if flags.contains(Interrupts::START_OF_FRAME) {
            ral::write_reg!(ral::usb, self.usb, FSINTSTAT, SOFTOK: 1);
            if self.sof_enabled {
                let frame = self.frame_number();
                self.push(Event::StartOfFrame(frame));
            }
        }

        if flags.contains(Interrupts::ERROR) {
            let errors = ral::read_reg!(ral::usb, self.usb, FSERRSTAT);
            ral::write_reg!(ral::usb, self.usb, FSERRSTAT, errors);
            warn!("ERROR {:#X}", errors);
            ral::write_reg!(ral::usb, self.usb, FSINTSTAT, ERROR: 1);
        }
    }

    /// Reinitialize every endpoint, and prepare EP0 for the next SETUP
    fn bus_reset(&mut self) {
        ral::modify_reg!(ral::usb, self.usb, FSCTL, ODDRST: 1);
        ral::modify_reg!(ral::usb, self.usb, FSCTL, ODDRST: 0);
        ral::write_reg!(ral::usb, self.usb, FSADDR, 0);
        self.pending_address = 0;

        for epctl in self.usb.FSEPCTL.iter() {
            epctl.write(0);
        }
        self.bdt.reclaim_all();
        self.endpoints.iter_mut().flatten().for_each(Endpoint::reset);

        let ep0_size = self.config.ep0_max_packet_size();
        for ep in self.endpoints[0].iter_mut() {
            ep.open(EndpointType::Control, ep0_size);
        }
        let epctl = ral::endpoint_control::register(&self.usb, 0);
        ral::write_reg!(ral::endpoint_control, &epctl, FSEPCTL, EPHSHK: 1, EPTXEN: 1, EPRXEN: 1);

        // The first IN packet after a SETUP is DATA1.
        self.endpoints[0][1].set_next_toggle(DataToggle::Data1);
        let armed = self
            .bdt
            .descriptor(0, UsbDirection::Out, Slot::Even)
            .arm(DataToggle::Data1, self.ep0_buffer.as_ptr(), SETUP_LEN);
        debug_assert!(armed);

        debug!("RESET");
        self.push(Event::Reset);
    }

    /// The controller sent a STALL handshake on EP0. Clear the stall, and
    /// keep listening for the next SETUP.
    fn on_ep0_stall(&mut self) {
        let epctl = ral::endpoint_control::register(&self.usb, 0);
        ral::modify_reg!(ral::endpoint_control, &epctl, FSEPCTL, EPSTALL: 0);

        let slot = self.endpoints[0][0].next_slot();
        let ep0_size = self.config.ep0_max_packet_size();
        let bd = self.bdt.descriptor(0, UsbDirection::Out, slot);
        if !bd.arm(DataToggle::Data1, self.ep0_buffer.as_ptr(), ep0_size) {
            trace!("EP0 OUT already armed");
        }
        debug!("EP0 STALL CLEARED");
    }

    fn on_token_done(&mut self) {
        let index = ral::read_reg!(ral::usb, self.usb, FSSTAT, ENDP) as usize;
        let dir = if ral::read_reg!(ral::usb, self.usb, FSSTAT, TX == 1) {
            UsbDirection::In
        } else {
            UsbDirection::Out
        };
        let slot = Slot::from_bit(ral::read_reg!(ral::usb, self.usb, FSSTAT, ODD));

        let bdt = self.bdt;
        let bd = bdt.descriptor(index, dir, slot);
        let Some(mut completed) = bd.software() else {
            warn!("EP{} TOKEN ON BUSY DESCRIPTOR", index as u8);
            return;
        };
        let token = completed.token();
        let size = completed.byte_count();
        let toggle = bd.toggle();
        completed.clear();

        if index == 0 && dir == UsbDirection::Out {
            self.on_ep0_out(slot, toggle, token, size);
            return;
        }

        let ep = &mut self.endpoints[index][bdt::direction_index(dir)];
        let Some(bytes) = ep.on_token(bdt.pair(index, dir), slot, toggle, size) else {
            return;
        };
        let address = ep.address();

        if index == 0 && dir == UsbDirection::In && bytes == 0 && self.pending_address != 0 {
            ral::write_reg!(ral::usb, self.usb, FSADDR, ADDR: u32::from(self.pending_address));
            debug!("ADDRESS {}", self.pending_address);
            self.pending_address = 0;
        }

        trace!("EP{} IN={} COMPLETE {}", index as u8, dir == UsbDirection::In, bytes as u32);
        self.push(Event::TransferComplete {
            address,
            bytes,
            result: TransferResult::Success,
        });
    }

    fn on_ep0_out(&mut self, slot: Slot, toggle: DataToggle, token: TokenPid, size: usize) {
        let ep0_size = self.config.ep0_max_packet_size();
        let ep = &mut self.endpoints[0][0];
        ep.advance(slot, toggle);

        if token == TokenPid::Setup {
            if size != SETUP_LEN {
                warn!("SETUP WITH {} BYTES", size as u32);
            }
            self.setup = [0; SETUP_LEN];
            self.ep0_buffer.read(&mut self.setup, size);
            // A new control transfer replaces whatever the last one left.
            ep.clear_pending();
            self.endpoints[0][1].set_next_toggle(DataToggle::Data1);
            debug!("SETUP");
            self.push(Event::Setup(self.setup));
        } else if size > 0 && ep.pending().is_none() {
            // The USB stack hasn't asked for the data yet. The next OUT
            // packet overwrites it if the stack doesn't claim it first.
            trace!("EP0 OUT UNCLAIMED {}", size as u32);
            ep.latch_unclaimed(size);
        } else {
            let bytes = match ep.pending() {
                // Safety: the caller of submit() guarantees the buffer.
                Some((buffer, len)) => unsafe { self.ep0_buffer.copy_to(buffer.as_ptr(), len, size) },
                None => 0,
            };
            ep.clear_pending();
            trace!("EP0 OUT COMPLETE {}", bytes as u32);
            self.push(Event::TransferComplete {
                address: ctrl_ep0_out(),
                bytes,
                result: TransferResult::Success,
            });
        }

        let bd = self.bdt.descriptor(0, UsbDirection::Out, slot.other());
        if !bd.arm(DataToggle::Data1, self.ep0_buffer.as_ptr(), ep0_size) {
            warn!("EP0 OUT BUSY");
        }

        if token == TokenPid::Setup {
            ral::modify_reg!(ral::usb, self.usb, FSCTL, TXDSUSPENDTOKENBUSY: 0);
        }
    }
}
