//! The controller abstraction.
//!
//! Six EtherLink families share one command-register protocol but differ
//! in their data path: the classic parts move frames through FIFO
//! registers with window-banked access, the later parts are bus masters
//! with download/upload descriptor lists. [`Nic`] carries everything
//! common (identity, state machine, receive mode, counters) and
//! dispatches the data path to the variant in [`pio`] or [`busmaster`],
//! the way the virtqueue code in this family of kernels wraps its two
//! queue layouts behind one enum.

pub mod busmaster;
pub mod pio;

use core::fmt;

use bit_field::BitField;
use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use self::busmaster::BusMasterNic;
use self::error::NicError;
use self::pio::PioNic;
use crate::config::MAX_MULTICAST;
use crate::dispatch::DispatchTable;
use crate::dma::{DmaPool, DmaReach, PhysAddr};
use crate::hal::PortIo;
use crate::stats::NicStats;

/// Register-level constants shared by all families.
///
/// Window selection goes through the command register; the status read
/// carries the currently selected window in its top three bits, which is
/// what lets the ISR save and restore the selector around its work.
pub(crate) mod regs {
	/// Command register offset (write) in every window.
	pub const CMD: u16 = 0x0e;
	/// Status register offset (read) in every window.
	pub const STATUS: u16 = 0x0e;

	// Commands are (code << 11) | argument.
	pub const TOTAL_RESET: u16 = 0 << 11;
	pub const SELECT_WINDOW: u16 = 1 << 11;
	pub const RX_DISABLE: u16 = 3 << 11;
	pub const RX_ENABLE: u16 = 4 << 11;
	pub const RX_RESET: u16 = 5 << 11;
	pub const UP_STALL: u16 = 6 << 11;
	pub const UP_UNSTALL: u16 = (6 << 11) | 1;
	pub const DOWN_STALL: u16 = (6 << 11) | 2;
	pub const DOWN_UNSTALL: u16 = (6 << 11) | 3;
	pub const RX_DISCARD: u16 = 8 << 11;
	pub const TX_ENABLE: u16 = 9 << 11;
	pub const TX_DISABLE: u16 = 10 << 11;
	pub const TX_RESET: u16 = 11 << 11;
	pub const ACK_INTR: u16 = 13 << 11;
	pub const SET_INTR_MASK: u16 = 14 << 11;
	pub const SET_STATUS_MASK: u16 = 15 << 11;
	pub const SET_RX_FILTER: u16 = 16 << 11;
	pub const SET_TX_AVAIL: u16 = 18 << 11;
	pub const STATS_ENABLE: u16 = 21 << 11;
	pub const STATS_DISABLE: u16 = 22 << 11;

	// SET_RX_FILTER argument bits.
	pub const FILTER_INDIVIDUAL: u16 = 0x01;
	pub const FILTER_MULTICAST: u16 = 0x02;
	pub const FILTER_BROADCAST: u16 = 0x04;
	pub const FILTER_PROMISC: u16 = 0x08;

	// Window 1 (operating set).
	pub const W1_TX_FIFO: u16 = 0x00;
	pub const W1_RX_FIFO: u16 = 0x00;
	pub const W1_RX_STATUS: u16 = 0x08;
	pub const W1_TX_STATUS: u16 = 0x0b;
	pub const W1_TX_FREE: u16 = 0x0c;

	// Window 2 holds the station address in bytes 0..=5.

	// Window 4 (diagnostics).
	pub const W4_NET_DIAG: u16 = 0x06;
	/// Link beat detected (10BASE-T).
	pub const NET_DIAG_LINK_BEAT: u16 = 1 << 11;
	/// SQE heartbeat present (AUI).
	pub const NET_DIAG_SQE: u16 = 1 << 9;

	// Window 6 (statistics), byte counters unless noted.
	pub const W6_CARRIER_LOST: u16 = 0x00;
	pub const W6_SQE_ERRORS: u16 = 0x01;
	pub const W6_MULTI_COLLISIONS: u16 = 0x02;
	pub const W6_SINGLE_COLLISIONS: u16 = 0x03;
	pub const W6_LATE_COLLISIONS: u16 = 0x04;
	pub const W6_RX_OVERRUNS: u16 = 0x05;
	pub const W6_TX_FRAMES_OK: u16 = 0x06;
	pub const W6_RX_FRAMES_OK: u16 = 0x07;
	pub const W6_TX_DEFERRALS: u16 = 0x08;
	/// Word register.
	pub const W6_RX_BYTES: u16 = 0x0a;
	/// Word register.
	pub const W6_TX_BYTES: u16 = 0x0c;

	// Bus-master list registers, valid in every window.
	pub const DOWN_LIST_PTR: u16 = 0x24;
	pub const DOWN_POLL: u16 = 0x2d;
	pub const UP_LIST_PTR: u16 = 0x38;
}

bitflags! {
	/// Latched interrupt status word.
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct IntStatus: u16 {
		const INT_LATCH = 0x0001;
		const ADAPTER_FAILURE = 0x0002;
		const TX_COMPLETE = 0x0004;
		const TX_AVAILABLE = 0x0008;
		const RX_COMPLETE = 0x0010;
		const RX_EARLY = 0x0020;
		const INT_REQ = 0x0040;
		const STATS_FULL = 0x0080;
		const DMA_DONE = 0x0100;
		const DOWN_COMPLETE = 0x0200;
		const UP_COMPLETE = 0x0400;
		const CMD_IN_PROGRESS = 0x1000;
	}
}

impl IntStatus {
	/// Causes the tiny path handles without a full context save.
	pub const COMMON: IntStatus = IntStatus::INT_LATCH
		.union(IntStatus::TX_COMPLETE)
		.union(IntStatus::TX_AVAILABLE)
		.union(IntStatus::RX_COMPLETE)
		.union(IntStatus::INT_REQ)
		.union(IntStatus::DMA_DONE)
		.union(IntStatus::DOWN_COMPLETE)
		.union(IntStatus::UP_COMPLETE);

	/// Anything outside the common set forces the full path.
	pub fn has_uncommon(self) -> bool {
		!self.difference(Self::COMMON).is_empty()
	}

	/// The window selector travels in bits 13-15 of the raw status word.
	pub fn window_of(raw: u16) -> u16 {
		raw >> 13
	}
}

/// RX-status register contents (window 1, offset 0x08).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RxStatus(pub u16);

impl RxStatus {
	pub fn len(self) -> usize {
		self.0.get_bits(0..11) as usize
	}

	pub fn is_error(self) -> bool {
		self.0.get_bit(14)
	}

	/// Set while the frame is still streaming in, and when the FIFO is
	/// empty. Either way: leave it for the next interrupt.
	pub fn is_incomplete(self) -> bool {
		self.0.get_bit(15)
	}

	pub fn error_code(self) -> Option<RxError> {
		self.is_error()
			.then(|| RxError::try_from(self.0.get_bits(11..14) as u8).ok())
			.flatten()
	}
}

/// RX error codes, bits 13-11 of the RX status word.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum RxError {
	Overrun = 0b000,
	Oversize = 0b001,
	Dribble = 0b010,
	Runt = 0b011,
	Alignment = 0b100,
	Crc = 0b101,
}

/// TX-status register bits (window 1, offset 0x0b). The register is a
/// stack: each read pops one entry and clears it.
pub mod tx_status {
	pub const COMPLETE: u8 = 0x01;
	pub const DEFERRED: u8 = 0x02;
	pub const ABORTED: u8 = 0x04;
	pub const SINGLE_COLLISION: u8 = 0x08;
	pub const MULTI_COLLISION: u8 = 0x10;
	pub const UNDERRUN: u8 = 0x20;
	pub const JABBER: u8 = 0x40;
	pub const MAX_COLLISIONS: u8 = 0x80;

	/// Synthetic pattern reported on a duplex mismatch; a warning, not an
	/// error.
	pub const DUPLEX_MISMATCH: u8 = 0x82;

	/// Statuses that leave the transmitter disabled until a TX reset.
	pub const TX_DISABLING: u8 = ABORTED | UNDERRUN | JABBER | MAX_COLLISIONS;
}

bitflags! {
	/// Capability set of a controller family.
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct NicCaps: u16 {
		const BUS_MASTER = 0x0001;
		const MULTICAST = 0x0002;
		const PROMISCUOUS = 0x0004;
		const FULL_DUPLEX = 0x0008;
		const LINK_BEAT = 0x0010;
		const WAKE_ON_LAN = 0x0020;
		const HW_CHECKSUM = 0x0040;
		const VLAN_TAGGING = 0x0080;
	}
}

/// The EtherLink families the resident core drives.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NicFamily {
	/// 10 Mbps FIFO parts with window-banked programmed I/O.
	PioClassic,
	/// The ISA bus master (Corkscrew-class).
	BusMasterIsa,
	Vortex,
	Boomerang,
	Cyclone,
	Tornado,
}

impl NicFamily {
	pub fn is_bus_master(self) -> bool {
		!matches!(self, NicFamily::PioClassic)
	}

	pub fn is_pci(self) -> bool {
		matches!(
			self,
			NicFamily::Vortex | NicFamily::Boomerang | NicFamily::Cyclone | NicFamily::Tornado
		)
	}

	pub fn dma_reach(self) -> DmaReach {
		match self {
			NicFamily::BusMasterIsa => DmaReach::Isa16M,
			_ => DmaReach::Unlimited,
		}
	}

	/// The later PCI parts share one implementation and differ only here.
	pub fn capabilities(self) -> NicCaps {
		let base = NicCaps::MULTICAST | NicCaps::PROMISCUOUS | NicCaps::LINK_BEAT;
		match self {
			NicFamily::PioClassic => base,
			NicFamily::BusMasterIsa => base | NicCaps::BUS_MASTER | NicCaps::FULL_DUPLEX,
			NicFamily::Vortex | NicFamily::Boomerang => {
				base | NicCaps::BUS_MASTER | NicCaps::FULL_DUPLEX
			}
			NicFamily::Cyclone => {
				base | NicCaps::BUS_MASTER
					| NicCaps::FULL_DUPLEX
					| NicCaps::WAKE_ON_LAN
					| NicCaps::HW_CHECKSUM
			}
			NicFamily::Tornado => {
				base | NicCaps::BUS_MASTER
					| NicCaps::FULL_DUPLEX
					| NicCaps::WAKE_ON_LAN
					| NicCaps::HW_CHECKSUM
					| NicCaps::VLAN_TAGGING
			}
		}
	}
}

/// Lifecycle of a controller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NicState {
	Uninitialized,
	Ready,
	Running,
	Stopped,
	Faulted,
}

/// A MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
	pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

	pub fn is_broadcast(&self) -> bool {
		*self == Self::BROADCAST
	}

	/// Group bit set, but not the broadcast address.
	pub fn is_multicast(&self) -> bool {
		self.0[0] & 0x01 != 0 && !self.is_broadcast()
	}
}

impl fmt::Display for MacAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let [a, b, c, d, e, g] = self.0;
		write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
	}
}

/// Receive modes defined by the Packet Driver Specification.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum ReceiveMode {
	Off = 1,
	DirectOnly = 2,
	Broadcast = 3,
	BroadcastLimitedMulticast = 4,
	BroadcastAllMulticast = 5,
	Promiscuous = 6,
}

impl ReceiveMode {
	/// Capability bits the controller must have for this mode.
	pub fn required_caps(self) -> NicCaps {
		match self {
			ReceiveMode::BroadcastLimitedMulticast | ReceiveMode::BroadcastAllMulticast => {
				NicCaps::MULTICAST
			}
			ReceiveMode::Promiscuous => NicCaps::PROMISCUOUS,
			_ => NicCaps::empty(),
		}
	}

	/// Destination-address admission for this mode.
	pub fn accepts(self, dest: &MacAddr, ours: &MacAddr, multicast: &[MacAddr]) -> bool {
		let direct = dest == ours;
		match self {
			ReceiveMode::Off => false,
			ReceiveMode::DirectOnly => direct,
			ReceiveMode::Broadcast => direct || dest.is_broadcast(),
			ReceiveMode::BroadcastLimitedMulticast => {
				direct
					|| dest.is_broadcast()
					|| (dest.is_multicast() && multicast.contains(dest))
			}
			ReceiveMode::BroadcastAllMulticast => {
				direct || dest.is_broadcast() || dest.is_multicast()
			}
			ReceiveMode::Promiscuous => true,
		}
	}

	fn filter_bits(self) -> u16 {
		use self::regs::*;
		match self {
			ReceiveMode::Off => 0,
			ReceiveMode::DirectOnly => FILTER_INDIVIDUAL,
			ReceiveMode::Broadcast => FILTER_INDIVIDUAL | FILTER_BROADCAST,
			ReceiveMode::BroadcastLimitedMulticast | ReceiveMode::BroadcastAllMulticast => {
				FILTER_INDIVIDUAL | FILTER_BROADCAST | FILTER_MULTICAST
			}
			ReceiveMode::Promiscuous => {
				FILTER_INDIVIDUAL | FILTER_BROADCAST | FILTER_MULTICAST | FILTER_PROMISC
			}
		}
	}
}

/// Stable identifier of a controller within the resident core.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NicId(pub u8);

impl NicId {
	pub fn index(self) -> usize {
		usize::from(self.0)
	}
}

/// Everything the cold-path probe hands over for one controller.
///
/// Ring and pool placement addresses come from the probe's conventional
/// memory allocator; the PIO variant only uses `buffer_pool_phys`.
#[derive(Clone, Copy, Debug)]
pub struct NicDescriptor {
	pub id: NicId,
	pub io_base: u16,
	pub irq: u8,
	pub family: NicFamily,
	pub mac: MacAddr,
	pub tx_ring_phys: PhysAddr,
	pub rx_ring_phys: PhysAddr,
	pub buffer_pool_phys: PhysAddr,
	/// PCI command-register state as the probe left it.
	pub pci_bus_master_enabled: bool,
	pub pci_io_enabled: bool,
}

pub mod error {
	use thiserror::Error;

	use crate::dma::error::DmaError;

	/// Driver-level errors surfaced to the API multiplexer.
	#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
	pub enum NicError {
		#[error("transmitter busy")]
		TxBusy,
		#[error("out of packet buffers")]
		OutOfBuffers,
		#[error("buffer not reachable by the controller")]
		BufferUnreachable,
		#[error("receive mode not supported by this controller")]
		UnsupportedMode,
		#[error("controller is faulted")]
		Faulted,
		#[error("controller is not running")]
		NotRunning,
		#[error("hardware command timed out")]
		Timeout,
		#[error("frame length invalid")]
		BadFrame,
		#[error("PCI bus mastering disabled by configuration")]
		BusMasterDisabled,
	}

	impl From<DmaError> for NicError {
		fn from(_err: DmaError) -> Self {
			NicError::BufferUnreachable
		}
	}

	impl From<crate::ring::error::RingError> for NicError {
		fn from(_err: crate::ring::error::RingError) -> Self {
			NicError::BufferUnreachable
		}
	}
}

/// Consumer of drained frames; the API classifier implements this.
/// Called once per frame, in ISR context, on the private stack.
pub trait FrameSink {
	fn frame(&mut self, nic: NicId, frame: &[u8]);
}

enum Variant {
	Pio(PioNic),
	BusMaster(BusMasterNic),
}

/// One controller: identity, state machine, receive policy, counters and
/// the family-specific data path.
pub struct Nic {
	pub(crate) id: NicId,
	pub(crate) io_base: u16,
	pub(crate) irq: u8,
	family: NicFamily,
	caps: NicCaps,
	mac: MacAddr,
	state: NicState,
	rx_mode: ReceiveMode,
	multicast: heapless::Vec<MacAddr, MAX_MULTICAST>,
	pub(crate) stats: NicStats,
	/// PCI parts must arrive with bus mastering and I/O decoding enabled.
	pci_ok: bool,
	variant: Variant,
}

impl Nic {
	/// Accepts the probe's handoff; `Uninitialized -> Ready`.
	pub fn new(desc: &NicDescriptor) -> Result<Self, NicError> {
		let variant = if desc.family.is_bus_master() {
			Variant::BusMaster(BusMasterNic::new(desc)?)
		} else {
			Variant::Pio(PioNic::new(desc)?)
		};

		Ok(Self {
			id: desc.id,
			io_base: desc.io_base,
			irq: desc.irq,
			family: desc.family,
			caps: desc.family.capabilities(),
			mac: desc.mac,
			state: NicState::Ready,
			rx_mode: ReceiveMode::Broadcast,
			multicast: heapless::Vec::new(),
			stats: NicStats::new(),
			pci_ok: !desc.family.is_pci()
				|| (desc.pci_bus_master_enabled && desc.pci_io_enabled),
			variant,
		})
	}

	pub fn id(&self) -> NicId {
		self.id
	}

	pub fn irq(&self) -> u8 {
		self.irq
	}

	pub fn family(&self) -> NicFamily {
		self.family
	}

	pub fn capabilities(&self) -> NicCaps {
		self.caps
	}

	pub fn state(&self) -> NicState {
		self.state
	}

	pub fn mac(&self) -> MacAddr {
		self.mac
	}

	pub fn receive_mode(&self) -> ReceiveMode {
		self.rx_mode
	}

	pub fn multicast_list(&self) -> &[MacAddr] {
		&self.multicast
	}

	pub fn stats(&self) -> &NicStats {
		&self.stats
	}

	fn guard_operational(&self) -> Result<(), NicError> {
		match self.state {
			NicState::Faulted => Err(NicError::Faulted),
			NicState::Running => Ok(()),
			_ => Err(NicError::NotRunning),
		}
	}

	pub(crate) fn fault(&mut self) {
		self.state = NicState::Faulted;
	}

	/// Terminal state at unload; only a full re-init through the cold
	/// path brings the controller back.
	pub fn release(&mut self) {
		self.state = NicState::Uninitialized;
	}

	/// Full controller reset, preserving MAC, mode and multicast list.
	/// A running controller comes back running; counters are cleared.
	pub fn reset(&mut self, io: &mut dyn PortIo, table: &DispatchTable, dma: &mut DmaPool) -> Result<(), NicError> {
		let was_running = self.state == NicState::Running;
		if was_running {
			self.stop(io, table, dma)?;
		}

		issue_command_wait(io, self.io_base, regs::TOTAL_RESET, table.spin_bound)
			.inspect_err(|_| self.fault())?;
		self.state = NicState::Ready;
		self.stats.clear();

		if was_running {
			self.start(io, table, dma)?;
		}
		Ok(())
	}

	/// Brings the controller to `Running`.
	pub fn start(&mut self, io: &mut dyn PortIo, table: &DispatchTable, dma: &mut DmaPool) -> Result<(), NicError> {
		match self.state {
			NicState::Ready | NicState::Stopped => {}
			NicState::Faulted => return Err(NicError::Faulted),
			NicState::Running => return Ok(()),
			NicState::Uninitialized => return Err(NicError::NotRunning),
		}
		if !self.pci_ok {
			return Err(NicError::BusMasterDisabled);
		}

		self.write_station_address(io);
		self.program_rx_filter(io);

		match &mut self.variant {
			Variant::Pio(pio) => pio.start(io, self.io_base)?,
			Variant::BusMaster(bm) => bm.start(io, self.io_base, dma)?,
		}

		issue_command(io, self.io_base, regs::STATS_ENABLE);
		issue_command(io, self.io_base, regs::RX_ENABLE);
		issue_command(io, self.io_base, regs::TX_ENABLE);
		// Everything in the common set may interrupt us.
		issue_command(
			io,
			self.io_base,
			regs::SET_INTR_MASK | (IntStatus::COMMON | IntStatus::ADAPTER_FAILURE | IntStatus::STATS_FULL).bits(),
		);
		issue_command(io, self.io_base, regs::SET_STATUS_MASK | 0x07ff);

		select_window(io, self.io_base, 1);
		self.state = NicState::Running;
		info!("nic {}: running, mac {}", self.id.0, self.mac);
		Ok(())
	}

	/// Halts the data path. Posted transmits are dropped on the floor and
	/// reaped back to the free list; nothing is delivered.
	pub fn stop(&mut self, io: &mut dyn PortIo, table: &DispatchTable, dma: &mut DmaPool) -> Result<(), NicError> {
		if self.state == NicState::Faulted {
			return Err(NicError::Faulted);
		}
		if self.state != NicState::Running {
			return Ok(());
		}

		issue_command(io, self.io_base, regs::SET_INTR_MASK);
		issue_command(io, self.io_base, regs::RX_DISABLE);
		issue_command(io, self.io_base, regs::TX_DISABLE);
		issue_command(io, self.io_base, regs::STATS_DISABLE);

		match &mut self.variant {
			Variant::Pio(pio) => pio.stop(),
			Variant::BusMaster(bm) => bm.stop(io, self.io_base, table, dma)?,
		}

		self.state = NicState::Stopped;
		Ok(())
	}

	/// Programs a new station address (window 2) and remembers it.
	pub fn set_mac(&mut self, io: &mut dyn PortIo, mac: MacAddr) -> Result<(), NicError> {
		if self.state == NicState::Faulted {
			return Err(NicError::Faulted);
		}
		self.mac = mac;
		self.write_station_address(io);
		select_window(io, self.io_base, 1);
		Ok(())
	}

	fn write_station_address(&mut self, io: &mut dyn PortIo) {
		select_window(io, self.io_base, 2);
		for (i, byte) in self.mac.0.iter().enumerate() {
			io.outb(self.io_base + i as u16, *byte);
		}
	}

	/// Validates `mode` against the capability set, then programs the
	/// hardware RX filter.
	pub fn set_receive_mode(
		&mut self,
		io: &mut dyn PortIo,
		mode: ReceiveMode,
	) -> Result<(), NicError> {
		if self.state == NicState::Faulted {
			return Err(NicError::Faulted);
		}
		if !self.caps.contains(mode.required_caps()) {
			return Err(NicError::UnsupportedMode);
		}
		self.rx_mode = mode;
		self.program_rx_filter(io);
		Ok(())
	}

	/// Replaces the multicast list used by limited-multicast mode.
	pub fn set_multicast_list(
		&mut self,
		io: &mut dyn PortIo,
		list: &[MacAddr],
	) -> Result<(), NicError> {
		if !self.caps.contains(NicCaps::MULTICAST) {
			return Err(NicError::UnsupportedMode);
		}
		if list.len() > MAX_MULTICAST {
			return Err(NicError::UnsupportedMode);
		}
		self.multicast.clear();
		for addr in list {
			// Capacity checked above.
			let _ = self.multicast.push(*addr);
		}
		self.program_rx_filter(io);
		Ok(())
	}

	fn program_rx_filter(&mut self, io: &mut dyn PortIo) {
		issue_command(
			io,
			self.io_base,
			regs::SET_RX_FILTER | self.rx_mode.filter_bits(),
		);
	}

	/// Reads the latched interrupt status word (raw, including the window
	/// selector bits).
	pub fn read_interrupt_status(&mut self, io: &mut dyn PortIo) -> u16 {
		io.inw(self.io_base + regs::STATUS)
	}

	/// Acknowledges exactly the observed causes.
	pub fn ack_interrupt(&mut self, io: &mut dyn PortIo, causes: IntStatus) {
		issue_command(
			io,
			self.io_base,
			regs::ACK_INTR | (causes.bits() & 0x07ff),
		);
	}

	/// Submits one frame. Returns synchronously; completion is reaped
	/// from the ISR.
	pub fn submit_tx_frame(
		&mut self,
		io: &mut dyn PortIo,
		table: &DispatchTable,
		dma: &mut DmaPool,
		frame: &mut [u8],
		frame_phys: PhysAddr,
	) -> Result<(), NicError> {
		self.guard_operational()?;
		match &mut self.variant {
			Variant::Pio(pio) => pio.submit_tx_frame(io, self.io_base, table, frame),
			Variant::BusMaster(bm) => {
				bm.submit_tx_frame(io, self.io_base, dma, frame, frame_phys)
			}
		}
	}

	/// Drains completed receives, at most `budget` frames, delivering
	/// each to `sink`.
	pub fn drain_rx_until_empty(
		&mut self,
		io: &mut dyn PortIo,
		table: &DispatchTable,
		dma: &mut DmaPool,
		sink: &mut dyn FrameSink,
		budget: u8,
	) -> u8 {
		let id = self.id;
		match &mut self.variant {
			Variant::Pio(pio) => {
				pio.drain_rx(io, self.io_base, table, sink, id, &self.stats, budget)
			}
			Variant::BusMaster(bm) => {
				bm.drain_rx(io, self.io_base, dma, sink, id, &self.stats, budget)
			}
		}
	}

	/// Reaps finished transmits and recovers a disabled transmitter.
	pub fn reap_tx_completions(
		&mut self,
		io: &mut dyn PortIo,
		table: &DispatchTable,
		dma: &mut DmaPool,
	) -> u8 {
		match &mut self.variant {
			Variant::Pio(pio) => pio.reap_tx(io, self.io_base, table, &self.stats),
			Variant::BusMaster(bm) => bm.reap_tx(io, self.io_base, dma, &self.stats),
		}
	}

	/// Full-path causes: adapter failure and statistics overflow.
	pub fn handle_uncommon(&mut self, io: &mut dyn PortIo, causes: IntStatus) {
		if causes.contains(IntStatus::ADAPTER_FAILURE) {
			error!("nic {}: adapter failure, fencing off", self.id.0);
			issue_command(io, self.io_base, regs::SET_INTR_MASK);
			self.fault();
			return;
		}
		if causes.contains(IntStatus::STATS_FULL) {
			self.harvest_stats(io);
		}
	}

	/// Reads and clears the window-6 hardware counters into ours.
	pub fn harvest_stats(&mut self, io: &mut dyn PortIo) {
		use core::sync::atomic::Ordering;

		issue_command(io, self.io_base, regs::STATS_DISABLE);
		select_window(io, self.io_base, 6);

		let base = self.io_base;
		let mut add = |offset: u16, counter: &core::sync::atomic::AtomicU32| {
			let v = io.inb(base + offset) as u32;
			counter.store(counter.load(Ordering::Relaxed).wrapping_add(v), Ordering::Relaxed);
		};
		add(regs::W6_SINGLE_COLLISIONS, &self.stats.tx_single_collisions);
		add(regs::W6_MULTI_COLLISIONS, &self.stats.tx_multi_collisions);
		add(regs::W6_RX_OVERRUNS, &self.stats.rx_overruns);
		add(regs::W6_TX_DEFERRALS, &self.stats.tx_deferrals);
		// Reading clears; the remaining registers only need draining.
		io.inb(base + regs::W6_CARRIER_LOST);
		io.inb(base + regs::W6_SQE_ERRORS);
		io.inb(base + regs::W6_LATE_COLLISIONS);
		io.inb(base + regs::W6_TX_FRAMES_OK);
		io.inb(base + regs::W6_RX_FRAMES_OK);
		io.inw(base + regs::W6_RX_BYTES);
		io.inw(base + regs::W6_TX_BYTES);

		select_window(io, self.io_base, 1);
		issue_command(io, self.io_base, regs::STATS_ENABLE);
	}

	/// Link beat (10BASE-T) from the window-4 diagnostics register.
	pub fn link_beat(&mut self, io: &mut dyn PortIo) -> bool {
		select_window(io, self.io_base, 4);
		let diag = io.inw(self.io_base + regs::W4_NET_DIAG);
		select_window(io, self.io_base, 1);
		diag & regs::NET_DIAG_LINK_BEAT != 0
	}

	/// Restores the window selector the ISR found on entry.
	pub(crate) fn select_window(&mut self, io: &mut dyn PortIo, window: u16) {
		select_window(io, self.io_base, window);
	}
}

pub(crate) fn select_window(io: &mut dyn PortIo, io_base: u16, window: u16) {
	io.outw(io_base + regs::CMD, regs::SELECT_WINDOW | (window & 0x7));
}

pub(crate) fn issue_command(io: &mut dyn PortIo, io_base: u16, command: u16) {
	io.outw(io_base + regs::CMD, command);
}

/// Issues a command and spins, bounded, until the busy bit clears.
pub(crate) fn issue_command_wait(
	io: &mut dyn PortIo,
	io_base: u16,
	command: u16,
	spin_bound: u32,
) -> Result<(), NicError> {
	io.outw(io_base + regs::CMD, command);
	for _ in 0..spin_bound {
		let status = io.inw(io_base + regs::STATUS);
		if IntStatus::from_bits_truncate(status & 0x1fff).contains(IntStatus::CMD_IN_PROGRESS) {
			continue;
		}
		return Ok(());
	}
	warn!("command {command:#06x} stuck in progress");
	Err(NicError::Timeout)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn family_capabilities() {
		assert!(!NicFamily::PioClassic.capabilities().contains(NicCaps::BUS_MASTER));
		assert!(NicFamily::BusMasterIsa.capabilities().contains(NicCaps::BUS_MASTER));
		assert_eq!(NicFamily::BusMasterIsa.dma_reach(), crate::dma::DmaReach::Isa16M);
		assert_eq!(NicFamily::Tornado.dma_reach(), crate::dma::DmaReach::Unlimited);
		assert!(NicFamily::Tornado.capabilities().contains(NicCaps::VLAN_TAGGING));
		assert!(NicFamily::Cyclone.capabilities().contains(NicCaps::WAKE_ON_LAN));
		assert!(!NicFamily::Boomerang.capabilities().contains(NicCaps::WAKE_ON_LAN));
	}

	#[test]
	fn rx_status_fields() {
		// 64-byte frame, no error.
		let st = RxStatus(64);
		assert_eq!(st.len(), 64);
		assert!(!st.is_error() && !st.is_incomplete());

		// CRC error, length 100.
		let st = RxStatus(0x4000 | (0b101 << 11) | 100);
		assert!(st.is_error());
		assert_eq!(st.error_code(), Some(RxError::Crc));

		// Still streaming in.
		let st = RxStatus(0x8000);
		assert!(st.is_incomplete());
	}

	#[test]
	fn receive_mode_admission() {
		let ours = MacAddr([0x00, 0xa0, 0x24, 0x11, 0x22, 0x33]);
		let other = MacAddr([0x00, 0xa0, 0x24, 0x44, 0x55, 0x66]);
		let mcast = MacAddr([0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]);

		assert!(!ReceiveMode::Off.accepts(&ours, &ours, &[]));
		assert!(ReceiveMode::DirectOnly.accepts(&ours, &ours, &[]));
		assert!(!ReceiveMode::DirectOnly.accepts(&MacAddr::BROADCAST, &ours, &[]));
		assert!(ReceiveMode::Broadcast.accepts(&MacAddr::BROADCAST, &ours, &[]));
		assert!(!ReceiveMode::Broadcast.accepts(&mcast, &ours, &[]));
		assert!(!ReceiveMode::BroadcastLimitedMulticast.accepts(&mcast, &ours, &[]));
		assert!(ReceiveMode::BroadcastLimitedMulticast.accepts(&mcast, &ours, &[mcast]));
		assert!(ReceiveMode::BroadcastAllMulticast.accepts(&mcast, &ours, &[]));
		assert!(ReceiveMode::Promiscuous.accepts(&other, &ours, &[]));
	}

	#[test]
	fn uncommon_bit_classification() {
		let common = IntStatus::INT_LATCH | IntStatus::RX_COMPLETE | IntStatus::TX_COMPLETE;
		assert!(!common.has_uncommon());
		assert!((common | IntStatus::ADAPTER_FAILURE).has_uncommon());
		assert!((common | IntStatus::STATS_FULL).has_uncommon());
		assert_eq!(IntStatus::window_of(0x2010), 1);
	}

	#[test]
	fn window_select_encoding() {
		use crate::hal::testing::{IoOp, MockBus};
		let mut bus = MockBus::new();
		select_window(&mut bus, 0x300, 4);
		assert_eq!(bus.log, [IoOp::Outw(0x30e, 0x0800 | 4)]);
	}
}
