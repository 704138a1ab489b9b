//! The interrupt core.
//!
//! The assembly stub saves segments, loads our data segment and switches
//! to the private stack; everything after that happens here. Entry order
//! is fixed: verify we still own the vector (another resident program may
//! have overwritten it without chaining; forward to the snapshot we took
//! at install time), guard against reentry, then scan the controllers'
//! latched status words round-robin and drain within the batch ceiling.
//! End-of-interrupt goes to the slave PIC before the master for the high
//! IRQ lines.
//!
//! The tiny path (common causes only) acknowledges and leaves without a
//! full register context; uncommon causes (adapter failure, statistics
//! overflow) take the full path, which may fence a controller off or
//! defer work to the next non-ISR entry.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU8, Ordering};

use smallvec::SmallVec;

use crate::config::{ISR_STACK_SIZE, MAX_NICS};
use crate::dispatch::DispatchTable;
use crate::dma::DmaPool;
use crate::hal::{FarPtr, PortIo, VectorTable};
use crate::nic::{FrameSink, IntStatus, Nic, NicId, NicState};
use crate::pic;
use crate::stats::count;

/// Value planted at the far end of the private stack; if it ever changes,
/// the ISR overran its 2 KiB.
const STACK_CANARY: u32 = 0x5aa5_c33c;

/// The host interrupt vector a hardware IRQ line arrives on.
pub fn irq_to_vector(irq: u8) -> u8 {
	if irq < 8 { 0x08 + irq } else { 0x70 + irq - 8 }
}

/// The private ISR stack and its occupancy accounting. The region itself
/// is what the stub loads into SS:SP; this side only tracks use and
/// checks the canary.
#[derive(Debug)]
pub struct IsrStack {
	region: Box<[u8]>,
	active: bool,
}

impl IsrStack {
	pub fn new() -> Self {
		let mut region = alloc::vec![0u8; ISR_STACK_SIZE].into_boxed_slice();
		region[..4].copy_from_slice(&STACK_CANARY.to_le_bytes());
		Self {
			region,
			active: false,
		}
	}

	/// Top of the region; stacks grow down.
	pub fn top(&self) -> *const u8 {
		self.region.as_ptr_range().end
	}

	fn enter(&mut self) {
		debug_assert!(!self.active);
		self.active = true;
	}

	fn leave(&mut self) {
		if !self.canary_intact() {
			error!("private ISR stack overran its region");
		}
		self.active = false;
	}

	pub fn canary_intact(&self) -> bool {
		self.region[..4] == STACK_CANARY.to_le_bytes()
	}
}

impl Default for IsrStack {
	fn default() -> Self {
		Self::new()
	}
}

/// Batch ceiling and deferred-work bits (one per controller).
#[derive(Debug)]
pub struct MitigationPolicy {
	ceiling: u8,
	hard_ceiling: u8,
	work_pending: u8,
	stats_deferred: u8,
}

impl MitigationPolicy {
	pub fn new(table: &DispatchTable) -> Self {
		Self {
			ceiling: table.batch_ceiling,
			hard_ceiling: table.batch_ceiling,
			work_pending: 0,
			stats_deferred: 0,
		}
	}

	pub fn ceiling(&self) -> u8 {
		self.ceiling
	}

	/// Administrative override; only ever lowers below the selected value.
	pub fn set_ceiling(&mut self, ceiling: u8) {
		self.ceiling = ceiling.clamp(1, self.hard_ceiling);
	}

	pub fn mark_work_pending(&mut self, nic: NicId) {
		self.work_pending |= 1 << nic.index();
	}

	pub fn take_work_pending(&mut self, nic: NicId) -> bool {
		let bit = 1 << nic.index();
		let was = self.work_pending & bit != 0;
		self.work_pending &= !bit;
		was
	}

	pub fn defer_stats(&mut self, nic: NicId) {
		self.stats_deferred |= 1 << nic.index();
	}

	pub fn take_stats_deferred(&mut self, nic: NicId) -> bool {
		let bit = 1 << nic.index();
		let was = self.stats_deferred & bit != 0;
		self.stats_deferred &= !bit;
		was
	}
}

/// One hooked interrupt vector.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VectorHook {
	pub irq: u8,
	pub vector: u8,
	/// Address of our stub, snapshotted at install.
	pub installed: FarPtr,
	/// The handler that was there before us, for chaining.
	pub previous: FarPtr,
}

/// What the stub should do after the core returns.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IsrOutcome {
	/// Jump to the given previous handler; we no longer own the vector or
	/// the cause was not ours.
	Chained { to: FarPtr },
	/// Nested entry; already acknowledged.
	Reentered,
	/// Nothing asserted a cause and there is nobody to chain to.
	Spurious,
	Serviced { rx_frames: u16, tx_reaped: u16 },
}

#[derive(Debug)]
pub struct InterruptCore {
	hooks: SmallVec<[VectorHook; MAX_NICS]>,
	depth: AtomicU8,
	stack: IsrStack,
	rotor: usize,
	pub policy: MitigationPolicy,
}

impl InterruptCore {
	pub fn new(policy: MitigationPolicy) -> Self {
		Self {
			hooks: SmallVec::new(),
			depth: AtomicU8::new(0),
			stack: IsrStack::new(),
			rotor: 0,
			policy,
		}
	}

	pub fn add_hook(&mut self, hook: VectorHook) {
		self.hooks.push(hook);
	}

	pub fn remove_hook(&mut self, vector: u8) -> Option<VectorHook> {
		let index = self.hooks.iter().position(|h| h.vector == vector)?;
		Some(self.hooks.remove(index))
	}

	pub fn hooks(&self) -> &[VectorHook] {
		&self.hooks
	}

	pub fn stack(&self) -> &IsrStack {
		&self.stack
	}

	/// The ISR body, entered by the stub once per hardware interrupt on
	/// `irq`.
	pub fn service(
		&mut self,
		io: &mut dyn PortIo,
		vectors: &mut dyn VectorTable,
		irq: u8,
		nics: &mut [Nic],
		table: &DispatchTable,
		dma: &mut DmaPool,
		sink: &mut dyn FrameSink,
	) -> IsrOutcome {
		let Some(hook) = self.hooks.iter().copied().find(|h| h.irq == irq) else {
			return IsrOutcome::Spurious;
		};

		// Ownership check: somebody may have taken the vector without
		// chaining. Forward as if we were never here.
		if vectors.get(hook.vector) != hook.installed {
			for nic in nics.iter().filter(|n| n.irq() == irq) {
				count(&nic.stats.interrupts_chained);
			}
			return IsrOutcome::Chained { to: hook.previous };
		}

		// Reentrancy guard. The vector was verified ours, so the nested
		// cause can be acknowledged before bailing out.
		if self.depth.fetch_add(1, Ordering::Relaxed) > 0 {
			self.depth.fetch_sub(1, Ordering::Relaxed);
			pic::eoi(io, irq);
			return IsrOutcome::Reentered;
		}

		self.stack.enter();
		let outcome = self.scan_and_drain(io, irq, nics, table, dma, sink);
		let outcome = match outcome {
			ScanResult::NothingLatched => {
				if hook.previous.is_null() {
					for nic in nics.iter().filter(|n| n.irq() == irq) {
						count(&nic.stats.interrupts_spurious);
					}
					pic::eoi(io, irq);
					IsrOutcome::Spurious
				} else {
					// A shared line: the cause belongs to whoever was on
					// the vector before us.
					for nic in nics.iter().filter(|n| n.irq() == irq) {
						count(&nic.stats.interrupts_chained);
					}
					IsrOutcome::Chained { to: hook.previous }
				}
			}
			ScanResult::Serviced {
				rx_frames,
				tx_reaped,
			} => {
				pic::eoi(io, irq);
				IsrOutcome::Serviced {
					rx_frames,
					tx_reaped,
				}
			}
		};
		self.stack.leave();
		self.depth.fetch_sub(1, Ordering::Relaxed);
		outcome
	}

	fn scan_and_drain(
		&mut self,
		io: &mut dyn PortIo,
		_irq: u8,
		nics: &mut [Nic],
		table: &DispatchTable,
		dma: &mut DmaPool,
		sink: &mut dyn FrameSink,
	) -> ScanResult {
		if nics.is_empty() {
			return ScanResult::NothingLatched;
		}

		let start = self.rotor % nics.len();
		self.rotor = self.rotor.wrapping_add(1);

		let mut any = false;
		let mut rx_frames = 0u16;
		let mut tx_reaped = 0u16;

		for offset in 0..nics.len() {
			let nic = &mut nics[(start + offset) % nics.len()];
			if nic.state() != NicState::Running {
				continue;
			}

			let raw = nic.read_interrupt_status(io);
			let status = IntStatus::from_bits_truncate(raw & 0x1fff);
			if !status.contains(IntStatus::INT_LATCH) {
				continue;
			}
			any = true;
			count(&nic.stats.interrupts_serviced);

			// A non-ISR caller may be mid-window-switch; put the selector
			// back the way we found it when we are done.
			let saved_window = IntStatus::window_of(raw);

			if status.has_uncommon() {
				// Full path: the stub pushed the whole register context
				// for these.
				if status.contains(IntStatus::STATS_FULL) {
					self.policy.defer_stats(nic.id());
				}
				nic.handle_uncommon(
					io,
					status.difference(IntStatus::STATS_FULL),
				);
				if nic.state() == NicState::Faulted {
					nic.ack_interrupt(io, status);
					continue;
				}
			}

			let budget = self.policy.ceiling();
			if status
				.intersects(IntStatus::RX_COMPLETE | IntStatus::UP_COMPLETE | IntStatus::RX_EARLY)
			{
				let drained = nic.drain_rx_until_empty(io, table, dma, sink, budget);
				rx_frames += u16::from(drained);
				if drained >= budget {
					// More may be waiting; let the next entry (or a
					// non-ISR poll) continue instead of overstaying.
					self.policy.mark_work_pending(nic.id());
				}
			}
			if status.intersects(
				IntStatus::TX_COMPLETE
					| IntStatus::TX_AVAILABLE
					| IntStatus::DOWN_COMPLETE
					| IntStatus::DMA_DONE,
			) {
				tx_reaped += u16::from(nic.reap_tx_completions(io, table, dma));
			}

			nic.ack_interrupt(io, status);
			nic.select_window(io, saved_window);
		}

		if any {
			ScanResult::Serviced {
				rx_frames,
				tx_reaped,
			}
		} else {
			ScanResult::NothingLatched
		}
	}
}

enum ScanResult {
	NothingLatched,
	Serviced { rx_frames: u16, tx_reaped: u16 },
}

#[cfg(test)]
mod tests {
	use alloc::vec::Vec;

	use super::*;
	use crate::cpu::{CpuFeatures, CpuGeneration};
	use crate::dispatch;
	use crate::dma::{CoherencyStrategy, PhysAddr};
	use crate::hal::testing::{IoOp, MockBus, MockIvt};
	use crate::nic::{MacAddr, NicDescriptor, NicFamily, regs};

	const BASE: u16 = 0x300;
	const IRQ: u8 = 10;
	const STUB: FarPtr = FarPtr::new(0xc800, 0x0010);
	const PREV: FarPtr = FarPtr::new(0xf000, 0x1234);

	fn table() -> DispatchTable {
		dispatch::select(&CpuFeatures::for_generation(CpuGeneration::Cpu286), false).unwrap()
	}

	fn dma() -> DmaPool {
		DmaPool::new(PhysAddr::new(0x8000), CoherencyStrategy::Uncached).unwrap()
	}

	fn pio_nic(id: u8, io_base: u16) -> Nic {
		let desc = NicDescriptor {
			id: NicId(id),
			io_base,
			irq: IRQ,
			family: NicFamily::PioClassic,
			mac: MacAddr([0x00, 0xa0, 0x24, 0x11, 0x22, 0x33]),
			tx_ring_phys: PhysAddr::new(0),
			rx_ring_phys: PhysAddr::new(0),
			buffer_pool_phys: PhysAddr::new(0x4_0000),
			pci_bus_master_enabled: false,
			pci_io_enabled: false,
		};
		let mut nic = Nic::new(&desc).unwrap();
		let mut bus = MockBus::new();
		nic.start(&mut bus, &table(), &mut dma()).unwrap();
		nic
	}

	fn core_with_hook() -> InterruptCore {
		let mut core = InterruptCore::new(MitigationPolicy::new(&table()));
		core.add_hook(VectorHook {
			irq: IRQ,
			vector: irq_to_vector(IRQ),
			installed: STUB,
			previous: PREV,
		});
		core
	}

	fn owned_ivt() -> MockIvt {
		let mut ivt = MockIvt::new();
		ivt.set(irq_to_vector(IRQ), STUB);
		ivt
	}

	#[derive(Default)]
	struct RecordingSink {
		frames: Vec<(NicId, Vec<u8>)>,
	}

	impl FrameSink for RecordingSink {
		fn frame(&mut self, nic: NicId, frame: &[u8]) {
			self.frames.push((nic, frame.to_vec()));
		}
	}

	#[test]
	fn vector_mapping() {
		assert_eq!(irq_to_vector(3), 0x0b);
		assert_eq!(irq_to_vector(10), 0x72);
		assert_eq!(irq_to_vector(15), 0x77);
	}

	#[test]
	fn hijacked_vector_chains_to_previous() {
		let mut core = core_with_hook();
		let mut nics = [pio_nic(0, BASE)];
		let mut bus = MockBus::new();
		let mut ivt = MockIvt::new();
		// Somebody replaced our vector without chaining.
		ivt.set(irq_to_vector(IRQ), FarPtr::new(0xdead, 0x0000));

		let outcome = core.service(
			&mut bus,
			&mut ivt,
			IRQ,
			&mut nics,
			&table(),
			&mut dma(),
			&mut RecordingSink::default(),
		);

		assert_eq!(outcome, IsrOutcome::Chained { to: PREV });
		assert_eq!(nics[0].stats().snapshot().interrupts_chained, 1);
		// Forwarded untouched: no EOI, no device access.
		assert!(bus.log.is_empty());
	}

	#[test]
	fn reentry_is_guarded() {
		let mut core = core_with_hook();
		let mut nics = [pio_nic(0, BASE)];
		let mut bus = MockBus::new();
		let mut ivt = owned_ivt();

		core.depth.store(1, Ordering::Relaxed);
		let outcome = core.service(
			&mut bus,
			&mut ivt,
			IRQ,
			&mut nics,
			&table(),
			&mut dma(),
			&mut RecordingSink::default(),
		);

		assert_eq!(outcome, IsrOutcome::Reentered);
		assert_eq!(core.depth.load(Ordering::Relaxed), 1);
		// The nested cause was acknowledged at the PICs, slave first.
		assert_eq!(bus.log, [IoOp::Outb(0xa0, 0x20), IoOp::Outb(0x20, 0x20)]);
	}

	#[test]
	fn tiny_path_drains_acks_and_eois() {
		let mut core = core_with_hook();
		let mut nics = [pio_nic(0, BASE)];
		let mut bus = MockBus::new();
		let mut ivt = owned_ivt();
		let mut sink = RecordingSink::default();
		let mut dma = dma();

		// Window 1 selected, latch + RX complete.
		bus.push_read(
			BASE + regs::STATUS,
			u32::from(0x2000 | (IntStatus::INT_LATCH | IntStatus::RX_COMPLETE).bits()),
		);
		// One 64-byte frame, then empty.
		bus.push_read(BASE + regs::W1_RX_STATUS, 64);
		bus.push_read(BASE + regs::W1_RX_STATUS, 0x8000);

		let outcome = core.service(
			&mut bus,
			&mut ivt,
			IRQ,
			&mut nics,
			&table(),
			&mut dma,
			&mut sink,
		);

		assert_eq!(
			outcome,
			IsrOutcome::Serviced {
				rx_frames: 1,
				tx_reaped: 0
			}
		);
		assert_eq!(sink.frames.len(), 1);
		assert_eq!(nics[0].stats().snapshot().interrupts_serviced, 1);

		let cmds = bus.writes_to(BASE + regs::CMD);
		// Acknowledged the observed causes...
		assert!(cmds.contains(&u32::from(
			regs::ACK_INTR | (IntStatus::INT_LATCH | IntStatus::RX_COMPLETE).bits()
		)));
		// ...and restored the window selector found on entry.
		assert_eq!(*cmds.last().unwrap(), u32::from(regs::SELECT_WINDOW | 1));
		// EOI for IRQ 10: slave before master, after device work.
		let eois: Vec<_> = bus
			.log
			.iter()
			.filter(|op| matches!(op, IoOp::Outb(0xa0, 0x20) | IoOp::Outb(0x20, 0x20)))
			.collect();
		assert_eq!(eois.len(), 2);
		assert_eq!(*eois[0], IoOp::Outb(0xa0, 0x20));
		assert!(core.stack().canary_intact());
		assert_eq!(core.depth.load(Ordering::Relaxed), 0);
	}

	#[test]
	fn batch_ceiling_bounds_the_drain_and_marks_pending() {
		let mut core = core_with_hook();
		core.policy.set_ceiling(2);
		let mut nics = [pio_nic(0, BASE)];
		let mut bus = MockBus::new();
		let mut ivt = owned_ivt();
		let mut sink = RecordingSink::default();
		let mut dma = dma();

		bus.push_read(
			BASE + regs::STATUS,
			u32::from(0x2000 | (IntStatus::INT_LATCH | IntStatus::RX_COMPLETE).bits()),
		);
		for _ in 0..5 {
			bus.push_read(BASE + regs::W1_RX_STATUS, 32);
		}

		let outcome = core.service(
			&mut bus,
			&mut ivt,
			IRQ,
			&mut nics,
			&table(),
			&mut dma,
			&mut sink,
		);

		assert_eq!(
			outcome,
			IsrOutcome::Serviced {
				rx_frames: 2,
				tx_reaped: 0
			}
		);
		assert!(core.policy.take_work_pending(NicId(0)));
		assert!(!core.policy.take_work_pending(NicId(0)));
	}

	#[test]
	fn no_latched_cause_chains_on_a_shared_line() {
		let mut core = core_with_hook();
		let mut nics = [pio_nic(0, BASE)];
		let mut bus = MockBus::new();
		let mut ivt = owned_ivt();

		// Status read returns nothing latched.
		let outcome = core.service(
			&mut bus,
			&mut ivt,
			IRQ,
			&mut nics,
			&table(),
			&mut dma(),
			&mut RecordingSink::default(),
		);

		assert_eq!(outcome, IsrOutcome::Chained { to: PREV });
		assert_eq!(nics[0].stats().snapshot().interrupts_chained, 1);
	}

	#[test]
	fn no_latched_cause_without_previous_is_spurious() {
		let mut core = InterruptCore::new(MitigationPolicy::new(&table()));
		core.add_hook(VectorHook {
			irq: IRQ,
			vector: irq_to_vector(IRQ),
			installed: STUB,
			previous: FarPtr::NULL,
		});
		let mut nics = [pio_nic(0, BASE)];
		let mut bus = MockBus::new();
		let mut ivt = owned_ivt();

		let outcome = core.service(
			&mut bus,
			&mut ivt,
			IRQ,
			&mut nics,
			&table(),
			&mut dma(),
			&mut RecordingSink::default(),
		);

		assert_eq!(outcome, IsrOutcome::Spurious);
		assert_eq!(nics[0].stats().snapshot().interrupts_spurious, 1);
		// Nobody to chain to: we still owe the PIC its EOI.
		assert!(bus.log.contains(&IoOp::Outb(0xa0, 0x20)));
	}

	#[test]
	fn stats_overflow_is_deferred_not_harvested_inline() {
		let mut core = core_with_hook();
		let mut nics = [pio_nic(0, BASE)];
		let mut bus = MockBus::new();
		let mut ivt = owned_ivt();
		let mut dma = dma();

		bus.push_read(
			BASE + regs::STATUS,
			u32::from(0x2000 | (IntStatus::INT_LATCH | IntStatus::STATS_FULL).bits()),
		);

		let outcome = core.service(
			&mut bus,
			&mut ivt,
			IRQ,
			&mut nics,
			&table(),
			&mut dma,
			&mut RecordingSink::default(),
		);

		assert!(matches!(outcome, IsrOutcome::Serviced { .. }));
		assert!(core.policy.take_stats_deferred(NicId(0)));
		// No window-6 harvest from the ISR.
		assert!(!bus.writes_to(BASE + regs::CMD).contains(&u32::from(regs::SELECT_WINDOW | 6)));
	}

	#[test]
	fn adapter_failure_fences_the_controller() {
		let mut core = core_with_hook();
		let mut nics = [pio_nic(0, BASE)];
		let mut bus = MockBus::new();
		let mut ivt = owned_ivt();
		let mut dma = dma();

		bus.push_read(
			BASE + regs::STATUS,
			u32::from(0x2000 | (IntStatus::INT_LATCH | IntStatus::ADAPTER_FAILURE).bits()),
		);

		core.service(
			&mut bus,
			&mut ivt,
			IRQ,
			&mut nics,
			&table(),
			&mut dma,
			&mut RecordingSink::default(),
		);

		assert_eq!(nics[0].state(), NicState::Faulted);
	}

	#[test]
	fn round_robin_rotates_the_scan_start() {
		let mut core = core_with_hook();
		let mut nics = [pio_nic(0, 0x300), pio_nic(1, 0x320)];
		let mut ivt = owned_ivt();
		let mut dma = dma();

		let first_status_read = |bus: &MockBus| {
			bus.log.iter().find_map(|op| match *op {
				IoOp::Inw(p, _) if p == 0x300 + regs::STATUS || p == 0x320 + regs::STATUS => {
					Some(p)
				}
				_ => None,
			})
		};

		let mut bus = MockBus::new();
		core.service(&mut bus, &mut ivt, IRQ, &mut nics, &table(), &mut dma,
			&mut RecordingSink::default());
		assert_eq!(first_status_read(&bus), Some(0x300 + regs::STATUS));

		let mut bus = MockBus::new();
		core.service(&mut bus, &mut ivt, IRQ, &mut nics, &table(), &mut dma,
			&mut RecordingSink::default());
		assert_eq!(first_status_read(&bus), Some(0x320 + regs::STATUS));
	}
}
