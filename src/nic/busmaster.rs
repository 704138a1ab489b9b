//! The bus-master variants: the ISA Corkscrew-class part and the PCI
//! Vortex through Tornado families.
//!
//! Both directions run over 16-byte descriptor lists in host memory. The
//! upload (RX) list is kept primed with pool buffers; the download (TX)
//! list is fed one frame per submission and reaped against the
//! controller's list pointer. Every buffer exchange goes through the DMA
//! safety layer; the list bases are armed exactly once, at `start`.

use super::error::NicError;
use super::{
	FrameSink, NicDescriptor, NicId, issue_command, issue_command_wait, regs,
};
use crate::config::RING_DEPTH;
use crate::dispatch::DispatchTable;
use crate::dma::{DmaDirection, DmaPool, DmaReach, DmaTicket, PhysAddr};
use crate::hal::PortIo;
use crate::ring::{
	BUF_SIZE, BufOwner, BufferId, BufferPool, DescRing, DownDesc, DownDescVolatileFieldAccess,
	FRAG_INTR, FRAG_LAST, UP_COMPLETE, UP_ERROR, UP_LEN_MASK, UpDesc, UpDescVolatileFieldAccess,
};
use crate::stats::{NicStats, count};

struct TxMeta {
	ticket: DmaTicket,
	len: u16,
}

#[derive(Debug)]
struct RxMeta {
	ticket: DmaTicket,
	buf: BufferId,
}

#[derive(Debug)]
pub struct BusMasterNic {
	tx: DescRing<DownDesc, TxMeta>,
	rx: DescRing<UpDesc, RxMeta>,
	pool: BufferPool,
	reach: DmaReach,
}

impl BusMasterNic {
	pub(super) fn new(desc: &NicDescriptor) -> Result<Self, NicError> {
		let reach = desc.family.dma_reach();
		Ok(Self {
			tx: DescRing::new(RING_DEPTH, desc.tx_ring_phys, reach)?,
			rx: DescRing::new(RING_DEPTH, desc.rx_ring_phys, reach)?,
			pool: BufferPool::new(desc.buffer_pool_phys, reach)?,
			reach,
		})
	}

	/// Primes the upload list and arms both list pointers. The bases are
	/// never written again until the next full stop/start cycle.
	pub(super) fn start(
		&mut self,
		io: &mut dyn PortIo,
		io_base: u16,
		dma: &mut DmaPool,
	) -> Result<(), NicError> {
		// Ring memory is prepared for the device once, here.
		dma.coherency()
			.flush_for_device(self.tx.slots_ptr() as *const u8, self.tx.slots_len_bytes());
		dma.coherency()
			.flush_for_device(self.rx.slots_ptr() as *const u8, self.rx.slots_len_bytes());

		while !self.rx.is_full() {
			self.post_rx_buffer(dma)?;
		}

		io.outl(
			io_base + regs::UP_LIST_PTR,
			self.rx.slot_phys(self.rx.tail()).as_u32(),
		);
		io.outl(
			io_base + regs::DOWN_LIST_PTR,
			self.tx.slot_phys(self.tx.tail()).as_u32(),
		);
		issue_command(io, io_base, regs::UP_UNSTALL);
		issue_command(io, io_base, regs::DOWN_UNSTALL);
		Ok(())
	}

	/// Stalls both engines and drops everything posted. In-flight
	/// transmits are reaped to the free list without being counted;
	/// primed receive buffers go back to the pool.
	pub(super) fn stop(
		&mut self,
		io: &mut dyn PortIo,
		io_base: u16,
		table: &DispatchTable,
		dma: &mut DmaPool,
	) -> Result<(), NicError> {
		issue_command_wait(io, io_base, regs::DOWN_STALL, table.spin_bound)?;
		issue_command_wait(io, io_base, regs::UP_STALL, table.spin_bound)?;

		while let Some(meta) = self.tx.reap() {
			unsafe { dma.complete_from_device(meta.ticket) };
		}
		while let Some(meta) = self.rx.reap() {
			unsafe { dma.complete_from_device(meta.ticket) };
			self.pool.release(meta.buf);
		}
		Ok(())
	}

	fn post_rx_buffer(&mut self, dma: &mut DmaPool) -> Result<(), NicError> {
		let index = self.rx.peek_head().map_err(|_| NicError::OutOfBuffers)?;
		let Some(buf) = self.pool.alloc(BufOwner::PostedToNic) else {
			return Err(NicError::OutOfBuffers);
		};

		let buf_phys = self.pool.phys(buf);
		let ticket = match dma.prepare_for_device(
			self.pool.buf_mut(buf),
			buf_phys,
			DmaDirection::FromDevice,
			self.reach,
		) {
			Ok(ticket) => ticket,
			Err(err) => {
				self.pool.release(buf);
				return Err(err.into());
			}
		};

		let next = self.rx.slot_phys(self.rx.next_index(index));
		let mut slot = self.rx.slot(index);
		let desc = slot.as_mut_ptr();
		desc.next().write(next.as_u32());
		desc.pkt_status().write(0);
		desc.frag_addr().write(ticket.device_addr().as_u32());
		desc.frag_len().write(FRAG_LAST | BUF_SIZE as u32);
		drop(slot);
		self.flush_rx_desc(dma, index);

		// Cannot fail, the slot was peeked above.
		let _ = self.rx.push(RxMeta { ticket, buf });
		Ok(())
	}

	fn flush_rx_desc(&mut self, dma: &mut DmaPool, index: usize) {
		let ptr = unsafe { self.rx.slots_ptr().add(index) } as *const u8;
		dma.coherency()
			.flush_for_device(ptr, core::mem::size_of::<UpDesc>());
	}

	fn flush_tx_desc(&mut self, dma: &mut DmaPool, index: usize) {
		let ptr = unsafe { self.tx.slots_ptr().add(index) } as *const u8;
		dma.coherency()
			.flush_for_device(ptr, core::mem::size_of::<DownDesc>());
	}

	/// Queues one frame on the download list and pokes the poll register.
	pub(super) fn submit_tx_frame(
		&mut self,
		io: &mut dyn PortIo,
		io_base: u16,
		dma: &mut DmaPool,
		frame: &mut [u8],
		frame_phys: PhysAddr,
	) -> Result<(), NicError> {
		let len = frame.len();
		let index = self.tx.peek_head().map_err(|_| NicError::TxBusy)?;
		let ticket =
			dma.prepare_for_device(frame, frame_phys, DmaDirection::ToDevice, self.reach)?;

		let was_empty = self.tx.is_empty();
		let this_phys = self.tx.slot_phys(index);
		{
			let mut slot = self.tx.slot(index);
			let desc = slot.as_mut_ptr();
			desc.next().write(0);
			desc.frame_header().write(len as u32);
			desc.frag_addr().write(ticket.device_addr().as_u32());
			desc.frag_len().write(len as u32 | FRAG_LAST | FRAG_INTR);
		}
		self.flush_tx_desc(dma, index);

		if !was_empty {
			// Stitch the previous descriptor onto this one.
			let prev = self.tx.prev_index(index);
			let mut slot = self.tx.slot(prev);
			slot.as_mut_ptr().next().write(this_phys.as_u32());
			drop(slot);
			self.flush_tx_desc(dma, prev);
		}

		// Cannot fail, the slot was peeked above.
		let _ = self.tx.push(TxMeta {
			ticket,
			len: len as u16,
		});

		dma.coherency().barrier();
		io.outb(io_base + regs::DOWN_POLL, 1);
		Ok(())
	}

	/// Walks the upload list from the tail while slots show
	/// upload-complete, delivering each frame through `sink` and
	/// re-priming the list.
	#[allow(clippy::too_many_arguments)]
	pub(super) fn drain_rx(
		&mut self,
		_io: &mut dyn PortIo,
		_io_base: u16,
		dma: &mut DmaPool,
		sink: &mut dyn FrameSink,
		id: NicId,
		stats: &NicStats,
		budget: u8,
	) -> u8 {
		let mut frames = 0;
		while frames < budget {
			if self.rx.is_empty() {
				break;
			}
			let tail = self.rx.tail();
			dma.coherency().invalidate_for_cpu(
				unsafe { self.rx.slots_ptr().add(tail) } as *const u8,
				core::mem::size_of::<UpDesc>(),
			);
			let status = self.rx.slot(tail).as_ptr().pkt_status().read();
			// Not yet uploaded (or still uploading): the next interrupt
			// picks it up, the ISR does not spin here.
			if status & UP_COMPLETE == 0 {
				break;
			}

			let Some(meta) = self.rx.reap() else {
				break;
			};
			unsafe { dma.complete_from_device(meta.ticket) };

			if status & UP_ERROR != 0 {
				count(&stats.rx_errors_total);
				self.pool.release(meta.buf);
			} else {
				let len = ((status & UP_LEN_MASK) as usize).min(BUF_SIZE);
				self.pool.set_owner(meta.buf, BufOwner::InFlightToClient);
				stats.count_rx_frame(len);
				sink.frame(id, &self.pool.buf(meta.buf)[..len]);
				self.pool.release(meta.buf);
			}

			if self.post_rx_buffer(dma).is_err() {
				count(&stats.rx_no_buffers);
			}
			frames += 1;
		}
		frames
	}

	/// Retires download descriptors the controller has moved past.
	pub(super) fn reap_tx(
		&mut self,
		io: &mut dyn PortIo,
		io_base: u16,
		dma: &mut DmaPool,
		stats: &NicStats,
	) -> u8 {
		let current = io.inl(io_base + regs::DOWN_LIST_PTR);
		let mut reaped = 0;
		while !self.tx.is_empty() {
			let tail = self.tx.tail();
			if current != 0 && current == self.tx.slot_phys(tail).as_u32() {
				// The engine is still working on this one.
				break;
			}
			let Some(meta) = self.tx.reap() else {
				break;
			};
			unsafe { dma.complete_from_device(meta.ticket) };
			stats.count_tx_frame(usize::from(meta.len));
			reaped += 1;
		}
		reaped
	}
}
