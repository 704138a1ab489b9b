//! The window-banked programmed-I/O variant (10 Mbps EtherLink III
//! class).
//!
//! Frames move through the window-1 FIFO registers with the burst
//! primitives frozen at init. The RX status register reports one frame at
//! a time; `RX_DISCARD` pops it. The TX status register is a stack that
//! pops on every read, so completions are always read through in one
//! pass.

use heapless::Deque;

use super::error::NicError;
use super::{
	FrameSink, NicDescriptor, NicId, RxError, RxStatus, issue_command, issue_command_wait, regs,
	tx_status,
};
use crate::dispatch::DispatchTable;
use crate::dma::DmaReach;
use crate::hal::PortIo;
use crate::ring::{BufOwner, BufferPool};
use crate::stats::{NicStats, count};

/// In-order lengths of frames sitting in the TX FIFO, so completions can
/// be accounted in bytes. The FIFO never holds more than a handful.
const TX_PENDING: usize = 8;

#[derive(Debug)]
pub struct PioNic {
	pool: BufferPool,
	pending_lens: Deque<u16, TX_PENDING>,
	/// Frames refused because the FIFO had no room.
	tx_busy_drops: u32,
}

impl PioNic {
	pub(super) fn new(desc: &NicDescriptor) -> Result<Self, NicError> {
		// The private free list lives in conventional memory; only the
		// alignment rule applies.
		let pool = BufferPool::new(desc.buffer_pool_phys, DmaReach::Unlimited)?;
		Ok(Self {
			pool,
			pending_lens: Deque::new(),
			tx_busy_drops: 0,
		})
	}

	pub(super) fn start(&mut self, io: &mut dyn PortIo, io_base: u16) -> Result<(), NicError> {
		// Interrupt once the FIFO can take a full frame again.
		issue_command(io, io_base, regs::SET_TX_AVAIL | (1536 >> 2));
		Ok(())
	}

	pub(super) fn stop(&mut self) {
		self.pending_lens.clear();
	}

	pub fn tx_busy_drops(&self) -> u32 {
		self.tx_busy_drops
	}

	/// Writes length preamble plus data into the TX FIFO, dword-padded.
	pub(super) fn submit_tx_frame(
		&mut self,
		io: &mut dyn PortIo,
		io_base: u16,
		table: &DispatchTable,
		frame: &[u8],
	) -> Result<(), NicError> {
		let len = frame.len();
		let padded = (len + 3) & !3;

		let free = usize::from(io.inw(io_base + regs::W1_TX_FREE));
		if free < padded + 4 {
			self.tx_busy_drops += 1;
			return Err(NicError::TxBusy);
		}

		io.outw(io_base + regs::W1_TX_FIFO, len as u16);
		io.outw(io_base + regs::W1_TX_FIFO, 0);
		(table.write_burst)(io, io_base + regs::W1_TX_FIFO, frame);
		// The burst already rounded up to its unit; top up to a dword.
		let written = len.next_multiple_of(usize::from(table.io_unit));
		for _ in written..padded {
			io.outb(io_base + regs::W1_TX_FIFO, 0);
		}

		if self.pending_lens.push_back(len as u16).is_err() {
			// Deeper than the FIFO can be; drop the oldest record.
			self.pending_lens.pop_front();
			let _ = self.pending_lens.push_back(len as u16);
		}
		Ok(())
	}

	/// Pulls completed frames out of the RX FIFO, at most `budget` status
	/// reads, classifying each through `sink`.
	#[allow(clippy::too_many_arguments)]
	pub(super) fn drain_rx(
		&mut self,
		io: &mut dyn PortIo,
		io_base: u16,
		table: &DispatchTable,
		sink: &mut dyn FrameSink,
		id: NicId,
		stats: &NicStats,
		budget: u8,
	) -> u8 {
		let mut frames = 0;
		while frames < budget {
			let status = RxStatus(io.inw(io_base + regs::W1_RX_STATUS));
			// Empty FIFO and a frame still streaming in look the same;
			// either way the next interrupt picks it up.
			if status.is_incomplete() {
				break;
			}

			if status.is_error() {
				match status.error_code() {
					Some(RxError::Overrun) => count(&stats.rx_overruns),
					Some(RxError::Oversize) => count(&stats.rx_oversize),
					Some(RxError::Dribble) => count(&stats.rx_dribble),
					Some(RxError::Runt) => count(&stats.rx_runts),
					Some(RxError::Alignment) => count(&stats.rx_alignment_errors),
					Some(RxError::Crc) => count(&stats.rx_crc_errors),
					None => {}
				}
				count(&stats.rx_errors_total);
				discard_top(io, io_base, table);
				frames += 1;
				continue;
			}

			let len = status.len();
			let Some(buf_id) = self.pool.alloc(BufOwner::InFlightToClient) else {
				count(&stats.rx_no_buffers);
				discard_top(io, io_base, table);
				frames += 1;
				continue;
			};

			(table.read_burst)(
				io,
				io_base + regs::W1_RX_FIFO,
				&mut self.pool.buf_mut(buf_id)[..len],
			);
			discard_top(io, io_base, table);

			stats.count_rx_frame(len);
			sink.frame(id, &self.pool.buf(buf_id)[..len]);
			self.pool.release(buf_id);
			frames += 1;
		}
		frames
	}

	/// Reads through the stacked TX statuses, at most four per visit.
	pub(super) fn reap_tx(
		&mut self,
		io: &mut dyn PortIo,
		io_base: u16,
		table: &DispatchTable,
		stats: &NicStats,
	) -> u8 {
		let mut reaped = 0;
		for _ in 0..4 {
			let raw = io.inb(io_base + regs::W1_TX_STATUS);
			if raw == 0 {
				break;
			}

			if raw == tx_status::DUPLEX_MISMATCH {
				count(&stats.tx_duplex_mismatch);
				continue;
			}

			if raw & tx_status::COMPLETE != 0 {
				let len = self.pending_lens.pop_front().unwrap_or(0);
				stats.count_tx_frame(usize::from(len));
				reaped += 1;
			}
			if raw & tx_status::DEFERRED != 0 {
				count(&stats.tx_deferrals);
			}
			if raw & tx_status::SINGLE_COLLISION != 0 {
				count(&stats.tx_single_collisions);
			}
			if raw & tx_status::MULTI_COLLISION != 0 {
				count(&stats.tx_multi_collisions);
			}
			if raw & tx_status::UNDERRUN != 0 {
				count(&stats.tx_underruns);
			}
			if raw & tx_status::JABBER != 0 {
				count(&stats.tx_jabber);
			}
			if raw & tx_status::MAX_COLLISIONS != 0 {
				count(&stats.tx_max_collisions);
			}
			if raw & (tx_status::ABORTED | tx_status::UNDERRUN | tx_status::JABBER) != 0 {
				count(&stats.tx_errors_total);
			}

			if raw & tx_status::TX_DISABLING != 0 {
				// The transmitter shut itself off; reset and re-enable.
				debug!("tx status {raw:#04x} disabled the transmitter, recovering");
				let _ = issue_command_wait(io, io_base, regs::TX_RESET, table.spin_bound);
				issue_command(io, io_base, regs::TX_ENABLE);
			}
		}
		reaped
	}
}

fn discard_top(io: &mut dyn PortIo, io_base: u16, table: &DispatchTable) {
	let _ = issue_command_wait(io, io_base, regs::RX_DISCARD, table.spin_bound);
}
