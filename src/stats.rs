//! Per-NIC and per-handle counters.
//!
//! All counters are written by the single ISR thread with plain 32-bit
//! atomic stores; nothing here uses locked read-modify-write cycles. A
//! reader that needs a consistent pair masks the NIC's IRQ for the
//! duration of [`snapshot`](NicStats::snapshot), which on pre-386 parts
//! is what keeps a 32-bit value from tearing.

use core::sync::atomic::{AtomicU32, Ordering};

#[inline]
fn bump(counter: &AtomicU32) {
	bump_by(counter, 1);
}

// Single writer: load + store instead of a locked fetch_add.
#[inline]
fn bump_by(counter: &AtomicU32, n: u32) {
	counter.store(counter.load(Ordering::Relaxed).wrapping_add(n), Ordering::Relaxed);
}

macro_rules! counter_block {
	($(#[$meta:meta])* $name:ident / $snapshot:ident { $($(#[$fmeta:meta])* $field:ident,)+ }) => {
		$(#[$meta])*
		#[derive(Default, Debug)]
		pub struct $name {
			$($(#[$fmeta])* pub $field: AtomicU32,)+
		}

		#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
		pub struct $snapshot {
			$(pub $field: u32,)+
		}

		impl $name {
			pub const fn new() -> Self {
				Self {
					$($field: AtomicU32::new(0),)+
				}
			}

			/// Copies all counters. Mask the owning IRQ around this if a
			/// torn pair would matter.
			pub fn snapshot(&self) -> $snapshot {
				$snapshot {
					$($field: self.$field.load(Ordering::Relaxed),)+
				}
			}

			/// Zeroes all counters.
			pub fn clear(&self) {
				$(self.$field.store(0, Ordering::Relaxed);)+
			}
		}
	};
}

counter_block! {
	/// Counters kept per controller.
	NicStats / NicStatsSnapshot {
		rx_frames,
		rx_bytes,
		rx_errors_total,
		rx_overruns,
		rx_oversize,
		rx_dribble,
		rx_runts,
		rx_alignment_errors,
		rx_crc_errors,
		/// Inbound frames dropped because the buffer pool was empty.
		rx_no_buffers,
		tx_frames,
		tx_bytes,
		tx_errors_total,
		tx_deferrals,
		tx_single_collisions,
		tx_multi_collisions,
		tx_underruns,
		tx_jabber,
		tx_max_collisions,
		/// Synthetic TX status 0x82: link partner duplex mismatch.
		tx_duplex_mismatch,
		interrupts_serviced,
		interrupts_chained,
		interrupts_spurious,
	}
}

counter_block! {
	/// Counters kept per packet-driver handle.
	HandleStats / HandleStatsSnapshot {
		rx_delivered,
		rx_dropped_no_buffer,
		tx_submitted,
	}
}

impl NicStats {
	pub fn count_rx_frame(&self, len: usize) {
		bump(&self.rx_frames);
		bump_by(&self.rx_bytes, len as u32);
	}

	pub fn count_tx_frame(&self, len: usize) {
		bump(&self.tx_frames);
		bump_by(&self.tx_bytes, len as u32);
	}
}

impl HandleStats {
	pub fn count_delivered(&self) {
		bump(&self.rx_delivered);
	}

	pub fn count_no_buffer(&self) {
		bump(&self.rx_dropped_no_buffer);
	}

	pub fn count_submitted(&self) {
		bump(&self.tx_submitted);
	}
}

/// Increments an arbitrary counter; the ISR uses this for the error
/// sub-counters it picks from a status word.
pub fn count(counter: &AtomicU32) {
	bump(counter);
}

/// The seven-dword statistics block defined by the Packet Driver
/// Specification, derived from a [`NicStatsSnapshot`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct PktStatsBlock {
	pub packets_in: u32,
	pub packets_out: u32,
	pub bytes_in: u32,
	pub bytes_out: u32,
	pub errors_in: u32,
	pub errors_out: u32,
	pub packets_dropped: u32,
}

impl PktStatsBlock {
	pub fn from_nic(s: &NicStatsSnapshot, dropped_no_buffer: u32) -> Self {
		Self {
			packets_in: s.rx_frames,
			packets_out: s.tx_frames,
			bytes_in: s.rx_bytes,
			bytes_out: s.tx_bytes,
			errors_in: s.rx_errors_total,
			errors_out: s.tx_errors_total,
			packets_dropped: s.rx_no_buffers.wrapping_add(dropped_no_buffer),
		}
	}

	/// Wire layout handed to clients: seven little-endian dwords.
	pub fn as_dwords(&self) -> [u32; 7] {
		[
			self.packets_in,
			self.packets_out,
			self.bytes_in,
			self.bytes_out,
			self.errors_in,
			self.errors_out,
			self.packets_dropped,
		]
	}
}
