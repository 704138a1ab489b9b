//! Descriptor rings and packet buffers for the bus-master variants, plus
//! the private buffer free list the PIO variant draws from.
//!
//! Ring memory and buffer pools are reserved once at init and never freed
//! during normal operation; exhaustion is an event to count, not an error
//! that stops a controller.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem;

use thiserror::Error;
use volatile::{VolatileFieldAccess, VolatileRef};

use crate::config::BUFFERS_PER_NIC;
use crate::dma::{self, DmaReach, PhysAddr};

/// Download (TX) descriptor, 16 bytes, as the adapter fetches it.
#[repr(C, align(16))]
#[derive(Clone, Copy, Default, VolatileFieldAccess)]
pub struct DownDesc {
	pub next: u32,
	/// Frame length plus control flags.
	pub frame_header: u32,
	pub frag_addr: u32,
	/// Fragment length; bit 31 marks the last fragment, bit 30 requests
	/// a download-complete interrupt.
	pub frag_len: u32,
}

/// Upload (RX) descriptor, 16 bytes.
#[repr(C, align(16))]
#[derive(Clone, Copy, Default, VolatileFieldAccess)]
pub struct UpDesc {
	pub next: u32,
	/// Bit 15 complete, bit 14 error, bits 0-12 length.
	pub pkt_status: u32,
	pub frag_addr: u32,
	pub frag_len: u32,
}

/// Last-fragment marker in `frag_len`.
pub const FRAG_LAST: u32 = 1 << 31;
/// Request-interrupt marker in `frag_len`.
pub const FRAG_INTR: u32 = 1 << 30;

/// Upload-complete bit in `pkt_status`.
pub const UP_COMPLETE: u32 = 1 << 15;
/// Upload-error bit in `pkt_status`.
pub const UP_ERROR: u32 = 1 << 14;
/// Length field of `pkt_status`.
pub const UP_LEN_MASK: u32 = 0x1fff;

pub mod error {
	use thiserror::Error;

	use crate::dma::error::DmaError;

	#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
	pub enum RingError {
		#[error("ring depth must be a power of two")]
		BadDepth,
		#[error("ring placement: {0}")]
		Placement(DmaError),
	}

	impl From<DmaError> for RingError {
		fn from(err: DmaError) -> Self {
			RingError::Placement(err)
		}
	}
}

use self::error::RingError;

#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
#[error("ring full")]
pub struct RingFull;

/// A descriptor ring with per-slot driver bookkeeping of type `M`.
///
/// `head` is the next slot to post, `tail` the oldest un-reaped slot.
/// `head == tail` means empty; one slot is sacrificed so that
/// `(head + 1) % N == tail` means full.
#[derive(Debug)]
pub struct DescRing<D, M> {
	slots: Box<[D]>,
	meta: Box<[Option<M>]>,
	phys_base: PhysAddr,
	head: usize,
	tail: usize,
}

impl<D: Copy + Default, M> DescRing<D, M> {
	/// Builds a ring of `depth` slots whose backing memory the cold-path
	/// allocator placed at `phys_base`.
	///
	/// The region is validated against the 64 KiB boundary rule and the
	/// controller's reach here, once; it is never re-checked afterwards.
	pub fn new(depth: usize, phys_base: PhysAddr, reach: DmaReach) -> Result<Self, RingError> {
		if !depth.is_power_of_two() || depth < 2 {
			return Err(RingError::BadDepth);
		}
		dma::check_region(phys_base, depth * mem::size_of::<D>(), reach)?;

		let slots = alloc::vec![D::default(); depth].into_boxed_slice();
		let meta = (0..depth).map(|_| None).collect::<Vec<_>>().into_boxed_slice();

		Ok(Self {
			slots,
			meta,
			phys_base,
			head: 0,
			tail: 0,
		})
	}

	pub fn depth(&self) -> usize {
		self.slots.len()
	}

	fn mask(&self) -> usize {
		self.slots.len() - 1
	}

	pub fn is_empty(&self) -> bool {
		self.head == self.tail
	}

	pub fn is_full(&self) -> bool {
		(self.head + 1) & self.mask() == self.tail
	}

	/// Slots currently posted.
	pub fn in_flight(&self) -> usize {
		(self.head + self.slots.len() - self.tail) & self.mask()
	}

	pub fn head(&self) -> usize {
		self.head
	}

	pub fn tail(&self) -> usize {
		self.tail
	}

	pub fn prev_index(&self, index: usize) -> usize {
		(index + self.slots.len() - 1) & self.mask()
	}

	pub fn next_index(&self, index: usize) -> usize {
		(index + 1) & self.mask()
	}

	/// Physical address of slot `index`, for hardware list pointers.
	pub fn slot_phys(&self, index: usize) -> PhysAddr {
		PhysAddr::new(self.phys_base.as_u32() + (index * mem::size_of::<D>()) as u32)
	}

	pub fn base_phys(&self) -> PhysAddr {
		self.phys_base
	}

	/// Volatile view of slot `index`; the hardware may be writing to it
	/// concurrently.
	pub fn slot(&mut self, index: usize) -> VolatileRef<'_, D> {
		VolatileRef::from_mut_ref(&mut self.slots[index])
	}

	pub fn slots_ptr(&self) -> *const D {
		self.slots.as_ptr()
	}

	pub fn slots_len_bytes(&self) -> usize {
		self.slots.len() * mem::size_of::<D>()
	}

	/// Claims the head slot, records its bookkeeping and advances `head`.
	/// The caller must have filled the descriptor beforehand.
	pub fn push(&mut self, meta: M) -> Result<usize, RingFull> {
		if self.is_full() {
			return Err(RingFull);
		}
		let index = self.head;
		self.meta[index] = Some(meta);
		self.head = self.next_index(index);
		Ok(index)
	}

	/// The slot a subsequent [`push`](Self::push) would claim.
	pub fn peek_head(&self) -> Result<usize, RingFull> {
		if self.is_full() {
			return Err(RingFull);
		}
		Ok(self.head)
	}

	/// Bookkeeping of the oldest posted slot, if any.
	pub fn tail_meta(&mut self) -> Option<&mut M> {
		if self.is_empty() {
			return None;
		}
		self.meta[self.tail].as_mut()
	}

	/// Retires the tail slot and hands back its bookkeeping.
	pub fn reap(&mut self) -> Option<M> {
		if self.is_empty() {
			return None;
		}
		let meta = self.meta[self.tail].take();
		self.tail = self.next_index(self.tail);
		meta
	}
}

/// Owner of a packet buffer at any instant.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BufOwner {
	Free,
	PostedToNic,
	InFlightToClient,
}

/// Index into a [`BufferPool`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BufferId(u16);

impl BufferId {
	pub fn index(self) -> usize {
		usize::from(self.0)
	}
}

/// Size of one packet buffer: MTU plus link-layer overhead, rounded up to
/// a power of two so a naturally aligned pool never straddles a 64 KiB
/// boundary.
pub const BUF_SIZE: usize = 2048;

/// A fixed pool of packet buffers with the three cohabiting identities of
/// each buffer: virtual slice, physical address, and owner.
#[derive(Debug)]
pub struct BufferPool {
	arena: Box<[u8]>,
	phys_base: PhysAddr,
	owners: Box<[BufOwner]>,
	free: heapless::Vec<u16, BUFFERS_PER_NIC>,
}

impl BufferPool {
	pub fn new(phys_base: PhysAddr, reach: DmaReach) -> Result<Self, RingError> {
		if phys_base.as_u32() % BUF_SIZE as u32 != 0 {
			return Err(RingError::Placement(
				dma::error::DmaError::PoolPlacement("buffer pool base not buffer-aligned"),
			));
		}
		// Each buffer is checked on its own; the pool may span boundaries.
		for i in 0..BUFFERS_PER_NIC {
			dma::check_region(
				PhysAddr::new(phys_base.as_u32() + (i * BUF_SIZE) as u32),
				BUF_SIZE,
				reach,
			)?;
		}

		let mut free = heapless::Vec::new();
		for i in 0..BUFFERS_PER_NIC as u16 {
			let _ = free.push(i);
		}

		Ok(Self {
			arena: alloc::vec![0u8; BUFFERS_PER_NIC * BUF_SIZE].into_boxed_slice(),
			phys_base,
			owners: alloc::vec![BufOwner::Free; BUFFERS_PER_NIC].into_boxed_slice(),
			free,
		})
	}

	pub fn free_buffers(&self) -> usize {
		self.free.len()
	}

	/// Draws a buffer and assigns it to `owner`.
	pub fn alloc(&mut self, owner: BufOwner) -> Option<BufferId> {
		debug_assert_ne!(owner, BufOwner::Free);
		let index = self.free.pop()?;
		self.owners[usize::from(index)] = owner;
		Some(BufferId(index))
	}

	pub fn owner(&self, id: BufferId) -> BufOwner {
		self.owners[id.index()]
	}

	pub fn set_owner(&mut self, id: BufferId, owner: BufOwner) {
		debug_assert_ne!(owner, BufOwner::Free);
		self.owners[id.index()] = owner;
	}

	/// Returns a buffer to the free list. Exactly one release per
	/// allocation: a second release of the same buffer is ignored (and
	/// logged), never double-queued.
	pub fn release(&mut self, id: BufferId) {
		if self.owners[id.index()] == BufOwner::Free {
			warn!("buffer {} released twice", id.index());
			return;
		}
		self.owners[id.index()] = BufOwner::Free;
		let _ = self.free.push(id.0);
	}

	pub fn buf_mut(&mut self, id: BufferId) -> &mut [u8] {
		let start = id.index() * BUF_SIZE;
		&mut self.arena[start..start + BUF_SIZE]
	}

	pub fn buf(&self, id: BufferId) -> &[u8] {
		let start = id.index() * BUF_SIZE;
		&self.arena[start..start + BUF_SIZE]
	}

	pub fn phys(&self, id: BufferId) -> PhysAddr {
		PhysAddr::new(self.phys_base.as_u32() + (id.index() * BUF_SIZE) as u32)
	}
}
