//! The Packet Driver API multiplexer.
//!
//! Clients reach the driver through a software interrupt in the reserved
//! vector range; a function number in AH selects one of the calls below,
//! results travel back in registers, and errors set carry with a code in
//! DH, all per the Packet Driver Specification. This module owns the
//! ABI types, the handle table and the receive classifier; the register
//! marshaling lives with the driver front end.
//!
//! Received frames are fanned out by first match in allocation order. A
//! matching handle's receiver is called twice per frame: once to obtain a
//! destination buffer (`NULL` means drop and count), once after the copy.

use alloc::boxed::Box;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use num_enum::TryFromPrimitive;
use thiserror::Error;

use crate::config::{ETH_FRAME_MAX, MAX_HANDLES, MAX_TYPE_LEN};
use crate::dispatch::CopyFn;
use crate::hal::FarPtr;
use crate::nic::{MacAddr, NicId, ReceiveMode};
use crate::stats::HandleStats;

/// Signature embedded near the interrupt entry so utilities can probe
/// for an installed packet driver.
pub const SIGNATURE: [u8; 9] = *b"PKT DRVR\0";

/// Function numbers of the Packet Driver Specification (AH register).
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum FuncCode {
	DriverInfo = 1,
	AccessType = 2,
	ReleaseType = 3,
	SendPkt = 4,
	Terminate = 5,
	GetAddress = 6,
	ResetInterface = 7,
	GetParameters = 10,
	SetRcvMode = 20,
	GetRcvMode = 21,
	SetMulticastList = 22,
	GetMulticastList = 23,
	GetStatistics = 24,
	SetAddress = 25,
}

/// Interface classes the driver serves.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum IfClass {
	/// DIX Ethernet II.
	Ethernet = 1,
	/// IEEE 802.3 with 802.2 headers.
	Ieee8023 = 11,
}

/// API errors, carried back to the client in DH with carry set.
#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum ApiError {
	#[error("invalid handle")]
	BadHandle,
	#[error("no interface of that class")]
	NoClass,
	#[error("no interface of that type")]
	NoType,
	#[error("no interface of that number")]
	NoNumber,
	#[error("bad packet type specification")]
	BadType,
	#[error("interface does not support multicast")]
	NoMulticast,
	#[error("packet driver cannot terminate")]
	CantTerminate,
	#[error("invalid receive mode")]
	BadMode,
	#[error("no space in the handle table")]
	NoSpace,
	#[error("type already in use")]
	TypeInUse,
	#[error("bad command")]
	BadCommand,
	#[error("packet could not be sent")]
	CantSend,
	#[error("hardware address could not be changed")]
	CantSet,
	#[error("hardware address has bad length or format")]
	BadAddress,
	#[error("interface could not be reset")]
	CantReset,
	#[error("driver is still initializing")]
	NotReady,
}

impl ApiError {
	/// The DH error code. `NotReady` has no number of its own in the
	/// specification and travels as `BadCommand`.
	pub fn code(self) -> u8 {
		match self {
			ApiError::BadHandle => 1,
			ApiError::NoClass => 2,
			ApiError::NoType => 3,
			ApiError::NoNumber => 4,
			ApiError::BadType => 5,
			ApiError::NoMulticast => 6,
			ApiError::CantTerminate => 7,
			ApiError::BadMode => 8,
			ApiError::NoSpace => 9,
			ApiError::TypeInUse => 10,
			ApiError::BadCommand | ApiError::NotReady => 11,
			ApiError::CantSend => 12,
			ApiError::CantSet => 13,
			ApiError::BadAddress => 14,
			ApiError::CantReset => 15,
		}
	}
}

/// The `driver_info` reply.
#[derive(Clone, Copy, Debug)]
pub struct DriverInfo {
	pub version: u16,
	pub class: IfClass,
	pub if_type: u16,
	pub if_number: u8,
	pub name: &'static str,
	/// 1 = basic, 2 = basic+extended, 5 = basic+high-performance, 6 = all.
	pub functionality: u8,
}

/// The `get_parameters` reply block (specification v1.11).
#[derive(Clone, Copy, Debug)]
pub struct DriverParams {
	pub major_rev: u8,
	pub minor_rev: u8,
	pub length: u8,
	pub addr_len: u8,
	pub mtu: u16,
	pub multicast_avail: u16,
	pub rcv_bufs: u16,
	pub xmt_bufs: u16,
	pub int_num: u16,
}

impl DriverParams {
	/// Wire layout of the block, little-endian words.
	pub fn to_bytes(self) -> [u8; 14] {
		let mut b = [0u8; 14];
		b[0] = self.major_rev;
		b[1] = self.minor_rev;
		b[2] = self.length;
		b[3] = self.addr_len;
		b[4..6].copy_from_slice(&self.mtu.to_le_bytes());
		b[6..8].copy_from_slice(&self.multicast_avail.to_le_bytes());
		b[8..10].copy_from_slice(&self.rcv_bufs.to_le_bytes());
		b[10..12].copy_from_slice(&self.xmt_bufs.to_le_bytes());
		b[12..14].copy_from_slice(&self.int_num.to_le_bytes());
		b
	}
}

/// A client's receiver, called from the ISR on the private stack.
///
/// The two-call convention of the specification: `request_buffer` asks
/// the client for `len` bytes (returning `None` rejects the frame), and
/// after the driver copied the frame, `copy_complete` hands it over.
pub trait PacketReceiver: Send {
	fn request_buffer(&mut self, handle: u16, len: u16) -> Option<NonNull<u8>>;
	fn copy_complete(&mut self, handle: u16, buffer: NonNull<u8>, len: u16);
}

/// A packet-type template, matched as a byte prefix against the frame's
/// type field. An empty template matches every type of the class.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct TypeFilter {
	bytes: heapless::Vec<u8, MAX_TYPE_LEN>,
}

impl TypeFilter {
	pub fn new(template: &[u8]) -> Result<Self, ApiError> {
		let mut bytes = heapless::Vec::new();
		if template.len() > MAX_TYPE_LEN {
			return Err(ApiError::BadType);
		}
		// Length was checked against the capacity.
		let _ = bytes.extend_from_slice(template);
		Ok(Self { bytes })
	}

	pub fn match_all() -> Self {
		Self::default()
	}

	pub fn is_match_all(&self) -> bool {
		self.bytes.is_empty()
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.bytes
	}

	pub fn matches(&self, type_field: &[u8]) -> bool {
		type_field.len() >= self.bytes.len() && type_field[..self.bytes.len()] == self.bytes[..]
	}
}

/// One registration in the handle table.
pub struct HandleEntry {
	pub class: IfClass,
	pub filter: TypeFilter,
	pub mode: ReceiveMode,
	pub nic: NicId,
	pub receiver: Box<dyn PacketReceiver>,
	pub stats: HandleStats,
}

impl core::fmt::Debug for HandleEntry {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("HandleEntry")
			.field("class", &self.class)
			.field("filter", &self.filter)
			.field("mode", &self.mode)
			.field("nic", &self.nic)
			.field("receiver", &"<dyn PacketReceiver>")
			.field("stats", &self.stats)
			.finish()
	}
}

/// The fixed-capacity handle table plus the classifier over it.
pub struct HandleTable {
	slots: [Option<HandleEntry>; MAX_HANDLES],
	/// Frames that matched no handle (including late frames for released
	/// handles); discarded.
	pub unmatched_drops: AtomicU32,
}

impl core::fmt::Debug for HandleTable {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("HandleTable")
			.field("slots", &self.slots)
			.field("unmatched_drops", &self.unmatched_drops)
			.finish()
	}
}

impl Default for HandleTable {
	fn default() -> Self {
		Self::new()
	}
}

impl HandleTable {
	pub fn new() -> Self {
		Self {
			slots: [const { None }; MAX_HANDLES],
			unmatched_drops: AtomicU32::new(0),
		}
	}

	pub fn get(&self, handle: u16) -> Result<&HandleEntry, ApiError> {
		self.slots
			.get(usize::from(handle))
			.and_then(Option::as_ref)
			.ok_or(ApiError::BadHandle)
	}

	pub fn get_mut(&mut self, handle: u16) -> Result<&mut HandleEntry, ApiError> {
		self.slots
			.get_mut(usize::from(handle))
			.and_then(Option::as_mut)
			.ok_or(ApiError::BadHandle)
	}

	pub fn active_handles(&self) -> usize {
		self.slots.iter().filter(|slot| slot.is_some()).count()
	}

	/// Registers a class/type filter with its receiver; the handle is the
	/// table index. Duplicate registrations of the same class and type on
	/// the same interface are rejected.
	pub fn access_type(
		&mut self,
		class: IfClass,
		filter: TypeFilter,
		nic: NicId,
		receiver: Box<dyn PacketReceiver>,
	) -> Result<u16, ApiError> {
		let duplicate = self.slots.iter().flatten().any(|entry| {
			entry.nic == nic && entry.class == class && entry.filter == filter
		});
		if duplicate {
			return Err(ApiError::TypeInUse);
		}

		let Some(index) = self.slots.iter().position(Option::is_none) else {
			return Err(ApiError::NoSpace);
		};
		self.slots[index] = Some(HandleEntry {
			class,
			filter,
			mode: ReceiveMode::Broadcast,
			nic,
			receiver,
			stats: HandleStats::new(),
		});
		Ok(index as u16)
	}

	/// Unhooks a registration. Frames already in flight for it are
	/// counted and discarded by the classifier.
	pub fn release_type(&mut self, handle: u16) -> Result<(), ApiError> {
		let slot = self
			.slots
			.get_mut(usize::from(handle))
			.ok_or(ApiError::BadHandle)?;
		if slot.take().is_none() {
			return Err(ApiError::BadHandle);
		}
		Ok(())
	}

	pub fn release_all(&mut self) {
		for slot in &mut self.slots {
			*slot = None;
		}
	}

	/// First matching handle for `frame`, in allocation order.
	pub fn classify(
		&self,
		frame: &[u8],
		nic: NicId,
		ours: &MacAddr,
		multicast: &[MacAddr],
	) -> Option<u16> {
		let parsed = ParsedFrame::new(frame)?;
		self.slots.iter().enumerate().find_map(|(index, slot)| {
			let entry = slot.as_ref()?;
			(entry.nic == nic
				&& entry.class == parsed.class
				&& entry.filter.matches(parsed.type_field)
				&& entry.mode.accepts(&parsed.dest, ours, multicast))
			.then_some(index as u16)
		})
	}

	/// Runs the two-call convention for one frame.
	pub fn deliver(&mut self, handle: u16, frame: &[u8], copy: CopyFn) {
		let Ok(entry) = self.get_mut(handle) else {
			return;
		};
		let len = frame.len() as u16;
		match entry.receiver.request_buffer(handle, len) {
			None => entry.stats.count_no_buffer(),
			Some(buffer) => {
				let dst =
					unsafe { core::slice::from_raw_parts_mut(buffer.as_ptr(), frame.len()) };
				copy(dst, frame);
				entry.receiver.copy_complete(handle, buffer, len);
				entry.stats.count_delivered();
			}
		}
	}

	pub(crate) fn count_unmatched(&self) {
		let drops = &self.unmatched_drops;
		drops.store(drops.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);
	}
}

/// Link-layer fields the classifier needs.
struct ParsedFrame<'a> {
	dest: MacAddr,
	class: IfClass,
	type_field: &'a [u8],
}

impl<'a> ParsedFrame<'a> {
	fn new(frame: &'a [u8]) -> Option<Self> {
		if frame.len() < 14 {
			return None;
		}
		let mut dest = [0u8; 6];
		dest.copy_from_slice(&frame[..6]);
		let ethertype = u16::from_be_bytes([frame[12], frame[13]]);

		// Values below 0x600 are an 802.3 length; the type template then
		// matches the 802.2 header that follows.
		let (class, type_field) = if ethertype >= 0x0600 {
			(IfClass::Ethernet, &frame[12..14])
		} else {
			(IfClass::Ieee8023, &frame[14..])
		};

		Some(Self {
			dest: MacAddr(dest),
			class,
			type_field,
		})
	}
}

/// Validates an outgoing frame before it reaches the hardware.
pub fn validate_tx_frame(frame: &[u8]) -> Result<(), ApiError> {
	if frame.is_empty() || frame.len() > ETH_FRAME_MAX {
		return Err(ApiError::CantSend);
	}
	Ok(())
}

/// Register file of an API call, as the interrupt stub captured it.
#[derive(Clone, Copy, Default, Debug)]
pub struct Regs {
	pub ax: u16,
	pub bx: u16,
	pub cx: u16,
	pub dx: u16,
	pub si: u16,
	pub di: u16,
	pub ds: u16,
	pub es: u16,
	pub carry: bool,
}

impl Regs {
	pub fn ah(&self) -> u8 {
		(self.ax >> 8) as u8
	}

	pub fn al(&self) -> u8 {
		self.ax as u8
	}

	pub fn dl(&self) -> u8 {
		self.dx as u8
	}

	pub fn ds_si(&self) -> FarPtr {
		FarPtr::new(self.ds, self.si)
	}

	pub fn es_di(&self) -> FarPtr {
		FarPtr::new(self.es, self.di)
	}

	/// Success: carry clear.
	pub fn ok(&mut self) {
		self.carry = false;
	}

	/// Failure: carry set, code in DH.
	pub fn fail(&mut self, err: ApiError) {
		self.carry = true;
		self.dx = (self.dx & 0x00ff) | (u16::from(err.code()) << 8);
	}
}

/// The client's address space, resolved by the host glue. On the real
/// host this is flat real-mode memory; tests provide an array-backed
/// implementation.
pub trait ClientMemory {
	fn read(&mut self, at: FarPtr, buf: &mut [u8]);
	fn write(&mut self, at: FarPtr, data: &[u8]);

	/// Physical address of a client buffer, for the DMA layer.
	fn phys(&self, at: FarPtr) -> crate::dma::PhysAddr {
		crate::dma::PhysAddr::new(at.linear())
	}
}

/// Turns a client's far-call receiver entry point into a
/// [`PacketReceiver`]; the far-call trampoline itself is host glue.
pub trait ReceiverBridge {
	fn bind(&mut self, entry: FarPtr) -> Box<dyn PacketReceiver>;
}

#[cfg(test)]
pub(crate) mod test_support {
	use alloc::rc::Rc;
	use alloc::vec::Vec;
	use core::cell::RefCell;
	use core::ptr::NonNull;

	use super::PacketReceiver;

	/// What one mock receiver observed.
	#[derive(Default)]
	pub struct ReceiverLog {
		pub delivered: Vec<(u16, Vec<u8>)>,
		pub refused: u32,
	}

	/// A scripted client receiver backed by a shared log.
	pub struct MockReceiver {
		pub log: Rc<RefCell<ReceiverLog>>,
		pub refuse: bool,
		buffer: Vec<u8>,
	}

	// Test-only: the single-threaded harness never sends it anywhere.
	unsafe impl Send for MockReceiver {}

	impl MockReceiver {
		pub fn new(log: Rc<RefCell<ReceiverLog>>) -> Self {
			Self {
				log,
				refuse: false,
				buffer: alloc::vec![0u8; 2048],
			}
		}

		pub fn refusing(log: Rc<RefCell<ReceiverLog>>) -> Self {
			Self {
				log,
				refuse: true,
				buffer: alloc::vec![0u8; 2048],
			}
		}
	}

	impl PacketReceiver for MockReceiver {
		fn request_buffer(&mut self, _handle: u16, len: u16) -> Option<NonNull<u8>> {
			if self.refuse || usize::from(len) > self.buffer.len() {
				self.log.borrow_mut().refused += 1;
				return None;
			}
			NonNull::new(self.buffer.as_mut_ptr())
		}

		fn copy_complete(&mut self, handle: u16, _buffer: NonNull<u8>, len: u16) {
			let data = self.buffer[..usize::from(len)].to_vec();
			self.log.borrow_mut().delivered.push((handle, data));
		}
	}
}
