//! The driver front end: install sequence, teardown, and the API entry
//! points the interrupt stubs call into.
//!
//! Install is a strict sequence of acquire steps, each paired with a
//! compensating entry in the unwind registry; any failure rolls the whole
//! thing back and leaves nothing resident. The API is gated by
//! `api_ready` until the last checkpoint passes, so a client racing the
//! still-installing driver sees `NotReady` instead of half-built state.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, Ordering};

use smallvec::SmallVec;
use thiserror::Error;

use crate::api::{
	self, ApiError, ClientMemory, DriverInfo, DriverParams, FuncCode, HandleTable, IfClass,
	PacketReceiver, ReceiverBridge, Regs, TypeFilter,
};
use crate::config::{
	BUFFERS_PER_NIC, DRIVER_NAME, DRIVER_VERSION, MAX_MULTICAST, MAX_NICS, PKTDRV_SPEC_VERSION,
	PKTDRV_VECTOR_FIRST, PKTDRV_VECTOR_LAST, RING_DEPTH,
};
use crate::cpu::CpuFeatures;
use crate::dispatch::{self, CopyFn, DispatchTable, SelectError};
use crate::dma::{DmaPool, PhysAddr, error::DmaError};
use crate::hal::{FarPtr, PortIo, VectorTable};
use crate::irq::{InterruptCore, IsrOutcome, MitigationPolicy, VectorHook, irq_to_vector};
use crate::nic::{
	FrameSink, MacAddr, Nic, NicDescriptor, NicId, ReceiveMode, error::NicError,
};
use crate::pic;
use crate::ring::BUF_SIZE;
use crate::stats::PktStatsBlock;
use crate::unwind::{UnwindAction, UnwindRegistry};

pub mod error {
	use super::*;

	#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
	pub enum InstallError {
		#[error("vector {0:#04x} is outside the packet driver range")]
		BadVector(u8),
		#[error("vector {0:#04x} is already hooked by someone else")]
		VectorInUse(u8),
		#[error("IRQ {0} cannot belong to a NIC")]
		BadIrq(u8),
		#[error("no controllers were handed over")]
		NoNics,
		#[error(transparent)]
		Select(#[from] SelectError),
		#[error("bounce pool: {0}")]
		Dma(#[from] DmaError),
		#[error("controller: {0}")]
		Nic(#[from] NicError),
	}

	#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
	pub enum TeardownError {
		/// A hooked vector could not be restored; the driver must stay
		/// resident.
		#[error("hooked vectors could not all be restored")]
		VectorsNotOurs,
	}
}

use self::error::{InstallError, TeardownError};

/// Everything the cold-path loader decides before handing control here.
#[derive(Clone, Copy, Debug)]
pub struct InstallConfig {
	/// CPU capability record from the probe.
	pub cpu: CpuFeatures,
	/// Software interrupt vector for the API, in the reserved range.
	pub vector: u8,
	/// Address of the API interrupt stub.
	pub stub: FarPtr,
	/// Address of the hardware interrupt stub.
	pub irq_stub: FarPtr,
	/// Placement of the bounce pool, low and chunk-aligned.
	pub bounce_pool_phys: PhysAddr,
	/// Operator consent to the global write-through configuration on
	/// tier-3 parts.
	pub write_through_consent: bool,
	/// Administrative batch-ceiling override (only ever lowers).
	pub batch_ceiling: Option<u8>,
}

/// The resident core.
#[derive(Debug)]
pub struct PacketDriver {
	table: DispatchTable,
	dma: DmaPool,
	nics: SmallVec<[Nic; MAX_NICS]>,
	handles: HandleTable,
	core: InterruptCore,
	unwind: UnwindRegistry,
	api_ready: AtomicBool,
	vector: u8,
	stub: FarPtr,
	irq_stub: FarPtr,
	/// Staging buffer for frames read out of client memory on the INT
	/// path; reserved at init, the send path never allocates.
	tx_scratch: Box<[u8]>,
}

/// Installs the resident core: hooks vectors, brings every controller to
/// `Running`, and only then opens the API gate.
pub fn install(
	config: InstallConfig,
	descriptors: &[NicDescriptor],
	io: &mut dyn PortIo,
	vectors: &mut dyn VectorTable,
) -> Result<PacketDriver, InstallError> {
	if !(PKTDRV_VECTOR_FIRST..=PKTDRV_VECTOR_LAST).contains(&config.vector) {
		return Err(InstallError::BadVector(config.vector));
	}
	if !vectors.get(config.vector).is_null() {
		return Err(InstallError::VectorInUse(config.vector));
	}
	if descriptors.is_empty() {
		return Err(InstallError::NoNics);
	}
	for desc in descriptors {
		if !pic::irq_permissible(desc.irq) {
			return Err(InstallError::BadIrq(desc.irq));
		}
	}

	let table = dispatch::select(&config.cpu, config.write_through_consent)?;
	let dma = DmaPool::new(config.bounce_pool_phys, table.coherency)?;
	let mut policy = MitigationPolicy::new(&table);
	if let Some(ceiling) = config.batch_ceiling {
		policy.set_ceiling(ceiling);
	}

	let mut driver = PacketDriver {
		table,
		dma,
		nics: SmallVec::new(),
		handles: HandleTable::new(),
		core: InterruptCore::new(policy),
		unwind: UnwindRegistry::new(),
		api_ready: AtomicBool::new(false),
		vector: config.vector,
		stub: config.stub,
		irq_stub: config.irq_stub,
		tx_scratch: alloc::vec![0u8; BUF_SIZE].into_boxed_slice(),
	};

	match driver.install_steps(&config, descriptors, io, vectors) {
		Ok(()) => {
			driver.api_ready.store(true, Ordering::Release);
			info!(
				"packet driver installed on vector {:#04x}, {} controller(s)",
				config.vector,
				driver.nics.len()
			);
			Ok(driver)
		}
		Err(err) => {
			error!("install failed ({err}), unwinding");
			driver.execute_unwind(io, vectors);
			Err(err)
		}
	}
}

impl PacketDriver {
	fn install_steps(
		&mut self,
		config: &InstallConfig,
		descriptors: &[NicDescriptor],
		io: &mut dyn PortIo,
		vectors: &mut dyn VectorTable,
	) -> Result<(), InstallError> {
		self.unwind.push(UnwindAction::ReleaseBouncePool);

		vectors.set(config.vector, config.stub);
		self.unwind.push(UnwindAction::RestoreVector {
			vector: config.vector,
			previous: FarPtr::NULL,
		});

		for desc in descriptors {
			let nic = Nic::new(desc)?;
			debug!(
				"nic {}: {:?} at {:#05x}, irq {}, mac {}",
				desc.id.0,
				desc.family,
				desc.io_base,
				desc.irq,
				nic.mac()
			);
			self.nics.push(nic);
			self.unwind.push(UnwindAction::ReleaseNic { nic: desc.id });
		}

		for irq in self.owned_irqs() {
			let vector = irq_to_vector(irq);
			let previous = vectors.get(vector);
			vectors.set(vector, config.irq_stub);
			self.core.add_hook(VectorHook {
				irq,
				vector,
				installed: config.irq_stub,
				previous,
			});
			self.unwind.push(UnwindAction::RestoreVector { vector, previous });
		}

		for index in 0..self.nics.len() {
			let PacketDriver {
				nics, table, dma, ..
			} = self;
			nics[index].start(io, table, dma)?;
			let id = nics[index].id();
			self.unwind.push(UnwindAction::StopNic { nic: id });
		}

		for irq in self.owned_irqs() {
			pic::unmask(io, irq);
			self.unwind.push(UnwindAction::MaskIrq { irq });
		}

		self.unwind.push(UnwindAction::RetractApi);
		Ok(())
	}

	fn owned_irqs(&self) -> SmallVec<[u8; MAX_NICS]> {
		let mut irqs: SmallVec<[u8; MAX_NICS]> = SmallVec::new();
		for nic in &self.nics {
			if !irqs.contains(&nic.irq()) {
				irqs.push(nic.irq());
			}
		}
		irqs
	}

	/// Pops and executes the unwind registry; returns how many actions
	/// failed (they are logged and skipped, never retried).
	fn execute_unwind(&mut self, io: &mut dyn PortIo, vectors: &mut dyn VectorTable) -> usize {
		let mut failures = 0;
		let PacketDriver {
			unwind,
			nics,
			dma,
			table,
			handles,
			api_ready,
			stub,
			irq_stub,
			..
		} = self;

		unwind.unwind(|action| match action {
			UnwindAction::RestoreVector { vector, previous } => {
				let current = vectors.get(vector);
				if current == *stub || current == *irq_stub {
					vectors.set(vector, previous);
					Ok(())
				} else {
					failures += 1;
					Err("vector no longer points at the driver")
				}
			}
			UnwindAction::MaskIrq { irq } => {
				pic::mask(io, irq);
				Ok(())
			}
			UnwindAction::StopNic { nic } => {
				match nics.iter_mut().find(|n| n.id() == nic) {
					Some(n) => {
						if n.stop(io, table, dma).is_err() {
							failures += 1;
							return Err("controller refused to stop");
						}
						Ok(())
					}
					None => {
						failures += 1;
						Err("unknown controller")
					}
				}
			}
			UnwindAction::ReleaseNic { nic } => {
				if let Some(n) = nics.iter_mut().find(|n| n.id() == nic) {
					n.release();
				}
				Ok(())
			}
			// The pool's memory goes back with the driver allocation.
			UnwindAction::ReleaseBouncePool => {
				trace!("bounce pool: {} buffers free at teardown", dma.free_bounces());
				Ok(())
			}
			UnwindAction::RetractApi => {
				api_ready.store(false, Ordering::Release);
				handles.release_all();
				Ok(())
			}
		});
		failures
	}

	/// Uninstall: close the gate, quiesce the hardware, run the unwind
	/// registry, and verify no vector still points at driver code. On
	/// `Err` the driver must stay resident.
	pub fn uninstall(
		&mut self,
		io: &mut dyn PortIo,
		vectors: &mut dyn VectorTable,
	) -> Result<(), TeardownError> {
		self.api_ready.store(false, Ordering::Release);
		for irq in self.owned_irqs() {
			pic::mask(io, irq);
		}
		{
			let PacketDriver {
				nics, table, dma, ..
			} = self;
			for nic in nics.iter_mut() {
				let _ = nic.stop(io, table, dma);
			}
		}

		let failures = self.execute_unwind(io, vectors);

		let mut still_ours = !vectors.get(self.vector).is_null()
			&& vectors.get(self.vector) == self.stub;
		for hook in self.core.hooks() {
			if vectors.get(hook.vector) == self.irq_stub {
				still_ours = true;
			}
		}
		if failures > 0 || still_ours {
			error!("teardown incomplete, refusing to become non-resident");
			return Err(TeardownError::VectorsNotOurs);
		}

		for nic in &mut self.nics {
			nic.release();
		}
		info!("packet driver uninstalled");
		Ok(())
	}

	pub fn api_ready(&self) -> bool {
		self.api_ready.load(Ordering::Acquire)
	}

	pub fn nics(&self) -> &[Nic] {
		&self.nics
	}

	fn ready(&self) -> Result<(), ApiError> {
		if self.api_ready() {
			Ok(())
		} else {
			Err(ApiError::NotReady)
		}
	}

	fn nic_by_id(&mut self, id: NicId) -> Result<&mut Nic, ApiError> {
		self.nics
			.iter_mut()
			.find(|n| n.id() == id)
			.ok_or(ApiError::BadHandle)
	}

	fn nic_for_number(&self, number: u8) -> Result<NicId, ApiError> {
		self.nics
			.get(usize::from(number))
			.map(Nic::id)
			.ok_or(ApiError::NoNumber)
	}

	// ----- the packet driver function set ------------------------------

	pub fn driver_info(&self) -> Result<DriverInfo, ApiError> {
		self.ready()?;
		Ok(DriverInfo {
			version: DRIVER_VERSION,
			class: IfClass::Ethernet,
			if_type: 0xffff,
			if_number: 0,
			name: DRIVER_NAME,
			functionality: 2,
		})
	}

	/// Registers a receiver for a class/type filter on one interface.
	/// The handle table mutation happens with every owned IRQ masked.
	pub fn access_type(
		&mut self,
		io: &mut dyn PortIo,
		if_number: u8,
		class: IfClass,
		filter: TypeFilter,
		receiver: Box<dyn PacketReceiver>,
	) -> Result<u16, ApiError> {
		self.ready()?;
		let nic = self.nic_for_number(if_number)?;
		self.with_irqs_masked(io, |driver| {
			driver.handles.access_type(class, filter, nic, receiver)
		})
	}

	pub fn release_type(&mut self, io: &mut dyn PortIo, handle: u16) -> Result<(), ApiError> {
		self.ready()?;
		self.with_irqs_masked(io, |driver| driver.handles.release_type(handle))
	}

	/// Synchronous transmit. The frame may get its source address
	/// rewritten in place; the hardware hand-off goes through the DMA
	/// layer on the bus-master families.
	pub fn send_packet(
		&mut self,
		io: &mut dyn PortIo,
		handle: u16,
		frame: &mut [u8],
		frame_phys: PhysAddr,
	) -> Result<(), ApiError> {
		self.ready()?;
		api::validate_tx_frame(frame)?;
		let nic_id = self.handles.get(handle)?.nic;

		let PacketDriver {
			nics,
			table,
			dma,
			handles,
			..
		} = self;
		let nic = nics
			.iter_mut()
			.find(|n| n.id() == nic_id)
			.ok_or(ApiError::BadHandle)?;

		let irq = nic.irq();
		pic::mask(io, irq);
		let result = nic.submit_tx_frame(io, table, dma, frame, frame_phys);
		pic::unmask(io, irq);

		match result {
			Ok(()) => {
				handles.get(handle)?.stats.count_submitted();
				Ok(())
			}
			Err(err) => {
				debug!("send on handle {handle} failed: {err}");
				Err(ApiError::CantSend)
			}
		}
	}

	/// Releases the caller's handle; refuses while other clients still
	/// hold registrations.
	pub fn terminate(&mut self, io: &mut dyn PortIo, handle: u16) -> Result<(), ApiError> {
		self.ready()?;
		self.handles.get(handle)?;
		if self.handles.active_handles() > 1 {
			return Err(ApiError::CantTerminate);
		}
		self.with_irqs_masked(io, |driver| driver.handles.release_type(handle))
	}

	pub fn get_address(&self, handle: u16) -> Result<MacAddr, ApiError> {
		self.ready()?;
		let nic = self.handles.get(handle)?.nic;
		self.nics
			.iter()
			.find(|n| n.id() == nic)
			.map(|n| n.mac())
			.ok_or(ApiError::BadHandle)
	}

	/// Resets the interface below `handle`. Client-observable state (MAC,
	/// filters, running) survives; counters are cleared.
	pub fn reset_interface(&mut self, io: &mut dyn PortIo, handle: u16) -> Result<(), ApiError> {
		self.ready()?;
		let nic_id = self.handles.get(handle)?.nic;
		let PacketDriver {
			nics, table, dma, ..
		} = self;
		let nic = nics
			.iter_mut()
			.find(|n| n.id() == nic_id)
			.ok_or(ApiError::BadHandle)?;

		let irq = nic.irq();
		pic::mask(io, irq);
		let result = nic.reset(io, table, dma);
		pic::unmask(io, irq);
		result.map_err(|err| {
			warn!("reset of nic {} failed: {err}", nic_id.0);
			ApiError::CantReset
		})
	}

	pub fn set_receive_mode(
		&mut self,
		io: &mut dyn PortIo,
		handle: u16,
		mode: ReceiveMode,
	) -> Result<(), ApiError> {
		self.ready()?;
		let nic_id = self.handles.get(handle)?.nic;
		self.nic_by_id(nic_id)?
			.set_receive_mode(io, mode)
			.map_err(|_| ApiError::BadMode)?;
		self.handles.get_mut(handle)?.mode = mode;
		Ok(())
	}

	pub fn get_receive_mode(&self, handle: u16) -> Result<ReceiveMode, ApiError> {
		self.ready()?;
		Ok(self.handles.get(handle)?.mode)
	}

	pub fn set_multicast_list(
		&mut self,
		io: &mut dyn PortIo,
		handle: u16,
		list: &[MacAddr],
	) -> Result<(), ApiError> {
		self.ready()?;
		let nic_id = self.handles.get(handle)?.nic;
		self.nic_by_id(nic_id)?
			.set_multicast_list(io, list)
			.map_err(|_| ApiError::NoMulticast)
	}

	pub fn get_multicast_list(
		&self,
		handle: u16,
	) -> Result<heapless::Vec<MacAddr, MAX_MULTICAST>, ApiError> {
		self.ready()?;
		let nic_id = self.handles.get(handle)?.nic;
		let nic = self
			.nics
			.iter()
			.find(|n| n.id() == nic_id)
			.ok_or(ApiError::BadHandle)?;
		Ok(heapless::Vec::from_slice(nic.multicast_list()).unwrap_or_default())
	}

	/// The seven-dword ABI statistics block. The NIC's IRQ is masked for
	/// the duration of the snapshot so no counter pair tears.
	pub fn get_statistics(
		&mut self,
		io: &mut dyn PortIo,
		handle: u16,
	) -> Result<PktStatsBlock, ApiError> {
		self.ready()?;
		let nic_id = self.handles.get(handle)?.nic;
		let dropped = self
			.handles
			.get(handle)?
			.stats
			.snapshot()
			.rx_dropped_no_buffer;
		let nic = self
			.nics
			.iter()
			.find(|n| n.id() == nic_id)
			.ok_or(ApiError::BadHandle)?;

		pic::mask(io, nic.irq());
		let snapshot = nic.stats().snapshot();
		pic::unmask(io, nic.irq());

		Ok(PktStatsBlock::from_nic(&snapshot, dropped))
	}

	pub fn set_address(
		&mut self,
		io: &mut dyn PortIo,
		handle: u16,
		mac: MacAddr,
	) -> Result<(), ApiError> {
		self.ready()?;
		let nic_id = self.handles.get(handle)?.nic;
		self.nic_by_id(nic_id)?
			.set_mac(io, mac)
			.map_err(|_| ApiError::CantSet)
	}

	pub fn get_parameters(&self) -> Result<DriverParams, ApiError> {
		self.ready()?;
		Ok(DriverParams {
			major_rev: (PKTDRV_SPEC_VERSION >> 8) as u8,
			minor_rev: PKTDRV_SPEC_VERSION as u8,
			length: 14,
			addr_len: 6,
			mtu: crate::config::ETH_FRAME_MAX as u16,
			multicast_avail: MAX_MULTICAST as u16,
			rcv_bufs: (BUFFERS_PER_NIC - 1) as u16,
			xmt_bufs: (RING_DEPTH - 1) as u16,
			int_num: u16::from(self.vector),
		})
	}

	// ----- interrupt-time and deferred entry points --------------------

	/// The ISR body; called by the hardware interrupt stub.
	pub fn isr_entry(
		&mut self,
		io: &mut dyn PortIo,
		vectors: &mut dyn VectorTable,
		irq: u8,
	) -> IsrOutcome {
		let PacketDriver {
			core,
			nics,
			handles,
			table,
			dma,
			..
		} = self;
		let mut classifier = Classifier::snapshot(handles, table.copy, nics);
		core.service(io, vectors, irq, nics, table, dma, &mut classifier)
	}

	/// Deferred work marked by the ISR: leftover drain budget and
	/// statistics harvests. Called from non-ISR context (API entry); the
	/// controller's IRQ is masked around every touch of its registers.
	pub fn poll_deferred(&mut self, io: &mut dyn PortIo) {
		let PacketDriver {
			core,
			nics,
			handles,
			table,
			dma,
			..
		} = self;

		for index in 0..nics.len() {
			let id = nics[index].id();
			let pending = core.policy.take_work_pending(id);
			let stats = core.policy.take_stats_deferred(id);
			if !pending && !stats {
				continue;
			}

			let irq = nics[index].irq();
			pic::mask(io, irq);
			if stats {
				nics[index].harvest_stats(io);
			}
			if pending {
				let mut classifier = Classifier::snapshot(handles, table.copy, nics);
				let budget = core.policy.ceiling();
				let drained = nics[index].drain_rx_until_empty(
					io,
					table,
					dma,
					&mut classifier,
					budget,
				);
				if drained >= budget {
					core.policy.mark_work_pending(id);
				}
			}
			pic::unmask(io, irq);
		}
	}

	fn with_irqs_masked<R>(
		&mut self,
		io: &mut dyn PortIo,
		f: impl FnOnce(&mut Self) -> Result<R, ApiError>,
	) -> Result<R, ApiError> {
		let irqs = self.owned_irqs();
		for irq in &irqs {
			pic::mask(io, *irq);
		}
		let result = f(self);
		for irq in &irqs {
			pic::unmask(io, *irq);
		}
		result
	}

	// ----- register-level entry (the INT stub) -------------------------

	/// Dispatches one API software interrupt: function number in AH,
	/// carry + DH as the error channel, everything else per the
	/// register conventions of the specification.
	pub fn handle_api_int(
		&mut self,
		io: &mut dyn PortIo,
		regs: &mut Regs,
		client: &mut dyn ClientMemory,
		bridge: &mut dyn ReceiverBridge,
	) {
		let Ok(func) = FuncCode::try_from(regs.ah()) else {
			regs.fail(ApiError::BadCommand);
			return;
		};

		// Every call is also the hook for deferred ISR leftovers.
		if self.api_ready() {
			self.poll_deferred(io);
		}

		let result = self.dispatch_function(func, io, regs, client, bridge);
		match result {
			Ok(()) => regs.ok(),
			Err(err) => regs.fail(err),
		}
	}

	fn dispatch_function(
		&mut self,
		func: FuncCode,
		io: &mut dyn PortIo,
		regs: &mut Regs,
		client: &mut dyn ClientMemory,
		bridge: &mut dyn ReceiverBridge,
	) -> Result<(), ApiError> {
		match func {
			FuncCode::DriverInfo => {
				let info = self.driver_info()?;
				regs.bx = info.version;
				regs.cx = (u16::from(info.class as u8) << 8) | u16::from(info.if_number);
				regs.dx = info.if_type;
				regs.ax = (regs.ax & 0xff00) | u16::from(info.functionality);
				Ok(())
			}
			FuncCode::AccessType => {
				let class =
					IfClass::try_from(regs.al()).map_err(|_| ApiError::NoClass)?;
				let mut template = [0u8; crate::config::MAX_TYPE_LEN];
				let len = usize::from(regs.cx);
				if len > template.len() {
					return Err(ApiError::BadType);
				}
				client.read(regs.ds_si(), &mut template[..len]);
				let filter = TypeFilter::new(&template[..len])?;
				let receiver = bridge.bind(regs.es_di());
				let handle = self.access_type(io, regs.dl(), class, filter, receiver)?;
				regs.ax = handle;
				Ok(())
			}
			FuncCode::ReleaseType => self.release_type(io, regs.bx),
			FuncCode::SendPkt => {
				let len = usize::from(regs.cx);
				if len == 0 || len > self.tx_scratch.len() {
					return Err(ApiError::CantSend);
				}
				let mut scratch = core::mem::take(&mut self.tx_scratch);
				client.read(regs.ds_si(), &mut scratch[..len]);
				let phys = client.phys(regs.ds_si());
				let result = self.send_packet(io, regs.bx, &mut scratch[..len], phys);
				self.tx_scratch = scratch;
				result
			}
			FuncCode::Terminate => self.terminate(io, regs.bx),
			FuncCode::GetAddress => {
				if usize::from(regs.cx) < 6 {
					return Err(ApiError::BadAddress);
				}
				let mac = self.get_address(regs.bx)?;
				client.write(regs.es_di(), &mac.0);
				regs.cx = 6;
				Ok(())
			}
			FuncCode::ResetInterface => self.reset_interface(io, regs.bx),
			FuncCode::GetParameters => {
				let params = self.get_parameters()?;
				client.write(regs.es_di(), &params.to_bytes());
				Ok(())
			}
			FuncCode::SetRcvMode => {
				let mode = u8::try_from(regs.cx)
					.ok()
					.and_then(|m| ReceiveMode::try_from(m).ok())
					.ok_or(ApiError::BadMode)?;
				self.set_receive_mode(io, regs.bx, mode)
			}
			FuncCode::GetRcvMode => {
				regs.ax = u16::from(self.get_receive_mode(regs.bx)? as u8);
				Ok(())
			}
			FuncCode::SetMulticastList => {
				let len = usize::from(regs.cx);
				if len % 6 != 0 || len / 6 > MAX_MULTICAST {
					return Err(ApiError::NoMulticast);
				}
				let mut raw = [0u8; MAX_MULTICAST * 6];
				client.read(regs.es_di(), &mut raw[..len]);
				let mut list: SmallVec<[MacAddr; MAX_MULTICAST]> = SmallVec::new();
				for chunk in raw[..len].chunks_exact(6) {
					let mut mac = [0u8; 6];
					mac.copy_from_slice(chunk);
					list.push(MacAddr(mac));
				}
				self.set_multicast_list(io, regs.bx, &list)
			}
			FuncCode::GetMulticastList => {
				let list = self.get_multicast_list(regs.bx)?;
				let mut raw = [0u8; MAX_MULTICAST * 6];
				for (chunk, mac) in raw.chunks_exact_mut(6).zip(&list) {
					chunk.copy_from_slice(&mac.0);
				}
				client.write(regs.es_di(), &raw[..list.len() * 6]);
				regs.cx = (list.len() * 6) as u16;
				Ok(())
			}
			FuncCode::GetStatistics => {
				let block = self.get_statistics(io, regs.bx)?;
				let mut raw = [0u8; 28];
				for (chunk, dword) in raw.chunks_exact_mut(4).zip(block.as_dwords()) {
					chunk.copy_from_slice(&dword.to_le_bytes());
				}
				client.write(regs.ds_si(), &raw);
				Ok(())
			}
			FuncCode::SetAddress => {
				if usize::from(regs.cx) != 6 {
					return Err(ApiError::BadAddress);
				}
				let mut mac = [0u8; 6];
				client.read(regs.es_di(), &mut mac);
				self.set_address(io, regs.bx, MacAddr(mac))?;
				regs.cx = 6;
				Ok(())
			}
		}
	}
}

/// The receive classifier: snapshots per-NIC addressing state, then fans
/// drained frames out to the first matching handle.
struct Classifier<'a> {
	handles: &'a mut HandleTable,
	copy: CopyFn,
	nic_info: SmallVec<[(NicId, MacAddr, heapless::Vec<MacAddr, MAX_MULTICAST>); MAX_NICS]>,
}

impl<'a> Classifier<'a> {
	fn snapshot(handles: &'a mut HandleTable, copy: CopyFn, nics: &[Nic]) -> Self {
		let nic_info = nics
			.iter()
			.map(|nic| {
				(
					nic.id(),
					nic.mac(),
					heapless::Vec::from_slice(nic.multicast_list()).unwrap_or_default(),
				)
			})
			.collect();
		Self {
			handles,
			copy,
			nic_info,
		}
	}
}

impl FrameSink for Classifier<'_> {
	fn frame(&mut self, nic: NicId, frame: &[u8]) {
		let Some((_, mac, multicast)) = self.nic_info.iter().find(|(id, ..)| *id == nic) else {
			return;
		};
		match self.handles.classify(frame, nic, mac, multicast) {
			Some(handle) => self.handles.deliver(handle, frame, self.copy),
			None => self.handles.count_unmatched(),
		}
	}
}

#[cfg(test)]
mod tests {
	use alloc::rc::Rc;
	use alloc::vec::Vec;
	use core::cell::RefCell;

	use super::*;
	use crate::api::test_support::{MockReceiver, ReceiverLog};
	use crate::cpu::CpuGeneration;
	use crate::hal::testing::{MockBus, MockIvt};
	use crate::nic::{IntStatus, NicFamily, NicState, regs as nic_regs};

	const BASE: u16 = 0x300;
	const IRQ: u8 = 10;
	const STUB: FarPtr = FarPtr::new(0xc800, 0x0004);
	const IRQ_STUB: FarPtr = FarPtr::new(0xc800, 0x0104);
	const PREV_IRQ_HANDLER: FarPtr = FarPtr::new(0xf000, 0xe987);

	fn config() -> InstallConfig {
		InstallConfig {
			cpu: CpuFeatures::for_generation(CpuGeneration::Cpu286),
			vector: 0x60,
			stub: STUB,
			irq_stub: IRQ_STUB,
			bounce_pool_phys: PhysAddr::new(0x8000),
			write_through_consent: false,
			batch_ceiling: None,
		}
	}

	fn pio_desc() -> NicDescriptor {
		NicDescriptor {
			id: NicId(0),
			io_base: BASE,
			irq: IRQ,
			family: NicFamily::PioClassic,
			mac: MacAddr([0x00, 0xa0, 0x24, 0x11, 0x22, 0x33]),
			tx_ring_phys: PhysAddr::new(0),
			rx_ring_phys: PhysAddr::new(0),
			buffer_pool_phys: PhysAddr::new(0x4_0000),
			pci_bus_master_enabled: false,
			pci_io_enabled: false,
		}
	}

	fn installed() -> (PacketDriver, MockBus, MockIvt) {
		let mut bus = MockBus::new();
		let mut ivt = MockIvt::new();
		ivt.set(irq_to_vector(IRQ), PREV_IRQ_HANDLER);
		let driver = install(config(), &[pio_desc()], &mut bus, &mut ivt).unwrap();
		(driver, bus, ivt)
	}

	fn register_match_all(
		driver: &mut PacketDriver,
		bus: &mut MockBus,
	) -> (u16, Rc<RefCell<ReceiverLog>>) {
		let log = Rc::new(RefCell::new(ReceiverLog::default()));
		let handle = driver
			.access_type(
				bus,
				0,
				IfClass::Ethernet,
				TypeFilter::match_all(),
				Box::new(MockReceiver::new(log.clone())),
			)
			.unwrap();
		(handle, log)
	}

	/// Queues a full PIO receive (status word plus FIFO contents) on the
	/// scripted bus.
	fn script_rx_frame(bus: &mut MockBus, frame: &[u8]) {
		bus.push_read(
			BASE + nic_regs::STATUS,
			u32::from(0x2000 | (IntStatus::INT_LATCH | IntStatus::RX_COMPLETE).bits()),
		);
		bus.push_read(BASE + nic_regs::W1_RX_STATUS, frame.len() as u32);
		bus.push_read(BASE + nic_regs::W1_RX_STATUS, 0x8000);
		for chunk in frame.chunks(2) {
			let lo = u32::from(chunk[0]);
			let hi = chunk.get(1).copied().map(u32::from).unwrap_or(0) << 8;
			bus.push_read(BASE + nic_regs::W1_RX_FIFO, lo | hi);
		}
	}

	fn broadcast_frame(ethertype: u16, total_len: usize) -> Vec<u8> {
		let mut frame = Vec::new();
		frame.extend_from_slice(&[0xff; 6]);
		frame.extend_from_slice(&[0x00, 0xa0, 0x24, 0x44, 0x55, 0x66]);
		frame.extend_from_slice(&ethertype.to_be_bytes());
		frame.resize(total_len, 0);
		frame
	}

	#[test]
	fn install_brings_the_driver_up() {
		let (driver, mut bus, ivt) = installed();

		assert!(driver.api_ready());
		assert_eq!(driver.nics()[0].state(), NicState::Running);
		assert_eq!(ivt.get(0x60), STUB);
		assert_eq!(ivt.get(irq_to_vector(IRQ)), IRQ_STUB);
		// IRQ 10 was unmasked at the slave PIC.
		assert!(!pic::is_masked(&mut bus, IRQ));
	}

	#[test]
	fn install_rejects_bad_vector_and_busy_vector() {
		let mut bus = MockBus::new();
		let mut ivt = MockIvt::new();

		let mut cfg = config();
		cfg.vector = 0x21;
		assert_eq!(
			install(cfg, &[pio_desc()], &mut bus, &mut ivt).unwrap_err(),
			InstallError::BadVector(0x21)
		);

		ivt.set(0x60, FarPtr::new(0x1234, 0x5678));
		assert_eq!(
			install(config(), &[pio_desc()], &mut bus, &mut ivt).unwrap_err(),
			InstallError::VectorInUse(0x60)
		);
		// Nothing was left behind.
		assert_eq!(ivt.get(irq_to_vector(IRQ)), FarPtr::NULL);
	}

	#[test]
	fn install_rejects_forbidden_irqs() {
		for irq in [0, 1, 2, 6, 8, 13, 14] {
			let mut bus = MockBus::new();
			let mut ivt = MockIvt::new();
			let mut desc = pio_desc();
			desc.irq = irq;
			assert_eq!(
				install(config(), &[desc], &mut bus, &mut ivt).unwrap_err(),
				InstallError::BadIrq(irq)
			);
			assert_eq!(ivt.get(0x60), FarPtr::NULL);
		}
	}

	#[test]
	fn failed_install_unwinds_completely() {
		let mut bus = MockBus::new();
		let mut ivt = MockIvt::new();
		ivt.set(irq_to_vector(IRQ), PREV_IRQ_HANDLER);

		// Second controller's upload ring straddles a 64 KiB boundary;
		// its construction fails after the first one already started.
		let mut bad = pio_desc();
		bad.id = NicId(1);
		bad.io_base = 0x320;
		bad.family = NicFamily::BusMasterIsa;
		bad.tx_ring_phys = PhysAddr::new(0x1_0000);
		bad.rx_ring_phys = PhysAddr::new(0x1_fff0);
		bad.buffer_pool_phys = PhysAddr::new(0x6_0000);

		let err = install(config(), &[pio_desc(), bad], &mut bus, &mut ivt).unwrap_err();
		assert!(matches!(err, InstallError::Nic(_)));

		// Both hooks rolled back, nothing resident.
		assert_eq!(ivt.get(0x60), FarPtr::NULL);
		assert_eq!(ivt.get(irq_to_vector(IRQ)), PREV_IRQ_HANDLER);
	}

	#[test]
	fn api_gate_blocks_until_ready() {
		let (mut driver, mut bus, _ivt) = installed();
		driver.api_ready.store(false, Ordering::Release);

		let log = Rc::new(RefCell::new(ReceiverLog::default()));
		let err = driver
			.access_type(
				&mut bus,
				0,
				IfClass::Ethernet,
				TypeFilter::match_all(),
				Box::new(MockReceiver::new(log)),
			)
			.unwrap_err();
		assert_eq!(err, ApiError::NotReady);
		assert_eq!(driver.driver_info().unwrap_err(), ApiError::NotReady);
	}

	#[test]
	fn scenario_single_nic_pio_receive() {
		let (mut driver, mut bus, mut ivt) = installed();
		let (handle, log) = register_match_all(&mut driver, &mut bus);
		assert_eq!(handle, 0);

		// A 64-byte ARP broadcast arrives and raises IRQ 10.
		let frame = broadcast_frame(0x0806, 64);
		script_rx_frame(&mut bus, &frame);
		let outcome = driver.isr_entry(&mut bus, &mut ivt, IRQ);

		assert_eq!(
			outcome,
			IsrOutcome::Serviced {
				rx_frames: 1,
				tx_reaped: 0
			}
		);
		let delivered = &log.borrow().delivered;
		assert_eq!(delivered.len(), 1);
		assert_eq!(delivered[0], (handle, frame));

		let stats = driver.nics()[0].stats().snapshot();
		assert_eq!(stats.rx_frames, 1);
		assert_eq!(stats.rx_bytes, 64);
	}

	#[test]
	fn scenario_duplicate_type_registration() {
		let (mut driver, mut bus, _ivt) = installed();
		let (first, _log) = register_match_all(&mut driver, &mut bus);
		assert_eq!(first, 0);

		let log = Rc::new(RefCell::new(ReceiverLog::default()));
		let second = driver
			.access_type(
				&mut bus,
				0,
				IfClass::Ethernet,
				TypeFilter::new(&[0x08, 0x00]).unwrap(),
				Box::new(MockReceiver::new(log.clone())),
			)
			.unwrap();
		assert_eq!(second, 1);

		let err = driver
			.access_type(
				&mut bus,
				0,
				IfClass::Ethernet,
				TypeFilter::new(&[0x08, 0x00]).unwrap(),
				Box::new(MockReceiver::new(log)),
			)
			.unwrap_err();
		assert_eq!(err, ApiError::TypeInUse);
		assert_eq!(driver.handles.active_handles(), 2);
	}

	#[test]
	fn unmatched_frames_are_counted_and_discarded() {
		let (mut driver, mut bus, mut ivt) = installed();
		let log = Rc::new(RefCell::new(ReceiverLog::default()));
		let handle = driver
			.access_type(
				&mut bus,
				0,
				IfClass::Ethernet,
				TypeFilter::new(&[0x08, 0x00]).unwrap(),
				Box::new(MockReceiver::new(log.clone())),
			)
			.unwrap();
		driver.release_type(&mut bus, handle).unwrap();

		// A late frame for the released registration.
		script_rx_frame(&mut bus, &broadcast_frame(0x0800, 64));
		driver.isr_entry(&mut bus, &mut ivt, IRQ);

		assert!(log.borrow().delivered.is_empty());
		assert_eq!(driver.handles.unmatched_drops.load(Ordering::Relaxed), 1);
	}

	#[test]
	fn send_packet_reaches_the_fifo_and_counts() {
		let (mut driver, mut bus, _ivt) = installed();
		let (handle, _log) = register_match_all(&mut driver, &mut bus);

		bus.push_read(BASE + nic_regs::W1_TX_FREE, 0x600);
		let mut frame = broadcast_frame(0x0800, 60);
		driver
			.send_packet(&mut bus, handle, &mut frame, PhysAddr::new(0x2_0000))
			.unwrap();

		let fifo = bus.writes_to(BASE + nic_regs::W1_TX_FIFO);
		assert_eq!(fifo[0], 60);
		assert_eq!(
			driver
				.handles
				.get(handle)
				.unwrap()
				.stats
				.snapshot()
				.tx_submitted,
			1
		);
	}

	#[test]
	fn send_packet_length_bounds() {
		let (mut driver, mut bus, _ivt) = installed();
		let (handle, _log) = register_match_all(&mut driver, &mut bus);

		let mut empty = [0u8; 0];
		assert_eq!(
			driver.send_packet(&mut bus, handle, &mut empty, PhysAddr::new(0x2_0000)),
			Err(ApiError::CantSend)
		);

		let mut oversize = alloc::vec![0u8; 1515];
		assert_eq!(
			driver.send_packet(&mut bus, handle, &mut oversize, PhysAddr::new(0x2_0000)),
			Err(ApiError::CantSend)
		);

		assert_eq!(
			driver.send_packet(&mut bus, 99, &mut [0u8; 60], PhysAddr::new(0x2_0000)),
			Err(ApiError::BadHandle)
		);
	}

	#[test]
	fn receive_mode_round_trip() {
		let (mut driver, mut bus, _ivt) = installed();
		let (handle, _log) = register_match_all(&mut driver, &mut bus);

		driver
			.set_receive_mode(&mut bus, handle, ReceiveMode::Promiscuous)
			.unwrap();
		assert_eq!(
			driver.get_receive_mode(handle).unwrap(),
			ReceiveMode::Promiscuous
		);

		// The hardware filter followed.
		assert!(
			bus.writes_to(BASE + nic_regs::CMD)
				.contains(&u32::from(nic_regs::SET_RX_FILTER | 0x0f))
		);
	}

	#[test]
	fn reset_preserves_observables_and_clears_counters() {
		let (mut driver, mut bus, mut ivt) = installed();
		let (handle, _log) = register_match_all(&mut driver, &mut bus);

		script_rx_frame(&mut bus, &broadcast_frame(0x0800, 64));
		driver.isr_entry(&mut bus, &mut ivt, IRQ);
		assert_eq!(driver.nics()[0].stats().snapshot().rx_frames, 1);

		let mac_before = driver.get_address(handle).unwrap();
		driver.reset_interface(&mut bus, handle).unwrap();

		assert_eq!(driver.nics()[0].state(), NicState::Running);
		assert_eq!(driver.get_address(handle).unwrap(), mac_before);
		assert_eq!(driver.nics()[0].stats().snapshot().rx_frames, 0);
	}

	#[test]
	fn statistics_snapshot_masks_the_irq() {
		let (mut driver, mut bus, mut ivt) = installed();
		let (handle, _log) = register_match_all(&mut driver, &mut bus);

		script_rx_frame(&mut bus, &broadcast_frame(0x0800, 64));
		driver.isr_entry(&mut bus, &mut ivt, IRQ);

		bus.log.clear();
		let block = driver.get_statistics(&mut bus, handle).unwrap();
		assert_eq!(block.packets_in, 1);
		assert_eq!(block.bytes_in, 64);

		// IRQ 10 lives on the slave PIC: mask write then unmask write.
		let masks = bus.writes_to(0xa1);
		assert_eq!(masks.len(), 2);
		assert!(masks[0] & (1 << 2) != 0);
		assert!(masks[1] & (1 << 2) == 0);
	}

	#[test]
	fn multicast_list_round_trip() {
		let (mut driver, mut bus, _ivt) = installed();
		let (handle, _log) = register_match_all(&mut driver, &mut bus);

		let list = [
			MacAddr([0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]),
			MacAddr([0x01, 0x00, 0x5e, 0x00, 0x00, 0x02]),
		];
		driver.set_multicast_list(&mut bus, handle, &list).unwrap();
		assert_eq!(driver.get_multicast_list(handle).unwrap().as_slice(), &list);
	}

	#[test]
	fn terminate_refuses_while_other_clients_exist() {
		let (mut driver, mut bus, _ivt) = installed();
		let (first, _log1) = register_match_all(&mut driver, &mut bus);
		let log2 = Rc::new(RefCell::new(ReceiverLog::default()));
		let second = driver
			.access_type(
				&mut bus,
				0,
				IfClass::Ethernet,
				TypeFilter::new(&[0x08, 0x06]).unwrap(),
				Box::new(MockReceiver::new(log2)),
			)
			.unwrap();

		assert_eq!(
			driver.terminate(&mut bus, first).unwrap_err(),
			ApiError::CantTerminate
		);
		driver.release_type(&mut bus, second).unwrap();
		driver.terminate(&mut bus, first).unwrap();
		assert_eq!(driver.handles.active_handles(), 0);
	}

	#[test]
	fn uninstall_restores_the_world() {
		let (mut driver, mut bus, mut ivt) = installed();
		driver.uninstall(&mut bus, &mut ivt).unwrap();

		assert!(!driver.api_ready());
		assert_eq!(ivt.get(0x60), FarPtr::NULL);
		assert_eq!(ivt.get(irq_to_vector(IRQ)), PREV_IRQ_HANDLER);
		assert_eq!(driver.nics()[0].state(), NicState::Uninitialized);
		assert!(pic::is_masked(&mut bus, IRQ));
	}

	#[test]
	fn uninstall_refuses_when_a_vector_was_stolen() {
		let (mut driver, mut bus, mut ivt) = installed();
		ivt.set(irq_to_vector(IRQ), FarPtr::new(0xdead, 0xbeef));

		assert_eq!(
			driver.uninstall(&mut bus, &mut ivt).unwrap_err(),
			TeardownError::VectorsNotOurs
		);
		// The foreign handler was left alone.
		assert_eq!(ivt.get(irq_to_vector(IRQ)), FarPtr::new(0xdead, 0xbeef));
	}

	#[test]
	fn int_dispatch_runs_access_type_and_send() {
		let (mut driver, mut bus, _ivt) = installed();

		struct FlatMem(Vec<u8>);
		impl ClientMemory for FlatMem {
			fn read(&mut self, at: FarPtr, buf: &mut [u8]) {
				let a = at.linear() as usize;
				buf.copy_from_slice(&self.0[a..a + buf.len()]);
			}
			fn write(&mut self, at: FarPtr, data: &[u8]) {
				let a = at.linear() as usize;
				self.0[a..a + data.len()].copy_from_slice(data);
			}
		}

		struct Bridge(Rc<RefCell<ReceiverLog>>);
		impl ReceiverBridge for Bridge {
			fn bind(&mut self, _entry: FarPtr) -> Box<dyn PacketReceiver> {
				Box::new(MockReceiver::new(self.0.clone()))
			}
		}

		let mut mem = FlatMem(alloc::vec![0u8; 0x2_0000]);
		let log = Rc::new(RefCell::new(ReceiverLog::default()));
		let mut bridge = Bridge(log);

		// access_type: AH=2, AL=class, CX=filter len, DS:SI=template.
		mem.write(FarPtr::new(0x1000, 0), &[0x08, 0x00]);
		let mut regs = Regs {
			ax: 0x0201,
			cx: 2,
			ds: 0x1000,
			si: 0,
			es: 0x2000,
			di: 0x0010,
			..Regs::default()
		};
		driver.handle_api_int(&mut bus, &mut regs, &mut mem, &mut bridge);
		assert!(!regs.carry);
		let handle = regs.ax;

		// send_pkt: AH=4, BX=handle, CX=len, DS:SI=frame.
		bus.push_read(BASE + nic_regs::W1_TX_FREE, 0x600);
		mem.write(FarPtr::new(0x1100, 0), &broadcast_frame(0x0800, 60));
		let mut regs = Regs {
			ax: 0x0400,
			bx: handle,
			cx: 60,
			ds: 0x1100,
			si: 0,
			..Regs::default()
		};
		driver.handle_api_int(&mut bus, &mut regs, &mut mem, &mut bridge);
		assert!(!regs.carry);

		// get_address: AH=6, CX=buffer len, ES:DI=destination.
		let mut regs = Regs {
			ax: 0x0600,
			bx: handle,
			cx: 6,
			es: 0x1200,
			di: 0,
			..Regs::default()
		};
		driver.handle_api_int(&mut bus, &mut regs, &mut mem, &mut bridge);
		assert!(!regs.carry);
		let mut mac = [0u8; 6];
		mem.read(FarPtr::new(0x1200, 0), &mut mac);
		assert_eq!(MacAddr(mac), driver.get_address(handle).unwrap());

		// An unknown function number is a bad command.
		let mut regs = Regs {
			ax: 0x7f00,
			..Regs::default()
		};
		driver.handle_api_int(&mut bus, &mut regs, &mut mem, &mut bridge);
		assert!(regs.carry);
		assert_eq!(regs.dx >> 8, u16::from(ApiError::BadCommand.code()));
	}

	#[test]
	fn deferred_rx_work_is_polled_outside_the_isr() {
		let (mut driver, mut bus, mut ivt) = installed();
		driver.core.policy.set_ceiling(1);
		let (_handle, log) = register_match_all(&mut driver, &mut bus);

		// Two frames waiting; the ISR entry takes one (ceiling), the
		// deferred poll takes the other.
		bus.push_read(
			BASE + nic_regs::STATUS,
			u32::from(0x2000 | (IntStatus::INT_LATCH | IntStatus::RX_COMPLETE).bits()),
		);
		for frame in [broadcast_frame(0x0800, 60), broadcast_frame(0x0800, 60)] {
			bus.push_read(BASE + nic_regs::W1_RX_STATUS, frame.len() as u32);
			for chunk in frame.chunks(2) {
				bus.push_read(
					BASE + nic_regs::W1_RX_FIFO,
					u32::from(chunk[0]) | (u32::from(chunk[1]) << 8),
				);
			}
		}
		bus.push_read(BASE + nic_regs::W1_RX_STATUS, 0x8000);

		let outcome = driver.isr_entry(&mut bus, &mut ivt, IRQ);
		assert_eq!(
			outcome,
			IsrOutcome::Serviced {
				rx_frames: 1,
				tx_reaped: 0
			}
		);
		assert_eq!(log.borrow().delivered.len(), 1);

		driver.poll_deferred(&mut bus);
		assert_eq!(log.borrow().delivered.len(), 2);
	}
}
