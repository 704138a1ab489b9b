//! One-shot selection of the hot-path primitives.
//!
//! The original hardware driver patched its dispatch sites in place once
//! the CPU generation was known. Here the same contract (decide once,
//! freeze the hot path) is rendered as a [`DispatchTable`] of function
//! pointers filled in by [`select`] before the API is exposed. After
//! selection the table is immutable; nothing on the hot path reads the
//! [`CpuFeatures`](crate::cpu::CpuFeatures) record again.
//!
//! Selection fails closed: a capability record whose shape does not match
//! any known template aborts init (and unwinds) instead of guessing.

use thiserror::Error;

use crate::cpu::{CachePolicy, CpuFeatures, CpuGeneration, IoWidth};
use crate::dma::CoherencyStrategy;
use crate::hal::PortIo;

/// Burst-read `buf.len()` bytes from a FIFO register.
pub type ReadBurstFn = fn(&mut dyn PortIo, u16, &mut [u8]);
/// Burst-write `buf.len()` bytes to a FIFO register.
pub type WriteBurstFn = fn(&mut dyn PortIo, u16, &[u8]);
/// Copy `src` into `dst`; both slices have equal length.
pub type CopyFn = fn(&mut [u8], &[u8]);

/// The frozen hot path.
///
/// `Copy` on purpose: every consumer embeds its own copy of the table at
/// init, so no shared state is touched at interrupt time.
#[derive(Clone, Copy)]
pub struct DispatchTable {
	pub read_burst: ReadBurstFn,
	pub write_burst: WriteBurstFn,
	pub copy: CopyFn,
	/// Bytes moved per burst unit (1, 2 or 4); FIFO padding math needs it.
	pub io_unit: u8,
	pub coherency: CoherencyStrategy,
	/// Frames drained per NIC per interrupt entry.
	pub batch_ceiling: u8,
	/// Iteration bound for hardware command waits (roughly 10 ms, never
	/// more than 20 ms on the slowest supported part).
	pub spin_bound: u32,
}

impl core::fmt::Debug for DispatchTable {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("DispatchTable")
			.field("coherency", &self.coherency)
			.field("batch_ceiling", &self.batch_ceiling)
			.field("spin_bound", &self.spin_bound)
			.finish_non_exhaustive()
	}
}

#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum SelectError {
	/// The capability record does not match any instruction template.
	#[error("capability record does not fit template: {0}")]
	ShapeMismatch(&'static str),
}

/// Builds the dispatch table for the given capability record.
///
/// `write_through` is the operator's consent to treat the whole DMA region
/// as write-through on tier-3 parts; without it those parts get software
/// barriers.
pub fn select(cpu: &CpuFeatures, write_through: bool) -> Result<DispatchTable, SelectError> {
	validate(cpu)?;

	let (read_burst, write_burst, copy, io_unit): (ReadBurstFn, WriteBurstFn, CopyFn, u8) =
		match cpu.io_width {
			IoWidth::Bits8 => (read_burst8, write_burst8, copy8, 1),
			IoWidth::Bits16 => (read_burst16, write_burst16, copy16, 2),
			IoWidth::Bits32 => (read_burst32, write_burst32, copy32, 4),
		};

	let coherency = if cpu.cache_policy == CachePolicy::None {
		CoherencyStrategy::Uncached
	} else if cpu.has_clflush {
		CoherencyStrategy::FlushLines {
			line: cpu.clflush_line,
		}
	} else if cpu.has_wbinvd {
		CoherencyStrategy::FullWriteback
	} else if write_through {
		CoherencyStrategy::WriteThrough
	} else {
		CoherencyStrategy::SoftwareBarrier
	};

	let batch_ceiling = match cpu.generation {
		g if g <= CpuGeneration::Cpu286 => 8,
		g if g <= CpuGeneration::Cpu486 => 16,
		_ => 32,
	};

	let spin_bound = match cpu.generation {
		g if g <= CpuGeneration::Cpu286 => 8_000,
		CpuGeneration::Cpu386 => 20_000,
		CpuGeneration::Cpu486 => 40_000,
		_ => 100_000,
	};

	Ok(DispatchTable {
		read_burst,
		write_burst,
		copy,
		io_unit,
		coherency,
		batch_ceiling,
		spin_bound,
	})
}

fn validate(cpu: &CpuFeatures) -> Result<(), SelectError> {
	if cpu.io_width >= IoWidth::Bits16 && cpu.generation < CpuGeneration::Cpu286 {
		return Err(SelectError::ShapeMismatch("16-bit string I/O before 286"));
	}
	if cpu.io_width == IoWidth::Bits32 && cpu.generation < CpuGeneration::Cpu386 {
		return Err(SelectError::ShapeMismatch("32-bit string I/O before 386"));
	}
	if cpu.has_wbinvd && cpu.generation < CpuGeneration::Cpu486 {
		return Err(SelectError::ShapeMismatch("WBINVD before 486"));
	}
	if cpu.has_clflush && cpu.clflush_line == 0 {
		return Err(SelectError::ShapeMismatch("CLFLUSH without line size"));
	}
	if cpu.has_clflush && !cpu.has_wbinvd {
		return Err(SelectError::ShapeMismatch("CLFLUSH without WBINVD"));
	}
	if cpu.cache_policy == CachePolicy::None && cpu.generation > CpuGeneration::Cpu286 {
		return Err(SelectError::ShapeMismatch("cacheless part after 286"));
	}
	Ok(())
}

fn read_burst8(io: &mut dyn PortIo, port: u16, buf: &mut [u8]) {
	for byte in buf {
		*byte = io.inb(port);
	}
}

fn write_burst8(io: &mut dyn PortIo, port: u16, buf: &[u8]) {
	for byte in buf {
		io.outb(port, *byte);
	}
}

fn read_burst16(io: &mut dyn PortIo, port: u16, buf: &mut [u8]) {
	io.insw(port, buf);
}

fn write_burst16(io: &mut dyn PortIo, port: u16, buf: &[u8]) {
	io.outsw(port, buf);
}

fn read_burst32(io: &mut dyn PortIo, port: u16, buf: &mut [u8]) {
	io.insl(port, buf);
}

fn write_burst32(io: &mut dyn PortIo, port: u16, buf: &[u8]) {
	io.outsl(port, buf);
}

fn copy8(dst: &mut [u8], src: &[u8]) {
	for (d, s) in dst.iter_mut().zip(src) {
		*d = *s;
	}
}

fn copy16(dst: &mut [u8], src: &[u8]) {
	let n = src.len() & !1;
	dst[..n].copy_from_slice(&src[..n]);
	if n < src.len() {
		dst[n] = src[n];
	}
}

fn copy32(dst: &mut [u8], src: &[u8]) {
	dst.copy_from_slice(src);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cpu::CpuGeneration::*;
	use crate::hal::testing::{IoOp, MockBus};

	#[test]
	fn tier_selection() {
		let t = select(&CpuFeatures::for_generation(Cpu286), false).unwrap();
		assert_eq!(t.batch_ceiling, 8);
		assert_eq!(t.coherency, CoherencyStrategy::Uncached);

		let t = select(&CpuFeatures::for_generation(Cpu386), false).unwrap();
		assert_eq!(t.coherency, CoherencyStrategy::SoftwareBarrier);

		let t = select(&CpuFeatures::for_generation(Cpu386), true).unwrap();
		assert_eq!(t.coherency, CoherencyStrategy::WriteThrough);

		let t = select(&CpuFeatures::for_generation(Cpu486), false).unwrap();
		assert_eq!(t.coherency, CoherencyStrategy::FullWriteback);
		assert_eq!(t.batch_ceiling, 16);

		let t = select(&CpuFeatures::for_generation(Pentium3), false).unwrap();
		assert_eq!(t.coherency, CoherencyStrategy::FlushLines { line: 32 });
		assert_eq!(t.batch_ceiling, 32);
	}

	#[test]
	fn consent_flag_only_affects_tier3() {
		let t = select(&CpuFeatures::for_generation(Pentium), true).unwrap();
		assert_eq!(t.coherency, CoherencyStrategy::FullWriteback);
	}

	#[test]
	fn select_fails_closed() {
		let mut cpu = CpuFeatures::for_generation(Cpu286);
		cpu.has_wbinvd = true;
		assert_eq!(
			select(&cpu, false).unwrap_err(),
			SelectError::ShapeMismatch("WBINVD before 486")
		);

		let mut cpu = CpuFeatures::for_generation(Pentium3);
		cpu.clflush_line = 0;
		assert!(select(&cpu, false).is_err());

		let mut cpu = CpuFeatures::for_generation(Cpu8086);
		cpu.io_width = crate::cpu::IoWidth::Bits32;
		assert!(select(&cpu, false).is_err());
	}

	#[test]
	fn burst_widths_hit_the_bus_as_selected() {
		let table = select(&CpuFeatures::for_generation(Cpu8086), false).unwrap();
		let mut bus = MockBus::new();
		(table.write_burst)(&mut bus, 0x300, &[1, 2]);
		assert_eq!(bus.log, [IoOp::Outb(0x300, 1), IoOp::Outb(0x300, 2)]);

		let table = select(&CpuFeatures::for_generation(Cpu286), false).unwrap();
		let mut bus = MockBus::new();
		(table.write_burst)(&mut bus, 0x300, &[1, 2]);
		assert_eq!(bus.log, [IoOp::Outw(0x300, 0x0201)]);

		let table = select(&CpuFeatures::for_generation(Pentium), false).unwrap();
		let mut bus = MockBus::new();
		(table.write_burst)(&mut bus, 0x300, &[1, 2, 3, 4]);
		assert_eq!(bus.log, [IoOp::Outl(0x300, 0x0403_0201)]);
	}

	#[test]
	fn copy_variants_are_equivalent() {
		let src = [1u8, 2, 3, 4, 5];
		for f in [copy8 as CopyFn, copy16, copy32] {
			let mut dst = [0u8; 5];
			f(&mut dst, &src);
			assert_eq!(dst, src);
		}
	}
}
