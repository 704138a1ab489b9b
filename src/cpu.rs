//! CPU feature detection.
//!
//! Runs once during init and publishes a frozen [`CpuFeatures`] record.
//! The hot path never consults this record; it only runs code selected
//! from it by the dispatch table (see [`crate::dispatch`]).
//!
//! On targets with CPUID the record is filled from the hardware. The
//! canonical per-generation records produced by the classical probes
//! (flag-bit persistence, the alignment-check bit, CPUID availability)
//! are available through [`CpuFeatures::for_generation`] and are what the
//! real-mode probe code hands over for pre-CPUID parts.

/// Processor generations distinguished by the resident core.
///
/// The order is meaningful: later generations are strictly more capable.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum CpuGeneration {
	Cpu8086,
	Cpu186,
	Cpu286,
	Cpu386,
	Cpu486,
	Pentium,
	PentiumPro,
	Pentium3,
}

/// Widest I/O transfer unit the CPU supports on a string operation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum IoWidth {
	Bits8,
	Bits16,
	Bits32,
}

/// Cache write policy as far as the detector can tell.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CachePolicy {
	/// No cache at all (286 and earlier).
	None,
	WriteThrough,
	WriteBack,
	Unknown,
}

/// The frozen capability record produced at init.
#[derive(Clone, Copy, Debug)]
pub struct CpuFeatures {
	pub generation: CpuGeneration,
	pub io_width: IoWidth,
	pub has_wbinvd: bool,
	pub has_clflush: bool,
	/// CLFLUSH line size in bytes; zero when `has_clflush` is false.
	pub clflush_line: u16,
	pub cache_policy: CachePolicy,
}

impl CpuFeatures {
	/// The canonical record for a given generation.
	///
	/// This is what the classical probe sequence resolves to on each tier
	/// and is the only way to obtain a record for pre-CPUID parts.
	pub const fn for_generation(generation: CpuGeneration) -> Self {
		use CpuGeneration::*;

		let io_width = match generation {
			Cpu8086 | Cpu186 => IoWidth::Bits8,
			Cpu286 => IoWidth::Bits16,
			_ => IoWidth::Bits32,
		};
		let has_wbinvd = generation as u8 >= Cpu486 as u8;
		let has_clflush = generation as u8 >= Pentium3 as u8;
		let cache_policy = match generation {
			Cpu8086 | Cpu186 | Cpu286 => CachePolicy::None,
			Cpu386 => CachePolicy::Unknown,
			Cpu486 => CachePolicy::WriteThrough,
			_ => CachePolicy::WriteBack,
		};

		Self {
			generation,
			io_width,
			has_wbinvd,
			has_clflush,
			clflush_line: if has_clflush { 32 } else { 0 },
			cache_policy,
		}
	}

	/// Detects the running CPU.
	#[cfg(target_arch = "x86_64")]
	pub fn detect() -> Self {
		use raw_cpuid::CpuId;

		let cpuid = CpuId::new();
		let finfo = cpuid.get_feature_info();
		let has_clflush = finfo.as_ref().is_some_and(|f| f.has_clflush());
		let clflush_line = finfo
			.as_ref()
			.map(|f| u16::from(f.cflush_cache_line_size()) * 8)
			.unwrap_or(0);

		let generation = if has_clflush {
			CpuGeneration::Pentium3
		} else {
			CpuGeneration::PentiumPro
		};

		Self {
			generation,
			io_width: IoWidth::Bits32,
			has_wbinvd: true,
			has_clflush,
			clflush_line,
			cache_policy: CachePolicy::WriteBack,
		}
	}

	/// Detects the running CPU.
	///
	/// Without CPUID support in the toolchain we assume the most
	/// conservative cached generation; the probe handing over a
	/// [`CpuFeatures::for_generation`] record is the expected path here.
	#[cfg(not(target_arch = "x86_64"))]
	pub fn detect() -> Self {
		Self::for_generation(CpuGeneration::Cpu386)
	}
}
