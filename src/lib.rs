//! Resident core of a packet driver for 3Com EtherLink-family Ethernet
//! controllers.
//!
//! The crate multiplexes one or more controllers behind the standard
//! Packet Driver API: clients register class/type filters and receive
//! callbacks over a software interrupt, transmit synchronously, and get
//! frames delivered from a two-tier interrupt service path with a
//! private stack and a CPU-scaled batch ceiling. Six controller families
//! are served through one abstraction (window-banked programmed I/O on
//! the classic parts, download/upload descriptor rings on the bus
//! masters) with a DMA safety layer enforcing the 64 KiB boundary and
//! ISA reachability rules underneath.
//!
//! The cold path (probing, EEPROM, option parsing) is not part of this
//! crate; it hands over fully populated [`nic::NicDescriptor`]s and an
//! [`InstallConfig`] and calls [`install`]. Everything the install
//! sequence acquires is paired with a compensating action, so a failure
//! at any step leaves nothing resident.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

pub mod api;
pub mod config;
pub mod cpu;
pub mod dispatch;
pub mod dma;
mod driver;
pub mod hal;
pub mod irq;
pub mod nic;
pub mod pic;
pub mod ring;
pub mod stats;
pub mod unwind;

pub use api::SIGNATURE;
pub use driver::{InstallConfig, PacketDriver, error, install};

/// Storage for the installed driver instance, for hosts that keep it in
/// a static rather than threading it through the interrupt stubs.
pub mod resident {
	use hermit_sync::SpinMutex;

	use crate::PacketDriver;

	static DRIVER: SpinMutex<Option<PacketDriver>> = SpinMutex::new(None);

	/// Parks an installed driver. Returns the previous occupant, if any.
	pub fn put(driver: PacketDriver) -> Option<PacketDriver> {
		DRIVER.lock().replace(driver)
	}

	/// Runs `f` against the resident driver, if one is installed.
	pub fn with<R>(f: impl FnOnce(&mut PacketDriver) -> R) -> Option<R> {
		DRIVER.lock().as_mut().map(f)
	}

	/// Removes the resident driver, e.g. after a successful uninstall.
	pub fn take() -> Option<PacketDriver> {
		DRIVER.lock().take()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn signature_is_probeable() {
		assert_eq!(&SIGNATURE[..8], b"PKT DRVR");
		assert_eq!(SIGNATURE[8], 0);
	}
}
