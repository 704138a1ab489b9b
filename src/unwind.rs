//! The unwind registry: a LIFO of compensating actions.
//!
//! Every install step that acquires something pushes the action that
//! gives it back. A failing install pops and executes the list; a clean
//! teardown executes the same list. An action that fails is logged and
//! skipped; the remaining entries still run, so one stuck resource never
//! leaks the rest.

use smallvec::SmallVec;

use crate::hal::FarPtr;
use crate::nic::NicId;

/// A compensating action with its argument.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnwindAction {
	/// Put the previously installed handler back into `vector`.
	RestoreVector { vector: u8, previous: FarPtr },
	/// Mask `irq` at the PIC again.
	MaskIrq { irq: u8 },
	/// Stop a controller that was started.
	StopNic { nic: NicId },
	/// Tear down a controller's rings and buffer pool.
	ReleaseNic { nic: NicId },
	/// Give back the bounce pool.
	ReleaseBouncePool,
	/// Close the API gate and drop all handles.
	RetractApi,
}

#[derive(Default, Debug)]
pub struct UnwindRegistry {
	entries: SmallVec<[UnwindAction; 16]>,
}

impl UnwindRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, action: UnwindAction) {
		self.entries.push(action);
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Pops and executes every recorded action, newest first. `exec`
	/// returning an error does not stop the run.
	pub fn unwind<F>(&mut self, mut exec: F)
	where
		F: FnMut(UnwindAction) -> Result<(), &'static str>,
	{
		while let Some(action) = self.entries.pop() {
			if let Err(reason) = exec(action) {
				warn!("unwind action {action:?} failed: {reason}; continuing");
			}
		}
	}
}
