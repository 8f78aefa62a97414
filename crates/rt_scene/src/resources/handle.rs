//! Pool handles

use std::fmt;

/// Opaque identifier of a pool slot
///
/// The generation changes every time the slot is freed, so a handle kept past
/// `free` never aliases the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle {
    index: u32,
    generation: u32,
}

impl ResourceHandle {
    /// Sentinel meaning "no resource"
    pub const INVALID: Self = Self {
        index: u32::MAX,
        generation: 0,
    };

    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index; also used as the TLAS instance custom index
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when the handle was issued
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Whether this is not the sentinel (says nothing about liveness)
    pub const fn is_valid(self) -> bool {
        self.index != u32::MAX
    }
}

impl Default for ResourceHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "#{}v{}", self.index, self.generation)
        } else {
            f.write_str("#invalid")
        }
    }
}
