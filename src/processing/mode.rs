use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Transform applied to each frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ProcessingMode {
    Raw = 0,
    #[default]
    EdgeDetect = 1,
}

impl ProcessingMode {
    /// Map the bridge's integer mode id.
    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            0 => Some(Self::Raw),
            1 => Some(Self::EdgeDetect),
            _ => None,
        }
    }

    pub fn id(self) -> i32 {
        self as i32
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Raw => Self::EdgeDetect,
            Self::EdgeDetect => Self::Raw,
        }
    }

    fn from_bits(bits: u8) -> Self {
        if bits == Self::Raw as u8 {
            Self::Raw
        } else {
            Self::EdgeDetect
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::EdgeDetect => f.write_str("edge_detect"),
        }
    }
}

/// Process-wide processing mode, written by the UI thread and read by the
/// capture thread on every frame. Lock-free; readers never block.
#[derive(Debug)]
pub struct ModeRegister {
    bits: AtomicU8,
}

impl ModeRegister {
    pub fn new(mode: ProcessingMode) -> Self {
        Self {
            bits: AtomicU8::new(mode as u8),
        }
    }

    pub fn load(&self) -> ProcessingMode {
        ProcessingMode::from_bits(self.bits.load(Ordering::Acquire))
    }

    pub fn store(&self, mode: ProcessingMode) {
        self.bits.store(mode as u8, Ordering::Release);
    }

    /// Flip the mode and return the new value.
    pub fn toggle(&self) -> ProcessingMode {
        let prev = self.bits.fetch_xor(1, Ordering::AcqRel);
        ProcessingMode::from_bits(prev).toggled()
    }
}

impl Default for ModeRegister {
    fn default() -> Self {
        Self::new(ProcessingMode::default())
    }
}
