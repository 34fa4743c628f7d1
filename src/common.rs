use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::Display;

/// Per-dimension loop extents, tile factors, and concrete regions.
pub type Extents = SmallVec<[i64; 4]>;

/// Width the innermost loop extent is rounded up to when estimating
/// vectorization overcompute, and the widest vector the emitter requests.
pub const VECTOR_WIDTH: i64 = 16;

/// Minimum number of outer-loop iterations a root-level tiling must provide.
pub const PARALLELISM_FLOOR: i64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    Uint8,
    Sint8,
    Uint16,
    Sint16,
    Uint32,
    Sint32,
    Float32,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn bytes(&self) -> u8 {
        match self {
            Dtype::Uint8 | Dtype::Sint8 => 1,
            Dtype::Uint16 | Dtype::Sint16 => 2,
            Dtype::Uint32 | Dtype::Sint32 | Dtype::Float32 => 4,
        }
    }

    /// The common type of a binary operation over `self` and `other`.
    pub fn promote(self, other: Dtype) -> Dtype {
        if self == Dtype::Float32 || other == Dtype::Float32 {
            Dtype::Float32
        } else if self.bytes() >= other.bytes() {
            self
        } else {
            other
        }
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Uint8 => write!(f, "u8"),
            Dtype::Sint8 => write!(f, "i8"),
            Dtype::Uint16 => write!(f, "u16"),
            Dtype::Sint16 => write!(f, "i16"),
            Dtype::Uint32 => write!(f, "u32"),
            Dtype::Sint32 => write!(f, "i32"),
            Dtype::Float32 => write!(f, "f32"),
        }
    }
}

/// Machine characteristics the cost model is parameterized over.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MachineParams {
    /// Target core count. Root-level tilings that provide less parallelism
    /// than this are pruned, and the emitter sizes parallel tasks with it.
    pub parallelism: u32,
    /// Size in bytes of the last-level cache. The memory coefficient of
    /// every stage is divided by its logarithm.
    pub last_level_cache_size: u64,
    /// Relative weight of memory traffic against arithmetic. Higher values
    /// penalize cold loads more.
    pub balance: f64,
}

impl MachineParams {
    pub fn new(parallelism: u32, last_level_cache_size: u64, balance: f64) -> Self {
        MachineParams {
            parallelism,
            last_level_cache_size,
            balance,
        }
    }

    /// A plausible medium-sized desktop machine.
    pub fn generic() -> Self {
        MachineParams::new(16, 16 * 1024 * 1024, 40.0)
    }
}
