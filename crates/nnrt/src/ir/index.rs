use std::fmt;

use serde::{Deserialize, Serialize};

/// Conversion between a typed index and its arena slot.
pub trait ArenaIndex: Copy + Eq + Ord + fmt::Debug {
    fn from_usize(value: usize) -> Self;
    fn as_usize(self) -> usize;
}

macro_rules! define_index {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl $name {
            pub fn new(value: usize) -> Self {
                Self(value as u32)
            }

            pub fn value(self) -> usize {
                self.0 as usize
            }
        }

        impl ArenaIndex for $name {
            fn from_usize(value: usize) -> Self {
                Self::new(value)
            }

            fn as_usize(self) -> usize {
                self.value()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_index!(
    /// Stable handle of an operand inside one graph.
    OperandIndex,
    "%"
);
define_index!(
    /// Stable handle of an operation inside one graph.
    OperationIndex,
    "@"
);
define_index!(SubgraphIndex, "subg#");
define_index!(ModelIndex, "model#");

impl SubgraphIndex {
    pub const PRIMARY: SubgraphIndex = SubgraphIndex(0);
}

impl ModelIndex {
    pub const PRIMARY: ModelIndex = ModelIndex(0);
}
