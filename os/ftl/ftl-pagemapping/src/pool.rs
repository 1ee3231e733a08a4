//! The two-cluster pool set: `Cold` and `Hot`.
//!
//! Expressed as a named enum indexing a two-element array rather than
//! raw pointer arithmetic over a fixed-size cluster array.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pool {
    Cold,
    Hot,
}

impl Pool {
    pub const ALL: [Self; 2] = [Self::Cold, Self::Hot];

    #[must_use]
    pub const fn idx(self) -> usize {
        match self {
            Self::Cold => 0,
            Self::Hot => 1,
        }
    }

    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Cold => Self::Hot,
            Self::Hot => Self::Cold,
        }
    }
}
