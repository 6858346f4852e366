//! Address types.
//!
//! A guest address is only meaningful after translation, so the three spaces
//! the engine deals with are kept apart by type:
//! - [`Gva`]: guest virtual address, as seen by the guest payload.
//! - [`Hva`]: host-visible virtual address in the monitor process.
//! - [`Pa`]: host physical address.

/// Guest virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Gva(u64);

impl Gva {
    #[inline(always)]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Host-visible virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Hva(u64);

impl Hva {
    #[inline(always)]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Host physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Pa(u64);

impl Pa {
    #[inline(always)]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

macro_rules! impl_addr {
    ($t: ident) => {
        impl core::ops::Add<u64> for $t {
            type Output = Self;

            fn add(self, other: u64) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<u64> for $t {
            fn add_assign(&mut self, other: u64) {
                self.0 += other
            }
        }
        impl core::ops::Sub<u64> for $t {
            type Output = Self;

            fn sub(self, other: u64) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($t), "(0x{:x})"), self.0)
            }
        }
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($t), "(0x{:x})"), self.0)
            }
        }
    };
}

impl_addr!(Gva);
impl_addr!(Hva);
impl_addr!(Pa);
