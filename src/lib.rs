#![allow(clippy::multiple_crate_versions)]

//! Trace sessions over Intel PT style instruction-flow decoders.
//!
//! The center of the crate is [`session::Session`]: a single exclusive
//! session that owns one trace stream and one decoder cursor into it, and
//! exposes the small ordered API callers drive (open, sync, decode
//! instructions or blocks, query status and CR3). Instruction bytes are
//! resolved through an [`image::ImageStore`].
//!
//! The packet decoder is a seam ([`decoder::PacketDecoder`]). The crate
//! ships [`decoder::FlowDecoder`], a backend for the compact flow format in
//! [`packet`] which the ptrace [`record`]er produces. On top of sessions,
//! [`analyzer`] and [`cache`] provide the enumeration, automatic image
//! loading and block-offset caching used by the `ipt-dump` and `ipt-cache`
//! binaries in `bin/`.

/// Declares a small bit-set newtype over `u32` with named flag constants.
macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $(
                $(#[$flag_meta:meta])*
                const $flag:ident = $value:expr;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
        pub struct $name(u32);

        impl $name {
            $(
                $(#[$flag_meta])*
                pub const $flag: Self = Self($value);
            )*

            #[must_use]
            pub const fn empty() -> Self {
                Self(0)
            }

            #[must_use]
            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            #[must_use]
            pub const fn bits(self) -> u32 {
                self.0
            }

            #[must_use]
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            #[must_use]
            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

pub mod analyzer;
pub mod asm;
pub mod cache;
pub mod config;
pub mod decoder;
pub mod diag;
pub mod elf;
pub mod image;
pub mod input;
pub mod insn;
pub mod manifest;
pub mod packet;
pub mod print;
pub mod record;
pub mod session;
pub mod status;
