//! Serial-number arithmetic (RFC 1982 style).
//!
//! Transmission sequence numbers and stream sequence numbers live on a
//! modular ring; comparisons are meaningful only within half the number
//! space, which is exactly what the window logic guarantees.

macro_rules! serial_number {
    ($(#[$meta:meta])* $name:ident, $repr:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub $repr);

        impl $name {
            const HALF: $repr = 1 << (<$repr>::BITS - 1);

            /// The successor on the ring.
            #[must_use]
            pub fn next(self) -> Self {
                Self(self.0.wrapping_add(1))
            }

            /// Serial "less than": true when `self` comes before `other`
            /// within half the number space.
            pub fn precedes(self, other: Self) -> bool {
                (self.0 < other.0 && other.0 - self.0 <= Self::HALF)
                    || (self.0 > other.0 && self.0 - other.0 >= Self::HALF)
            }

            /// Serial "greater than".
            pub fn follows(self, other: Self) -> bool {
                other.precedes(self)
            }

            /// Ring distance from `base` to `self`.
            pub fn offset_from(self, base: Self) -> $repr {
                self.0.wrapping_sub(base.0)
            }
        }
    };
}

serial_number!(
    /// Transmission sequence number: one per payload chunk.
    Tsn,
    u32
);

serial_number!(
    /// Stream sequence number: one per ordered user message.
    Ssn,
    u16
);
