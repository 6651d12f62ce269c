use std::hash::BuildHasher;
use std::sync::LazyLock;

use ahash::RandomState;

// Key hashes order the list and index the table, so they must be stable for
// the lifetime of every map in the process.
static HASH_STATE: LazyLock<RandomState> = LazyLock::new(RandomState::new);

mod sealed {
    pub trait Sealed {}
}

/// A key kind the map knows how to hash.
///
/// The set is closed: fixed-width integers, machine-word integers, floats,
/// complex numbers as `(f32, f32)`/`(f64, f64)` pairs, and UTF-8 strings.
/// Each kind hashes a little-endian byte view of its in-memory
/// representation, so hashes are stable within a process but not across
/// processes or versions.
///
/// Float and complex keys compare by bit pattern: `NAN` equals itself and
/// `0.0` differs from `-0.0`.
pub trait Hashable: sealed::Sealed + Send + Sync + Sized + 'static {
    #[doc(hidden)]
    fn hash_key(&self) -> usize;

    #[doc(hidden)]
    fn key_eq(&self, other: &Self) -> bool;
}

macro_rules! hashable_int {
    ($($int:ty),*) => {$(
        impl sealed::Sealed for $int {}

        impl Hashable for $int {
            #[inline]
            fn hash_key(&self) -> usize {
                HASH_STATE.hash_one(self.to_le_bytes()) as usize
            }

            #[inline]
            fn key_eq(&self, other: &Self) -> bool {
                self == other
            }
        }
    )*};
}

hashable_int!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

macro_rules! hashable_float {
    ($($float:ty),*) => {$(
        impl sealed::Sealed for $float {}

        impl Hashable for $float {
            #[inline]
            fn hash_key(&self) -> usize {
                HASH_STATE.hash_one(self.to_bits().to_le_bytes()) as usize
            }

            #[inline]
            fn key_eq(&self, other: &Self) -> bool {
                self.to_bits() == other.to_bits()
            }
        }
    )*};
}

hashable_float!(f32, f64);

impl sealed::Sealed for (f32, f32) {}

impl Hashable for (f32, f32) {
    #[inline]
    fn hash_key(&self) -> usize {
        let mut bytes = [0; 8];
        bytes[..4].copy_from_slice(&self.0.to_bits().to_le_bytes());
        bytes[4..].copy_from_slice(&self.1.to_bits().to_le_bytes());
        HASH_STATE.hash_one(bytes) as usize
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> bool {
        (self.0.to_bits(), self.1.to_bits()) == (other.0.to_bits(), other.1.to_bits())
    }
}

impl sealed::Sealed for (f64, f64) {}

impl Hashable for (f64, f64) {
    #[inline]
    fn hash_key(&self) -> usize {
        let mut bytes = [0; 16];
        bytes[..8].copy_from_slice(&self.0.to_bits().to_le_bytes());
        bytes[8..].copy_from_slice(&self.1.to_bits().to_le_bytes());
        HASH_STATE.hash_one(bytes) as usize
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> bool {
        (self.0.to_bits(), self.1.to_bits()) == (other.0.to_bits(), other.1.to_bits())
    }
}

impl sealed::Sealed for String {}

impl Hashable for String {
    #[inline]
    fn hash_key(&self) -> usize {
        HASH_STATE.hash_one(self.as_bytes()) as usize
    }

    #[inline]
    fn key_eq(&self, other: &Self) -> bool {
        self == other
    }
}

/// The hash function of a map: the built-in byte-view hash, or whatever the
/// user installed with `set_hasher`.
pub(crate) enum KeyHasher<K> {
    Default,
    Custom(Box<dyn Fn(&K) -> usize + Send + Sync>),
}

impl<K: Hashable> KeyHasher<K> {
    #[inline]
    pub(crate) fn hash(&self, key: &K) -> usize {
        match self {
            KeyHasher::Default => key.hash_key(),
            KeyHasher::Custom(hasher) => hasher(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_stable() {
        assert_eq!(42_u64.hash_key(), 42_u64.hash_key());
        assert_eq!(
            String::from("anchor").hash_key(),
            String::from("anchor").hash_key()
        );
        assert_eq!((1.5_f64, -2.5_f64).hash_key(), (1.5_f64, -2.5_f64).hash_key());
    }

    #[test]
    fn width_matters() {
        // a byte and a word with the same value are distinct keys
        assert_ne!(7_u8.hash_key(), 7_u64.hash_key());
    }

    #[test]
    fn float_keys_compare_by_bits() {
        assert!(f64::NAN.key_eq(&f64::NAN));
        assert!(!0.0_f64.key_eq(&-0.0_f64));
        assert!(1.25_f32.key_eq(&1.25_f32));
    }
}
