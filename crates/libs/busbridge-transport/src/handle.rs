use std::fmt;
use std::num::NonZeroU64;

/// Opaque reference to an object owned by the native transport.
///
/// Handles are plain identities. Whoever holds one must also hold (or
/// borrow) a native reference for it to stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(NonZeroU64);

impl NativeHandle {
    /// Returns `None` for zero, which the transport uses as "no object".
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl From<NonZeroU64> for NativeHandle {
    fn from(raw: NonZeroU64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_not_a_handle() {
        assert!(NativeHandle::new(0).is_none());
        let handle = NativeHandle::new(0x2a).expect("non-zero");
        assert_eq!(handle.get(), 42);
        assert_eq!(handle.to_string(), "0x2a");
    }
}
