//! # Key and Expiration Types
//!
//! Bounded value types handed to operations before anything touches the wire.
//!
//! ## Design Principles
//!
//! 1. **Validate Once**: Keys are checked against `MAX_KEY_LENGTH` when they are
//!    built, so the request writer only asserts the bound.
//!
//! 2. **Zero-Copy Payloads**: Keys wrap `Bytes`, so cloning a key into a request
//!    shares the buffer instead of copying it.
//!
//! 3. **Protocol Expiry Rules**: Relative expirations longer than 30 days must be
//!    sent as absolute unix timestamps; `Expiration` hides that rule.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::error::{ClientError, ClientResult};
use crate::protocol::MAX_KEY_LENGTH;

/// Longest relative expiration the server interprets as "seconds from now".
pub const MAX_RELATIVE_EXPIRATION: Duration = Duration::from_secs(60 * 60 * 24 * 30);

/// Cache key with bounded size.
///
/// Keys are limited to 250 bytes by the server; longer keys are rejected with
/// `ClientError::KeyTooLong` before an operation is built.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key(Bytes);

impl Key {
    /// Creates a new key from raw bytes.
    ///
    /// # Errors
    /// Returns `ClientError::KeyTooLong` if data exceeds `MAX_KEY_LENGTH`.
    ///
    /// # Examples
    /// ```rust
    /// use mcpipe_common::{ClientError, Key, MAX_KEY_LENGTH};
    ///
    /// let key = Key::new("alpha").expect("valid key");
    /// assert_eq!(key.as_bytes(), b"alpha");
    ///
    /// let too_long = vec![b'k'; MAX_KEY_LENGTH + 1];
    /// assert!(matches!(Key::new(too_long), Err(ClientError::KeyTooLong { .. })));
    /// ```
    pub fn new(data: impl Into<Bytes>) -> ClientResult<Self> {
        let data = data.into();
        if data.len() > MAX_KEY_LENGTH {
            return Err(ClientError::KeyTooLong { len: data.len() });
        }
        Ok(Key(data))
    }

    /// Returns the key bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns a cheap clone of the underlying buffer.
    #[inline]
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl TryFrom<&str> for Key {
    type Error = ClientError;

    fn try_from(value: &str) -> ClientResult<Self> {
        Key::new(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl TryFrom<&[u8]> for Key {
    type Error = ClientError;

    fn try_from(value: &[u8]) -> ClientResult<Self> {
        Key::new(Bytes::copy_from_slice(value))
    }
}

/// Item expiration as understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    /// The item never expires.
    #[default]
    Never,
    /// The item expires after the given duration.
    After(Duration),
    /// The item expires at an absolute wall-clock time.
    At(SystemTime),
}

impl Expiration {
    /// Encodes the expiration into the 32-bit wire value.
    ///
    /// Durations up to 30 days are sent as seconds; longer ones are converted
    /// to an absolute unix timestamp, saturating at `u32::MAX`. Times at or
    /// before the unix epoch map to `Never`.
    pub fn to_wire(self) -> u32 {
        match self {
            Expiration::Never => 0,
            Expiration::After(duration) if duration.is_zero() => 0,
            Expiration::After(duration) if duration <= MAX_RELATIVE_EXPIRATION => {
                duration.as_secs().max(1) as u32
            }
            Expiration::After(duration) => match SystemTime::now().checked_add(duration) {
                Some(when) => Expiration::At(when).to_wire(),
                None => u32::MAX,
            },
            Expiration::At(when) => match when.duration_since(UNIX_EPOCH) {
                Ok(since) if since.as_secs() > 0 => since.as_secs().min(u32::MAX as u64) as u32,
                _ => 0,
            },
        }
    }
}

impl From<Duration> for Expiration {
    fn from(duration: Duration) -> Self {
        Expiration::After(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_creation() {
        let key = Key::new("test_key").unwrap();
        assert_eq!(key.as_bytes(), b"test_key");
        assert_eq!(key.len(), 8);
        assert!(!key.is_empty());
        assert_eq!(key.to_string(), "test_key");
    }

    #[test]
    fn test_key_max_size() {
        let data = vec![b'x'; MAX_KEY_LENGTH];
        let key = Key::new(data).unwrap();
        assert_eq!(key.len(), MAX_KEY_LENGTH);

        // Exceeds max size
        let data = vec![b'x'; MAX_KEY_LENGTH + 1];
        assert!(matches!(
            Key::new(data),
            Err(ClientError::KeyTooLong { len }) if len == MAX_KEY_LENGTH + 1
        ));
    }

    #[test]
    fn test_key_try_from() {
        let key = Key::try_from("alpha").unwrap();
        let other = Key::try_from(&b"alpha"[..]).unwrap();
        assert_eq!(key, other);
    }

    #[test]
    fn test_expiration_relative() {
        assert_eq!(Expiration::Never.to_wire(), 0);
        assert_eq!(Expiration::After(Duration::ZERO).to_wire(), 0);
        assert_eq!(Expiration::After(Duration::from_millis(10)).to_wire(), 1);
        assert_eq!(Expiration::After(Duration::from_secs(90)).to_wire(), 90);
        assert_eq!(
            Expiration::After(MAX_RELATIVE_EXPIRATION).to_wire(),
            MAX_RELATIVE_EXPIRATION.as_secs() as u32
        );
    }

    #[test]
    fn test_expiration_absolute() {
        let long = Duration::from_secs(60 * 60 * 24 * 31);
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let wire = Expiration::After(long).to_wire() as u64;
        assert!(wire >= now + long.as_secs());

        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(Expiration::At(at).to_wire(), 1_700_000_000);
        assert_eq!(Expiration::At(UNIX_EPOCH).to_wire(), 0);
    }

    #[test]
    fn test_expiration_saturates() {
        assert_eq!(Expiration::After(Duration::MAX).to_wire(), u32::MAX);
        assert_eq!(Expiration::After(Duration::from_secs(u64::MAX / 2)).to_wire(), u32::MAX);
    }
}
