//! Fixed-width field values.
//!
//! Every field of a record has a fixed byte width so a whole record, or a
//! single field, can be copied into a change-log frame without a schema.
//! Integers are encoded big-endian.

use bytes::{Buf, BufMut, BytesMut};
use std::cmp::Ordering;
use std::fmt;

/// A value that can live in a record field.
pub trait FieldValue: Clone + Default + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Encoded width in bytes.
    const WIDTH: usize;

    /// Appends exactly `WIDTH` bytes.
    fn encode(&self, buf: &mut BytesMut);

    /// Consumes exactly `WIDTH` bytes, or returns `None` if too few remain.
    fn decode(buf: &mut &[u8]) -> Option<Self>;

    /// Renders the value for the text dump format.
    fn to_text(&self) -> String;

    /// Parses a value rendered by [`FieldValue::to_text`].
    fn from_text(text: &str) -> Option<Self>;
}

macro_rules! impl_numeric_field {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl FieldValue for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn encode(&self, buf: &mut BytesMut) {
                    buf.$put(*self);
                }

                #[inline]
                fn decode(buf: &mut &[u8]) -> Option<Self> {
                    if buf.remaining() < Self::WIDTH {
                        return None;
                    }
                    Some(buf.$get())
                }

                fn to_text(&self) -> String {
                    self.to_string()
                }

                fn from_text(text: &str) -> Option<Self> {
                    text.trim().parse().ok()
                }
            }
        )*
    };
}

impl_numeric_field! {
    i8 => put_i8, get_i8;
    i16 => put_i16, get_i16;
    i32 => put_i32, get_i32;
    i64 => put_i64, get_i64;
    u8 => put_u8, get_u8;
    u16 => put_u16, get_u16;
    u32 => put_u32, get_u32;
    u64 => put_u64, get_u64;
    f32 => put_f32, get_f32;
    f64 => put_f64, get_f64;
}

impl FieldValue for bool {
    const WIDTH: usize = 1;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        if buf.remaining() < 1 {
            return None;
        }
        Some(buf.get_u8() != 0)
    }

    fn to_text(&self) -> String {
        String::from(if *self { "1" } else { "0" })
    }

    fn from_text(text: &str) -> Option<Self> {
        match text.trim() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        }
    }
}

/// Fixed-capacity UTF-8 string stored NUL-padded in `N` bytes.
///
/// Longer input is truncated at the last character boundary that fits.
/// Ordering is bytewise, which matches lexicographic string order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixedString<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> FixedString<N> {
    /// Creates a string, truncating to `N` bytes.
    pub fn new(s: &str) -> Self {
        let mut end = s.len().min(N);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; N];
        bytes[..end].copy_from_slice(&s.as_bytes()[..end]);
        Self { bytes }
    }

    /// Returns the stored text up to the first NUL.
    pub fn as_str(&self) -> &str {
        let len = self.bytes.iter().position(|&b| b == 0).unwrap_or(N);
        std::str::from_utf8(&self.bytes[..len]).unwrap_or_default()
    }

    /// Returns true if no characters are stored.
    pub fn is_empty(&self) -> bool {
        self.bytes.first().map_or(true, |&b| b == 0)
    }
}

impl<const N: usize> Default for FixedString<N> {
    fn default() -> Self {
        Self { bytes: [0u8; N] }
    }
}

impl<const N: usize> fmt::Debug for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl<const N: usize> fmt::Display for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> From<&str> for FixedString<N> {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl<const N: usize> FieldValue for FixedString<N> {
    const WIDTH: usize = N;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.bytes);
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        if buf.remaining() < N {
            return None;
        }
        let mut bytes = [0u8; N];
        buf.copy_to_slice(&mut bytes);
        // Reject bytes that would not survive `as_str`.
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(N);
        std::str::from_utf8(&bytes[..len]).ok()?;
        Some(Self { bytes })
    }

    fn to_text(&self) -> String {
        self.as_str().to_string()
    }

    fn from_text(text: &str) -> Option<Self> {
        Some(Self::new(text))
    }
}

/// Microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let micros = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self(micros)
    }

    /// Returns the raw microsecond count.
    pub fn as_micros(&self) -> u64 {
        self.0
    }
}

impl FieldValue for Timestamp {
    const WIDTH: usize = 8;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.0);
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        u64::decode(buf).map(Timestamp)
    }

    fn to_text(&self) -> String {
        self.0.to_string()
    }

    fn from_text(text: &str) -> Option<Self> {
        u64::from_text(text).map(Timestamp)
    }
}

/// `None` is the unset (wildcard) value. Encoded as a tag byte followed by
/// the inner value, or zero padding when unset. The text form of `None` is
/// the empty string.
impl<T: FieldValue> FieldValue for Option<T> {
    const WIDTH: usize = 1 + T::WIDTH;

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Some(value) => {
                buf.put_u8(1);
                value.encode(buf);
            }
            None => {
                buf.put_u8(0);
                buf.put_bytes(0, T::WIDTH);
            }
        }
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        if buf.remaining() < Self::WIDTH {
            return None;
        }
        match buf.get_u8() {
            0 => {
                buf.advance(T::WIDTH);
                Some(None)
            }
            _ => T::decode(buf).map(Some),
        }
    }

    fn to_text(&self) -> String {
        self.as_ref().map(T::to_text).unwrap_or_default()
    }

    fn from_text(text: &str) -> Option<Self> {
        if text.is_empty() {
            return Some(None);
        }
        T::from_text(text).map(Some)
    }
}

/// How an unset key field takes part in a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMatch {
    /// Total order between two stored records. Unset sorts before every
    /// set value and equals only another unset value.
    Exact,
    /// Lookup against a partial key. An unset key field matches anything,
    /// so trailing fields can be left unset to select every record sharing
    /// the leading ones.
    Wildcard,
}

/// Compares an indexed value against another record's value.
///
/// Indices keep their entries sorted with [`KeyMatch::Exact`] and search
/// them with [`KeyMatch::Wildcard`]. The wildcard order is coarser than the
/// exact one, so a sorted index stays partitioned for every lookup key.
#[inline]
pub fn compare_key<T: PartialOrd>(
    stored: &Option<T>,
    key: &Option<T>,
    mode: KeyMatch,
) -> Ordering {
    match (stored, key) {
        (_, None) if mode == KeyMatch::Wildcard => Ordering::Equal,
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: FieldValue>(value: T) -> T {
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        assert_eq!(buf.len(), T::WIDTH);
        let mut slice = &buf[..];
        let decoded = T::decode(&mut slice).unwrap();
        assert!(slice.is_empty());
        decoded
    }

    #[test]
    fn test_integers_are_big_endian() {
        let mut buf = BytesMut::new();
        0x0102_0304u32.encode(&mut buf);
        assert_eq!(&buf[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_numeric_widths() {
        assert_eq!(<i8 as FieldValue>::WIDTH, 1);
        assert_eq!(<i32 as FieldValue>::WIDTH, 4);
        assert_eq!(<u64 as FieldValue>::WIDTH, 8);
        assert_eq!(<f64 as FieldValue>::WIDTH, 8);
        assert_eq!(<Option<i32> as FieldValue>::WIDTH, 5);
        assert_eq!(<FixedString<12> as FieldValue>::WIDTH, 12);
    }

    #[test]
    fn test_negative_and_float_values() {
        assert_eq!(roundtrip(-42i64), -42);
        assert_eq!(roundtrip(2.5f64), 2.5);
        assert!(roundtrip(true));
    }

    #[test]
    fn test_decode_short_buffer() {
        let bytes = [0u8; 3];
        let mut slice = &bytes[..];
        assert_eq!(u32::decode(&mut slice), None);
        assert_eq!(slice.len(), 3);
    }

    #[test]
    fn test_fixed_string_truncates_on_char_boundary() {
        let s = FixedString::<4>::new("abcdef");
        assert_eq!(s.as_str(), "abcd");

        // 'é' is two bytes and would straddle the limit.
        let s = FixedString::<4>::new("abcé");
        assert_eq!(s.as_str(), "abc");
    }

    #[test]
    fn test_fixed_string_ordering_and_roundtrip() {
        let a = FixedString::<8>::new("ab");
        let b = FixedString::<8>::new("abc");
        assert!(a < b);
        assert_eq!(roundtrip(b), b);
        assert!(FixedString::<8>::default().is_empty());
    }

    #[test]
    fn test_fixed_string_rejects_invalid_utf8() {
        let bytes = [0xFFu8, 0xFE, 0, 0];
        let mut slice = &bytes[..];
        assert_eq!(FixedString::<4>::decode(&mut slice), None);
    }

    #[test]
    fn test_option_roundtrip() {
        assert_eq!(roundtrip(Some(7i32)), Some(7));
        assert_eq!(roundtrip(None::<i32>), None);
        assert_eq!(roundtrip(Some(FixedString::<6>::new("IBM"))).unwrap().as_str(), "IBM");
    }

    #[test]
    fn test_text_forms() {
        assert_eq!(17u16.to_text(), "17");
        assert_eq!(u16::from_text(" 17 "), Some(17));
        assert_eq!(i32::from_text("x"), None);
        assert_eq!(Some(3i8).to_text(), "3");
        assert_eq!(None::<i8>.to_text(), "");
        assert_eq!(Option::<i8>::from_text(""), Some(None));
        assert_eq!(bool::from_text("true"), Some(true));
        assert_eq!(Timestamp::from_text("1000"), Some(Timestamp(1000)));
    }

    #[test]
    fn test_compare_key_wildcard() {
        let m = KeyMatch::Wildcard;
        assert_eq!(compare_key(&Some(5), &None, m), Ordering::Equal);
        assert_eq!(compare_key(&None::<i32>, &None, m), Ordering::Equal);
        assert_eq!(compare_key(&None, &Some(1), m), Ordering::Less);
        assert_eq!(compare_key(&Some(1), &Some(2), m), Ordering::Less);
        assert_eq!(compare_key(&Some(2.0), &Some(1.0), m), Ordering::Greater);
    }

    #[test]
    fn test_compare_key_exact_is_antisymmetric() {
        let m = KeyMatch::Exact;
        assert_eq!(compare_key(&Some(5), &None, m), Ordering::Greater);
        assert_eq!(compare_key(&None, &Some(5), m), Ordering::Less);
        assert_eq!(compare_key(&None::<i32>, &None, m), Ordering::Equal);
        assert_eq!(compare_key(&Some(3), &Some(3), m), Ordering::Equal);

        let values = [None, Some(-1), Some(0), Some(7)];
        for a in &values {
            for b in &values {
                assert_eq!(compare_key(a, b, m), compare_key(b, a, m).reverse());
            }
        }
    }
}
