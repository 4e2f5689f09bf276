//! Record types and their field descriptor tables.
//!
//! A record type lists its fields once, in a static table of
//! [`FieldDescriptor`]s. Binary copy, text introspection and index
//! maintenance all walk that table instead of relying on per-field code.
//! [`define_record!`](crate::define_record) generates the struct, the
//! table and the field-id constants.

use crate::field::KeyMatch;
use bytes::BytesMut;
use std::cmp::Ordering;
use std::fmt;
use tessera_common::{DbId, FieldId, Result, RowId, TesseraError};

/// Name of the index every table must define.
pub const PRIMARY_KEY: &str = "PrimaryKey";

/// Describes one field of a record type.
pub struct FieldDescriptor<R> {
    /// Field name used by the text format.
    pub name: &'static str,
    /// Encoded width in bytes.
    pub width: usize,
    /// Whether any index comparator reads this field.
    pub indexed: bool,
    /// Appends the field's bytes.
    pub encode: fn(&R, &mut BytesMut),
    /// Reads the field's bytes, `None` if too short or invalid.
    pub decode: fn(&mut R, &mut &[u8]) -> Option<()>,
    /// Renders the field as text.
    pub to_text: fn(&R) -> String,
    /// Parses the field from text.
    pub from_text: fn(&mut R, &str) -> Option<()>,
}

impl<R> fmt::Debug for FieldDescriptor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("width", &self.width)
            .field("indexed", &self.indexed)
            .finish()
    }
}

/// Orders two records by their field contents only.
///
/// Indexes append the row id as a final tiebreak, so comparators must not
/// look at identity. The [`KeyMatch`] argument is forwarded to every
/// [`compare_key`](crate::field::compare_key) call.
pub type Comparator<R> = fn(&R, &R, KeyMatch) -> Ordering;

/// A named index definition.
pub struct IndexDef<R> {
    pub name: &'static str,
    pub compare: Comparator<R>,
}

/// A fixed-layout value stored in a table.
///
/// Identity (`row`) and the owning database id are carried as data and are
/// excluded from every bulk field copy.
pub trait Record: Clone + Default + fmt::Debug + Send + 'static {
    /// Table name. Names containing `"Lookup"` mark entity tables.
    const TABLE_NAME: &'static str;

    /// Field descriptors in field-id order.
    fn fields() -> &'static [FieldDescriptor<Self>];

    /// Index definitions; one must be named [`PRIMARY_KEY`].
    fn indices() -> Vec<IndexDef<Self>>;

    /// Row identity, `None` until the record is stored (or when a specific
    /// row has not been requested).
    fn row(&self) -> Option<RowId>;

    fn set_row(&mut self, row: Option<RowId>);

    fn db_id(&self) -> DbId;

    fn set_db_id(&mut self, db_id: DbId);

    /// Returns true if deleted slots must never be reused.
    fn is_entity() -> bool {
        Self::TABLE_NAME.contains("Lookup")
    }

    /// Width of all fields together, identity excluded.
    fn record_width() -> usize {
        Self::fields().iter().map(|f| f.width).sum()
    }

    /// Looks up a field id by name.
    fn field_index(name: &str) -> Option<FieldId> {
        Self::fields()
            .iter()
            .position(|f| f.name == name)
            .and_then(|i| FieldId::try_from(i).ok())
    }

    /// Width of a single field.
    fn field_width(field: FieldId) -> Option<usize> {
        Self::fields().get(field as usize).map(|f| f.width)
    }

    /// Appends every field's bytes.
    fn encode_fields(&self, buf: &mut BytesMut) {
        for field in Self::fields() {
            (field.encode)(self, buf);
        }
    }

    /// Overwrites every field from `bytes`; identity is untouched.
    fn decode_fields(&mut self, bytes: &[u8]) -> Result<()> {
        let expected = Self::record_width();
        if bytes.len() < expected {
            return Err(TesseraError::FrameTruncated {
                expected,
                actual: bytes.len(),
            });
        }
        let mut cursor = bytes;
        for field in Self::fields() {
            (field.decode)(self, &mut cursor).ok_or_else(|| invalid_bytes(field.name))?;
        }
        Ok(())
    }

    /// Appends one field's bytes. Returns false for an unknown field.
    fn encode_field(&self, field: FieldId, buf: &mut BytesMut) -> bool {
        match Self::fields().get(field as usize) {
            Some(desc) => {
                (desc.encode)(self, buf);
                true
            }
            None => false,
        }
    }

    /// Overwrites one field from `bytes`.
    fn decode_field(&mut self, field: FieldId, bytes: &[u8]) -> Result<()> {
        let desc = Self::fields()
            .get(field as usize)
            .ok_or_else(|| TesseraError::FieldNotFound {
                table: Self::TABLE_NAME.to_string(),
                field: field.to_string(),
            })?;
        if bytes.len() < desc.width {
            return Err(TesseraError::FrameTruncated {
                expected: desc.width,
                actual: bytes.len(),
            });
        }
        let mut cursor = bytes;
        (desc.decode)(self, &mut cursor).ok_or_else(|| invalid_bytes(desc.name))
    }

    /// Reads a field as text.
    fn get(&self, name: &str) -> Option<String> {
        Self::fields()
            .iter()
            .find(|f| f.name == name)
            .map(|f| (f.to_text)(self))
    }

    /// Writes a field from text.
    fn set(&mut self, name: &str, text: &str) -> Result<()> {
        let desc = Self::fields()
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| TesseraError::FieldNotFound {
                table: Self::TABLE_NAME.to_string(),
                field: name.to_string(),
            })?;
        (desc.from_text)(self, text).ok_or_else(|| TesseraError::InvalidFieldValue {
            field: name.to_string(),
            value: text.to_string(),
        })
    }

    /// Copies every field from `other`, keeping this record's identity.
    fn copy_fields_from(&mut self, other: &Self) {
        let row = self.row();
        let db_id = self.db_id();
        *self = other.clone();
        self.set_row(row);
        self.set_db_id(db_id);
    }
}

fn invalid_bytes(field: &str) -> TesseraError {
    TesseraError::InvalidFieldValue {
        field: field.to_string(),
        value: "<binary>".to_string(),
    }
}

/// Declares a record type with its field descriptor table.
///
/// Each field is written `[CONST = id] kind name: Type` where `kind` is
/// `index` (read by a comparator, so updates re-index the record) or `plain`.
/// Field ids must count up from zero in declaration order.
///
/// ```ignore
/// define_record! {
///     pub struct Quote = "Quote" {
///         [BUCKET = 0] index bucket: Option<i32>,
///         [PRICE = 1] plain price: f64,
///     }
///     indices {
///         "PrimaryKey" => Quote::by_bucket,
///     }
/// }
/// ```
#[macro_export]
macro_rules! define_record {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident = $table:literal {
            $( [$id_const:ident = $id:literal] $kind:ident $field:ident : $ty:ty ),* $(,)?
        }
        indices {
            $( $index_name:literal => $cmp:expr ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $name {
            $( pub $field: $ty, )*
            row: Option<$crate::RowId>,
            db_id: $crate::DbId,
        }

        impl $name {
            $( pub const $id_const: $crate::FieldId = $id; )*
        }

        impl $crate::Record for $name {
            const TABLE_NAME: &'static str = $table;

            fn fields() -> &'static [$crate::FieldDescriptor<Self>] {
                static FIELDS: &[$crate::FieldDescriptor<$name>] = &[
                    $(
                        $crate::FieldDescriptor {
                            name: stringify!($field),
                            width: <$ty as $crate::FieldValue>::WIDTH,
                            indexed: $crate::define_record!(@indexed $kind),
                            encode: |r: &$name, buf: &mut $crate::bytes::BytesMut| {
                                <$ty as $crate::FieldValue>::encode(&r.$field, buf)
                            },
                            decode: |r: &mut $name, buf: &mut &[u8]| {
                                r.$field = <$ty as $crate::FieldValue>::decode(buf)?;
                                Some(())
                            },
                            to_text: |r: &$name| <$ty as $crate::FieldValue>::to_text(&r.$field),
                            from_text: |r: &mut $name, text: &str| {
                                r.$field = <$ty as $crate::FieldValue>::from_text(text)?;
                                Some(())
                            },
                        },
                    )*
                ];
                FIELDS
            }

            fn indices() -> Vec<$crate::IndexDef<Self>> {
                vec![ $( $crate::IndexDef { name: $index_name, compare: $cmp }, )* ]
            }

            fn row(&self) -> Option<$crate::RowId> {
                self.row
            }

            fn set_row(&mut self, row: Option<$crate::RowId>) {
                self.row = row;
            }

            fn db_id(&self) -> $crate::DbId {
                self.db_id
            }

            fn set_db_id(&mut self, db_id: $crate::DbId) {
                self.db_id = db_id;
            }
        }
    };
    (@indexed index) => { true };
    (@indexed plain) => { false };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{compare_key, FixedString, KeyMatch};

    define_record! {
        /// Test record with one wildcard-capable key.
        pub struct Instrument = "InstrumentLookup" {
            [SYMBOL = 0] index symbol: Option<FixedString<8>>,
            [LOT = 1] plain lot: u32,
            [ACTIVE = 2] plain active: bool,
        }
        indices {
            "PrimaryKey" => Instrument::by_symbol,
        }
    }

    impl Instrument {
        fn by_symbol(a: &Self, b: &Self, m: KeyMatch) -> Ordering {
            compare_key(&a.symbol, &b.symbol, m)
        }
    }

    fn sample() -> Instrument {
        Instrument {
            symbol: Some(FixedString::new("MSFT")),
            lot: 100,
            active: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_descriptor_table() {
        let fields = Instrument::fields();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[Instrument::LOT as usize].name, "lot");
        assert!(fields[Instrument::SYMBOL as usize].indexed);
        assert!(!fields[Instrument::ACTIVE as usize].indexed);
        assert_eq!(Instrument::record_width(), 9 + 4 + 1);
        assert_eq!(Instrument::field_index("active"), Some(2));
        assert_eq!(Instrument::field_index("missing"), None);
        assert_eq!(Instrument::field_width(Instrument::LOT), Some(4));
    }

    #[test]
    fn test_entity_naming_convention() {
        assert!(Instrument::is_entity());
        assert_eq!(Instrument::indices()[0].name, PRIMARY_KEY);
    }

    #[test]
    fn test_encode_decode_excludes_identity() {
        let mut source = sample();
        source.set_row(Some(42));
        source.set_db_id(3);

        let mut buf = BytesMut::new();
        source.encode_fields(&mut buf);
        assert_eq!(buf.len(), Instrument::record_width());

        let mut target = Instrument::default();
        target.decode_fields(&buf).unwrap();
        assert_eq!(target.symbol, source.symbol);
        assert_eq!(target.lot, 100);
        assert_eq!(target.row(), None);
        assert_eq!(target.db_id(), 0);
    }

    #[test]
    fn test_decode_fields_short_input() {
        let mut target = Instrument::default();
        let err = target.decode_fields(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, TesseraError::FrameTruncated { expected: 14, actual: 4 }));
    }

    #[test]
    fn test_single_field_copy() {
        let source = sample();
        let mut buf = BytesMut::new();
        assert!(source.encode_field(Instrument::LOT, &mut buf));
        assert_eq!(&buf[..], &100u32.to_be_bytes());

        let mut target = Instrument::default();
        target.decode_field(Instrument::LOT, &buf).unwrap();
        assert_eq!(target.lot, 100);
        assert!(target.decode_field(9, &buf).is_err());
        assert!(!source.encode_field(9, &mut buf));
    }

    #[test]
    fn test_get_and_set_by_name() {
        let mut rec = sample();
        assert_eq!(rec.get("symbol").as_deref(), Some("MSFT"));
        assert_eq!(rec.get("lot").as_deref(), Some("100"));
        assert_eq!(rec.get("nope"), None);

        rec.set("lot", "250").unwrap();
        assert_eq!(rec.lot, 250);
        rec.set("symbol", "").unwrap();
        assert_eq!(rec.symbol, None);

        assert!(matches!(
            rec.set("lot", "many"),
            Err(TesseraError::InvalidFieldValue { .. })
        ));
        assert!(matches!(
            rec.set("venue", "X"),
            Err(TesseraError::FieldNotFound { .. })
        ));
    }

    #[test]
    fn test_copy_fields_keeps_identity() {
        let mut target = Instrument::default();
        target.set_row(Some(7));
        target.set_db_id(2);

        let mut source = sample();
        source.set_row(Some(99));
        target.copy_fields_from(&source);

        assert_eq!(target.lot, 100);
        assert_eq!(target.row(), Some(7));
        assert_eq!(target.db_id(), 2);
    }
}
