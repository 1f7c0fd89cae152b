//! Type descriptors and the physical buffer layout each one implies

use std::fmt;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::bitmap::bytes_for;
use crate::error::{Error, Result};

/// Logical type of the values a record describes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Every slot is null; no buffers are allocated
    Null,

    /// Boolean type (1 bit per value, 8 values per byte)
    Boolean,

    /// 8-bit signed integer
    Int8,

    /// 16-bit signed integer
    Int16,

    /// 32-bit signed integer
    Int32,

    /// 64-bit signed integer
    Int64,

    /// 8-bit unsigned integer
    UInt8,

    /// 16-bit unsigned integer
    UInt16,

    /// 32-bit unsigned integer
    UInt32,

    /// 64-bit unsigned integer
    UInt64,

    /// 32-bit floating point
    Float32,

    /// 64-bit floating point
    Float64,

    /// UTF-8 encoded string with 32-bit offsets
    Utf8,

    /// Binary data with 32-bit offsets
    Binary,

    /// Fixed-size binary data
    FixedSizeBinary(usize),

    /// List of values with a given type, 32-bit offsets
    List(Box<DataType>),

    /// Struct with one child per field
    Struct(Vec<DataType>),

    /// Dictionary encoded values: (key type, value type)
    Dictionary(Box<DataType>, Box<DataType>),
}

/// Role of one buffer within a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Validity bitmap, one bit per slot
    Validity,

    /// Fixed-width values
    Values {
        /// Width of a single value in bits
        bit_width: usize,
    },

    /// 32-bit offsets into a child or byte buffer, one per slot plus one
    Offsets,

    /// Variable-length bytes addressed by the preceding offsets buffer
    VarBytes,
}

impl BufferKind {
    /// Minimum byte length of this buffer for `slots` physical slots
    ///
    /// `None` for [`BufferKind::VarBytes`], whose size is read from the
    /// offsets buffer. A size that does not fit in `usize` can never be
    /// allocated and fails with [`Error::AllocationFailed`].
    pub fn min_bytes(self, slots: usize) -> Result<Option<usize>> {
        let bytes = match self {
            BufferKind::Validity => Some(bytes_for(slots)),
            BufferKind::Values { bit_width } => slots.checked_mul(bit_width).map(bytes_for),
            BufferKind::Offsets => slots
                .checked_add(1)
                .and_then(|n| n.checked_mul(std::mem::size_of::<i32>())),
            BufferKind::VarBytes => return Ok(None),
        };
        bytes
            .map(Some)
            .ok_or(Error::AllocationFailed { bytes: usize::MAX })
    }
}

impl DataType {
    /// Width of a single value in bytes, for byte-aligned fixed-width types
    pub fn byte_width(&self) -> Option<usize> {
        match self {
            DataType::Int8 | DataType::UInt8 => Some(1),
            DataType::Int16 | DataType::UInt16 => Some(2),
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => Some(4),
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => Some(8),
            DataType::FixedSizeBinary(size) => Some(*size),
            _ => None,
        }
    }

    /// Check if this type is an integer type
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::UInt64
        )
    }

    /// Check if this type stores variable-length bytes
    pub fn is_var_binary(&self) -> bool {
        matches!(self, DataType::Utf8 | DataType::Binary)
    }

    /// The type whose layout this type's own buffers follow
    ///
    /// Dictionary-encoded records store their keys; everything else stores
    /// itself.
    pub fn storage_type(&self) -> &DataType {
        match self {
            DataType::Dictionary(key, _) => key,
            other => other,
        }
    }

    /// Buffer layout, in order, for a record of this type
    pub fn buffer_layout(&self) -> Vec<BufferKind> {
        match self.storage_type() {
            DataType::Null => Vec::new(),
            DataType::Boolean => vec![BufferKind::Validity, BufferKind::Values { bit_width: 1 }],
            DataType::Utf8 | DataType::Binary => vec![
                BufferKind::Validity,
                BufferKind::Offsets,
                BufferKind::VarBytes,
            ],
            DataType::List(_) => vec![BufferKind::Validity, BufferKind::Offsets],
            DataType::Struct(_) => vec![BufferKind::Validity],
            fixed => {
                let width = fixed.byte_width().unwrap_or(0);
                vec![
                    BufferKind::Validity,
                    BufferKind::Values {
                        bit_width: width * 8,
                    },
                ]
            }
        }
    }

    /// Number of buffers a record of this type carries
    pub fn n_buffers(&self) -> usize {
        self.buffer_layout().len()
    }

    /// Types of the child records
    pub fn child_types(&self) -> &[DataType] {
        match self {
            DataType::List(item) => std::slice::from_ref(item.as_ref()),
            DataType::Struct(fields) => fields,
            _ => &[],
        }
    }

    /// Number of child records
    pub fn n_children(&self) -> usize {
        self.child_types().len()
    }

    /// Value type of the dictionary record, if dictionary encoded
    pub fn dictionary_type(&self) -> Option<&DataType> {
        match self {
            DataType::Dictionary(_, value) => Some(value),
            _ => None,
        }
    }

    /// Check that the descriptor itself is well-formed
    pub fn validate(&self) -> Result<()> {
        match self {
            DataType::Dictionary(key, value) => {
                if !key.is_integer() {
                    return Err(Error::TypeMismatch(format!(
                        "dictionary keys must be integers, got {key}"
                    )));
                }
                value.validate()
            }
            DataType::List(item) => item.validate(),
            DataType::Struct(fields) => fields.iter().try_for_each(DataType::validate),
            DataType::FixedSizeBinary(0) => Err(Error::InvalidArgument(
                "fixed-size binary width must be positive".into(),
            )),
            _ => Ok(()),
        }
    }

    /// C Data Interface format string of this type's storage
    ///
    /// Dictionary-encoded types report the format of their keys, as the
    /// interface expects.
    pub fn format(&self) -> String {
        let code = match self.storage_type() {
            DataType::Null => "n",
            DataType::Boolean => "b",
            DataType::Int8 => "c",
            DataType::UInt8 => "C",
            DataType::Int16 => "s",
            DataType::UInt16 => "S",
            DataType::Int32 => "i",
            DataType::UInt32 => "I",
            DataType::Int64 => "l",
            DataType::UInt64 => "L",
            DataType::Float32 => "f",
            DataType::Float64 => "g",
            DataType::Binary => "z",
            DataType::Utf8 => "u",
            DataType::List(_) => "+l",
            DataType::Struct(_) => "+s",
            DataType::FixedSizeBinary(size) => return format!("w:{size}"),
            DataType::Dictionary(key, _) => return key.format(),
        };
        code.to_string()
    }

    /// Parse a non-nested C Data Interface format string
    pub fn from_format(format: &str) -> Result<Self> {
        let data_type = match format {
            "n" => DataType::Null,
            "b" => DataType::Boolean,
            "c" => DataType::Int8,
            "C" => DataType::UInt8,
            "s" => DataType::Int16,
            "S" => DataType::UInt16,
            "i" => DataType::Int32,
            "I" => DataType::UInt32,
            "l" => DataType::Int64,
            "L" => DataType::UInt64,
            "f" => DataType::Float32,
            "g" => DataType::Float64,
            "z" => DataType::Binary,
            "u" => DataType::Utf8,
            other => match other.strip_prefix("w:") {
                Some(width) => {
                    let width = width.parse::<usize>().map_err(|_| {
                        Error::InvalidArgument(format!("bad fixed-size binary format '{other}'"))
                    })?;
                    let data_type = DataType::FixedSizeBinary(width);
                    data_type.validate()?;
                    data_type
                }
                None => {
                    return Err(Error::InvalidArgument(format!(
                        "unsupported format string '{other}'"
                    )))
                }
            },
        };
        Ok(data_type)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::List(item) => write!(f, "List<{item}>"),
            DataType::Struct(fields) => {
                write!(f, "Struct<")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, ">")
            }
            DataType::Dictionary(key, value) => write!(f, "Dictionary<{key}, {value}>"),
            DataType::FixedSizeBinary(size) => write!(f, "FixedSizeBinary({size})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Rust primitive that can be stored in a fixed-width values buffer
pub trait NativeType: Pod + fmt::Debug + PartialEq + Send + Sync {
    /// The descriptor matching this primitive
    fn data_type() -> DataType;

    /// The value for slot `index` of a running sequence, wrapping on overflow
    fn from_index(index: usize) -> Self;
}

macro_rules! native_type {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl NativeType for $t {
                fn data_type() -> DataType {
                    DataType::$variant
                }

                #[allow(
                    clippy::cast_possible_truncation,
                    clippy::cast_possible_wrap,
                    clippy::cast_precision_loss
                )]
                fn from_index(index: usize) -> Self {
                    index as $t
                }
            }
        )*
    };
}

native_type!(
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
);

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(DataType::Null, 0, 0 ; "null")]
    #[test_case(DataType::Int32, 2, 0 ; "int32")]
    #[test_case(DataType::Utf8, 3, 0 ; "utf8")]
    #[test_case(DataType::List(Box::new(DataType::Int64)), 2, 1 ; "list")]
    #[test_case(DataType::Struct(vec![DataType::Boolean, DataType::Utf8]), 1, 2 ; "struct")]
    #[test_case(DataType::Dictionary(Box::new(DataType::Int8), Box::new(DataType::Utf8)), 2, 0 ; "dictionary")]
    fn test_layout_shape(data_type: DataType, buffers: usize, children: usize) {
        assert_eq!(data_type.n_buffers(), buffers);
        assert_eq!(data_type.n_children(), children);
    }

    #[test]
    fn test_values_bit_width() {
        assert_eq!(
            DataType::Boolean.buffer_layout()[1],
            BufferKind::Values { bit_width: 1 }
        );
        assert_eq!(
            DataType::FixedSizeBinary(3).buffer_layout()[1],
            BufferKind::Values { bit_width: 24 }
        );
    }

    #[test]
    fn test_min_bytes() {
        assert_eq!(BufferKind::Validity.min_bytes(9), Ok(Some(2)));
        assert_eq!(BufferKind::Values { bit_width: 32 }.min_bytes(7), Ok(Some(28)));
        assert_eq!(BufferKind::Offsets.min_bytes(0), Ok(Some(4)));
        assert_eq!(BufferKind::VarBytes.min_bytes(3), Ok(None));
    }

    #[test]
    fn test_min_bytes_overflow_is_an_allocation_error() {
        let values = BufferKind::Values { bit_width: 64 }.min_bytes(usize::MAX / 4);
        assert!(values.unwrap_err().is_allocation());
        assert!(BufferKind::Offsets.min_bytes(usize::MAX).unwrap_err().is_allocation());
        assert_eq!(BufferKind::Validity.min_bytes(usize::MAX), Ok(Some(usize::MAX / 8 + 1)));
    }

    #[test_case("i", DataType::Int32)]
    #[test_case("u", DataType::Utf8)]
    #[test_case("g", DataType::Float64)]
    #[test_case("w:16", DataType::FixedSizeBinary(16))]
    fn test_format_parse(format: &str, expected: DataType) {
        let parsed = DataType::from_format(format).unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.format(), format);
    }

    #[test]
    fn test_dictionary_reports_key_format() {
        let dict = DataType::Dictionary(Box::new(DataType::Int16), Box::new(DataType::Utf8));
        assert_eq!(dict.format(), "s");
        assert_eq!(dict.dictionary_type(), Some(&DataType::Utf8));
    }

    #[test]
    fn test_validate_rejects_float_keys() {
        let dict = DataType::Dictionary(Box::new(DataType::Float32), Box::new(DataType::Utf8));
        assert!(matches!(dict.validate(), Err(Error::TypeMismatch(_))));
        assert!(DataType::from_format("+w").is_err());
        assert!(DataType::from_format("w:0").is_err());
    }
}
