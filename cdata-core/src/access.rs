//! Read access shared by owned and imported records
//!
//! Implementors only provide the raw fields and buffer lookup; every logical
//! read (validity, typed values, variable-length slots, null counting) is
//! written once here in terms of them. Logical index `i` always maps to
//! physical slot `offset + i`.

use std::ops::Range;
use std::sync::OnceLock;

use crate::bitmap::{bytes_for, count_set_bits, get_bit};
use crate::buffer::BufferView;
use crate::datatype::{DataType, NativeType};
use crate::error::{Error, Result};

/// Read-only view over the fields and buffers of an array record
pub trait ArrayAccess {
    /// Logical type of the record
    fn data_type(&self) -> &DataType;

    /// Number of logical elements
    fn len(&self) -> usize;

    /// Physical slot of logical element 0
    fn offset(&self) -> usize;

    /// Borrow buffer `index`
    ///
    /// Returns `Ok(None)` for an absent buffer and
    /// [`Error::IndexOutOfRange`] when `index >= n_buffers`.
    fn get_buffer(&self, index: usize) -> Result<Option<BufferView<'_>>>;

    /// Null count as declared by the producer, `None` when unknown
    fn declared_null_count(&self) -> Option<usize>;

    /// Cache slot for a lazily computed null count
    fn null_count_cache(&self) -> &OnceLock<usize>;

    /// Whether the record holds no elements
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buffers the record's type carries
    fn n_buffers(&self) -> usize {
        self.data_type().n_buffers()
    }

    /// Fail with [`Error::IndexOutOfRange`] unless `i < len`
    fn check_index(&self, i: usize) -> Result<()> {
        if i >= self.len() {
            return Err(Error::IndexOutOfRange {
                index: i,
                len: self.len(),
            });
        }
        Ok(())
    }

    /// The validity bitmap, `None` when absent (all valid)
    fn validity(&self) -> Result<Option<BufferView<'_>>> {
        if self.n_buffers() == 0 {
            return Ok(None);
        }
        self.get_buffer(0)
    }

    /// Whether logical element `i` is non-null
    fn is_valid(&self, i: usize) -> Result<bool> {
        self.check_index(i)?;

        if *self.data_type() == DataType::Null {
            return Ok(false);
        }

        match self.validity()? {
            Some(bits) => {
                let slot = self.offset() + i;
                if slot / 8 >= bits.len() {
                    return Err(Error::InvalidRecord(format!(
                        "validity bitmap of {} bytes does not cover slot {slot}",
                        bits.len()
                    )));
                }
                Ok(get_bit(&bits, slot))
            }
            None => Ok(true),
        }
    }

    /// Whether logical element `i` is null
    fn is_null(&self, i: usize) -> Result<bool> {
        self.is_valid(i).map(|valid| !valid)
    }

    /// Number of null elements
    ///
    /// An unknown count is computed once by popcount over the validity bits
    /// in `[offset, offset + len)` and cached for later calls.
    fn null_count(&self) -> Result<usize> {
        if let Some(count) = self.declared_null_count() {
            return Ok(count);
        }
        if *self.data_type() == DataType::Null {
            return Ok(self.len());
        }
        if let Some(count) = self.null_count_cache().get() {
            return Ok(*count);
        }

        let count = match self.validity()? {
            Some(bits) => {
                let end = self.offset() + self.len();
                if bytes_for(end) > bits.len() {
                    return Err(Error::InvalidRecord(format!(
                        "validity bitmap of {} bytes does not cover {end} slots",
                        bits.len()
                    )));
                }
                self.len() - count_set_bits(&bits, self.offset(), self.len())
            }
            None => 0,
        };

        Ok(*self.null_count_cache().get_or_init(|| count))
    }

    /// Buffer `index`, failing with [`Error::NullBufferAccess`] when absent
    fn required_buffer(&self, index: usize) -> Result<BufferView<'_>> {
        self.get_buffer(index)?
            .ok_or(Error::NullBufferAccess { index })
    }

    /// The values of a fixed-width record, logical range only
    ///
    /// Null slots are included with whatever the producer stored there.
    fn values<T: NativeType>(&self) -> Result<&[T]> {
        let expected = T::data_type();
        if *self.data_type().storage_type() != expected {
            return Err(Error::TypeMismatch(format!(
                "cannot read {} values as {expected}",
                self.data_type()
            )));
        }

        let all = self.required_buffer(1)?.typed::<T>()?;
        let range = self.offset()..self.offset() + self.len();
        all.get(range.clone()).ok_or_else(|| {
            Error::InvalidRecord(format!(
                "values buffer holds {} elements, slots {range:?} requested",
                all.len()
            ))
        })
    }

    /// Value of logical element `i`, `None` when null
    fn value<T: NativeType>(&self, i: usize) -> Result<Option<T>> {
        if !self.is_valid(i)? {
            return Ok(None);
        }
        Ok(Some(self.values::<T>()?[i]))
    }

    /// Value of logical element `i` of a boolean record
    fn bool_value(&self, i: usize) -> Result<Option<bool>> {
        if *self.data_type() != DataType::Boolean {
            return Err(Error::TypeMismatch(format!(
                "cannot read {} values as Boolean",
                self.data_type()
            )));
        }
        if !self.is_valid(i)? {
            return Ok(None);
        }

        let bits = self.required_buffer(1)?;
        let slot = self.offset() + i;
        if slot / 8 >= bits.len() {
            return Err(Error::InvalidRecord(format!(
                "boolean buffer does not cover slot {slot}"
            )));
        }
        Ok(Some(get_bit(&bits, slot)))
    }

    /// Offsets range of logical element `i` of a list or variable-length record
    fn slot_range(&self, i: usize) -> Result<Range<usize>> {
        self.check_index(i)?;

        let offsets = self.required_buffer(1)?.typed::<i32>()?;
        let slot = self.offset() + i;
        let (Some(&start), Some(&end)) = (offsets.get(slot), offsets.get(slot + 1)) else {
            return Err(Error::InvalidRecord(format!(
                "offsets buffer does not cover slot {slot}"
            )));
        };

        match (usize::try_from(start), usize::try_from(end)) {
            (Ok(start), Ok(end)) if start <= end => Ok(start..end),
            _ => Err(Error::InvalidRecord(format!(
                "offsets {start}..{end} at slot {slot} are not a valid range"
            ))),
        }
    }

    /// Bytes of logical element `i` of a `Utf8` or `Binary` record
    fn bytes_value(&self, i: usize) -> Result<Option<&[u8]>> {
        if !self.data_type().is_var_binary() {
            return Err(Error::TypeMismatch(format!(
                "cannot read {} values as bytes",
                self.data_type()
            )));
        }
        if !self.is_valid(i)? {
            return Ok(None);
        }

        let range = self.slot_range(i)?;
        let data: &[u8] = match self.get_buffer(2)? {
            Some(view) => view.as_bytes(),
            None if range.is_empty() => return Ok(Some(&[])),
            None => return Err(Error::NullBufferAccess { index: 2 }),
        };

        data.get(range.clone()).map(Some).ok_or_else(|| {
            Error::InvalidRecord(format!(
                "byte range {range:?} exceeds data buffer of {} bytes",
                data.len()
            ))
        })
    }

    /// String value of logical element `i` of a `Utf8` record
    fn str_value(&self, i: usize) -> Result<Option<&str>> {
        if *self.data_type() != DataType::Utf8 {
            return Err(Error::TypeMismatch(format!(
                "cannot read {} values as strings",
                self.data_type()
            )));
        }

        match self.bytes_value(i)? {
            Some(bytes) => std::str::from_utf8(bytes)
                .map(Some)
                .map_err(|e| Error::InvalidRecord(format!("slot {i} is not UTF-8: {e}"))),
            None => Ok(None),
        }
    }
}
