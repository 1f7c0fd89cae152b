//! Owned array records and their release lifecycle
//!
//! An [`ArrayRecord`] exclusively owns its buffers, its children and its
//! dictionary. It starts out populated and moves to released exactly once,
//! either through [`ArrayRecord::release`] or when it is dropped. Release is
//! bottom-up: the dictionary first, then each child in order, then the
//! record's own buffers, and only then its release callbacks.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::access::ArrayAccess;
use crate::bitmap::{bytes_for, count_set_bits, get_bit, set_bit, unset_bit};
use crate::buffer::{Buffer, BufferView};
use crate::datatype::{BufferKind, DataType, NativeType};
use crate::error::{Error, Result};
use crate::memory::{default_pool, MemoryPool};

/// Callback run once when a record is released
pub type ReleaseCallback = Box<dyn FnOnce() + Send + Sync>;

/// Lifecycle state of an owned record
///
/// Owned records are born populated. The uninitialized state of the
/// exchange protocol only exists at the C boundary, as
/// [`FFI_ArrowArray::empty`](crate::ffi::FFI_ArrowArray::empty).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Fields and buffers are readable
    Populated,

    /// Buffers, children and dictionary have been freed
    Released,
}

/// Raw parts of a record, validated by [`ArrayRecord::try_new`]
#[derive(Debug)]
pub struct RecordParts {
    /// Logical type
    pub data_type: DataType,

    /// Number of logical elements
    pub length: usize,

    /// Physical slot of logical element 0
    pub offset: usize,

    /// Exact null count, `None` if unknown
    pub null_count: Option<usize>,

    /// Buffers in layout order, `None` for absent buffers
    pub buffers: Vec<Option<Buffer>>,

    /// Child records in field order
    pub children: Vec<ArrayRecord>,

    /// Dictionary values for dictionary-encoded types
    pub dictionary: Option<ArrayRecord>,
}

impl RecordParts {
    /// Start a set of parts with no buffers, children or dictionary
    pub fn new(data_type: DataType, length: usize) -> Self {
        Self {
            data_type,
            length,
            offset: 0,
            null_count: None,
            buffers: Vec::new(),
            children: Vec::new(),
            dictionary: None,
        }
    }

    /// Set the offset
    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Set the null count (`None` for unknown)
    #[must_use]
    pub fn with_null_count(mut self, null_count: Option<usize>) -> Self {
        self.null_count = null_count;
        self
    }

    /// Set the buffers
    #[must_use]
    pub fn with_buffers(mut self, buffers: Vec<Option<Buffer>>) -> Self {
        self.buffers = buffers;
        self
    }

    /// Set the children
    #[must_use]
    pub fn with_children(mut self, children: Vec<ArrayRecord>) -> Self {
        self.children = children;
        self
    }

    /// Set the dictionary
    #[must_use]
    pub fn with_dictionary(mut self, dictionary: ArrayRecord) -> Self {
        self.dictionary = Some(dictionary);
        self
    }
}

/// Owned description of one column's physical storage
pub struct ArrayRecord {
    data_type: DataType,
    length: usize,
    offset: usize,

    /// Null count declared by the producer
    null_count: Option<usize>,

    /// Lazily computed count when the declared one is unknown
    computed_null_count: OnceLock<usize>,

    buffers: Vec<Option<Buffer>>,
    children: Vec<ArrayRecord>,
    dictionary: Option<Box<ArrayRecord>>,
    release_callbacks: Vec<ReleaseCallback>,
    state: RecordState,
}

impl ArrayRecord {
    /// Allocate a record of `data_type` from the default pool
    ///
    /// See [`ArrayRecord::create_in`].
    pub fn create(
        data_type: &DataType,
        length: usize,
        offset: usize,
        null_count: Option<usize>,
    ) -> Result<Self> {
        Self::create_in(data_type, length, offset, null_count, &default_pool())
    }

    /// Allocate every buffer a record of `data_type` needs for
    /// `offset + length` slots
    ///
    /// Data buffers are zero-filled. The validity bitmap is omitted when
    /// `null_count` is exactly zero and otherwise allocated with every bit
    /// set, ready for [`ArrayRecord::set_valid`]. Since a fresh bitmap has
    /// no nulls yet, any non-zero count is kept as unknown and recounted
    /// from the bits once they are written. Lists get an empty child,
    /// structs get one child per field covering every slot, and
    /// dictionary-encoded types get an empty dictionary. `Null` records
    /// carry no buffers and always report every element as null.
    ///
    /// If any allocation fails, everything allocated so far is returned to
    /// the pool before the error is reported.
    pub fn create_in(
        data_type: &DataType,
        length: usize,
        offset: usize,
        null_count: Option<usize>,
        pool: &Arc<dyn MemoryPool>,
    ) -> Result<Self> {
        data_type.validate()?;
        let slots = checked_slots(offset, length)?;

        check_null_count(null_count, length)?;
        let null_count = match null_count {
            _ if *data_type == DataType::Null => Some(length),
            Some(0) => Some(0),
            _ => None,
        };

        let mut buffers = Vec::with_capacity(data_type.n_buffers());
        for kind in data_type.buffer_layout() {
            let buffer = match kind {
                BufferKind::Validity if null_count == Some(0) => None,
                BufferKind::Validity => Some(Buffer::new_filled_in(bytes_for(slots), 0xFF, pool)?),
                BufferKind::VarBytes => Some(Buffer::new_zeroed_in(0, pool)?),
                sized => Some(Buffer::new_zeroed_in(
                    sized.min_bytes(slots)?.unwrap_or(0),
                    pool,
                )?),
            };
            buffers.push(buffer);
        }

        let child_slots = match data_type {
            DataType::Struct(_) => slots,
            _ => 0,
        };
        let children = data_type
            .child_types()
            .iter()
            .map(|child| Self::create_in(child, child_slots, 0, Some(0), pool))
            .collect::<Result<Vec<_>>>()?;

        let dictionary = match data_type.dictionary_type() {
            Some(value_type) => Some(Box::new(Self::create_in(value_type, 0, 0, Some(0), pool)?)),
            None => None,
        };

        tracing::debug!(
            data_type = %data_type,
            length,
            offset,
            buffers = buffers.len(),
            children = children.len(),
            "created array record"
        );

        Ok(Self::from_validated(
            data_type.clone(),
            length,
            offset,
            null_count,
            buffers,
            children,
            dictionary,
        ))
    }

    /// Assemble a record from explicit parts, checking them against the
    /// type's layout
    ///
    /// Buffers must match the layout in count and cover `offset + length`
    /// slots; children and the dictionary must match the type and still be
    /// populated. If validation fails, the parts are dropped and thereby
    /// released.
    pub fn try_new(parts: RecordParts) -> Result<Self> {
        let RecordParts {
            data_type,
            length,
            offset,
            null_count,
            buffers,
            children,
            dictionary,
        } = parts;

        data_type.validate()?;
        let slots = checked_slots(offset, length)?;
        check_null_count(null_count, length)?;

        if data_type == DataType::Null && null_count.is_some_and(|n| n != length) {
            return Err(Error::InvalidRecord(
                "every element of a Null record is null".into(),
            ));
        }

        let layout = data_type.buffer_layout();
        if buffers.len() != layout.len() {
            return Err(Error::InvalidRecord(format!(
                "{data_type} expects {} buffers, got {}",
                layout.len(),
                buffers.len()
            )));
        }

        for (index, (kind, buffer)) in layout.iter().zip(&buffers).enumerate() {
            let Some(buffer) = buffer else {
                if *kind == BufferKind::Validity {
                    if null_count.is_some_and(|n| n > 0) {
                        return Err(Error::InvalidRecord(format!(
                            "null count {null_count:?} declared without a validity bitmap"
                        )));
                    }
                    continue;
                }
                return Err(Error::InvalidRecord(format!("buffer {index} is required")));
            };

            let required = match kind.min_bytes(slots).map_err(|_| {
                Error::InvalidRecord(format!("buffer {index} cannot cover {slots} slots"))
            })? {
                Some(bytes) => bytes,
                None => last_offset(&buffers, index, slots)?,
            };
            if buffer.len() < required {
                return Err(Error::InvalidRecord(format!(
                    "buffer {index} holds {} bytes, {required} required",
                    buffer.len()
                )));
            }
        }

        let null_count = match (buffers.first(), null_count) {
            (Some(Some(bitmap)), Some(declared)) => {
                let nulls = length - count_set_bits(bitmap.as_slice(), offset, length);
                if declared != nulls {
                    return Err(Error::InvalidRecord(format!(
                        "null count {declared} declared, validity bitmap has {nulls} nulls"
                    )));
                }
                Some(declared)
            }
            (Some(None), _) if data_type != DataType::Null => Some(0),
            (_, declared) => declared,
        };

        let child_types = data_type.child_types();
        if children.len() != child_types.len() {
            return Err(Error::InvalidRecord(format!(
                "{data_type} expects {} children, got {}",
                child_types.len(),
                children.len()
            )));
        }
        for (i, (child, expected)) in children.iter().zip(child_types).enumerate() {
            if child.is_released() {
                return Err(Error::AlreadyReleased);
            }
            if child.data_type() != expected {
                return Err(Error::TypeMismatch(format!(
                    "child {i} is {}, expected {expected}",
                    child.data_type()
                )));
            }
            let needed = match data_type {
                DataType::List(_) => last_offset(&buffers, 2, slots)?,
                _ => slots,
            };
            if child.len() < needed {
                return Err(Error::InvalidRecord(format!(
                    "child {i} holds {} elements, {needed} required",
                    child.len()
                )));
            }
        }

        let dictionary = match (data_type.dictionary_type(), dictionary) {
            (Some(expected), Some(dictionary)) => {
                if dictionary.is_released() {
                    return Err(Error::AlreadyReleased);
                }
                if dictionary.data_type() != expected {
                    return Err(Error::TypeMismatch(format!(
                        "dictionary is {}, expected {expected}",
                        dictionary.data_type()
                    )));
                }
                Some(Box::new(dictionary))
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(Error::InvalidRecord(format!(
                    "{data_type} requires a dictionary"
                )))
            }
            (None, Some(_)) => {
                return Err(Error::InvalidRecord(format!(
                    "{data_type} is not dictionary encoded"
                )))
            }
        };

        Ok(Self::from_validated(
            data_type, length, offset, null_count, buffers, children, dictionary,
        ))
    }

    fn from_validated(
        data_type: DataType,
        length: usize,
        offset: usize,
        null_count: Option<usize>,
        buffers: Vec<Option<Buffer>>,
        children: Vec<ArrayRecord>,
        dictionary: Option<Box<ArrayRecord>>,
    ) -> Self {
        Self {
            data_type,
            length,
            offset,
            null_count,
            computed_null_count: OnceLock::new(),
            buffers,
            children,
            dictionary,
            release_callbacks: Vec::new(),
            state: RecordState::Populated,
        }
    }

    /// Record holding a copy of `values`, with no validity bitmap
    pub fn from_values<T: NativeType>(values: &[T]) -> Result<Self> {
        Self::from_values_in(values, &default_pool())
    }

    /// Record holding a copy of `values`, allocated from `pool`
    pub fn from_values_in<T: NativeType>(values: &[T], pool: &Arc<dyn MemoryPool>) -> Result<Self> {
        let data = Buffer::from_slice_in(values, pool)?;
        Self::try_new(
            RecordParts::new(T::data_type(), values.len()).with_buffers(vec![None, Some(data)]),
        )
    }

    /// Record from optional values; `None` entries become null slots
    pub fn from_options<T: NativeType>(values: &[Option<T>]) -> Result<Self> {
        Self::from_options_in(values, &default_pool())
    }

    /// Record from optional values, allocated from `pool`
    pub fn from_options_in<T: NativeType>(
        values: &[Option<T>],
        pool: &Arc<dyn MemoryPool>,
    ) -> Result<Self> {
        let mut validity = vec![0u8; bytes_for(values.len())];
        let mut data = Vec::with_capacity(values.len());
        let mut null_count = 0;

        for (i, value) in values.iter().enumerate() {
            match value {
                Some(v) => {
                    set_bit(&mut validity, i);
                    data.push(*v);
                }
                None => {
                    data.push(<T as bytemuck::Zeroable>::zeroed());
                    null_count += 1;
                }
            }
        }

        let validity = (null_count > 0)
            .then(|| Buffer::from_slice_in(&validity, pool))
            .transpose()?;
        Self::try_new(
            RecordParts::new(T::data_type(), values.len())
                .with_null_count(Some(null_count))
                .with_buffers(vec![validity, Some(Buffer::from_slice_in(&data, pool)?)]),
        )
    }

    /// `Utf8` record from optional strings
    pub fn from_strs(values: &[Option<&str>]) -> Result<Self> {
        Self::from_strs_in(values, &default_pool())
    }

    /// `Utf8` record from optional strings, allocated from `pool`
    pub fn from_strs_in<S: AsRef<str>>(
        values: &[Option<S>],
        pool: &Arc<dyn MemoryPool>,
    ) -> Result<Self> {
        let mut validity = vec![0u8; bytes_for(values.len())];
        let mut offsets = Vec::with_capacity(values.len() + 1);
        let mut bytes = Vec::new();
        let mut null_count = 0;

        offsets.push(0i32);
        for (i, value) in values.iter().enumerate() {
            match value {
                Some(s) => {
                    set_bit(&mut validity, i);
                    bytes.extend_from_slice(s.as_ref().as_bytes());
                }
                None => null_count += 1,
            }
            let end = i32::try_from(bytes.len()).map_err(|_| {
                Error::InvalidArgument("string data exceeds 32-bit offsets".into())
            })?;
            offsets.push(end);
        }

        let validity = (null_count > 0)
            .then(|| Buffer::from_slice_in(&validity, pool))
            .transpose()?;
        Self::try_new(
            RecordParts::new(DataType::Utf8, values.len())
                .with_null_count(Some(null_count))
                .with_buffers(vec![
                    validity,
                    Some(Buffer::from_slice_in(&offsets, pool)?),
                    Some(Buffer::from_slice_in(&bytes, pool)?),
                ]),
        )
    }

    /// Narrow the record to `length` elements starting at logical `offset`
    ///
    /// No data moves: only the record's offset and length change. A known
    /// null count becomes unknown unless the record has no validity bitmap.
    pub fn sliced(mut self, offset: usize, length: usize) -> Result<Self> {
        self.ensure_populated()?;

        let end = checked_slots(offset, length)?;
        if end > self.length {
            return Err(Error::IndexOutOfRange {
                index: end,
                len: self.length,
            });
        }

        let has_validity = self.buffers.first().is_some_and(Option::is_some);
        self.null_count = if self.data_type == DataType::Null {
            Some(length)
        } else if has_validity {
            None
        } else {
            Some(0)
        };
        self.computed_null_count = OnceLock::new();
        self.offset += offset;
        self.length = length;
        Ok(self)
    }

    /// Current lifecycle state
    pub fn state(&self) -> RecordState {
        self.state
    }

    /// Whether the record has been released
    pub fn is_released(&self) -> bool {
        self.state == RecordState::Released
    }

    /// Child records, in field order
    pub fn children(&self) -> &[ArrayRecord] {
        &self.children
    }

    /// Child record `index`
    pub fn child(&self, index: usize) -> Result<&ArrayRecord> {
        self.ensure_populated()?;
        self.children.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.children.len(),
        })
    }

    /// Dictionary record, for dictionary-encoded types
    pub fn dictionary(&self) -> Option<&ArrayRecord> {
        self.dictionary.as_deref()
    }

    /// Bytes held by this record's buffers and every nested record
    pub fn memory_usage(&self) -> usize {
        let own: usize = self.buffers.iter().flatten().map(Buffer::len).sum();
        let children: usize = self.children.iter().map(ArrayRecord::memory_usage).sum();
        own + children + self.dictionary.as_ref().map_or(0, |d| d.memory_usage())
    }

    /// Register a callback to run once, after this record's buffers are freed
    pub fn on_release<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.ensure_populated()?;
        self.release_callbacks.push(Box::new(callback));
        Ok(())
    }

    /// Mutable access to buffer `index` while the record is being populated
    ///
    /// Borrowing the validity bitmap drops a declared null count; it is
    /// recounted from the bits on the next [`ArrayAccess::null_count`].
    pub fn buffer_mut(&mut self, index: usize) -> Result<Option<&mut Buffer>> {
        self.ensure_populated()?;
        let n_buffers = self.buffers.len();
        let slot = self.buffers.get_mut(index).ok_or(Error::IndexOutOfRange {
            index,
            len: n_buffers,
        })?;

        if index == 0 && slot.is_some() {
            self.null_count = None;
            self.computed_null_count = OnceLock::new();
        }
        Ok(slot.as_mut())
    }

    /// Mark logical element `i` valid or null
    ///
    /// A known null count is kept in step with the bitmap. Records created
    /// without a validity bitmap can only be marked valid.
    pub fn set_valid(&mut self, i: usize, valid: bool) -> Result<()> {
        self.ensure_populated()?;
        self.check_index(i)?;
        let slot = self.offset + i;

        let Some(Some(bitmap)) = self.buffers.first_mut() else {
            return if valid {
                Ok(())
            } else {
                Err(Error::NullBufferAccess { index: 0 })
            };
        };

        let bits = bitmap.as_mut_slice();
        let was_valid = get_bit(bits, slot);
        if valid {
            set_bit(bits, slot);
        } else {
            unset_bit(bits, slot);
        }

        if was_valid != valid {
            self.null_count = self.null_count.and_then(|count| {
                if valid {
                    count.checked_sub(1)
                } else {
                    count.checked_add(1)
                }
            });
            self.computed_null_count = OnceLock::new();
        }
        Ok(())
    }

    /// Release the record: dictionary, children in order, own buffers, then
    /// release callbacks
    ///
    /// Returns [`Error::AlreadyReleased`] if called again; a second call
    /// never frees anything.
    pub fn release(&mut self) -> Result<()> {
        self.ensure_populated()?;

        if let Some(dictionary) = self.dictionary.as_mut() {
            dictionary.release_nested();
        }
        for child in &mut self.children {
            child.release_nested();
        }
        self.dictionary = None;
        self.children.clear();

        let mut freed = 0;
        for buffer in self.buffers.drain(..).flatten() {
            freed += buffer.len();
        }
        self.state = RecordState::Released;

        let callbacks = std::mem::take(&mut self.release_callbacks);
        tracing::trace!(
            data_type = %self.data_type,
            freed_bytes = freed,
            callbacks = callbacks.len(),
            "released array record"
        );
        for callback in callbacks {
            callback();
        }

        Ok(())
    }

    fn release_nested(&mut self) {
        if !self.is_released() {
            // populated nested records cannot fail to release
            let _ = self.release();
        }
    }

    pub(crate) fn ensure_populated(&self) -> Result<()> {
        match self.state {
            RecordState::Populated => Ok(()),
            RecordState::Released => Err(Error::AlreadyReleased),
        }
    }

    /// Detach children and dictionary, leaving only own buffers behind
    pub(crate) fn take_nested(&mut self) -> (Vec<ArrayRecord>, Option<ArrayRecord>) {
        let children = std::mem::take(&mut self.children);
        let dictionary = self.dictionary.take().map(|d| *d);
        (children, dictionary)
    }

    /// Buffer start pointers in layout order, null for absent buffers
    pub(crate) fn buffer_ptrs(&self) -> impl Iterator<Item = *const u8> + '_ {
        self.buffers
            .iter()
            .map(|b| b.as_ref().map_or(std::ptr::null(), Buffer::as_ptr))
    }
}

impl ArrayAccess for ArrayRecord {
    fn data_type(&self) -> &DataType {
        &self.data_type
    }

    fn len(&self) -> usize {
        self.length
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn get_buffer(&self, index: usize) -> Result<Option<BufferView<'_>>> {
        self.ensure_populated()?;
        match self.buffers.get(index) {
            Some(buffer) => Ok(buffer.as_ref().map(Buffer::view)),
            None => Err(Error::IndexOutOfRange {
                index,
                len: self.buffers.len(),
            }),
        }
    }

    fn declared_null_count(&self) -> Option<usize> {
        self.null_count
    }

    fn null_count_cache(&self) -> &OnceLock<usize> {
        &self.computed_null_count
    }
}

impl Drop for ArrayRecord {
    fn drop(&mut self) {
        self.release_nested();
    }
}

impl fmt::Debug for ArrayRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayRecord")
            .field("data_type", &self.data_type)
            .field("length", &self.length)
            .field("offset", &self.offset)
            .field("null_count", &self.null_count)
            .field("buffers", &self.buffers)
            .field("children", &self.children)
            .field("dictionary", &self.dictionary)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn checked_slots(offset: usize, length: usize) -> Result<usize> {
    offset.checked_add(length).ok_or_else(|| {
        Error::InvalidArgument(format!("offset {offset} + length {length} overflows"))
    })
}

fn check_null_count(null_count: Option<usize>, length: usize) -> Result<()> {
    match null_count {
        Some(n) if n > length => Err(Error::InvalidArgument(format!(
            "null count {n} exceeds length {length}"
        ))),
        _ => Ok(()),
    }
}

/// Last entry of the offsets buffer preceding `index`
fn last_offset(buffers: &[Option<Buffer>], index: usize, slots: usize) -> Result<usize> {
    let offsets = buffers
        .get(index - 1)
        .and_then(Option::as_ref)
        .ok_or(Error::NullBufferAccess { index: index - 1 })?
        .typed::<i32>()?;

    let last = offsets.get(slots).copied().ok_or_else(|| {
        Error::InvalidRecord(format!("offsets buffer does not cover slot {slots}"))
    })?;
    usize::try_from(last)
        .map_err(|_| Error::InvalidRecord(format!("negative offset {last} at slot {slots}")))
}
