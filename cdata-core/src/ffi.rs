//! The C layout of an array record, and moving records across it
//!
//! [`FFI_ArrowArray`] is bit-compatible with `struct ArrowArray` of the
//! Arrow C Data Interface, so a record exported here can be consumed from C,
//! C++ or Python, and a record produced there can be read here.
//!
//! * Export: [`ArrayRecord::into_ffi`] moves the record, its children and its
//!   dictionary into `private_data` and installs a release callback that
//!   frees them bottom-up.
//! * Import: [`ImportedArray::try_from_raw`] moves a foreign struct into Rust,
//!   marking the source released, and checks it against the expected type.
//!   Dropping the import calls the foreign release callback exactly once.

use std::ffi::c_void;
use std::ptr;
use std::sync::OnceLock;

use static_assertions::assert_eq_size;

use crate::access::ArrayAccess;
use crate::buffer::BufferView;
use crate::datatype::{BufferKind, DataType};
use crate::error::{Error, Result};
use crate::record::ArrayRecord;

/// Null count sentinel meaning "not computed"
pub const UNKNOWN_NULL_COUNT: i64 = -1;

/// ABI-compatible `struct ArrowArray`
///
/// Field order and types follow
/// <https://arrow.apache.org/docs/format/CDataInterface.html#structure-definitions>.
#[repr(C)]
#[derive(Debug)]
#[allow(non_camel_case_types)]
pub struct FFI_ArrowArray {
    length: i64,
    null_count: i64,
    offset: i64,
    n_buffers: i64,
    n_children: i64,
    buffers: *mut *const c_void,
    children: *mut *mut FFI_ArrowArray,
    dictionary: *mut FFI_ArrowArray,
    release: Option<unsafe extern "C" fn(arg1: *mut FFI_ArrowArray)>,
    // When exported, this owns everything the pointers above refer to,
    // including the pointer arrays themselves.
    private_data: *mut c_void,
}

#[cfg(target_pointer_width = "64")]
assert_eq_size!(FFI_ArrowArray, [u8; 80]);

impl FFI_ArrowArray {
    /// An uninitialized struct for a producer to fill
    ///
    /// `release` is null, so dropping it frees nothing.
    pub fn empty() -> Self {
        Self {
            length: 0,
            null_count: 0,
            offset: 0,
            n_buffers: 0,
            n_children: 0,
            buffers: ptr::null_mut(),
            children: ptr::null_mut(),
            dictionary: ptr::null_mut(),
            release: None,
            private_data: ptr::null_mut(),
        }
    }

    /// Whether the struct is released (or was never populated)
    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }

    /// Raw `length` field
    pub fn length(&self) -> i64 {
        self.length
    }

    /// Raw `null_count` field, [`UNKNOWN_NULL_COUNT`] if not computed
    pub fn null_count(&self) -> i64 {
        self.null_count
    }

    /// Raw `offset` field
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Raw `n_buffers` field
    pub fn n_buffers(&self) -> i64 {
        self.n_buffers
    }

    /// Raw `n_children` field
    pub fn n_children(&self) -> i64 {
        self.n_children
    }

    /// Whether a dictionary record is attached
    pub fn has_dictionary(&self) -> bool {
        !self.dictionary.is_null()
    }

    /// Pointer to buffer `index`, null if absent
    pub fn buffer_ptr(&self, index: usize) -> Result<*const c_void> {
        let len = usize::try_from(self.n_buffers).unwrap_or(0);
        if index >= len {
            return Err(Error::IndexOutOfRange { index, len });
        }
        if self.buffers.is_null() {
            return Ok(ptr::null());
        }
        // Safety: `buffers` holds `n_buffers` entries
        Ok(unsafe { *self.buffers.add(index) })
    }
}

impl Drop for FFI_ArrowArray {
    fn drop(&mut self) {
        if let Some(release) = self.release {
            // Safety: a populated struct's release callback accepts itself
            unsafe { release(self) };
        }
    }
}

/// Everything an exported struct points into
struct ExportedPrivate {
    /// The record with its children and dictionary detached; holds buffers
    record: ArrayRecord,
    buffer_ptrs: Box<[*const c_void]>,
    children: Box<[*mut FFI_ArrowArray]>,
    dictionary: *mut FFI_ArrowArray,
}

// Release callback installed on every exported struct
unsafe extern "C" fn release_exported(array: *mut FFI_ArrowArray) {
    if array.is_null() {
        return;
    }
    let array = &mut *array;
    if array.private_data.is_null() {
        array.release = None;
        return;
    }

    // take ownership of `private_data`, dropping it piece by piece
    let private = Box::from_raw(array.private_data.cast::<ExportedPrivate>());
    let ExportedPrivate {
        mut record,
        buffer_ptrs,
        children,
        dictionary,
    } = *private;

    // nested structs release themselves on drop unless a consumer moved them out
    if !dictionary.is_null() {
        drop(Box::from_raw(dictionary));
    }
    for child in children.iter() {
        drop(Box::from_raw(*child));
    }
    drop(children);
    drop(buffer_ptrs);

    if let Err(err) = record.release() {
        tracing::warn!(%err, "exported record was released twice");
    }

    array.private_data = ptr::null_mut();
    array.release = None;
}

fn to_i64(value: usize, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::LayoutError(format!("{field} {value} exceeds i64")))
}

impl ArrayRecord {
    /// Move this record into its C layout
    ///
    /// The returned struct owns everything; its release callback frees the
    /// dictionary, then each child, then the buffers. Dropping the struct
    /// without handing it to a consumer releases it too.
    pub fn into_ffi(mut self) -> Result<FFI_ArrowArray> {
        self.ensure_populated()?;

        let length = to_i64(self.len(), "length")?;
        let offset = to_i64(self.offset(), "offset")?;
        let has_validity = self.validity()?.is_some();
        let null_count = match (self.declared_null_count(), self.null_count_cache().get()) {
            (Some(count), _) | (None, Some(&count)) => to_i64(count, "null_count")?,
            (None, None) if !has_validity && *self.data_type() != DataType::Null => 0,
            (None, None) => UNKNOWN_NULL_COUNT,
        };

        let (children, dictionary) = self.take_nested();
        let children = children
            .into_iter()
            .map(ArrayRecord::into_ffi)
            .collect::<Result<Vec<_>>>()?;
        let dictionary = dictionary.map(ArrayRecord::into_ffi).transpose()?;
        let buffer_ptrs: Box<[*const c_void]> =
            self.buffer_ptrs().map(|p| p.cast::<c_void>()).collect();
        let n_buffers = to_i64(buffer_ptrs.len(), "n_buffers")?;
        let n_children = to_i64(children.len(), "n_children")?;

        let children: Box<[*mut FFI_ArrowArray]> = children
            .into_iter()
            .map(|child| Box::into_raw(Box::new(child)))
            .collect();
        let dictionary = dictionary.map_or(ptr::null_mut(), |d| Box::into_raw(Box::new(d)));

        tracing::debug!(
            data_type = %self.data_type(),
            length,
            offset,
            null_count,
            n_buffers,
            n_children,
            "exporting array record"
        );

        let mut private = Box::new(ExportedPrivate {
            record: self,
            buffer_ptrs,
            children,
            dictionary,
        });

        Ok(FFI_ArrowArray {
            length,
            null_count,
            offset,
            n_buffers,
            n_children,
            buffers: private.buffer_ptrs.as_mut_ptr(),
            children: private.children.as_mut_ptr(),
            dictionary,
            release: Some(release_exported),
            private_data: Box::into_raw(private).cast::<c_void>(),
        })
    }

    /// Export this record into caller-provided memory
    ///
    /// # Safety
    ///
    /// `out` must be valid for writes of one `FFI_ArrowArray`. Whatever it
    /// held before is overwritten without being released.
    pub unsafe fn export_into(self, out: *mut FFI_ArrowArray) -> Result<()> {
        if out.is_null() {
            return Err(Error::InvalidArgument("export target is null".into()));
        }
        let exported = self.into_ffi()?;
        ptr::write(out, exported);
        Ok(())
    }
}

fn non_negative(value: i64, field: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| Error::InvalidRecord(format!("{field} must be non-negative, got {value}")))
}

/// Physical slot count `offset + length` of a foreign struct
fn raw_slots(raw: &FFI_ArrowArray) -> Result<usize> {
    let length = non_negative(raw.length, "length")?;
    let offset = non_negative(raw.offset, "offset")?;
    if raw.offset.checked_add(raw.length).is_none() {
        return Err(Error::InvalidRecord(format!(
            "offset {offset} + length {length} overflows i64"
        )));
    }
    offset.checked_add(length).ok_or_else(|| {
        Error::InvalidRecord(format!("offset {offset} + length {length} overflows"))
    })
}

/// Byte extent of a `kind` buffer spanning `slots`, `None` for var bytes
fn raw_extent(kind: BufferKind, slots: usize) -> Result<Option<usize>> {
    let bytes = kind.min_bytes(slots).map_err(|_| {
        Error::InvalidRecord(format!("{kind:?} buffer cannot span {slots} slots"))
    })?;
    if bytes.is_some_and(|n| isize::try_from(n).is_err()) {
        return Err(Error::InvalidRecord(format!(
            "{kind:?} buffer for {slots} slots exceeds the address space"
        )));
    }
    Ok(bytes)
}

/// Check a foreign struct against `data_type`, recursively
///
/// # Safety
///
/// Non-null `children` and `dictionary` pointers must point to structs that
/// are valid for reads.
unsafe fn validate_raw(raw: &FFI_ArrowArray, data_type: &DataType) -> Result<()> {
    let length = non_negative(raw.length, "length")?;
    let slots = raw_slots(raw)?;
    for kind in data_type.buffer_layout() {
        raw_extent(kind, slots)?;
    }
    if raw.null_count < UNKNOWN_NULL_COUNT {
        return Err(Error::InvalidRecord(format!(
            "null_count must be -1 or non-negative, got {}",
            raw.null_count
        )));
    }
    if usize::try_from(raw.null_count).is_ok_and(|n| n > length) {
        return Err(Error::InvalidRecord(format!(
            "null_count {} exceeds length {length}",
            raw.null_count
        )));
    }

    let n_buffers = non_negative(raw.n_buffers, "n_buffers")?;
    if n_buffers != data_type.n_buffers() {
        return Err(Error::InvalidRecord(format!(
            "{data_type} expects {} buffers, got {n_buffers}",
            data_type.n_buffers()
        )));
    }

    let n_children = non_negative(raw.n_children, "n_children")?;
    let child_types = data_type.child_types();
    if n_children != child_types.len() {
        return Err(Error::InvalidRecord(format!(
            "{data_type} expects {} children, got {n_children}",
            child_types.len()
        )));
    }
    if n_children > 0 && raw.children.is_null() {
        return Err(Error::InvalidRecord("children pointer is null".into()));
    }
    for (i, child_type) in child_types.iter().enumerate() {
        let child = *raw.children.add(i);
        if child.is_null() {
            return Err(Error::InvalidRecord(format!("child {i} is null")));
        }
        validate_raw(&*child, child_type)?;
    }

    match (data_type.dictionary_type(), raw.dictionary.is_null()) {
        (Some(value_type), false) => validate_raw(&*raw.dictionary, value_type),
        (None, true) => Ok(()),
        (Some(_), true) => Err(Error::InvalidRecord(format!(
            "{data_type} requires a dictionary"
        ))),
        (None, false) => Err(Error::InvalidRecord(format!(
            "{data_type} is not dictionary encoded"
        ))),
    }
}

/// View buffer `index` of a validated foreign struct
///
/// Buffer extents are derived from the layout of `data_type` over
/// `offset + length` slots; variable-length byte buffers are sized by the
/// last entry of the preceding offsets buffer.
fn raw_buffer<'a>(
    raw: &'a FFI_ArrowArray,
    data_type: &DataType,
    index: usize,
) -> Result<Option<BufferView<'a>>> {
    let layout = data_type.buffer_layout();
    let kind = *layout.get(index).ok_or(Error::IndexOutOfRange {
        index,
        len: layout.len(),
    })?;

    if raw.buffers.is_null() {
        return Ok(None);
    }
    // Safety: validated to hold `n_buffers == layout.len()` entries
    let data = unsafe { *raw.buffers.add(index) };
    if data.is_null() {
        return Ok(None);
    }

    let slots = raw_slots(raw)?;
    let len = match raw_extent(kind, slots)? {
        Some(bytes) => bytes,
        None => {
            let offsets = raw_buffer(raw, data_type, index - 1)?
                .ok_or(Error::NullBufferAccess { index: index - 1 })?;
            let last = *offsets.typed::<i32>()?.get(slots).ok_or_else(|| {
                Error::InvalidRecord(format!("offsets buffer does not cover slot {slots}"))
            })?;
            non_negative(i64::from(last), "last offset")?
        }
    };

    // Safety: the producer guarantees the buffer spans its layout extent for
    // as long as the struct is unreleased, which `'a` enforces
    let bytes = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) };
    Ok(Some(BufferView::new(bytes)))
}

/// Borrowed view of child `index` of a validated foreign struct
fn raw_child<'a>(
    raw: &'a FFI_ArrowArray,
    data_type: &'a DataType,
    index: usize,
) -> Result<ImportedChild<'a>> {
    let child_types = data_type.child_types();
    let child_type = child_types.get(index).ok_or(Error::IndexOutOfRange {
        index,
        len: child_types.len(),
    })?;
    // Safety: validated non-null and well-formed at import
    let child = unsafe { &**raw.children.add(index) };
    Ok(ImportedChild::new(child, child_type))
}

fn raw_dictionary<'a>(
    raw: &'a FFI_ArrowArray,
    data_type: &'a DataType,
) -> Option<ImportedChild<'a>> {
    let value_type = data_type.dictionary_type()?;
    // Safety: validated non-null for dictionary types at import
    let dictionary = unsafe { &*raw.dictionary };
    Some(ImportedChild::new(dictionary, value_type))
}

fn declared(raw: &FFI_ArrowArray) -> Option<usize> {
    usize::try_from(raw.null_count).ok()
}

/// An array record received from a foreign producer
///
/// The struct is owned: reads borrow it, and [`ImportedArray::release`] or
/// drop hands it back to the producer's release callback exactly once. A
/// struct that arrives with a null release callback is read-only borrowed
/// memory; nothing is freed for it.
#[derive(Debug)]
pub struct ImportedArray {
    raw: Box<FFI_ArrowArray>,
    data_type: DataType,
    length: usize,
    offset: usize,
    computed_null_count: OnceLock<usize>,
    released: bool,
}

impl ImportedArray {
    /// Move the struct at `src` into a new import, leaving `src` marked
    /// released
    ///
    /// # Safety
    ///
    /// `src` must point to a struct populated according to the C Data
    /// Interface, whose buffers span the extent implied by `data_type`.
    pub unsafe fn try_from_raw(src: *mut FFI_ArrowArray, data_type: DataType) -> Result<Self> {
        if src.is_null() {
            return Err(Error::InvalidArgument("import source is null".into()));
        }
        let raw = ptr::replace(src, FFI_ArrowArray::empty());
        Self::try_new(raw, data_type)
    }

    /// Take ownership of a populated struct
    ///
    /// If validation fails the struct is released before the error is
    /// returned.
    ///
    /// # Safety
    ///
    /// Same contract as [`ImportedArray::try_from_raw`].
    pub unsafe fn try_new(raw: FFI_ArrowArray, data_type: DataType) -> Result<Self> {
        data_type.validate()?;
        validate_raw(&raw, &data_type)?;

        tracing::debug!(
            data_type = %data_type,
            length = raw.length,
            offset = raw.offset,
            null_count = raw.null_count,
            owned = !raw.is_released(),
            "imported array record"
        );

        Ok(Self {
            length: raw.length as usize,
            offset: raw.offset as usize,
            raw: Box::new(raw),
            data_type,
            computed_null_count: OnceLock::new(),
            released: false,
        })
    }

    /// Whether dropping this import will call a producer release callback
    pub fn owns_release(&self) -> bool {
        !self.released && !self.raw.is_released()
    }

    /// Whether [`ImportedArray::release`] has run
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// The underlying C struct
    pub fn raw(&self) -> &FFI_ArrowArray {
        &self.raw
    }

    /// Borrow child `index`
    pub fn child(&self, index: usize) -> Result<ImportedChild<'_>> {
        self.ensure_unreleased()?;
        raw_child(&self.raw, &self.data_type, index)
    }

    /// Borrow the dictionary, for dictionary-encoded types
    pub fn dictionary(&self) -> Result<Option<ImportedChild<'_>>> {
        self.ensure_unreleased()?;
        Ok(raw_dictionary(&self.raw, &self.data_type))
    }

    /// Hand the struct back to its producer
    ///
    /// Calls the foreign release callback once. A second call returns
    /// [`Error::AlreadyReleased`]. Structs imported without a callback are
    /// marked released without freeing anything.
    pub fn release(&mut self) -> Result<()> {
        self.ensure_unreleased()?;
        self.released = true;

        match self.raw.release {
            Some(release) => {
                // Safety: the struct is populated and owned by us
                unsafe { release(&mut *self.raw) };
                if self.raw.release.is_some() {
                    tracing::warn!("producer release callback left release set; clearing it");
                    self.raw.release = None;
                }
                tracing::trace!(data_type = %self.data_type, "released imported record");
            }
            None => {
                tracing::trace!(
                    data_type = %self.data_type,
                    "imported record has no release callback; nothing to free"
                );
            }
        }
        Ok(())
    }

    fn ensure_unreleased(&self) -> Result<()> {
        if self.released {
            Err(Error::AlreadyReleased)
        } else {
            Ok(())
        }
    }
}

impl ArrayAccess for ImportedArray {
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
        self.ensure_unreleased()?;
        raw_buffer(&self.raw, &self.data_type, index)
    }

    fn declared_null_count(&self) -> Option<usize> {
        declared(&self.raw)
    }

    fn null_count_cache(&self) -> &OnceLock<usize> {
        &self.computed_null_count
    }
}

/// Borrowed view of a child or dictionary of an imported record
///
/// Released together with its parent; it has no release of its own.
#[derive(Debug)]
pub struct ImportedChild<'a> {
    raw: &'a FFI_ArrowArray,
    data_type: &'a DataType,
    computed_null_count: OnceLock<usize>,
}

impl<'a> ImportedChild<'a> {
    fn new(raw: &'a FFI_ArrowArray, data_type: &'a DataType) -> Self {
        Self {
            raw,
            data_type,
            computed_null_count: OnceLock::new(),
        }
    }

    /// Borrow grandchild `index`
    pub fn child(&self, index: usize) -> Result<ImportedChild<'a>> {
        raw_child(self.raw, self.data_type, index)
    }

    /// Borrow the nested dictionary, if any
    pub fn dictionary(&self) -> Option<ImportedChild<'a>> {
        raw_dictionary(self.raw, self.data_type)
    }
}

impl ArrayAccess for ImportedChild<'_> {
    fn data_type(&self) -> &DataType {
        self.data_type
    }

    fn len(&self) -> usize {
        self.raw.length as usize
    }

    fn offset(&self) -> usize {
        self.raw.offset as usize
    }

    fn get_buffer(&self, index: usize) -> Result<Option<BufferView<'_>>> {
        raw_buffer(self.raw, self.data_type, index)
    }

    fn declared_null_count(&self) -> Option<usize> {
        declared(self.raw)
    }

    fn null_count_cache(&self) -> &OnceLock<usize> {
        &self.computed_null_count
    }
}
