//! C ABI entry points that export Int32 array records
//!
//! Built as both a `cdylib` for C and Python consumers and an `rlib` for the
//! demo binary. Each entry point writes a fully populated
//! [`FFI_ArrowArray`] into caller memory; the caller owns it from then on and
//! must invoke its release callback exactly once.

#![allow(unsafe_code)]

use cdata_core::{random_seed, DataType, Error, FFI_ArrowArray, Producer, RandomProducer, Result};

/// Number of values [`export_int32_data`] produces
pub const DEFAULT_LENGTH: usize = 1000;

/// Export `length` seeded random Int32 values into `out`
///
/// # Safety
///
/// `out` must be null or valid for writes of one `FFI_ArrowArray`. Anything
/// it held before is overwritten without being released.
pub unsafe fn export_random_int32(out: *mut FFI_ArrowArray, length: usize, seed: u64) -> Result<()> {
    if out.is_null() {
        return Err(Error::InvalidArgument("export target is null".into()));
    }

    let record = RandomProducer::new(length, seed).produce(&DataType::Int32)?;
    record.export_into(out)?;

    tracing::debug!(length, seed, "exported random Int32 record");
    Ok(())
}

/// Fill `out` with 1000 random Int32 values and no validity bitmap
///
/// A null `out` is ignored.
///
/// # Safety
///
/// `out` must be null or valid for writes of one `FFI_ArrowArray`.
#[no_mangle]
pub unsafe extern "C" fn export_int32_data(out: *mut FFI_ArrowArray) {
    if let Err(err) = export_random_int32(out, DEFAULT_LENGTH, random_seed()) {
        tracing::warn!(%err, "export_int32_data failed");
    }
}

/// Fill `out` with `length` random Int32 values drawn from `seed`
///
/// Returns 0 on success and -1 when `out` is null, `length` is negative or
/// allocation fails; `out` is left untouched on failure.
///
/// # Safety
///
/// `out` must be null or valid for writes of one `FFI_ArrowArray`.
#[no_mangle]
pub unsafe extern "C" fn export_int32_data_with(
    out: *mut FFI_ArrowArray,
    length: i64,
    seed: u64,
) -> i32 {
    let Ok(length) = usize::try_from(length) else {
        tracing::warn!(length, "export_int32_data_with called with a negative length");
        return -1;
    };

    match export_random_int32(out, length, seed) {
        Ok(()) => 0,
        Err(err) => {
            tracing::warn!(%err, length, seed, "export_int32_data_with failed");
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdata_core::{ArrayAccess, ImportedArray};
    use std::ptr;

    #[test]
    fn test_default_export_shape() {
        let mut out = FFI_ArrowArray::empty();
        unsafe { export_int32_data(&mut out) };

        assert!(!out.is_released());
        assert_eq!(out.length(), 1000);
        assert_eq!(out.null_count(), 0);
        assert_eq!(out.offset(), 0);
        assert_eq!(out.n_buffers(), 2);
        assert_eq!(out.n_children(), 0);
        assert!(!out.has_dictionary());
        assert!(out.buffer_ptr(0).unwrap().is_null());
        assert!(!out.buffer_ptr(1).unwrap().is_null());
    }

    #[test]
    fn test_seeded_export_is_reproducible() {
        let mut a = FFI_ArrowArray::empty();
        let mut b = FFI_ArrowArray::empty();
        unsafe {
            assert_eq!(export_int32_data_with(&mut a, 32, 99), 0);
            assert_eq!(export_int32_data_with(&mut b, 32, 99), 0);
        }

        let a = unsafe { ImportedArray::try_from_raw(&mut a, DataType::Int32) }.unwrap();
        let b = unsafe { ImportedArray::try_from_raw(&mut b, DataType::Int32) }.unwrap();
        assert_eq!(a.values::<i32>().unwrap(), b.values::<i32>().unwrap());
    }

    #[test]
    fn test_import_and_release() {
        let mut out = FFI_ArrowArray::empty();
        unsafe { assert_eq!(export_int32_data_with(&mut out, 5, 1), 0) };

        let mut imported = unsafe { ImportedArray::try_from_raw(&mut out, DataType::Int32) }.unwrap();
        assert!(out.is_released());
        assert_eq!(imported.len(), 5);
        assert!(imported.value::<i32>(4).unwrap().is_some());

        imported.release().unwrap();
        assert!(matches!(imported.release(), Err(Error::AlreadyReleased)));
    }

    #[test]
    fn test_invalid_arguments_leave_target_untouched() {
        let mut out = FFI_ArrowArray::empty();
        unsafe {
            assert_eq!(export_int32_data_with(&mut out, -1, 0), -1);
            assert_eq!(export_int32_data_with(ptr::null_mut(), 4, 0), -1);
            export_int32_data(ptr::null_mut());
        }
        assert!(out.is_released());
    }

    #[test]
    fn test_empty_export() {
        let mut out = FFI_ArrowArray::empty();
        unsafe { assert_eq!(export_int32_data_with(&mut out, 0, 0), 0) };
        assert_eq!(out.length(), 0);
        assert!(!out.is_released());
    }
}
