//! End-to-end record lifecycle: produce, export through the C layout,
//! import, read and release

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use cdata_core::pool::{BudgetedMemoryPool, MemoryPool, SystemMemoryPool};
use cdata_core::{
    ArrayAccess, ArrayRecord, Buffer, DataType, Error, FFI_ArrowArray, ImportedArray, Producer,
    RandomProducer, RecordParts, SequenceProducer, UNKNOWN_NULL_COUNT,
};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        use tracing_subscriber::filter::EnvFilter;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

fn counting_pool() -> (Arc<SystemMemoryPool>, Arc<dyn MemoryPool>) {
    let pool = Arc::new(SystemMemoryPool::new());
    let shared: Arc<dyn MemoryPool> = pool.clone();
    (pool, shared)
}

#[test]
fn exported_sequence_reads_back_and_frees_everything() {
    init_tracing();
    let (stats, pool) = counting_pool();

    let record = SequenceProducer::new(10)
        .with_pool(pool)
        .produce(&DataType::Int32)
        .unwrap();
    assert!(stats.usage_stats().current_bytes > 0);

    let mut raw = record.into_ffi().unwrap();
    let mut imported = unsafe { ImportedArray::try_from_raw(&mut raw, DataType::Int32) }.unwrap();
    assert!(raw.is_released());

    for i in 0..10 {
        assert_eq!(imported.value::<i32>(i).unwrap(), Some(i as i32));
    }
    assert_eq!(
        imported.value::<i32>(10).unwrap_err(),
        Error::IndexOutOfRange { index: 10, len: 10 }
    );

    imported.release().unwrap();
    assert_eq!(imported.release(), Err(Error::AlreadyReleased));

    let after = stats.usage_stats();
    assert_eq!(after.current_bytes, 0);
    assert_eq!(after.allocation_count, 0);
    assert_eq!(after.total_allocations, after.total_deallocations);
}

#[test]
fn dropping_an_import_releases_it() {
    init_tracing();
    let (stats, pool) = counting_pool();

    let mut raw = RandomProducer::new(1000, 42)
        .with_pool(pool)
        .produce(&DataType::Int32)
        .unwrap()
        .into_ffi()
        .unwrap();
    let imported = unsafe { ImportedArray::try_from_raw(&mut raw, DataType::Int32) }.unwrap();
    assert_eq!(imported.len(), 1000);
    assert_eq!(imported.null_count().unwrap(), 0);

    drop(imported);
    assert_eq!(stats.usage_stats().current_bytes, 0);
}

#[test]
fn offset_window_reads_physical_slots() {
    init_tracing();
    let values: Vec<i32> = (10..20).collect();
    let record = ArrayRecord::try_new(
        RecordParts::new(DataType::Int32, 4)
            .with_offset(3)
            .with_buffers(vec![None, Some(Buffer::from_slice(&values).unwrap())]),
    )
    .unwrap();

    let mut raw = record.into_ffi().unwrap();
    assert_eq!(raw.offset(), 3);
    assert_eq!(raw.length(), 4);

    let imported = unsafe { ImportedArray::try_from_raw(&mut raw, DataType::Int32) }.unwrap();
    assert_eq!(imported.value::<i32>(0).unwrap(), Some(13));
    assert_eq!(imported.values::<i32>().unwrap(), &[13, 14, 15, 16]);
    assert!(matches!(
        imported.value::<i32>(4),
        Err(Error::IndexOutOfRange { index: 4, len: 4 })
    ));
}

#[test]
fn nested_records_release_once_through_c_layout() {
    init_tracing();
    let released = Arc::new(AtomicUsize::new(0));
    let counted = |mut record: ArrayRecord| {
        let counter = released.clone();
        record
            .on_release(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        record
    };

    let ints = counted(ArrayRecord::from_options(&[Some(1i64), None, Some(3)]).unwrap());
    let strings = counted(ArrayRecord::from_strs(&[Some("x"), Some("yy"), None]).unwrap());
    let data_type = DataType::Struct(vec![DataType::Int64, DataType::Utf8]);
    let parent = counted(
        ArrayRecord::try_new(
            RecordParts::new(data_type.clone(), 3)
                .with_buffers(vec![None])
                .with_children(vec![ints, strings]),
        )
        .unwrap(),
    );

    let mut raw = parent.into_ffi().unwrap();
    let mut imported = unsafe { ImportedArray::try_from_raw(&mut raw, data_type) }.unwrap();

    let ints = imported.child(0).unwrap();
    assert_eq!(ints.value::<i64>(0).unwrap(), Some(1));
    assert!(ints.is_null(1).unwrap());
    assert_eq!(ints.null_count().unwrap(), 1);

    let strings = imported.child(1).unwrap();
    assert_eq!(strings.str_value(1).unwrap(), Some("yy"));
    assert_eq!(strings.str_value(2).unwrap(), None);
    assert!(imported.child(2).is_err());

    assert_eq!(released.load(Ordering::SeqCst), 0);
    imported.release().unwrap();
    assert_eq!(released.load(Ordering::SeqCst), 3);

    drop(imported);
    assert_eq!(released.load(Ordering::SeqCst), 3);
}

#[test]
fn failed_production_leaves_budget_untouched() {
    init_tracing();
    let budget = Arc::new(BudgetedMemoryPool::new(1024));
    let pool: Arc<dyn MemoryPool> = budget.clone();

    let data_type = DataType::Struct(vec![DataType::Int64, DataType::Int64]);
    let err = ArrayRecord::create_in(&data_type, 100, 0, None, &pool).unwrap_err();
    assert!(err.is_allocation());
    assert_eq!(budget.usage(), 0);

    let record = ArrayRecord::create_in(&DataType::Int8, 100, 0, Some(0), &pool).unwrap();
    assert!(budget.usage() > 0);
    drop(record);
    assert_eq!(budget.usage(), 0);
}

#[test]
fn export_into_caller_memory() {
    init_tracing();
    let mut slot = FFI_ArrowArray::empty();
    let record = ArrayRecord::from_values(&[7u16, 8, 9]).unwrap();
    unsafe { record.export_into(&mut slot) }.unwrap();

    assert!(!slot.is_released());
    assert_eq!(slot.n_buffers(), 2);
    assert!(slot.buffer_ptr(0).unwrap().is_null());

    let imported = unsafe { ImportedArray::try_from_raw(&mut slot, DataType::UInt16) }.unwrap();
    assert_eq!(imported.values::<u16>().unwrap(), &[7, 8, 9]);
}

#[test]
fn exported_null_count_matches_bitmap() {
    init_tracing();
    let mut record = ArrayRecord::create(&DataType::Int32, 10, 0, Some(3)).unwrap();
    for i in [1, 4, 7] {
        record.set_valid(i, false).unwrap();
    }

    let mut raw = record.into_ffi().unwrap();
    let exported = raw.null_count();
    let imported = unsafe { ImportedArray::try_from_raw(&mut raw, DataType::Int32) }.unwrap();

    let valid = (0..10).filter(|&i| imported.is_valid(i).unwrap()).count();
    assert_eq!(valid, 7);
    assert!(exported == UNKNOWN_NULL_COUNT || exported == 3);
    assert_eq!(imported.null_count().unwrap(), 3);
}

#[test]
fn unrepresentable_sizes_fail_without_touching_the_pool() {
    init_tracing();
    let (stats, pool) = counting_pool();

    let err = ArrayRecord::create_in(&DataType::Float64, usize::MAX / 2, 0, Some(0), &pool)
        .unwrap_err();
    assert!(err.is_allocation());
    let err = SequenceProducer::new(usize::MAX)
        .with_pool(pool)
        .produce(&DataType::Binary)
        .unwrap_err();
    assert!(err.is_allocation());

    assert_eq!(stats.usage_stats().total_allocations, 0);
}
