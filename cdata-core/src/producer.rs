//! Producers that build populated records ready for export

use std::sync::Arc;

use rand::distributions::{Distribution, Standard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::bitmap::set_bit;
use crate::datatype::{DataType, NativeType};
use crate::error::{Error, Result};
use crate::memory::{default_pool, MemoryPool};
use crate::record::ArrayRecord;

/// Something that can fill a fresh record of a requested type
pub trait Producer: Send + Sync {
    /// Build a populated record of `data_type`
    fn produce(&self, data_type: &DataType) -> Result<ArrayRecord>;

    /// Number of elements each produced record holds
    fn length(&self) -> usize;
}

/// Run `$body` with `$t` bound to the native type of `$data_type`
macro_rules! with_native_type {
    ($data_type:expr, $t:ident => $body:expr, _ => $fallback:expr) => {
        match $data_type {
            DataType::Int8 => {
                type $t = i8;
                $body
            }
            DataType::Int16 => {
                type $t = i16;
                $body
            }
            DataType::Int32 => {
                type $t = i32;
                $body
            }
            DataType::Int64 => {
                type $t = i64;
                $body
            }
            DataType::UInt8 => {
                type $t = u8;
                $body
            }
            DataType::UInt16 => {
                type $t = u16;
                $body
            }
            DataType::UInt32 => {
                type $t = u32;
                $body
            }
            DataType::UInt64 => {
                type $t = u64;
                $body
            }
            DataType::Float32 => {
                type $t = f32;
                $body
            }
            DataType::Float64 => {
                type $t = f64;
                $body
            }
            _ => $fallback,
        }
    };
}

/// A fresh seed from the thread-local generator
pub fn random_seed() -> u64 {
    rand::thread_rng().gen()
}

/// Allocate a fixed-width record and write `f(i)` into every slot
fn fill_native<T, F>(length: usize, pool: &Arc<dyn MemoryPool>, mut f: F) -> Result<ArrayRecord>
where
    T: NativeType,
    F: FnMut(usize) -> T,
{
    let mut record = ArrayRecord::create_in(&T::data_type(), length, 0, Some(0), pool)?;
    if let Some(values) = record.buffer_mut(1)? {
        for (i, slot) in values.typed_mut::<T>()?.iter_mut().enumerate() {
            *slot = f(i);
        }
    }
    Ok(record)
}

/// Allocate a boolean record and set bit `i` wherever `f(i)` holds
fn fill_bool<F>(length: usize, pool: &Arc<dyn MemoryPool>, mut f: F) -> Result<ArrayRecord>
where
    F: FnMut(usize) -> bool,
{
    let mut record = ArrayRecord::create_in(&DataType::Boolean, length, 0, Some(0), pool)?;
    if let Some(bits) = record.buffer_mut(1)? {
        let bits = bits.as_mut_slice();
        for i in 0..length {
            if f(i) {
                set_bit(bits, i);
            }
        }
    }
    Ok(record)
}

/// Produces `0, 1, 2, ...` in every slot
///
/// Numeric types count up from zero (wrapping at the type's range), booleans
/// alternate starting with `true`, and strings hold the decimal index. Any
/// other type gets the zero-filled layout from [`ArrayRecord::create_in`].
pub struct SequenceProducer {
    length: usize,
    pool: Arc<dyn MemoryPool>,
}

impl SequenceProducer {
    /// Sequence producer allocating from the default pool
    pub fn new(length: usize) -> Self {
        Self {
            length,
            pool: default_pool(),
        }
    }

    /// Allocate from `pool` instead
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<dyn MemoryPool>) -> Self {
        self.pool = pool;
        self
    }
}

impl Producer for SequenceProducer {
    fn produce(&self, data_type: &DataType) -> Result<ArrayRecord> {
        with_native_type!(data_type, T => fill_native(self.length, &self.pool, T::from_index), _ => {
            match data_type {
                DataType::Boolean => fill_bool(self.length, &self.pool, |i| i % 2 == 0),
                DataType::Utf8 => {
                    let values: Vec<Option<String>> =
                        (0..self.length).map(|i| Some(i.to_string())).collect();
                    ArrayRecord::from_strs_in(&values, &self.pool)
                }
                other => ArrayRecord::create_in(other, self.length, 0, Some(0), &self.pool),
            }
        })
    }

    fn length(&self) -> usize {
        self.length
    }
}

/// Produces uniformly random values from a seeded generator
///
/// The same seed always yields the same record. Integers span their full
/// range; floats fall in `[0, 1)`. Only fixed-width primitives and booleans
/// are supported.
pub struct RandomProducer {
    length: usize,
    seed: u64,
    pool: Arc<dyn MemoryPool>,
}

impl RandomProducer {
    /// Random producer with a fixed seed, allocating from the default pool
    pub fn new(length: usize, seed: u64) -> Self {
        Self {
            length,
            seed,
            pool: default_pool(),
        }
    }

    /// Random producer seeded from the thread-local generator
    pub fn from_entropy(length: usize) -> Self {
        Self::new(length, random_seed())
    }

    /// Allocate from `pool` instead
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<dyn MemoryPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Seed the generator starts from
    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn fill<T>(&self) -> Result<ArrayRecord>
    where
        T: NativeType,
        Standard: Distribution<T>,
    {
        let mut rng = StdRng::seed_from_u64(self.seed);
        fill_native(self.length, &self.pool, |_| rng.gen::<T>())
    }
}

impl Producer for RandomProducer {
    fn produce(&self, data_type: &DataType) -> Result<ArrayRecord> {
        with_native_type!(data_type, T => self.fill::<T>(), _ => {
            match data_type {
                DataType::Boolean => {
                    let mut rng = StdRng::seed_from_u64(self.seed);
                    fill_bool(self.length, &self.pool, |_| rng.gen_bool(0.5))
                }
                other => Err(Error::TypeMismatch(format!(
                    "random values cannot be produced for {other}"
                ))),
            }
        })
    }

    fn length(&self) -> usize {
        self.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::ArrayAccess;
    use crate::memory::BudgetedMemoryPool;
    use test_case::test_case;

    #[test]
    fn test_sequence_int32() {
        let record = SequenceProducer::new(10).produce(&DataType::Int32).unwrap();
        assert_eq!(record.len(), 10);
        assert_eq!(record.null_count().unwrap(), 0);
        assert_eq!(record.values::<i32>().unwrap(), &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_sequence_wraps_narrow_types() {
        let record = SequenceProducer::new(300).produce(&DataType::UInt8).unwrap();
        assert_eq!(record.value::<u8>(255).unwrap(), Some(255));
        assert_eq!(record.value::<u8>(256).unwrap(), Some(0));
    }

    #[test]
    fn test_sequence_bool_and_utf8() {
        let producer = SequenceProducer::new(3);

        let bools = producer.produce(&DataType::Boolean).unwrap();
        assert_eq!(bools.bool_value(0).unwrap(), Some(true));
        assert_eq!(bools.bool_value(1).unwrap(), Some(false));

        let strings = producer.produce(&DataType::Utf8).unwrap();
        assert_eq!(strings.str_value(2).unwrap(), Some("2"));
    }

    #[test]
    fn test_sequence_nested_falls_back_to_layout() {
        let data_type = DataType::Struct(vec![DataType::Int32, DataType::Utf8]);
        let record = SequenceProducer::new(4).produce(&data_type).unwrap();
        assert_eq!(record.children().len(), 2);
        assert_eq!(record.child(0).unwrap().len(), 4);
    }

    #[test_case(DataType::Int8 ; "int8")]
    #[test_case(DataType::Int32 ; "int32")]
    #[test_case(DataType::UInt64 ; "uint64")]
    #[test_case(DataType::Float64 ; "float64")]
    #[test_case(DataType::Boolean ; "boolean")]
    fn test_random_is_deterministic_per_seed(data_type: DataType) {
        let a = RandomProducer::new(64, 7).produce(&data_type).unwrap();
        let b = RandomProducer::new(64, 7).produce(&data_type).unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(
            a.required_buffer(1).unwrap().as_bytes(),
            b.required_buffer(1).unwrap().as_bytes()
        );
    }

    #[test]
    fn test_random_seeds_differ() {
        let a = RandomProducer::new(100, 1).produce(&DataType::Int32).unwrap();
        let b = RandomProducer::new(100, 2).produce(&DataType::Int32).unwrap();
        assert_ne!(a.values::<i32>().unwrap(), b.values::<i32>().unwrap());
    }

    #[test]
    fn test_random_seed_varies() {
        let seeds: std::collections::HashSet<u64> = (0..8).map(|_| random_seed()).collect();
        assert!(seeds.len() > 1);
        assert_eq!(RandomProducer::from_entropy(3).length(), 3);
    }

    #[test]
    fn test_random_rejects_var_binary() {
        let result = RandomProducer::new(4, 0).produce(&DataType::Utf8);
        assert!(matches!(result, Err(Error::TypeMismatch(_))));
    }

    #[test]
    fn test_budget_failure_leaves_pool_empty() {
        let budget = Arc::new(BudgetedMemoryPool::new(64));
        let pool: Arc<dyn MemoryPool> = budget.clone();
        let result = SequenceProducer::new(1000)
            .with_pool(pool)
            .produce(&DataType::Int64);

        assert!(result.unwrap_err().is_allocation());
        assert_eq!(budget.usage(), 0);
    }
}
