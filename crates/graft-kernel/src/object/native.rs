//! Exact transfer of standard-library values
//!
//! JSON cannot carry non-finite floats or integers beyond 64 bits, so values
//! whose type comes from the standard library move between module versions
//! as a [`NativeValue`] instead. The set is closed: a type defined inside a
//! module keeps its `TypeId` across rebuilds even when its layout changes,
//! so it can never be trusted on the far side of a downcast.

use std::any::{Any, TypeId};

/// A boxed value handed from one module version to the next.
pub type NativeValue = Box<dyn Any + Send>;

macro_rules! shared_types {
    ($($ty:ty),* $(,)?) => {
        /// Whether `V` is one of the shared types, or an `Option`, `Vec` or
        /// boxed slice of one.
        pub(crate) fn is_shared<V: 'static>() -> bool {
            let id = TypeId::of::<V>();
            $(
                if id == TypeId::of::<$ty>()
                    || id == TypeId::of::<Option<$ty>>()
                    || id == TypeId::of::<Vec<$ty>>()
                    || id == TypeId::of::<Box<[$ty]>>()
                {
                    return true;
                }
            )*
            false
        }

        /// Clone a shared value into a [`NativeValue`].
        pub(crate) fn clone_shared(value: &dyn Any) -> Option<NativeValue> {
            $(
                if let Some(value) = value.downcast_ref::<$ty>() {
                    return Some(Box::new(value.clone()));
                }
                if let Some(value) = value.downcast_ref::<Option<$ty>>() {
                    return Some(Box::new(value.clone()));
                }
                if let Some(value) = value.downcast_ref::<Vec<$ty>>() {
                    return Some(Box::new(value.clone()));
                }
                if let Some(value) = value.downcast_ref::<Box<[$ty]>>() {
                    return Some(Box::new(value.clone()));
                }
            )*
            None
        }
    };
}

shared_types!(
    bool, char, String, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64,
);
