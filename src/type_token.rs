//! Type tags and type-erased values.
//!
//! This module provides:
//! - [`Item`] / [`Acc`]: the opaque boxes pipeline values and reduce accumulators
//!   travel in once they cross into a backend. Backends never know the concrete
//!   types; the typed builder layer erases values on the way in and restores them
//!   on the way out.
//! - [`TypeTag`]: a lightweight runtime type identifier attached to every
//!   pipeline step so a chain of steps can be checked when it is built.
//! - [`Data`]: the bound every value flowing through a pipeline must satisfy.

use crate::error::{Error, Result};
use std::any::{Any, TypeId, type_name};

/// One pipeline value in flight (a root item, a mapped value, or a keyed pair).
pub type Item = Box<dyn Any + Send>;

/// One reduce accumulator in flight.
pub type Acc = Box<dyn Any + Send>;

/// Bound for values produced by pipeline steps and for reduce accumulators.
///
/// Values only need to move between worker threads; they are never shared.
pub trait Data: 'static + Send {}
impl<T> Data for T where T: 'static + Send {}

/// A lightweight runtime type tag for debugging and assertions.
///
/// ```
/// use histbeam::type_token::TypeTag;
/// let tag = TypeTag::of::<u32>();
/// assert_eq!(tag.name, "u32");
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeTag {
    /// Stable Rust type identifier.
    pub id: TypeId,
    /// Human-readable type name (best-effort).
    pub name: &'static str,
}

impl TypeTag {
    /// Construct a tag for `T`.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }
}

/// Unbox an erased value, reporting the expected type on mismatch.
pub(crate) fn unbox<T: 'static>(value: Box<dyn Any + Send>) -> Result<T> {
    value.downcast::<T>().map(|b| *b).map_err(|_| Error::TypeMismatch {
        expected: type_name::<T>(),
    })
}

/// Borrow an erased value as `T`.
pub(crate) fn peek<T: 'static>(value: &(dyn Any + Send)) -> Result<&T> {
    value.downcast_ref::<T>().ok_or(Error::TypeMismatch {
        expected: type_name::<T>(),
    })
}

pub(crate) fn boxed<T: Data>(value: T) -> Item {
    Box::new(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbox_reports_expected_type() {
        let v: Item = Box::new(7u32);
        let err = unbox::<String>(v).unwrap_err();
        assert!(err.to_string().contains("String"));
    }

    #[test]
    fn peek_borrows_without_consuming() {
        let v: Item = Box::new(vec![1, 2, 3]);
        assert_eq!(peek::<Vec<i32>>(v.as_ref()).unwrap().len(), 3);
        assert_eq!(unbox::<Vec<i32>>(v).unwrap(), vec![1, 2, 3]);
    }
}
