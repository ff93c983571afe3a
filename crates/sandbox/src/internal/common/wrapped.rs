use std::cell::{Ref, RefCell, RefMut};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Shared single-threaded handle (`Rc<RefCell<T>>`).
///
/// Equality and hashing use the pointer, so two handles are equal only when they
/// point to the same object. Every object shared between jobs, resources and
/// background tasks of the grid manager lives behind one of these.
#[derive(Default, Debug)]
pub struct WrappedRcRefCell<T: ?Sized> {
    inner: Rc<RefCell<T>>,
}

impl<T> WrappedRcRefCell<T> {
    #[inline]
    pub fn wrap(t: T) -> Self {
        WrappedRcRefCell {
            inner: Rc::new(RefCell::new(t)),
        }
    }
}

impl<T: ?Sized> WrappedRcRefCell<T> {
    #[inline]
    pub fn new_wrapped(inner: Rc<RefCell<T>>) -> Self {
        WrappedRcRefCell { inner }
    }

    #[inline]
    #[track_caller]
    pub fn get(&self) -> Ref<T> {
        self.inner.borrow()
    }

    #[inline]
    #[track_caller]
    pub fn get_mut(&self) -> RefMut<T> {
        self.inner.borrow_mut()
    }

    #[inline]
    pub fn get_num_refs(&self) -> usize {
        Rc::strong_count(&self.inner)
    }
}

impl<T: ?Sized> Clone for WrappedRcRefCell<T> {
    #[inline]
    fn clone(&self) -> Self {
        WrappedRcRefCell {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized> Hash for WrappedRcRefCell<T> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        Rc::as_ptr(&self.inner).cast::<()>().hash(state);
    }
}

impl<T: ?Sized> PartialEq for WrappedRcRefCell<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: ?Sized> Eq for WrappedRcRefCell<T> {}

/// Newtype over [`WrappedRcRefCell`], so that a shared object can get its own methods.
#[macro_export]
macro_rules! define_wrapped_type {
    ($name: ident, $type: ty $(, $visibility: vis)?) => {
        #[derive(::std::clone::Clone)]
        #[repr(transparent)]
        $($visibility)? struct $name($crate::WrappedRcRefCell<$type>);

        impl ::std::cmp::PartialEq for $name {
            #[inline]
            fn eq(&self, other: &Self) -> bool {
                self.0 == other.0
            }
        }

        impl ::std::cmp::Eq for $name {}

        impl ::std::ops::Deref for $name {
            type Target = $crate::WrappedRcRefCell<$type>;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::WrappedRcRefCell;
    use crate::Set;

    #[test]
    fn test_pointer_identity() {
        let a = WrappedRcRefCell::wrap(1);
        let b = WrappedRcRefCell::wrap(1);
        let a2 = a.clone();
        assert!(a == a2);
        assert!(a != b);
        assert_eq!(a.get_num_refs(), 2);

        let set: Set<_> = [a.clone(), a2, b].into_iter().collect();
        assert_eq!(set.len(), 2);

        *a.get_mut() += 1;
        assert_eq!(*a.get(), 2);
    }
}
