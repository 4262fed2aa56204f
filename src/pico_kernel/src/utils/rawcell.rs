use core::cell::UnsafeCell;

use super::Init;

/// Like `UnsafeCell`, but implements `Sync`.
///
/// Used for the handful of kernel fields that a port's context-switch
/// handler must be able to locate by raw pointer. All Rust-side accesses are
/// still mediated by the kernel lock token.
#[repr(transparent)]
pub struct RawCell<T: ?Sized>(UnsafeCell<T>);

// Safety: Accesses are serialized by the kernel lock; the port's
// context-switch handler only touches the contents with interrupts masked.
unsafe impl<T: ?Sized + Send> Sync for RawCell<T> {}

impl<T> RawCell<T> {
    pub const fn new(x: T) -> Self {
        Self(UnsafeCell::new(x))
    }
}

impl<T: ?Sized> RawCell<T> {
    pub const fn get(&self) -> *mut T {
        self.0.get()
    }
}

impl<T: Init> Init for RawCell<T> {
    const INIT: Self = Self::new(T::INIT);
}
