//! Smart handles for plugin instances.
//!
//! Instances minted through a [`Loader`](crate::Loader) carry a destruction
//! callback back into it: when the handle (or, for shared handles, the last
//! clone) drops, the plugin object is destroyed first and the loader's
//! instance count is decremented, which under on-demand mode may close the
//! library. The handles keep the loader's core alive, so the callback can
//! never outlive its target.

use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::loader::LoaderCore;

/// Owns one plugin object and re-enters the loader on drop.
struct InstanceHandle<B: ?Sized + 'static> {
    object: ManuallyDrop<Box<B>>,
    loader: Arc<LoaderCore>,
}

impl<B: ?Sized + 'static> Drop for InstanceHandle<B> {
    fn drop(&mut self) {
        // The object is destroyed before the count moves, so an instance
        // count of zero always means no plugin code is live.
        // SAFETY: drop runs exactly once and the object is not touched after.
        unsafe { ManuallyDrop::drop(&mut self.object) };
        self.loader.on_instance_destroyed();
    }
}

/// Shared handle to a plugin instance.
///
/// Clones share one instance count entry; the loader is notified when the
/// last clone drops.
pub struct SharedInstance<B: ?Sized + 'static> {
    inner: Arc<InstanceHandle<B>>,
}

impl<B: ?Sized + 'static> SharedInstance<B> {
    pub(crate) fn new(object: Box<B>, loader: Arc<LoaderCore>) -> Self {
        Self {
            inner: Arc::new(InstanceHandle {
                object: ManuallyDrop::new(object),
                loader,
            }),
        }
    }
}

impl<B: ?Sized + 'static> Clone for SharedInstance<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: ?Sized + 'static> Deref for SharedInstance<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.inner.object
    }
}

impl<B: ?Sized + 'static> fmt::Debug for SharedInstance<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedInstance")
            .field("loader", &self.inner.loader.library_path())
            .finish()
    }
}

/// Single-owner handle to a plugin instance.
pub struct UniqueInstance<B: ?Sized + 'static> {
    inner: InstanceHandle<B>,
}

impl<B: ?Sized + 'static> UniqueInstance<B> {
    pub(crate) fn new(object: Box<B>, loader: Arc<LoaderCore>) -> Self {
        Self {
            inner: InstanceHandle {
                object: ManuallyDrop::new(object),
                loader,
            },
        }
    }
}

impl<B: ?Sized + 'static> Deref for UniqueInstance<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.inner.object
    }
}

impl<B: ?Sized + 'static> DerefMut for UniqueInstance<B> {
    fn deref_mut(&mut self) -> &mut B {
        &mut self.inner.object
    }
}

impl<B: ?Sized + 'static> fmt::Debug for UniqueInstance<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueInstance")
            .field("loader", &self.inner.loader.library_path())
            .finish()
    }
}
