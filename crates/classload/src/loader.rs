//! The per-library loader.
//!
//! A [`Loader`] binds one library path to a reference-counted open/close
//! discipline. Loading is counted (`load` / `unload` pair up), instance
//! creation is counted separately, and in on-demand mode the library is
//! opened lazily on first creation and closed when the last managed instance
//! drops. Destroying the loader unloads its library.

use std::any::type_name;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::catalog;
use crate::error::{Error, Result};
use crate::factory::PluginFactory;
use crate::instance::{SharedInstance, UniqueInstance};

/// Process-unique identity of a loader.
///
/// Factory records own loader identities rather than references, so a record
/// can never dangle into a destroyed loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LoaderId(u64);

impl LoaderId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn value(self) -> u64 {
        self.0
    }
}

/// Shared state of a loader.
///
/// Outstanding instance handles keep the core alive, so the destruction
/// callback has a target even after the user-facing [`Loader`] is gone.
pub(crate) struct LoaderCore {
    id: LoaderId,
    library_path: String,
    on_demand: bool,

    /// Balance of `load` over `unload` calls. Clamped at zero.
    load_count: Mutex<i64>,

    /// Live managed (shared or unique) instances minted by this loader.
    instances: Mutex<usize>,
}

impl LoaderCore {
    pub(crate) fn library_path(&self) -> &str {
        &self.library_path
    }

    /// Unload with the instance count already locked by the caller.
    ///
    /// Refuses (with a warning) while managed instances are live. Otherwise
    /// decrements the load count and closes the library when it reaches
    /// zero; an over-unload clamps back to zero without touching the
    /// platform handle. Returns the remaining load count.
    fn unload_with(&self, instances: &mut usize) -> Result<usize> {
        let mut load = self.load_count.lock();

        if *instances > 0 {
            warn!(
                library = %self.library_path,
                live_instances = *instances,
                "attempting to unload a library while objects created by this \
                 loader exist; drop the instances first. The library will NOT \
                 be unloaded"
            );
            return Ok((*load).max(0) as usize);
        }

        *load -= 1;
        if *load == 0 {
            catalog::close_library(&self.library_path, self.id)?;
        } else if *load < 0 {
            *load = 0;
        }
        Ok(*load as usize)
    }

    /// Destruction callback target for instance handles.
    pub(crate) fn on_instance_destroyed(&self) {
        let mut instances = self.instances.lock();
        debug_assert!(*instances > 0, "instance count underflow");
        *instances = instances.saturating_sub(1);

        if *instances == 0 && self.on_demand {
            if catalog::unmanaged_instance_created() {
                warn!(
                    library = %self.library_path,
                    "last managed instance dropped, but an unmanaged instance \
                     was created in this process; the library will NOT be \
                     closed"
                );
            } else if let Err(error) = self.unload_with(&mut instances) {
                // Destruction callbacks never fail.
                warn!(
                    library = %self.library_path,
                    %error,
                    "failed to unload library after last instance dropped"
                );
            }
        }
    }
}

/// A scope binding one library path, from which plugin instances are made.
pub struct Loader {
    core: Arc<LoaderCore>,
}

impl Loader {
    /// Bind a loader to `library_path`.
    ///
    /// With `on_demand` false the library is opened immediately and stays
    /// open for the loader's lifetime; the error of a failed open surfaces
    /// here. With `on_demand` true the open is deferred to the first
    /// instance creation and the library is closed whenever the last managed
    /// instance drops.
    ///
    /// An empty `library_path` designates plugin classes registered by code
    /// already linked into the process; such a loader never opens or closes
    /// anything.
    pub fn new(library_path: impl Into<String>, on_demand: bool) -> Result<Self> {
        let loader = Self {
            core: Arc::new(LoaderCore {
                id: LoaderId::next(),
                library_path: library_path.into(),
                on_demand,
                load_count: Mutex::new(0),
                instances: Mutex::new(0),
            }),
        };

        debug!(
            library = %loader.core.library_path,
            loader = loader.core.id.value(),
            on_demand,
            "constructed loader"
        );

        if !on_demand {
            loader.load()?;
        }
        Ok(loader)
    }

    pub(crate) fn id(&self) -> LoaderId {
        self.core.id
    }

    /// The library path this loader is bound to.
    pub fn library_path(&self) -> &str {
        &self.core.library_path
    }

    /// Whether on-demand (lazy) load/unload is active.
    pub fn is_on_demand(&self) -> bool {
        self.core.on_demand
    }

    /// Whether the library is loaded within this loader's scope.
    ///
    /// The library may be resident through another loader and still not
    /// loaded *here*; creation through this loader first requires [`load`]
    /// (which `create_*` calls automatically).
    ///
    /// [`load`]: Loader::load
    pub fn is_library_loaded(&self) -> bool {
        catalog::is_library_loaded(&self.core.library_path, self.core.id)
    }

    /// Whether the library is resident in the process, loaded by any loader.
    pub fn is_library_loaded_by_any(&self) -> bool {
        catalog::is_library_loaded_by_anybody(&self.core.library_path)
    }

    /// Open the library (counted; pair with [`unload`](Loader::unload)).
    ///
    /// If the library is already resident, this loader is bound as an
    /// additional owner of its plugin factories instead of reopening it.
    pub fn load(&self) -> Result<()> {
        if self.core.library_path.is_empty() {
            return Ok(());
        }

        let mut load = self.core.load_count.lock();
        *load += 1;
        match catalog::open_library(&self.core.library_path, self.core.id) {
            Ok(()) => Ok(()),
            Err(error) => {
                *load -= 1;
                Err(error)
            }
        }
    }

    /// Release one load reference.
    ///
    /// Returns the number of further `unload` calls needed before the
    /// library is unbound from this loader. While instances created by this
    /// loader are live, the call warns and changes nothing.
    pub fn unload(&self) -> Result<usize> {
        if self.core.library_path.is_empty() {
            return Ok(0);
        }
        let mut instances = self.core.instances.lock();
        self.core.unload_with(&mut instances)
    }

    /// Names of the classes implementing interface `B` that this loader can
    /// instantiate: classes it owns, plus classes registered outside any
    /// loader.
    pub fn available_classes<B: ?Sized + 'static>(&self) -> Vec<String> {
        catalog::available_classes(type_name::<B>(), self.core.id)
    }

    /// Whether `class_name` is available under interface `B`.
    pub fn is_class_available<B: ?Sized + 'static>(&self, class_name: &str) -> bool {
        self.available_classes::<B>()
            .iter()
            .any(|name| name == class_name)
    }

    /// Distinct library paths whose factories this loader owns.
    pub fn associated_libraries(&self) -> Vec<String> {
        catalog::libraries_used_by_loader(self.core.id)
    }

    /// Create an instance of `class_name` behind a shared handle.
    ///
    /// Loads the library first if needed. The loader's instance count tracks
    /// the handle; when the last clone drops, the count falls and on-demand
    /// mode may close the library.
    pub fn create_shared<B: ?Sized + 'static>(
        &self,
        class_name: &str,
    ) -> Result<SharedInstance<B>> {
        let object = self.create_boxed::<B>(class_name, true)?;
        Ok(SharedInstance::new(object, Arc::clone(&self.core)))
    }

    /// Create an instance of `class_name` behind a single-owner handle.
    pub fn create_unique<B: ?Sized + 'static>(
        &self,
        class_name: &str,
    ) -> Result<UniqueInstance<B>> {
        let object = self.create_boxed::<B>(class_name, true)?;
        Ok(UniqueInstance::new(object, Arc::clone(&self.core)))
    }

    /// Create an instance whose lifetime this loader does not track.
    ///
    /// The caller owns the box outright. Creating an unmanaged instance
    /// permanently disables on-demand unloading for every loader in the
    /// process, since the system can no longer prove when plugin code stops
    /// being referenced.
    pub fn create_unmanaged<B: ?Sized + 'static>(&self, class_name: &str) -> Result<Box<B>> {
        self.create_boxed::<B>(class_name, false)
    }

    fn create_boxed<B: ?Sized + 'static>(
        &self,
        class_name: &str,
        managed: bool,
    ) -> Result<Box<B>> {
        if !managed {
            catalog::mark_unmanaged_instance_created();
        }

        if managed && self.core.on_demand && catalog::unmanaged_instance_created() {
            tracing::info!(
                library = %self.core.library_path,
                "creating a managed instance, but an unmanaged instance exists \
                 in this process; libraries will not be closed automatically \
                 when managed instances are destroyed"
            );
        }

        if !self.is_library_loaded() {
            self.load()?;
        }

        let record = self.authorized_factory::<B>(class_name)?;

        // The constructor runs plugin code; no catalog lock is held here.
        let object = record
            .create()
            .downcast::<Box<B>>()
            .map_err(|_| Error::CreateClass {
                class_name: class_name.to_string(),
                reason: "factory produced an instance of a different interface".to_string(),
            })?;

        if managed {
            *self.core.instances.lock() += 1;
        }

        Ok(*object)
    }

    /// Find the factory for `(B, class_name)` and check this loader may use
    /// it: it must own the record, or the record must be ownerless
    /// (registered outside any loader).
    fn authorized_factory<B: ?Sized + 'static>(
        &self,
        class_name: &str,
    ) -> Result<Arc<PluginFactory>> {
        let Some(record) = catalog::find_factory(type_name::<B>(), class_name) else {
            return Err(Error::CreateClass {
                class_name: class_name.to_string(),
                reason: format!("no factory registered under interface {}", type_name::<B>()),
            });
        };

        if record.is_owned_by(self.core.id) {
            return Ok(record);
        }

        if !record.is_owned_by_anybody() {
            debug!(
                class_name,
                "a factory exists for the requested class but has no owning \
                 loader; its library was opened outside the loader interface \
                 and can never be safely unloaded"
            );
            return Ok(record);
        }

        Err(Error::CreateClass {
            class_name: class_name.to_string(),
            reason: "the factory for this class belongs to other loaders".to_string(),
        })
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        debug!(
            library = %self.core.library_path,
            loader = self.core.id.value(),
            "destroying loader, unloading associated library"
        );
        if let Err(error) = self.unload() {
            warn!(
                library = %self.core.library_path,
                %error,
                "failed to unload library while destroying loader"
            );
        }
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("library_path", &self.core.library_path)
            .field("on_demand", &self.core.on_demand)
            .field("load_count", &*self.core.load_count.lock())
            .field("instances", &*self.core.instances.lock())
            .finish()
    }
}
