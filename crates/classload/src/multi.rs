//! A façade binding many libraries into one namespace.
//!
//! [`MultiLoader`] owns one [`Loader`] per bound library path. Creation by
//! class name scans the loaders in the order their libraries were bound,
//! loading any not yet loaded, and dispatches to the first one advertising
//! the class; creation by explicit library dispatches directly. Destroying
//! the multi-loader unloads every bound library.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::MultiLoaderConfig;
use crate::error::{Error, Result};
use crate::instance::{SharedInstance, UniqueInstance};
use crate::loader::Loader;

struct LoaderEntry {
    library_path: String,
    loader: Arc<Loader>,
}

/// A loader façade over multiple runtime libraries.
pub struct MultiLoader {
    on_demand: bool,

    /// Bound loaders in insertion order.
    loaders: Mutex<Vec<LoaderEntry>>,
}

impl MultiLoader {
    /// Create an empty multi-loader.
    ///
    /// `on_demand` is applied to every loader subsequently bound through
    /// [`load_library`](MultiLoader::load_library).
    pub fn new(on_demand: bool) -> Self {
        Self {
            on_demand,
            loaders: Mutex::new(Vec::new()),
        }
    }

    /// Build a multi-loader from a configuration, binding every listed
    /// library.
    pub fn from_config(config: &MultiLoaderConfig) -> Result<Self> {
        let multi = Self::new(config.on_demand);
        for path in &config.libraries {
            multi.load_library(path)?;
        }
        Ok(multi)
    }

    /// Whether on-demand (lazy) load/unload is applied to bound loaders.
    pub fn is_on_demand(&self) -> bool {
        self.on_demand
    }

    /// Bind `library_path` into this multi-loader's namespace.
    ///
    /// Binding an already-bound path has no effect.
    pub fn load_library(&self, library_path: &str) -> Result<()> {
        let mut loaders = self.loaders.lock();
        if loaders.iter().any(|entry| entry.library_path == library_path) {
            return Ok(());
        }

        let loader = Arc::new(Loader::new(library_path, self.on_demand)?);
        loaders.push(LoaderEntry {
            library_path: library_path.to_string(),
            loader,
        });
        Ok(())
    }

    /// Unload one load reference of `library_path`.
    ///
    /// Returns the number of further calls needed for the library to be
    /// unbound; when it reaches zero, the loader is removed from this
    /// multi-loader.
    pub fn unload_library(&self, library_path: &str) -> Result<usize> {
        let mut loaders = self.loaders.lock();
        let Some(position) = loaders
            .iter()
            .position(|entry| entry.library_path == library_path)
        else {
            return Ok(0);
        };

        let remaining = loaders[position].loader.unload()?;
        if remaining == 0 {
            loaders.remove(position);
        }
        Ok(remaining)
    }

    /// Whether `library_path` is bound to this multi-loader.
    pub fn is_library_available(&self, library_path: &str) -> bool {
        self.loaders
            .lock()
            .iter()
            .any(|entry| entry.library_path == library_path)
    }

    /// Paths of the libraries currently bound, in insertion order.
    pub fn registered_libraries(&self) -> Vec<String> {
        self.loaders
            .lock()
            .iter()
            .map(|entry| entry.library_path.clone())
            .collect()
    }

    /// Class names implementing interface `B` across every bound loader.
    pub fn available_classes<B: ?Sized + 'static>(&self) -> Vec<String> {
        let mut classes = Vec::new();
        for loader in self.all_loaders() {
            classes.extend(loader.available_classes::<B>());
        }
        classes
    }

    /// Class names implementing interface `B` exposed by one bound library.
    pub fn available_classes_for_library<B: ?Sized + 'static>(
        &self,
        library_path: &str,
    ) -> Result<Vec<String>> {
        let loader = self.loader_for_library(library_path)?;
        Ok(loader.available_classes::<B>())
    }

    /// Whether `class_name` is available under interface `B` in any bound
    /// library.
    pub fn is_class_available<B: ?Sized + 'static>(&self, class_name: &str) -> bool {
        self.available_classes::<B>()
            .iter()
            .any(|name| name == class_name)
    }

    /// Create a shared instance of `class_name`, dispatching to the first
    /// bound loader that advertises the class.
    pub fn create_shared<B: ?Sized + 'static>(
        &self,
        class_name: &str,
    ) -> Result<SharedInstance<B>> {
        debug!(class_name, "creating instance through multi-loader");
        self.loader_for_class::<B>(class_name)?
            .create_shared::<B>(class_name)
    }

    /// Create a shared instance of `class_name` from a specific library.
    pub fn create_shared_from<B: ?Sized + 'static>(
        &self,
        class_name: &str,
        library_path: &str,
    ) -> Result<SharedInstance<B>> {
        self.loader_for_library(library_path)?
            .create_shared::<B>(class_name)
    }

    /// Create a single-owner instance of `class_name`, dispatching to the
    /// first bound loader that advertises the class.
    pub fn create_unique<B: ?Sized + 'static>(
        &self,
        class_name: &str,
    ) -> Result<UniqueInstance<B>> {
        debug!(class_name, "creating unique instance through multi-loader");
        self.loader_for_class::<B>(class_name)?
            .create_unique::<B>(class_name)
    }

    /// Create a single-owner instance of `class_name` from a specific
    /// library.
    pub fn create_unique_from<B: ?Sized + 'static>(
        &self,
        class_name: &str,
        library_path: &str,
    ) -> Result<UniqueInstance<B>> {
        self.loader_for_library(library_path)?
            .create_unique::<B>(class_name)
    }

    /// Create an untracked instance of `class_name`.
    ///
    /// See [`Loader::create_unmanaged`] for the process-wide consequences.
    pub fn create_unmanaged<B: ?Sized + 'static>(&self, class_name: &str) -> Result<Box<B>> {
        self.loader_for_class::<B>(class_name)?
            .create_unmanaged::<B>(class_name)
    }

    /// Create an untracked instance of `class_name` from a specific library.
    pub fn create_unmanaged_from<B: ?Sized + 'static>(
        &self,
        class_name: &str,
        library_path: &str,
    ) -> Result<Box<B>> {
        self.loader_for_library(library_path)?
            .create_unmanaged::<B>(class_name)
    }

    fn all_loaders(&self) -> Vec<Arc<Loader>> {
        self.loaders
            .lock()
            .iter()
            .map(|entry| Arc::clone(&entry.loader))
            .collect()
    }

    /// The loader bound to `library_path`, or [`Error::NoLoader`].
    fn loader_for_library(&self, library_path: &str) -> Result<Arc<Loader>> {
        self.loaders
            .lock()
            .iter()
            .find(|entry| entry.library_path == library_path)
            .map(|entry| Arc::clone(&entry.loader))
            .ok_or_else(|| Error::NoLoader {
                path: library_path.to_string(),
            })
    }

    /// The first bound loader advertising `class_name` under `B`, loading
    /// libraries not yet loaded along the way.
    fn loader_for_class<B: ?Sized + 'static>(&self, class_name: &str) -> Result<Arc<Loader>> {
        for loader in self.all_loaders() {
            if !loader.is_library_loaded() {
                loader.load()?;
            }
            if loader.is_class_available::<B>(class_name) {
                return Ok(loader);
            }
        }
        Err(Error::CreateClass {
            class_name: class_name.to_string(),
            reason: "no bound library exposes a factory for this class".to_string(),
        })
    }

    fn unload_all(&self) {
        for path in self.registered_libraries() {
            if let Err(error) = self.unload_library(&path) {
                warn!(library = %path, %error, "failed to unload library");
            }
        }
    }
}

impl Drop for MultiLoader {
    fn drop(&mut self) {
        debug!("destroying multi-loader, unloading all bound libraries");
        self.unload_all();
        // Loaders still bound (load counts above one) unload once more as
        // the entries drop.
    }
}

impl std::fmt::Debug for MultiLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiLoader")
            .field("on_demand", &self.on_demand)
            .field("libraries", &self.registered_libraries())
            .finish()
    }
}
