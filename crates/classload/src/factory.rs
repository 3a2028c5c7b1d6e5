//! Factory records and the registration entry point.
//!
//! A factory record is the catalog's unit of bookkeeping: it knows how to
//! manufacture one plugin class behind one interface, which library it came
//! from, and which loaders may use it. Records are minted by
//! [`register_plugin`], which runs as a side effect of a plugin library being
//! opened; the returned [`FactoryRegistration`] handle is retained by the
//! library (the SDK macro keeps it in a per-plugin static) and unlinks the
//! record from the catalog and the graveyard when it drops.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::catalog;
use crate::loader::LoaderId;

/// Placeholder library path used until registration associates the real one.
///
/// Observable only for registrations that happen outside any library open
/// (e.g. a plugin library linked directly into the executable).
pub const UNKNOWN_LIBRARY: &str = "Unknown";

/// Untyped constructor stored in a factory record.
///
/// The payload is a `Box<Box<dyn Interface>>` erased to `Box<dyn Any>`; the
/// typed creation façade on [`Loader`](crate::Loader) downcasts it back. The
/// catalog itself never learns the interface type.
pub type CreateFn = fn() -> Box<dyn Any>;

/// A catalog entry that can manufacture instances of one plugin class.
pub struct PluginFactory {
    /// Literal name of the concrete plugin class.
    class_name: String,

    /// Literal name of the interface the class implements.
    base_class_name: String,

    /// Runtime identifier of the interface type, treated as an opaque key.
    base_fingerprint: String,

    /// Path of the library that registered this factory. Set once after
    /// construction; [`UNKNOWN_LIBRARY`] until then.
    library_path: Mutex<String>,

    /// Loaders allowed to create through this factory. Empty means the
    /// factory was registered outside any loader's open and is usable by
    /// everybody (with a warning).
    owners: Mutex<Vec<LoaderId>>,

    /// The untyped constructor.
    create: CreateFn,
}

impl PluginFactory {
    pub(crate) fn new(
        class_name: impl Into<String>,
        base_class_name: impl Into<String>,
        base_fingerprint: impl Into<String>,
        create: CreateFn,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            base_class_name: base_class_name.into(),
            base_fingerprint: base_fingerprint.into(),
            library_path: Mutex::new(UNKNOWN_LIBRARY.to_string()),
            owners: Mutex::new(Vec::new()),
            create,
        }
    }

    /// Literal name of the plugin class this factory creates.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Literal name of the interface the class implements.
    pub fn base_class_name(&self) -> &str {
        &self.base_class_name
    }

    /// Opaque identifier of the interface type.
    pub fn base_fingerprint(&self) -> &str {
        &self.base_fingerprint
    }

    /// Path of the library this factory is associated with.
    pub fn library_path(&self) -> String {
        self.library_path.lock().clone()
    }

    pub(crate) fn set_library_path(&self, path: &str) {
        *self.library_path.lock() = path.to_string();
    }

    /// Number of loaders currently owning this factory.
    pub fn owner_count(&self) -> usize {
        self.owners.lock().len()
    }

    pub(crate) fn add_owner(&self, loader: LoaderId) {
        let mut owners = self.owners.lock();
        if !owners.contains(&loader) {
            owners.push(loader);
        }
    }

    pub(crate) fn remove_owner(&self, loader: LoaderId) {
        let mut owners = self.owners.lock();
        owners.retain(|id| *id != loader);
    }

    pub(crate) fn is_owned_by(&self, loader: LoaderId) -> bool {
        self.owners.lock().contains(&loader)
    }

    pub(crate) fn is_owned_by_anybody(&self) -> bool {
        !self.owners.lock().is_empty()
    }

    /// Manufacture one instance. The caller downcasts the payload.
    pub(crate) fn create(&self) -> Box<dyn Any> {
        (self.create)()
    }
}

impl fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginFactory")
            .field("class_name", &self.class_name)
            .field("base_class_name", &self.base_class_name)
            .field("library_path", &*self.library_path.lock())
            .field("owners", &self.owners.lock().len())
            .finish()
    }
}

/// Unique handle controlling a factory record's lifetime.
///
/// Dropping the handle unlinks the record from the graveyard and the catalog
/// under the catalog lock, then releases it. Plugin libraries keep one per
/// exported class for as long as they are loaded; when the library is closed
/// its retained handles drop and the records self-unlink.
#[must_use = "dropping the registration immediately unregisters the plugin class"]
pub struct FactoryRegistration {
    record: Arc<PluginFactory>,
}

impl FactoryRegistration {
    /// The record controlled by this handle.
    pub fn record(&self) -> &Arc<PluginFactory> {
        &self.record
    }
}

impl Drop for FactoryRegistration {
    fn drop(&mut self) {
        catalog::unlink_factory(&self.record);
    }
}

impl fmt::Debug for FactoryRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FactoryRegistration")
            .field(&self.record)
            .finish()
    }
}

/// Register a plugin class under interface `B`.
///
/// Invoked from a plugin library's load-time side effects, normally through
/// the SDK's `export_plugin_class!` macro. The currently active loader and
/// the library being opened are taken from the registration context
/// established around the platform open call; a registration that happens
/// with no open in progress marks the process as having opened a non-pure
/// plugin library, which permanently disables automatic unloading.
///
/// `class_name` and `base_class_name` are the literal (diagnostic) names; the
/// catalog key for the interface is derived from the type parameter.
pub fn register_plugin<B: ?Sized + 'static>(
    class_name: &str,
    base_class_name: &str,
    create: CreateFn,
) -> FactoryRegistration {
    let context = catalog::active_registration();

    tracing::debug!(
        class_name,
        base_class_name,
        library = context
            .as_ref()
            .map(|c| c.library_path.as_str())
            .unwrap_or(UNKNOWN_LIBRARY),
        "registering plugin factory"
    );

    if context.is_none() {
        tracing::warn!(
            class_name,
            "a library containing plugins has been opened outside any loader; \
             this happens when plugin libraries also contain ordinary code linked \
             into the application. No library can be safely unloaded for the rest \
             of this process. Isolate plugins into their own libraries."
        );
        catalog::mark_non_pure_library_opened();
    }

    let record = Arc::new(PluginFactory::new(
        class_name,
        base_class_name,
        std::any::type_name::<B>(),
        create,
    ));

    if let Some(context) = context {
        record.set_library_path(&context.library_path);
        record.add_owner(context.loader);
    }

    catalog::register_factory(Arc::clone(&record));

    tracing::debug!(class_name, "plugin factory registered");

    FactoryRegistration { record }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record() -> PluginFactory {
        PluginFactory::new("Widget", "Renderable", "test::Renderable", || {
            Box::new(0u8)
        })
    }

    #[test]
    fn test_record_starts_unassociated_and_unowned() {
        let record = make_record();
        assert_eq!(record.library_path(), UNKNOWN_LIBRARY);
        assert!(!record.is_owned_by_anybody());
        assert_eq!(record.owner_count(), 0);
    }

    #[test]
    fn test_owner_set_is_duplicate_free() {
        let record = make_record();
        let id = LoaderId::next();

        record.add_owner(id);
        record.add_owner(id);
        assert_eq!(record.owner_count(), 1);
        assert!(record.is_owned_by(id));

        record.remove_owner(id);
        assert!(!record.is_owned_by_anybody());
    }

    #[test]
    fn test_remove_absent_owner_is_noop() {
        let record = make_record();
        record.add_owner(LoaderId::next());
        record.remove_owner(LoaderId::next());
        assert_eq!(record.owner_count(), 1);
    }
}
