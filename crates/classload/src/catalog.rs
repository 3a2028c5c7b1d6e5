//! Process-global plugin catalog, graveyard, and library registry.
//!
//! This module holds the state every loader in the process shares: the
//! factory catalog (interface fingerprint → class name → record), the
//! graveyard of records currently between owning loaders, the registry of
//! open libraries, and the sticky safety flags. The public surface of the
//! crate (loaders, the multi-loader, registration) is a veneer over the
//! operations here.
//!
//! Locking: the catalog and the graveyard share one reentrant lock; the
//! library registry has its own; a process-wide open lock serializes platform
//! opens so the registration context is unambiguous. Lock order is
//! open → library → catalog, and the catalog lock is never held across a
//! platform open or close.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::factory::PluginFactory;
use crate::loader::LoaderId;
use crate::platform::SharedLibrary;

/// Class name → factory record, for one interface fingerprint.
type FactoryMap = BTreeMap<String, Arc<PluginFactory>>;

/// Catalog and graveyard, guarded together by the catalog lock.
#[derive(Default)]
struct CatalogState {
    /// Interface fingerprint → factory map.
    factories: BTreeMap<String, FactoryMap>,

    /// Records awaiting a new owning loader, in arrival order.
    graveyard: Vec<Arc<PluginFactory>>,
}

/// One open library tracked by the registry.
struct LibraryEntry {
    path: String,
    library: SharedLibrary,
}

/// The in-progress library open, visible to `register_plugin`.
#[derive(Clone)]
pub(crate) struct RegistrationContext {
    /// The loader on whose behalf the open runs.
    pub(crate) loader: LoaderId,

    /// The library being opened.
    pub(crate) library_path: String,
}

fn catalog() -> &'static ReentrantMutex<RefCell<CatalogState>> {
    static CATALOG: OnceLock<ReentrantMutex<RefCell<CatalogState>>> = OnceLock::new();
    CATALOG.get_or_init(|| ReentrantMutex::new(RefCell::new(CatalogState::default())))
}

fn libraries() -> &'static Mutex<Vec<LibraryEntry>> {
    static LIBRARIES: OnceLock<Mutex<Vec<LibraryEntry>>> = OnceLock::new();
    LIBRARIES.get_or_init(|| Mutex::new(Vec::new()))
}

fn open_lock() -> &'static Mutex<()> {
    static OPEN: OnceLock<Mutex<()>> = OnceLock::new();
    OPEN.get_or_init(|| Mutex::new(()))
}

fn registration_context() -> &'static Mutex<Option<RegistrationContext>> {
    static CONTEXT: OnceLock<Mutex<Option<RegistrationContext>>> = OnceLock::new();
    CONTEXT.get_or_init(|| Mutex::new(None))
}

/// Set once a plugin library is seen registering outside any loader; from
/// then on no library is ever unloaded by any loader in this process.
static NON_PURE_LIBRARY_OPENED: AtomicBool = AtomicBool::new(false);

/// Set once an unmanaged instance has been created anywhere in the process;
/// from then on on-demand unloading is refused.
static UNMANAGED_INSTANCE_CREATED: AtomicBool = AtomicBool::new(false);

/// Clears the registration context when the open that installed it ends.
struct RegistrationScope;

impl RegistrationScope {
    fn enter(loader: LoaderId, library_path: &str) -> Self {
        *registration_context().lock() = Some(RegistrationContext {
            loader,
            library_path: library_path.to_string(),
        });
        RegistrationScope
    }
}

impl Drop for RegistrationScope {
    fn drop(&mut self) {
        *registration_context().lock() = None;
    }
}

/// The registration context of the open currently in progress, if any.
pub(crate) fn active_registration() -> Option<RegistrationContext> {
    registration_context().lock().clone()
}

/// Whether a non-pure plugin library has been opened in this process.
pub fn non_pure_library_opened() -> bool {
    NON_PURE_LIBRARY_OPENED.load(Ordering::SeqCst)
}

pub(crate) fn mark_non_pure_library_opened() {
    NON_PURE_LIBRARY_OPENED.store(true, Ordering::SeqCst);
}

/// Whether an unmanaged instance has ever been created in this process.
pub fn unmanaged_instance_created() -> bool {
    UNMANAGED_INSTANCE_CREATED.load(Ordering::SeqCst)
}

pub(crate) fn mark_unmanaged_instance_created() {
    UNMANAGED_INSTANCE_CREATED.store(true, Ordering::SeqCst)
}

// Catalog primitives. Entry points take the catalog lock and borrow the
// state exactly once; helpers receive `&mut CatalogState` and never lock.

/// Insert a record under its `(fingerprint, class name)` key.
///
/// A same-key record already present is displaced into the graveyard and a
/// collision warning is logged; the newest registration wins lookups until
/// its library goes away, at which point the displaced record can be revived.
pub(crate) fn register_factory(record: Arc<PluginFactory>) {
    let guard = catalog().lock();
    let mut state = guard.borrow_mut();

    let map = state
        .factories
        .entry(record.base_fingerprint().to_string())
        .or_default();

    if let Some(previous) = map.insert(record.class_name().to_string(), Arc::clone(&record)) {
        warn!(
            class_name = record.class_name(),
            previous_library = %previous.library_path(),
            new_library = %record.library_path(),
            "plugin factory name collision; the new factory overwrites the \
             existing one. This happens when libraries containing the same \
             plugin class are loaded into one process."
        );
        if !state.graveyard.iter().any(|g| Arc::ptr_eq(g, &previous)) {
            state.graveyard.push(previous);
        }
    }
}

/// Unlink exactly this record from the graveyard and the catalog.
///
/// Called from [`FactoryRegistration`](crate::FactoryRegistration) drops; a
/// record that was already displaced or purged is silently skipped.
pub(crate) fn unlink_factory(record: &Arc<PluginFactory>) {
    let guard = catalog().lock();
    let mut state = guard.borrow_mut();

    state.graveyard.retain(|g| !Arc::ptr_eq(g, record));

    if let Some(map) = state.factories.get_mut(record.base_fingerprint()) {
        let same_record = map
            .get(record.class_name())
            .map(|r| Arc::ptr_eq(r, record))
            .unwrap_or(false);
        if same_record {
            map.remove(record.class_name());
        }
    }

    debug!(
        class_name = record.class_name(),
        library = %record.library_path(),
        "factory record unlinked"
    );
}

/// Look up the record for `(fingerprint, class name)`.
pub(crate) fn find_factory(fingerprint: &str, class_name: &str) -> Option<Arc<PluginFactory>> {
    let guard = catalog().lock();
    let state = guard.borrow();
    state
        .factories
        .get(fingerprint)
        .and_then(|map| map.get(class_name))
        .cloned()
}

/// Class names under `fingerprint` whose record satisfies `predicate`.
pub(crate) fn enumerate_classes(
    fingerprint: &str,
    predicate: impl Fn(&PluginFactory) -> bool,
) -> Vec<String> {
    let guard = catalog().lock();
    let mut state = guard.borrow_mut();
    state
        .factories
        .entry(fingerprint.to_string())
        .or_default()
        .iter()
        .filter(|(_, record)| predicate(record))
        .map(|(name, _)| name.clone())
        .collect()
}

/// Class names visible to `loader` under `fingerprint`: those it owns,
/// followed by those owned by nobody (registered outside any loader).
pub(crate) fn available_classes(fingerprint: &str, loader: LoaderId) -> Vec<String> {
    let mut classes = enumerate_classes(fingerprint, |record| record.is_owned_by(loader));
    let unowned = enumerate_classes(fingerprint, |record| !record.is_owned_by_anybody());
    classes.extend(unowned);
    classes
}

fn records_for_library(state: &CatalogState, library_path: &str) -> Vec<Arc<PluginFactory>> {
    state
        .factories
        .values()
        .flat_map(|map| map.values())
        .filter(|record| record.library_path() == library_path)
        .cloned()
        .collect()
}

/// Whether any catalog record is still associated with `library_path`.
fn has_factories_for_library(state: &CatalogState, library_path: &str) -> bool {
    state
        .factories
        .values()
        .flat_map(|map| map.values())
        .any(|record| record.library_path() == library_path)
}

/// Distinct library paths whose factories are owned by `loader`.
pub(crate) fn libraries_used_by_loader(loader: LoaderId) -> Vec<String> {
    let guard = catalog().lock();
    let state = guard.borrow();

    let mut paths: Vec<String> = Vec::new();
    for record in state.factories.values().flat_map(|map| map.values()) {
        if record.is_owned_by(loader) {
            let path = record.library_path();
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    paths
}

/// Strip `loader` from every record of `library_path`; records left with no
/// owner move from the catalog into the graveyard.
fn destroy_factories_for(state: &mut CatalogState, library_path: &str, loader: LoaderId) {
    debug!(
        library = library_path,
        loader = loader.value(),
        "removing factory records for departing loader"
    );

    let mut buried: Vec<Arc<PluginFactory>> = Vec::new();
    for map in state.factories.values_mut() {
        map.retain(|_, record| {
            if record.library_path() != library_path || !record.is_owned_by(loader) {
                return true;
            }
            record.remove_owner(loader);
            if record.is_owned_by_anybody() {
                true
            } else {
                buried.push(Arc::clone(record));
                false
            }
        });
    }

    for record in buried {
        debug!(
            class_name = record.class_name(),
            library = library_path,
            "moving ownerless factory record to the graveyard"
        );
        state.graveyard.push(record);
    }
}

/// Revive graveyard records of `library_path` into the catalog, owned by
/// `loader`. Only vacant `(fingerprint, class)` slots are filled; a record
/// whose slot is occupied by a live registration stays in the graveyard.
/// Returns the revived records (still present in the graveyard; the caller
/// decides what to purge).
fn resurrect_for(
    state: &mut CatalogState,
    library_path: &str,
    loader: LoaderId,
) -> Vec<Arc<PluginFactory>> {
    let mut revived = Vec::new();

    let candidates: Vec<Arc<PluginFactory>> = state
        .graveyard
        .iter()
        .filter(|record| record.library_path() == library_path)
        .cloned()
        .collect();

    for record in candidates {
        let map = state
            .factories
            .entry(record.base_fingerprint().to_string())
            .or_default();
        if map.contains_key(record.class_name()) {
            continue;
        }

        debug!(
            class_name = record.class_name(),
            library = library_path,
            loader = loader.value(),
            "resurrecting factory record from the graveyard"
        );
        record.add_owner(loader);
        map.insert(record.class_name().to_string(), Arc::clone(&record));
        revived.push(record);
    }

    revived
}

/// Drop every graveyard entry associated with `library_path`.
fn purge_for(state: &mut CatalogState, library_path: &str) {
    state.graveyard.retain(|record| {
        let keep = record.library_path() != library_path;
        if !keep {
            debug!(
                class_name = record.class_name(),
                library = library_path,
                "purging factory record from the graveyard"
            );
        }
        keep
    });
}

/// Drop specific records from the graveyard.
fn purge_records(state: &mut CatalogState, records: &[Arc<PluginFactory>]) {
    state
        .graveyard
        .retain(|record| !records.iter().any(|r| Arc::ptr_eq(r, record)));
}

fn graveyard_count_for(state: &CatalogState, library_path: &str) -> usize {
    state
        .graveyard
        .iter()
        .filter(|record| record.library_path() == library_path)
        .count()
}

// Library registry.

/// Whether `library_path` is resident in the process, opened by any loader.
pub fn is_library_loaded_by_anybody(library_path: &str) -> bool {
    libraries()
        .lock()
        .iter()
        .any(|entry| entry.path == library_path)
}

/// Whether `library_path` is loaded within `loader`'s scope: resident, and
/// either this loader owns one of its factories or the library currently
/// exposes none (neither in the catalog nor awaiting revival).
pub(crate) fn is_library_loaded(library_path: &str, loader: LoaderId) -> bool {
    if !is_library_loaded_by_anybody(library_path) {
        return false;
    }

    let guard = catalog().lock();
    let state = guard.borrow();

    let records = records_for_library(&state, library_path);
    if records.iter().any(|record| record.is_owned_by(loader)) {
        return true;
    }
    records.is_empty() && graveyard_count_for(&state, library_path) == 0
}

/// Open `library_path` on behalf of `loader`.
///
/// A library that is already resident is not reopened; the loader is bound as
/// an additional owner of every record the library already exposes, and any
/// of its graveyard records are revived. A fresh open installs the
/// registration context, asks the platform loader to open the library (its
/// load-time side effects self-register factories), then reconciles the
/// graveyard and records the open handle.
pub(crate) fn open_library(library_path: &str, loader: LoaderId) -> Result<()> {
    debug!(
        library = library_path,
        loader = loader.value(),
        "opening library"
    );

    if is_library_loaded_by_anybody(library_path) {
        bind_existing_library(library_path, loader);
        return Ok(());
    }

    let _open = open_lock().lock();

    // A racing open may have brought the library in while we waited.
    if is_library_loaded_by_anybody(library_path) {
        bind_existing_library(library_path, loader);
        return Ok(());
    }

    let library = {
        let _scope = RegistrationScope::enter(loader, library_path);
        SharedLibrary::open(library_path).map_err(|reason| Error::LibraryLoad {
            path: library_path.to_string(),
            reason,
        })?
    };

    debug!(library = library_path, "library opened");

    {
        let guard = catalog().lock();
        let mut state = guard.borrow_mut();

        if !has_factories_for_library(&state, library_path) {
            debug!(
                library = library_path,
                "open produced no new factories; checking the graveyard for \
                 previously registered ones"
            );
            resurrect_for(&mut state, library_path, loader);
        }
        purge_for(&mut state, library_path);
    }

    libraries().lock().push(LibraryEntry {
        path: library_path.to_string(),
        library,
    });

    Ok(())
}

/// Bind `loader` as an additional owner of an already-resident library.
fn bind_existing_library(library_path: &str, loader: LoaderId) {
    let _libs = libraries().lock();

    let guard = catalog().lock();
    let mut state = guard.borrow_mut();

    for record in records_for_library(&state, library_path) {
        debug!(
            class_name = record.class_name(),
            library = library_path,
            loader = loader.value(),
            "binding existing factory record to loader"
        );
        record.add_owner(loader);
    }

    // Records displaced by a since-departed collision can be revived now
    // that a loader claims this library again.
    let revived = resurrect_for(&mut state, library_path, loader);
    purge_records(&mut state, &revived);
}

/// Close `library_path` on behalf of `loader`.
///
/// The loader's factories are released (graveyarding those left ownerless);
/// the platform handle is closed only when no factories for the library
/// remain anywhere in the catalog. Once a non-pure library has been opened,
/// closing is refused entirely.
pub(crate) fn close_library(library_path: &str, loader: LoaderId) -> Result<()> {
    if non_pure_library_opened() {
        warn!(
            library = library_path,
            "not unloading: a non-pure plugin library was opened in this \
             process, so no library can be closed without risking symbols \
             that are still in use"
        );
        return Ok(());
    }

    debug!(
        library = library_path,
        loader = loader.value(),
        "closing library"
    );

    let library = {
        let mut libs = libraries().lock();

        let Some(position) = libs.iter().position(|entry| entry.path == library_path) else {
            debug!(
                library = library_path,
                "attempt to close a library that is not open"
            );
            return Ok(());
        };

        {
            let guard = catalog().lock();
            let mut state = guard.borrow_mut();
            destroy_factories_for(&mut state, library_path, loader);

            if has_factories_for_library(&state, library_path) {
                debug!(
                    library = library_path,
                    "factory records remain; other loaders still use the \
                     library, keeping it open"
                );
                return Ok(());
            }
        }

        libs.remove(position).library
    };

    // Closing the platform handle runs the library's unload-time side
    // effects (registration handles drop and self-unlink), so no lock may be
    // held here.
    debug!(library = library_path, "no factory records remain, unloading");
    library.close().map_err(|reason| Error::LibraryUnload {
        path: library_path.to_string(),
        reason,
    })
}

/// Log a report of the open libraries and catalog contents.
pub fn dump_state() {
    {
        let libs = libraries().lock();
        debug!(open_libraries = libs.len(), "library registry");
        for entry in libs.iter() {
            debug!(library = %entry.path, "open library");
        }
    }

    let guard = catalog().lock();
    let state = guard.borrow();
    for (fingerprint, map) in &state.factories {
        for record in map.values() {
            debug!(
                interface = %fingerprint,
                class_name = record.class_name(),
                library = %record.library_path(),
                owners = record.owner_count(),
                "catalog record"
            );
        }
    }
    debug!(graveyard = state.graveyard.len(), "graveyard records");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(class: &str, fingerprint: &str) -> Arc<PluginFactory> {
        Arc::new(PluginFactory::new(class, "Base", fingerprint, || {
            Box::new(0u8)
        }))
    }

    #[test]
    fn test_register_find_unlink() {
        let r = record("CatalogUnit", "catalog::unit::A");
        register_factory(Arc::clone(&r));

        let found = find_factory("catalog::unit::A", "CatalogUnit").unwrap();
        assert!(Arc::ptr_eq(&found, &r));

        unlink_factory(&r);
        assert!(find_factory("catalog::unit::A", "CatalogUnit").is_none());

        // Unlinking again is a no-op.
        unlink_factory(&r);
    }

    #[test]
    fn test_collision_displaces_into_graveyard() {
        let first = record("CatalogDup", "catalog::unit::B");
        first.set_library_path("libone.so");
        let second = record("CatalogDup", "catalog::unit::B");
        second.set_library_path("libtwo.so");

        register_factory(Arc::clone(&first));
        register_factory(Arc::clone(&second));

        let found = find_factory("catalog::unit::B", "CatalogDup").unwrap();
        assert!(Arc::ptr_eq(&found, &second));

        // The displaced record survives in the graveyard.
        {
            let guard = catalog().lock();
            let state = guard.borrow();
            assert_eq!(graveyard_count_for(&state, "libone.so"), 1);
        }

        unlink_factory(&first);
        unlink_factory(&second);
    }

    #[test]
    fn test_enumerate_with_predicate() {
        let a = record("CatalogEnumA", "catalog::unit::C");
        let b = record("CatalogEnumB", "catalog::unit::C");
        let id = LoaderId::next();
        a.add_owner(id);

        register_factory(Arc::clone(&a));
        register_factory(Arc::clone(&b));

        let owned = enumerate_classes("catalog::unit::C", |r| r.is_owned_by(id));
        assert_eq!(owned, vec!["CatalogEnumA".to_string()]);

        let visible = available_classes("catalog::unit::C", id);
        assert_eq!(
            visible,
            vec!["CatalogEnumA".to_string(), "CatalogEnumB".to_string()]
        );

        unlink_factory(&a);
        unlink_factory(&b);
    }

    #[test]
    fn test_destroy_then_resurrect_round_trip() {
        let r = record("CatalogGrave", "catalog::unit::D");
        r.set_library_path("libgrave-unit.so");
        let first = LoaderId::next();
        r.add_owner(first);
        register_factory(Arc::clone(&r));

        {
            let guard = catalog().lock();
            let mut state = guard.borrow_mut();
            destroy_factories_for(&mut state, "libgrave-unit.so", first);
            assert!(!has_factories_for_library(&state, "libgrave-unit.so"));
            assert_eq!(graveyard_count_for(&state, "libgrave-unit.so"), 1);
        }

        let second = LoaderId::next();
        {
            let guard = catalog().lock();
            let mut state = guard.borrow_mut();
            let revived = resurrect_for(&mut state, "libgrave-unit.so", second);
            assert_eq!(revived.len(), 1);
            purge_records(&mut state, &revived);
            assert_eq!(graveyard_count_for(&state, "libgrave-unit.so"), 0);
        }

        let found = find_factory("catalog::unit::D", "CatalogGrave").unwrap();
        assert!(found.is_owned_by(second));
        assert!(!found.is_owned_by(first));

        unlink_factory(&r);
    }
}
