//! Platform shared-library handles.
//!
//! [`SharedLibrary`] wraps the two ways a plugin library can exist in this
//! process:
//!
//! - **Native**: a real shared object opened through `libloading`. Opening it
//!   runs the library's load-time constructors (which self-register plugin
//!   factories); dropping the handle closes it, running the unload-time
//!   destructors that release the retained registrations.
//! - **Builtin**: a library compiled into the host and announced under a
//!   library path. Its init closure stands in for the load-time constructors
//!   and returns the registrations the "library" retains; they drop when the
//!   handle is closed. A *resident* builtin models a library linked into the
//!   executable: its init runs once per process and its registrations are
//!   retained for the life of the process, so closing never releases them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::debug;

use crate::factory::FactoryRegistration;

/// Load-time side effect of a builtin library: registers the library's
/// plugin classes and returns the handles the library retains.
pub type BuiltinInit = Box<dyn Fn() -> Vec<FactoryRegistration> + Send + Sync>;

struct BuiltinLibrary {
    init: BuiltinInit,

    /// Resident builtins register once per process and never release.
    resident: bool,

    /// Whether a resident builtin has run its init.
    initialized: AtomicBool,
}

fn builtins() -> &'static Mutex<HashMap<String, Arc<BuiltinLibrary>>> {
    static BUILTINS: OnceLock<Mutex<HashMap<String, Arc<BuiltinLibrary>>>> = OnceLock::new();
    BUILTINS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registrations of resident builtins, retained for the process lifetime the
/// way a linked library's statics would be.
fn resident_registrations() -> &'static Mutex<Vec<FactoryRegistration>> {
    static HELD: OnceLock<Mutex<Vec<FactoryRegistration>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(Vec::new()))
}

/// Announce a builtin library under `library_path`.
///
/// Every open of the path runs `init` in place of the platform loader, and
/// closing the library drops the returned registrations, unregistering the
/// classes. This gives a library compiled into the host the same open/close
/// discipline as a dynamically loaded one.
pub fn register_builtin_library(
    library_path: impl Into<String>,
    init: impl Fn() -> Vec<FactoryRegistration> + Send + Sync + 'static,
) {
    let path = library_path.into();
    debug!(library = %path, "registering builtin library");
    builtins().lock().insert(
        path,
        Arc::new(BuiltinLibrary {
            init: Box::new(init),
            resident: false,
            initialized: AtomicBool::new(false),
        }),
    );
}

/// Announce a resident builtin library under `library_path`.
///
/// Models a plugin library linked directly into the executable: `init` runs
/// on the first open only, and the registrations it returns live until the
/// process exits. Closing such a library removes it from the open-library
/// registry but leaves its factory records alive (in the graveyard, once
/// their owners depart), ready to be revived by a later open.
pub fn register_resident_builtin(
    library_path: impl Into<String>,
    init: impl Fn() -> Vec<FactoryRegistration> + Send + Sync + 'static,
) {
    let path = library_path.into();
    debug!(library = %path, "registering resident builtin library");
    builtins().lock().insert(
        path,
        Arc::new(BuiltinLibrary {
            init: Box::new(init),
            resident: true,
            initialized: AtomicBool::new(false),
        }),
    );
}

enum LibraryHandle {
    Native(libloading::Library),
    Builtin {
        /// Registrations released when the handle closes. Empty for
        /// resident builtins.
        registrations: Vec<FactoryRegistration>,
    },
}

/// An open library: either a platform shared object or a builtin.
pub struct SharedLibrary {
    path: String,
    handle: LibraryHandle,
}

impl SharedLibrary {
    /// Open `library_path`, running its load-time side effects.
    ///
    /// Builtin announcements take precedence over the platform loader. May
    /// block indefinitely: the platform open performs arbitrary I/O and runs
    /// the library's initialization code.
    pub(crate) fn open(library_path: &str) -> Result<Self, String> {
        let builtin = builtins().lock().get(library_path).cloned();

        if let Some(builtin) = builtin {
            let registrations = if builtin.resident {
                if !builtin.initialized.swap(true, Ordering::SeqCst) {
                    let held = (builtin.init)();
                    debug!(
                        library = library_path,
                        count = held.len(),
                        "resident builtin library initialized"
                    );
                    resident_registrations().lock().extend(held);
                }
                Vec::new()
            } else {
                (builtin.init)()
            };

            return Ok(Self {
                path: library_path.to_string(),
                handle: LibraryHandle::Builtin { registrations },
            });
        }

        // SAFETY: opening a shared object executes its initialization
        // routines; that is the contract of this crate, and the caller
        // serializes opens so registrations attribute correctly.
        let library =
            unsafe { libloading::Library::new(library_path) }.map_err(|e| e.to_string())?;

        Ok(Self {
            path: library_path.to_string(),
            handle: LibraryHandle::Native(library),
        })
    }

    /// Close the library, running its unload-time side effects.
    pub(crate) fn close(self) -> Result<(), String> {
        debug!(library = %self.path, "closing platform handle");
        match self.handle {
            LibraryHandle::Native(library) => library.close().map_err(|e| e.to_string()),
            LibraryHandle::Builtin { registrations } => {
                drop(registrations);
                Ok(())
            }
        }
    }
}

/// Platform-specific file name for a library, e.g. `lib{name}.so` on Linux
/// and `{name}.dll` on Windows.
pub fn library_filename(name: &str) -> String {
    libloading::library_filename(name)
        .to_string_lossy()
        .into_owned()
}
