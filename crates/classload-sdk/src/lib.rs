//! Plugin-author SDK for the `classload` plugin system.
//!
//! A plugin library declares each exported class once with
//! [`export_plugin_class!`]; the class registers itself into the host's
//! catalog when the library is opened and unregisters when it is closed.
//!
//! ```ignore
//! use classload_sdk::export_plugin_class;
//!
//! pub trait Greeter: Send + Sync {
//!     fn greet(&self) -> String;
//! }
//!
//! #[derive(Default)]
//! struct EnglishGreeter;
//!
//! impl Greeter for EnglishGreeter {
//!     fn greet(&self) -> String {
//!         "hello".to_string()
//!     }
//! }
//!
//! export_plugin_class!(EnglishGreeter, Greeter);
//! ```
//!
//! The interface trait must be object-safe and shared between the host and
//! the plugin (defined in a crate both link), and the exported class must
//! implement [`Default`]. Host and plugins must share one copy of the
//! `classload` runtime — link it as a dynamic library.

pub use classload::{register_plugin, CreateFn, FactoryRegistration};

// Expansion internals of `export_plugin_class!`.
pub use ctor;
pub use parking_lot;
pub use tracing;

/// Export a plugin class from this library.
///
/// For each `(Derived, Base)` pair this emits a load-time constructor that
/// registers a factory for `Derived` under interface `Base` and retains the
/// registration handle in a static, plus an unload-time destructor that
/// drops the handle, unlinking the factory. Registration thereby tracks the
/// library's own lifetime in the process.
///
/// The three-argument form logs `message` when the registration runs.
#[macro_export]
macro_rules! export_plugin_class {
    ($derived:ty, $base:path) => {
        $crate::export_plugin_class!($derived, $base, "");
    };
    ($derived:ty, $base:path, $message:expr) => {
        const _: () = {
            mod wrapper {
                #[allow(unused_imports)]
                use super::*;

                static REGISTRATION: $crate::parking_lot::Mutex<
                    ::std::option::Option<$crate::FactoryRegistration>,
                > = $crate::parking_lot::Mutex::new(::std::option::Option::None);

                #[$crate::ctor::ctor]
                fn register() {
                    let message: &str = $message;
                    if !message.is_empty() {
                        $crate::tracing::info!("{}", message);
                    }
                    let registration = $crate::register_plugin::<dyn $base>(
                        ::std::stringify!($derived),
                        ::std::stringify!($base),
                        || {
                            ::std::boxed::Box::new(::std::boxed::Box::new(
                                <$derived as ::std::default::Default>::default(),
                            )
                                as ::std::boxed::Box<dyn $base>)
                        },
                    );
                    *REGISTRATION.lock() = ::std::option::Option::Some(registration);
                }

                #[$crate::ctor::dtor]
                fn unregister() {
                    REGISTRATION.lock().take();
                }
            }
        };
    };
}
