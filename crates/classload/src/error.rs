//! Error types for the plugin loading system.

/// Result type for plugin loading operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by user-invoked loading operations.
///
/// Registration warnings and late-unload warnings are logged, never returned;
/// only the operations a caller actively invokes (loading a library, creating
/// an instance, dispatching through a [`MultiLoader`](crate::MultiLoader))
/// produce these.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The platform loader could not open the library.
    #[error("failed to load library {path}: {reason}")]
    LibraryLoad {
        /// Path of the library that failed to open.
        path: String,
        /// Platform-provided failure reason.
        reason: String,
    },

    /// The platform loader could not close the library.
    #[error("failed to unload library {path}: {reason}")]
    LibraryUnload {
        /// Path of the library that failed to close.
        path: String,
        /// Platform-provided failure reason.
        reason: String,
    },

    /// No usable factory exists for the requested class.
    #[error("could not create instance of class {class_name}: {reason}")]
    CreateClass {
        /// The class that could not be instantiated.
        class_name: String,
        /// Why creation was refused.
        reason: String,
    },

    /// A multi-loader has no loader bound to the requested library.
    #[error("no loader bound to library {path}; load it first")]
    NoLoader {
        /// The unbound library path.
        path: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::LibraryLoad {
            path: "libfoo.so".to_string(),
            reason: "not found".to_string(),
        };
        assert_eq!(err.to_string(), "failed to load library libfoo.so: not found");

        let err = Error::NoLoader {
            path: "libbar.so".to_string(),
        };
        assert!(err.to_string().contains("libbar.so"));
    }
}
