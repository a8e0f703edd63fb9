//! Secret wrapper for sensitive values
//!
//! Refresh tokens live in memory for the lifetime of an account. Wrapping
//! them keeps the value out of Debug/Display output and zeroes the memory
//! on drop; callers reach the raw token only through `expose()`.

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Zeroize> From<T> for Secret<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_debug_and_display() {
        let secret = Secret::new(String::from("rt_warp_1234"));
        assert_eq!(format!("{:?}", secret), "[REDACTED]");
        assert_eq!(format!("{}", secret), "[REDACTED]");
    }

    #[test]
    fn exposes_value() {
        let secret = Secret::new(String::from("rt_warp_1234"));
        assert_eq!(secret.expose(), "rt_warp_1234");
    }

    #[test]
    fn clone_is_independent() {
        let secret = Secret::new(String::from("independent"));
        let cloned = secret.clone();
        drop(secret);
        assert_eq!(cloned.expose(), "independent");
    }

    #[test]
    fn zeroizes_on_drop() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        /// Tracks whether zeroize() was called via a shared flag.
        #[derive(Clone)]
        struct Witness {
            zeroed: Arc<AtomicBool>,
        }

        impl Zeroize for Witness {
            fn zeroize(&mut self) {
                self.zeroed.store(true, Ordering::SeqCst);
            }
        }

        let zeroed = Arc::new(AtomicBool::new(false));
        let secret = Secret::new(Witness {
            zeroed: Arc::clone(&zeroed),
        });

        assert!(!zeroed.load(Ordering::SeqCst));
        drop(secret);
        assert!(zeroed.load(Ordering::SeqCst), "must zeroize on drop");
    }
}
