//! Connect permission gate
//!
//! Checked before every transport touch-point, since a grant can be
//! revoked while a connection flow is running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Predicate that must pass before any transport operation
pub trait PermissionGate: Send + Sync {
    fn has_connect_permission(&self) -> bool;
}

impl<F> PermissionGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn has_connect_permission(&self) -> bool {
        self()
    }
}

/// Revocable permission shared between the host and the manager
#[derive(Debug, Clone)]
pub struct PermissionFlag {
    granted: Arc<AtomicBool>,
}

impl PermissionFlag {
    pub fn granted() -> Self {
        Self {
            granted: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn denied() -> Self {
        Self {
            granted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn grant(&self) {
        self.granted.store(true, Ordering::SeqCst);
    }

    pub fn revoke(&self) {
        self.granted.store(false, Ordering::SeqCst);
    }
}

impl PermissionGate for PermissionFlag {
    fn has_connect_permission(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }
}
