use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, cooperative stop signal.
///
/// Raising the flag never interrupts a request in flight; long transfers
/// poll it between chunks and bail out with
/// [`StoreError::Cancelled`](crate::StoreError::Cancelled).
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is raised.
    pub fn check(&self) -> crate::StoreResult<()> {
        if self.is_cancelled() {
            Err(crate::StoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(flag.check().is_ok());
        other.cancel();
        assert!(flag.is_cancelled());
        assert!(matches!(flag.check(), Err(crate::StoreError::Cancelled)));
    }
}
