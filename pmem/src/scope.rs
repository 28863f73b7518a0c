//! Scoped durability barriers.
//!
//! A scope borrows the region exclusively and runs its barrier exactly once when it ends: by
//! [`Scope::finish`], or by `Drop` on every other exit path such as an early `?` return or a
//! panic. The barrier covers every range of the region still pending at that point, including
//! writes made before the scope began.
use core::ops::{Deref, DerefMut};

use crate::{persist, Region, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Barrier {
    /// Flush pending ranges without waiting for them.
    Flush,
    /// Flush pending ranges, then drain once.
    Persist,
}

/// A pending-durability token over a region.
///
/// Dereferences to the [`Region`].
pub struct Scope<'r> {
    region: &'r mut Region,
    barrier: Barrier,
    close: bool,
    released: bool,
}

impl Region {
    /// Borrow the region; pending ranges are flushed (not drained) when the scope ends.
    pub fn flush_scope(&mut self) -> Scope<'_> {
        Scope::new(self, Barrier::Flush)
    }

    /// Borrow the region; pending ranges are flushed and drained once when the scope ends.
    pub fn persist_scope(&mut self) -> Scope<'_> {
        Scope::new(self, Barrier::Persist)
    }
}

impl<'r> Scope<'r> {
    pub fn new(region: &'r mut Region, barrier: Barrier) -> Self {
        Scope {
            region,
            barrier,
            close: false,
            released: false,
        }
    }

    /// Also close the region after the barrier.
    pub fn close_on_exit(mut self) -> Self {
        self.close = true;
        self
    }

    pub fn barrier(&self) -> Barrier {
        self.barrier
    }

    /// Run the barrier now and report its outcome. Dropping afterwards does nothing.
    pub fn finish(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if core::mem::replace(&mut self.released, true) {
            return Ok(());
        }

        if !self.region.is_closed() {
            self.region.flush_pending()?;

            if self.barrier == Barrier::Persist {
                persist::drain();
            }
        }

        if self.close {
            self.region.close()?;
        }

        Ok(())
    }
}

impl Deref for Scope<'_> {
    type Target = Region;

    fn deref(&self) -> &Region {
        self.region
    }
}

impl DerefMut for Scope<'_> {
    fn deref_mut(&mut self) -> &mut Region {
        self.region
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(
                path = %self.region.path().display(),
                barrier = ?self.barrier,
                %err,
                "scope barrier failed on drop"
            );
        }
    }
}
