//! Subscriber identities
//!
//! Every task that subscribes to the bus first draws a small integer identity
//! from a fixed-size pool. The owner name travels with the identity so queue
//! diagnostics can say who is slow.

use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

/// Default size of the identity pool
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("subscriber pool exhausted ({capacity} identities in use), cannot register '{owner}'")]
    Exhausted { owner: String, capacity: usize },
}

/// A small, stable subscriber identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u16);

impl SubscriberId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fixed-size pool of subscriber identities, allocated first-free-slot
pub struct SubscriberRegistry {
    slots: Mutex<Vec<Option<String>>>,
}

impl SubscriberRegistry {
    /// Create a registry holding at most `capacity` identities
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize + 1);
        Self {
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    /// Allocate the lowest free identity for `owner`
    pub fn allocate(&self, owner: impl Into<String>) -> Result<SubscriberId, RegistryError> {
        let owner = owner.into();
        let mut slots = self.lock();

        let Some(index) = slots.iter().position(Option::is_none) else {
            return Err(RegistryError::Exhausted {
                owner,
                capacity: slots.len(),
            });
        };

        debug!(subscriber = index, owner = %owner, "Allocated subscriber identity");
        slots[index] = Some(owner);
        Ok(SubscriberId(index as u16))
    }

    /// Return an identity to the pool; false if it was not allocated
    pub fn release(&self, id: SubscriberId) -> bool {
        let mut slots = self.lock();
        match slots.get_mut(id.index()) {
            Some(slot) if slot.is_some() => {
                trace!(subscriber = %id, owner = ?slot, "Released subscriber identity");
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Owner name recorded for `id`
    pub fn owner(&self, id: SubscriberId) -> Option<String> {
        self.lock().get(id.index()).cloned().flatten()
    }

    /// Number of identities currently allocated
    pub fn in_use(&self) -> usize {
        self.lock().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Option<String>>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SUBSCRIBERS)
    }
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_free_slot() {
        let registry = SubscriberRegistry::new(4);
        let a = registry.allocate("a").unwrap();
        let b = registry.allocate("b").unwrap();
        let c = registry.allocate("c").unwrap();
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));

        assert!(registry.release(b));
        let d = registry.allocate("d").unwrap();
        assert_eq!(d.index(), 1);
        assert_eq!(registry.owner(d).as_deref(), Some("d"));
    }

    #[test]
    fn test_exhaustion() {
        let registry = SubscriberRegistry::new(2);
        registry.allocate("one").unwrap();
        registry.allocate("two").unwrap();

        let err = registry.allocate("three").unwrap_err();
        assert_eq!(
            err,
            RegistryError::Exhausted {
                owner: "three".to_string(),
                capacity: 2
            }
        );
        assert_eq!(registry.in_use(), 2);
    }

    #[test]
    fn test_release_unknown() {
        let registry = SubscriberRegistry::new(2);
        let id = registry.allocate("x").unwrap();
        assert!(registry.release(id));
        assert!(!registry.release(id));
        assert_eq!(registry.owner(id), None);
    }
}
