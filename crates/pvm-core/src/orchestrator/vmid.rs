use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

/// Hands out VM identifiers. Identifiers stay reserved in-process until the
/// returned [`VmidReservation`] drops, so two concurrent creations never
/// pick the same one even before either reaches the store.
pub(crate) struct VmidAllocator {
    floor: u32,
    reserved: Arc<Mutex<BTreeSet<u32>>>,
}

pub(crate) struct VmidReservation {
    vmid: u32,
    reserved: Arc<Mutex<BTreeSet<u32>>>,
}

impl VmidReservation {
    pub(crate) fn vmid(&self) -> u32 {
        self.vmid
    }
}

impl Drop for VmidReservation {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.vmid);
    }
}

impl VmidAllocator {
    pub(crate) fn new(floor: u32) -> Self {
        Self {
            floor,
            reserved: Arc::default(),
        }
    }

    /// Pick the next identifier.
    ///
    /// With the cluster inventory (`remote`), this is the smallest id at or
    /// above the floor that is unused remotely, locally, and in flight.
    /// Without it, one past the highest id known locally. The fallback can
    /// collide with guests the store does not know about.
    pub(crate) fn reserve(&self, remote: Option<&[u32]>, local: &[u32]) -> VmidReservation {
        let mut reserved = self.reserved.lock();

        let vmid = match remote {
            Some(remote) => {
                let used: BTreeSet<u32> = remote
                    .iter()
                    .chain(local)
                    .chain(reserved.iter())
                    .copied()
                    .collect();
                (self.floor..)
                    .find(|id| !used.contains(id))
                    .unwrap_or(u32::MAX)
            }
            None => {
                let highest = local
                    .iter()
                    .chain(reserved.iter())
                    .copied()
                    .max()
                    .unwrap_or(0);
                highest.saturating_add(1).max(self.floor)
            }
        };

        reserved.insert(vmid);
        VmidReservation {
            vmid,
            reserved: self.reserved.clone(),
        }
    }
}
