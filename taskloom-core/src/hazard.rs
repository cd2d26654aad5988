//! A bounded hazard-pointer domain for safe reclamation of nodes shared
//! between the lock-free MPMC queue and the Chase-Lev work-stealing deque.
//!
//! Each participating thread owns exactly one hazard slot (allocated lazily
//! on first use and released on thread exit). `protect` publishes the
//! address a thread is about to dereference; `retire` hands a no-longer
//! reachable pointer to the domain, which frees it only once a scan confirms
//! no slot still protects it.

use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

const MAX_HAZARD_SLOTS: usize = 256;
/// Once a thread's retired list grows past this many entries, it scans.
const SCAN_THRESHOLD: usize = 64;

struct Slot {
    ptr: AtomicPtr<()>,
    in_use: AtomicUsize,
}

/// Global registry of hazard slots, plus erased-type drop glue so retired
/// objects of heterogeneous types can share one reclamation path.
pub struct HazardDomain {
    slots: Vec<Slot>,
}

type DropFn = unsafe fn(*mut ());

struct Retired {
    ptr: *mut (),
    drop_fn: DropFn,
}

unsafe impl Send for Retired {}

/// Releases this thread's slot back to the domain when the thread exits (or
/// when a new domain displaces it). Holding `&'static HazardDomain` rather
/// than a raw pointer means the release is always valid to run, no matter
/// how late in shutdown the thread-local destructor fires.
struct SlotHandle {
    domain: &'static HazardDomain,
    idx: usize,
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        self.domain.slots[self.idx].in_use.store(0, Ordering::Release);
    }
}

thread_local! {
    static MY_SLOT: RefCell<Option<SlotHandle>> = RefCell::new(None);
    static RETIRED: RefCell<Vec<Retired>> = RefCell::new(Vec::new());
}

impl HazardDomain {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_HAZARD_SLOTS);
        for _ in 0..MAX_HAZARD_SLOTS {
            slots.push(Slot {
                ptr: AtomicPtr::new(ptr::null_mut()),
                in_use: AtomicUsize::new(0),
            });
        }
        HazardDomain { slots }
    }

    fn acquire_slot(&'static self) -> usize {
        if let Some(idx) = MY_SLOT.with(|s| s.borrow().as_ref().map(|h| h.idx)) {
            return idx;
        }
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.in_use.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                MY_SLOT.with(|s| *s.borrow_mut() = Some(SlotHandle { domain: self, idx }));
                return idx;
            }
        }
        panic!("taskloom-core: hazard pointer domain exhausted (> {} threads)", MAX_HAZARD_SLOTS);
    }

    /// Publish `addr` as currently being dereferenced by this thread.
    /// Returns a guard that clears the slot on drop. The slot itself is
    /// released back to the domain when this thread exits, via `SlotHandle`'s
    /// own `Drop` impl in the thread-local that owns it.
    pub fn protect(&'static self, addr: *mut ()) -> HazardGuard<'_> {
        let idx = self.acquire_slot();
        self.slots[idx].ptr.store(addr, Ordering::SeqCst);
        HazardGuard { domain: self, idx }
    }

    fn clear(&self, idx: usize) {
        self.slots[idx].ptr.store(ptr::null_mut(), Ordering::Release);
    }

    fn is_protected(&self, addr: *mut ()) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.ptr.load(Ordering::Acquire) == addr)
    }

    /// Hand a no-longer-reachable pointer to the domain for eventual
    /// reclamation. `drop_fn` performs the type-specific `Box::from_raw` +
    /// drop. Safety: caller must guarantee `ptr` was allocated in a way
    /// compatible with `drop_fn` and is unreachable from any live structure.
    pub unsafe fn retire(&self, ptr: *mut (), drop_fn: DropFn) {
        let should_scan = RETIRED.with(|r| {
            let mut r = r.borrow_mut();
            r.push(Retired { ptr, drop_fn });
            r.len() >= SCAN_THRESHOLD
        });
        if should_scan {
            self.scan();
        }
    }

    /// Force an immediate scan-and-reclaim pass over this thread's retired
    /// list, regardless of its length. Useful at queue/deque teardown.
    pub fn scan(&self) {
        RETIRED.with(|r| {
            let mut r = r.borrow_mut();
            let mut remaining = Vec::with_capacity(r.len());
            for entry in r.drain(..) {
                if self.is_protected(entry.ptr) {
                    remaining.push(entry);
                } else {
                    unsafe { (entry.drop_fn)(entry.ptr) };
                }
            }
            *r = remaining;
        });
    }
}

impl Default for HazardDomain {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HazardGuard<'a> {
    domain: &'a HazardDomain,
    idx: usize,
}

impl<'a> Drop for HazardGuard<'a> {
    fn drop(&mut self) {
        self.domain.clear(self.idx);
    }
}

/// Process-wide domain shared by every queue/deque instance. A single
/// domain (rather than one per queue) keeps the per-thread slot count
/// bounded regardless of how many queues a program creates, at the cost of
/// scans walking slightly more entries than strictly necessary.
static GLOBAL_DOMAIN: Mutex<Option<&'static HazardDomain>> = Mutex::new(None);

pub fn global_domain() -> &'static HazardDomain {
    let mut guard = GLOBAL_DOMAIN.lock().unwrap();
    if guard.is_none() {
        let leaked: &'static HazardDomain = Box::leak(Box::new(HazardDomain::new()));
        *guard = Some(leaked);
    }
    guard.unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retire_reclaims_once_unprotected() {
        let domain = HazardDomain::new();
        let boxed: Box<u64> = Box::new(42);
        let raw = Box::into_raw(boxed) as *mut ();
        unsafe fn drop_u64(p: *mut ()) {
            drop(Box::from_raw(p as *mut u64));
        }
        unsafe { domain.retire(raw, drop_u64) };
        domain.scan();
    }

    #[test]
    fn protected_pointer_survives_scan() {
        let domain: &'static HazardDomain = Box::leak(Box::new(HazardDomain::new()));
        let boxed: Box<u64> = Box::new(7);
        let raw = Box::into_raw(boxed) as *mut ();
        let guard = domain.protect(raw);
        unsafe fn drop_u64(p: *mut ()) {
            drop(Box::from_raw(p as *mut u64));
        }
        unsafe { domain.retire(raw, drop_u64) };
        domain.scan();
        assert!(domain.is_protected(raw));
        drop(guard);
        domain.scan();
    }

    #[test]
    fn thread_exit_releases_its_hazard_slot() {
        // If slots weren't released on thread exit, the (MAX_HAZARD_SLOTS +
        // 1)th sequential thread to touch this domain would hit the
        // "domain exhausted" panic in `acquire_slot`.
        let domain: &'static HazardDomain = Box::leak(Box::new(HazardDomain::new()));
        for _ in 0..(MAX_HAZARD_SLOTS + 10) {
            std::thread::spawn(move || {
                let _guard = domain.protect(ptr::null_mut());
            })
            .join()
            .unwrap();
        }
    }
}
