//! Chase-Lev work-stealing deque (§4.2.3).
//!
//! The owning worker calls `push`/`pop` (LIFO); any other thread calls
//! `steal` (FIFO). Capacity is a power of two and doubles on growth; retired
//! backing arrays are reclaimed through the hazard-pointer domain rather
//! than kept alive forever, which fills a gap the reference design left
//! open (it never reclaimed old arrays at all).

use std::ptr;
use std::sync::atomic::{fence, AtomicI64, AtomicPtr, Ordering};

use crate::hazard::{global_domain, HazardDomain};
use crate::job::Job;

const INITIAL_CAPACITY: usize = 64;

struct Buffer {
    mask: i64,
    slots: Box<[AtomicPtr<Job>]>,
}

impl Buffer {
    fn with_capacity(cap: usize) -> Box<Buffer> {
        debug_assert!(cap.is_power_of_two());
        let mut slots = Vec::with_capacity(cap);
        slots.resize_with(cap, || AtomicPtr::new(ptr::null_mut()));
        Box::new(Buffer {
            mask: cap as i64 - 1,
            slots: slots.into_boxed_slice(),
        })
    }

    fn capacity(&self) -> i64 {
        self.mask + 1
    }

    unsafe fn read(&self, i: i64) -> *mut Job {
        self.slots[(i & self.mask) as usize].load(Ordering::Acquire)
    }

    unsafe fn write(&self, i: i64, job: *mut Job) {
        self.slots[(i & self.mask) as usize].store(job, Ordering::Release);
    }

    /// Copy the live range `[t, b)` from `self` into a new buffer of double
    /// the capacity.
    unsafe fn grow(&self, t: i64, b: i64) -> Box<Buffer> {
        let new_buf = Buffer::with_capacity(self.capacity() as usize * 2);
        let mut i = t;
        while i < b {
            new_buf.write(i, self.read(i));
            i += 1;
        }
        new_buf
    }
}

unsafe fn drop_buffer(p: *mut ()) {
    drop(Box::from_raw(p as *mut Buffer));
}

/// Per-worker double-ended queue of job pointers.
pub struct ChaseLevDeque {
    top: AtomicI64,
    bottom: AtomicI64,
    buffer: AtomicPtr<Buffer>,
    domain: &'static HazardDomain,
}

unsafe impl Send for ChaseLevDeque {}
unsafe impl Sync for ChaseLevDeque {}

impl ChaseLevDeque {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.next_power_of_two().max(2);
        ChaseLevDeque {
            top: AtomicI64::new(0),
            bottom: AtomicI64::new(0),
            buffer: AtomicPtr::new(Box::into_raw(Buffer::with_capacity(cap))),
            domain: global_domain(),
        }
    }

    /// Owner-only: push a job onto the bottom of the deque, growing the
    /// backing array if it is full.
    pub fn push(&self, job: Job) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let mut buf_ptr = self.buffer.load(Ordering::Relaxed);
        let mut buf = unsafe { &*buf_ptr };

        if b - t >= buf.capacity() - 1 {
            let new_buf = unsafe { buf.grow(t, b) };
            let new_ptr = Box::into_raw(new_buf);
            self.buffer.store(new_ptr, Ordering::Release);
            unsafe { self.domain.retire(buf_ptr as *mut (), drop_buffer) };
            buf_ptr = new_ptr;
            buf = unsafe { &*buf_ptr };
        }

        let raw = Box::into_raw(Box::new(job));
        unsafe { buf.write(b, raw) };
        fence(Ordering::Release);
        self.bottom.store(b + 1, Ordering::Relaxed);
    }

    /// Owner-only: pop the most recently pushed job (LIFO). Races a
    /// concurrent `steal` of the last remaining element via a single CAS on
    /// `top`.
    pub fn pop(&self) -> Option<Job> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            // Deque was already empty; restore bottom.
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        let buf_ptr = self.buffer.load(Ordering::Relaxed);
        let _guard = self.domain.protect(buf_ptr as *mut ());
        let mut raw = unsafe { (*buf_ptr).read(b) };

        if t == b {
            if self
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                // A thief won the race for the last element.
                raw = ptr::null_mut();
            }
            self.bottom.store(b + 1, Ordering::Relaxed);
        }

        if raw.is_null() {
            None
        } else {
            Some(unsafe { *Box::from_raw(raw) })
        }
    }

    /// Thief-only: steal the oldest job (FIFO) from another worker's deque.
    pub fn steal(&self) -> Option<Job> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);
        if t >= b {
            return None;
        }

        let buf_ptr = self.buffer.load(Ordering::Acquire);
        let _guard = self.domain.protect(buf_ptr as *mut ());
        // Re-validate: the array may have been swapped out by a grow
        // between our two loads above.
        if buf_ptr != self.buffer.load(Ordering::Acquire) {
            return None;
        }
        let raw = unsafe { (*buf_ptr).read(t) };

        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        if raw.is_null() {
            None
        } else {
            Some(unsafe { *Box::from_raw(raw) })
        }
    }

    /// Steal up to `max` jobs. Implemented as repeated single steals: each
    /// one is still individually linearized by its own CAS on `top`, so this
    /// stays correct even though it is not a single bulk CAS.
    pub fn steal_batch(&self, max: usize) -> Vec<Job> {
        let mut out = Vec::with_capacity(max.min(8));
        for _ in 0..max {
            match self.steal() {
                Some(job) => out.push(job),
                None => break,
            }
        }
        out
    }

    /// Approximate length; exact only absent concurrent activity.
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChaseLevDeque {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ChaseLevDeque {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        let buf_ptr = self.buffer.load(Ordering::Relaxed);
        unsafe { drop(Box::from_raw(buf_ptr)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_returns_same_identity() {
        let d = ChaseLevDeque::new();
        let job = Job::new(|| Ok(()));
        let id = job.id;
        d.push(job);
        let popped = d.pop().unwrap();
        assert_eq!(popped.id, id);
    }

    #[test]
    fn pop_is_lifo() {
        let d = ChaseLevDeque::new();
        let ids: Vec<_> = (0..10)
            .map(|_| {
                let job = Job::new(|| Ok(()));
                let id = job.id;
                d.push(job);
                id
            })
            .collect();
        for expected in ids.into_iter().rev() {
            assert_eq!(d.pop().unwrap().id, expected);
        }
        assert!(d.pop().is_none());
    }

    #[test]
    fn steal_is_fifo_and_disjoint_from_pop() {
        let d = ChaseLevDeque::new();
        let ids: Vec<_> = (0..10)
            .map(|_| {
                let job = Job::new(|| Ok(()));
                let id = job.id;
                d.push(job);
                id
            })
            .collect();
        assert_eq!(d.steal().unwrap().id, ids[0]);
        assert_eq!(d.steal().unwrap().id, ids[1]);
        // Remaining elements still pop in LIFO order from the back.
        assert_eq!(d.pop().unwrap().id, ids[9]);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let d = ChaseLevDeque::with_capacity(2);
        for _ in 0..100 {
            d.push(Job::new(|| Ok(())));
        }
        let mut count = 0;
        while d.pop().is_some() {
            count += 1;
        }
        assert_eq!(count, 100);
    }

    #[test]
    fn concurrent_steal_and_pop_never_both_take_last_element() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;
        use std::thread;

        let d = Arc::new(ChaseLevDeque::new());
        for _ in 0..2000 {
            d.push(Job::new(|| Ok(())));
        }
        let taken = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..7 {
            let d = Arc::clone(&d);
            let taken = Arc::clone(&taken);
            handles.push(thread::spawn(move || {
                let mut n = 0;
                while d.steal().is_some() {
                    n += 1;
                }
                taken.fetch_add(n, Ordering::SeqCst);
            }));
        }
        let mut popped = 0;
        while d.pop().is_some() {
            popped += 1;
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(popped + taken.load(Ordering::SeqCst), 2000);
    }
}
