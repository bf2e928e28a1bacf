//! A concurrent work-stealing deque.
//!
//! The data structure can be thought of as a dynamically growable and shrinkable buffer that has
//! two ends: bottom and top. A [`Worker`] can [`push`] elements into the bottom and [`pop`]
//! elements from the bottom, while any number of [`Stealer`]s can only
//! [`steal`][Stealer::steal] elements from the top.
//!
//! A deque is created together with its two handles by the [`deque`] function. The [`Worker`]
//! cannot be cloned - there is exactly one per deque - but it can be sent to another thread. A
//! [`Stealer`] can be cloned any number of times, and the clones can be sent to other threads.
//!
//! Here's a visualization of the data structure:
//!
//! ```text
//!                      top
//!                       _
//!   Stealer::steal ->  | |
//!                      | |
//!                      | |
//!                      | |
//! Worker::push/pop -> |_|
//!
//!                    bottom
//! ```
//!
//! # Work-stealing schedulers
//!
//! Usually, the data structure is used in work-stealing schedulers as follows.
//!
//! There is a number of threads. Each thread owns a [`Worker`] and shares a [`Stealer`] with all
//! other threads. Then, all threads are executing in a loop. In the loop, each one attempts to
//! [`pop`] some work from its own [`Worker`]. But if it is empty, it attempts to
//! [`steal`][Stealer::steal] work from some other thread instead. When executing work (or being
//! idle), a thread may produce more work, which gets [`push`]ed into its [`Worker`].
//!
//! # Storage reclamation
//!
//! The backing storage is a chain of segments, each tagged with a generation id that increases
//! with every resize. When the worker replaces a full or sparse segment, the old one is kept on a
//! private chain of retired segments: a stealer may still be reading from it. Every [`Stealer`]
//! registers a small record with the deque and publishes into it the id of the segment it last
//! read from, along with a flag telling whether it is currently inside a steal. Retired segments
//! are freed by the worker once every registered stealer is either idle or has moved past them.
//!
//! # Examples
//!
//! ```
//! use steal_deque::deque;
//! use std::thread;
//!
//! let (mut worker, stealer) = deque();
//!
//! worker.push('a');
//! worker.push('b');
//! worker.push('c');
//!
//! assert_eq!(worker.pop(), Some('c'));
//!
//! thread::spawn(move || {
//!     assert_eq!(stealer.steal(), Some('a'));
//!     assert_eq!(stealer.steal(), Some('b'));
//! }).join().unwrap();
//! ```
//!
//! # References
//!
//! The implementation is based on the following work:
//!
//! 1. [Chase and Lev. Dynamic circular work-stealing deque. SPAA 2005.][chase-lev]
//! 2. [Le, Pop, Cohen, and Zappa Nardelli. Correct and efficient work-stealing for weak memory
//!    models. PPoPP 2013.][weak-mem]
//!
//! [chase-lev]: https://dl.acm.org/citation.cfm?id=1073974
//! [weak-mem]: https://dl.acm.org/citation.cfm?id=2442524
//!
//! [`deque`]: fn.deque.html
//! [`Worker`]: struct.Worker.html
//! [`Stealer`]: struct.Stealer.html
//! [`push`]: struct.Worker.html#method.push
//! [`pop`]: struct.Worker.html#method.pop
//! [Stealer::steal]: struct.Stealer.html#method.steal

extern crate crossbeam_utils as utils;

use std::cell::Cell;
use std::cmp;
use std::fmt;
use std::mem;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool, AtomicI64, AtomicIsize, AtomicPtr};
use std::sync::atomic::Ordering;

use utils::CachePadded;

/// The initial segment holds `1 << LOG_INITIAL_CAP` elements. Shrinking never goes below it.
const LOG_INITIAL_CAP: u32 = 4;

/// A segment of storage holding the elements of a deque.
///
/// Capacity is always a power of two, so wrapping a logical index reduces to a bit mask.
struct Segment<T> {
    /// Generation id. Every resize publishes a segment with the next id.
    id: i64,

    /// log2 of the capacity.
    log_cap: u32,

    /// Pointer to the allocated memory.
    ptr: *mut T,

    /// The segment that superseded this one, set by the worker on resize. Retired segments are
    /// chained through this field.
    next: Cell<*mut Segment<T>>,
}

impl<T> Segment<T> {
    /// Returns a new segment with capacity `1 << log_cap` and the specified generation id.
    fn new(log_cap: u32, id: i64) -> Segment<T> {
        let mut v = Vec::with_capacity(1 << log_cap);
        let ptr = v.as_mut_ptr();
        mem::forget(v);

        Segment {
            id: id,
            log_cap: log_cap,
            ptr: ptr,
            next: Cell::new(ptr::null_mut()),
        }
    }

    /// Returns the capacity of the segment.
    fn cap(&self) -> usize {
        1 << self.log_cap
    }

    /// Returns a pointer to the slot at the logical index `index`.
    unsafe fn at(&self, index: isize) -> *mut T {
        // `self.cap()` is always a power of two.
        self.ptr.offset(index & (self.cap() - 1) as isize)
    }

    /// Writes `value` into the slot at the logical index `index`.
    unsafe fn write(&self, index: isize, value: T) {
        ptr::write(self.at(index), value)
    }

    /// Reads the value from the slot at the logical index `index`.
    unsafe fn read(&self, index: isize) -> T {
        ptr::read(self.at(index))
    }

    /// Allocates a successor segment with capacity `1 << (log_cap + delta)` and the next
    /// generation id, copies the live range `[top, bottom)` into it slot by slot, and links it as
    /// this segment's successor.
    ///
    /// Each index is wrapped by the successor's capacity, so elements stay at their logical
    /// positions.
    #[cold]
    unsafe fn resize(&self, bottom: isize, top: isize, delta: i32) -> *mut Segment<T> {
        let new = Box::into_raw(Box::new(Segment::new(
            (self.log_cap as i32 + delta) as u32,
            self.id + 1,
        )));

        let mut i = top;
        while i != bottom {
            ptr::copy_nonoverlapping(self.at(i), (*new).at(i), 1);
            i = i.wrapping_add(1);
        }

        self.next.set(new);
        new
    }
}

impl<T> Drop for Segment<T> {
    fn drop(&mut self) {
        // The elements themselves are dropped by whoever retires the whole deque. Only the
        // allocation is released here.
        unsafe {
            drop(Vec::from_raw_parts(self.ptr, 0, self.cap()));
        }
    }
}

/// A per-stealer record read by the worker when it decides which retired segments to free.
///
/// The owning stealer is the only writer; the worker only reads.
struct Epoch {
    /// The id of the segment this stealer most recently read from.
    last_used: AtomicI64,

    /// Set whenever the stealer is not inside a steal. An idle stealer cannot be holding a
    /// segment, so its `last_used` does not constrain reclamation.
    is_idle: AtomicBool,

    /// The next record in the registration list. Written once before publication.
    next: *mut Epoch,
}

/// The registry of per-stealer records.
///
/// Records are prepended concurrently and never removed; they are all freed together when the
/// deque goes away.
struct Reclaimer {
    head: AtomicPtr<Epoch>,
}

impl Reclaimer {
    fn new() -> Reclaimer {
        Reclaimer {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Registers a new stealer, returning its record.
    ///
    /// The record starts out idle, with no segment used yet.
    fn register(&self) -> *mut Epoch {
        unsafe {
            let epoch = Box::into_raw(Box::new(Epoch {
                last_used: AtomicI64::new(0),
                is_idle: AtomicBool::new(true),
                next: self.head.load(Ordering::Relaxed),
            }));

            loop {
                match self.head.compare_exchange_weak(
                    (*epoch).next,
                    epoch,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return epoch,
                    Err(head) => (*epoch).next = head,
                }
            }
        }
    }

    /// Returns the head of the registration list.
    fn head(&self) -> *mut Epoch {
        self.head.load(Ordering::Acquire)
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        let mut head = self.head.load(Ordering::Relaxed);
        while !head.is_null() {
            let next = unsafe { (*head).next };
            drop(unsafe { Box::from_raw(head) });
            head = next;
        }
    }
}

/// Internal data that is shared between the worker and its stealers.
struct Inner<T> {
    /// The bottom index. Advanced only by the worker.
    bottom: AtomicIsize,

    /// The top index. Advanced by successful steals and by the worker's pop of a last element.
    top: AtomicIsize,

    /// The currently published segment.
    buffer: AtomicPtr<Segment<T>>,

    /// The oldest retired segment. The chain through `Segment::next` ends at the published
    /// segment. Only the worker touches this.
    unlinked: Cell<*mut Segment<T>>,

    /// The registry of stealer records.
    reclaimer: Reclaimer,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    fn new() -> Inner<T> {
        Inner {
            bottom: AtomicIsize::new(0),
            top: AtomicIsize::new(0),
            buffer: AtomicPtr::new(Box::into_raw(Box::new(Segment::new(LOG_INITIAL_CAP, 0)))),
            unlinked: Cell::new(ptr::null_mut()),
            reclaimer: Reclaimer::new(),
        }
    }

    /// Retires the current segment, publishes a resized successor, and returns it.
    ///
    /// Must be called only by the worker.
    #[cold]
    unsafe fn replace(&self, a: *mut Segment<T>, b: isize, t: isize, delta: i32) -> *mut Segment<T> {
        if self.unlinked.get().is_null() {
            self.unlinked.set(a);
        }

        let new = (*a).resize(b, t, delta);

        // Publication: stealers that load the new segment must also see the copied contents.
        self.buffer.store(new, Ordering::Release);
        new
    }

    /// Frees retired segments that no stealer can still observe.
    ///
    /// Must be called only by the worker, with a non-empty `unlinked` chain. `published` is the
    /// currently published segment.
    #[cold]
    unsafe fn reclaim(&self, published: *mut Segment<T>) {
        // An idle stealer cannot be holding a segment. For the rest, the id of the segment last
        // read bounds what may still be referenced.
        let mut min_id = (*published).id;
        let mut epoch = self.reclaimer.head();
        while !epoch.is_null() {
            if !(*epoch).is_idle.load(Ordering::Acquire) {
                min_id = cmp::min(min_id, (*epoch).last_used.load(Ordering::Relaxed));
            }
            epoch = (*epoch).next;
        }

        // Free strictly from the head of the chain, stopping at the first segment some stealer
        // may still observe. The chain ends at `published`, whose id is never below `min_id`.
        let mut head = self.unlinked.get();
        while (*head).id < min_id {
            let next = (*head).next.get();
            drop(Box::from_raw(head));
            head = next;
        }
        self.unlinked.set(head);
    }

    /// Pushes an element into the bottom of the deque.
    ///
    /// Must be called only by the worker.
    unsafe fn push(&self, value: T) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let mut a = self.buffer.load(Ordering::Relaxed);

        let size = b.wrapping_sub(t);

        // Grow while one slot is still free: the slot at `bottom` must be writable without
        // catching up with a concurrent steal at `top`.
        if size >= (*a).cap() as isize - 1 {
            a = self.replace(a, b, t, 1);
        }

        if !self.unlinked.get().is_null() {
            self.reclaim(a);
        }

        (*a).write(b, value);

        // The element must be visible in its slot before the new bottom is.
        atomic::fence(Ordering::Release);
        self.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
    }

    /// Pops an element from the bottom of the deque.
    ///
    /// Must be called only by the worker.
    unsafe fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed);
        let mut a = self.buffer.load(Ordering::Acquire);

        // Tentatively claim the bottom slot. The store must become visible before `top` is read,
        // which forces a concurrent steal of the same slot onto the race below.
        self.bottom.store(b.wrapping_sub(1), Ordering::Relaxed);
        atomic::fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        let size = b.wrapping_sub(t);

        if size <= 0 {
            // Empty. Give the claimed slot back.
            self.bottom.store(b, Ordering::Relaxed);
            None
        } else if size == 1 {
            // The last element can also be taken by a concurrent steal. Whoever advances `top`
            // owns it.
            let popped = if self.top
                .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                Some((*a).read(t))
            } else {
                None
            };
            self.bottom.store(b, Ordering::Relaxed);
            popped
        } else {
            let popped = (*a).read(b.wrapping_sub(1));

            // Shrink a sparse segment, but never below the initial capacity.
            let cap = (*a).cap() as isize;
            if size <= cap / 3 && size > (1 << LOG_INITIAL_CAP) {
                a = self.replace(a, b, t, -1);
            }

            if !self.unlinked.get().is_null() {
                self.reclaim(a);
            }

            Some(popped)
        }
    }

    /// Steals an element from the top of the deque.
    ///
    /// Returns `None` when the deque is empty and when the race for the top element is lost.
    fn steal(&self) -> Option<T> {
        let t = self.top.load(Ordering::Acquire);
        atomic::fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if b.wrapping_sub(t) <= 0 {
            return None;
        }

        let a = self.buffer.load(Ordering::Acquire);

        // The element must be read before the claiming CAS: right after the CAS the worker is
        // free to overwrite the slot. On a lost race the value belongs to somebody else, so it
        // must not be dropped here.
        let value = unsafe { (*a).read(t) };

        if self.top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            mem::forget(value);
            return None;
        }

        Some(value)
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        let buffer = self.buffer.load(Ordering::Relaxed);

        unsafe {
            // Free whatever is left of the retired chain. It ends at the published segment.
            let mut head = self.unlinked.get();
            while !head.is_null() && head != buffer {
                let next = (*head).next.get();
                drop(Box::from_raw(head));
                head = next;
            }

            // Go through the segment from top to bottom and drop all elements in the deque.
            let mut i = t;
            while i != b {
                ptr::drop_in_place((*buffer).at(i));
                i = i.wrapping_add(1);
            }

            drop(Box::from_raw(buffer));
        }
    }
}

/// The worker side of a deque.
///
/// There is exactly one worker per deque: the handle cannot be cloned, only moved. The worker
/// [`push`]es elements into the bottom of the deque and [`pop`]s them from the bottom.
///
/// # Examples
///
/// ```
/// use steal_deque::deque;
///
/// let (mut w, _) = deque();
/// w.push(1);
/// w.push(2);
///
/// assert_eq!(w.pop(), Some(2));
/// assert_eq!(w.pop(), Some(1));
/// assert_eq!(w.pop(), None);
/// ```
///
/// [`push`]: struct.Worker.html#method.push
/// [`pop`]: struct.Worker.html#method.pop
pub struct Worker<T> {
    inner: Arc<CachePadded<Inner<T>>>,
}

impl<T> Worker<T> {
    /// Returns `true` if the deque is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use steal_deque::deque;
    ///
    /// let (mut w, _) = deque();
    /// assert!(w.is_empty());
    /// w.push("foo");
    /// assert!(!w.is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of elements in the deque.
    ///
    /// # Examples
    ///
    /// ```
    /// use steal_deque::deque;
    ///
    /// let (mut w, _) = deque();
    /// w.push('a');
    /// w.push('b');
    /// w.push('c');
    /// assert_eq!(w.len(), 3);
    /// ```
    pub fn len(&self) -> usize {
        let t = self.inner.top.load(Ordering::Relaxed);
        let b = self.inner.bottom.load(Ordering::Relaxed);
        b.wrapping_sub(t).max(0) as usize
    }

    /// Pushes an element into the bottom of the deque.
    ///
    /// If the segment is full, a new one twice the capacity of the current one is published
    /// first.
    ///
    /// # Examples
    ///
    /// ```
    /// use steal_deque::deque;
    ///
    /// let (mut w, _) = deque();
    /// w.push(1);
    /// w.push(2);
    /// ```
    pub fn push(&mut self, value: T) {
        unsafe { self.inner.push(value) }
    }

    /// Pops an element from the bottom of the deque.
    ///
    /// Returns `None` when the deque is empty, and when the deque holds a single element and a
    /// concurrent steal takes it first.
    ///
    /// If the segment is sparsely filled, a new one half the capacity of the current one is
    /// published, but never below the initial capacity.
    ///
    /// # Examples
    ///
    /// ```
    /// use steal_deque::deque;
    ///
    /// let (mut w, _) = deque();
    /// w.push(1);
    /// w.push(2);
    ///
    /// assert_eq!(w.pop(), Some(2));
    /// assert_eq!(w.pop(), Some(1));
    /// assert_eq!(w.pop(), None);
    /// ```
    pub fn pop(&mut self) -> Option<T> {
        unsafe { self.inner.pop() }
    }
}

impl<T> fmt::Debug for Worker<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Worker {{ ... }}")
    }
}

/// The stealing side of a deque.
///
/// Stealers [`steal`] elements from the top of the deque. A stealer can be cloned in order to
/// create more stealers, and the clones can be sent to other threads. Cloning registers a fresh
/// record with the deque's reclaimer; moving a stealer keeps its record.
///
/// A stealer is `Send` but deliberately not `Sync`: its record admits a single writer, so every
/// thread must steal through its own clone.
///
/// [`steal`]: struct.Stealer.html#method.steal
pub struct Stealer<T> {
    inner: Arc<CachePadded<Inner<T>>>,
    epoch: *mut Epoch,
}

unsafe impl<T: Send> Send for Stealer<T> {}

impl<T> Stealer<T> {
    /// Returns `true` if the deque is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use steal_deque::deque;
    ///
    /// let (mut w, s) = deque();
    /// w.push("foo");
    /// assert!(!s.is_empty());
    /// s.steal();
    /// assert!(s.is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of elements in the deque.
    ///
    /// # Examples
    ///
    /// ```
    /// use steal_deque::deque;
    ///
    /// let (mut w, s) = deque();
    /// w.push('a');
    /// w.push('b');
    /// w.push('c');
    /// assert_eq!(s.len(), 3);
    /// ```
    pub fn len(&self) -> usize {
        let t = self.inner.top.load(Ordering::Relaxed);
        atomic::fence(Ordering::SeqCst);
        let b = self.inner.bottom.load(Ordering::Relaxed);
        cmp::max(b.wrapping_sub(t), 0) as usize
    }

    /// Steals an element from the top of the deque.
    ///
    /// Returns `None` when the deque is empty and when another steal or a pop of the last
    /// element gets in the way. The caller decides whether and when to retry.
    ///
    /// # Examples
    ///
    /// ```
    /// use steal_deque::deque;
    ///
    /// let (mut w, s) = deque();
    /// w.push(1);
    /// w.push(2);
    ///
    /// assert_eq!(s.steal(), Some(1));
    /// assert_eq!(s.steal(), Some(2));
    /// assert_eq!(s.steal(), None);
    /// ```
    pub fn steal(&self) -> Option<T> {
        let epoch = unsafe { &*self.epoch };

        // The record must read as busy before any deque state is sampled, so that a concurrent
        // reclamation pass takes `last_used` into account.
        epoch.is_idle.store(false, Ordering::Release);
        let stolen = self.inner.steal();
        epoch.is_idle.store(true, Ordering::Release);

        // Record the id of the newest segment this stealer could have read, for the next
        // reclamation pass.
        let a = self.inner.buffer.load(Ordering::Acquire);
        epoch.last_used.store(unsafe { (*a).id }, Ordering::Relaxed);

        stolen
    }
}

impl<T> Clone for Stealer<T> {
    /// Creates another stealer, registering a fresh record with the deque's reclaimer.
    fn clone(&self) -> Stealer<T> {
        Stealer {
            inner: self.inner.clone(),
            epoch: self.inner.reclaimer.register(),
        }
    }
}

impl<T> fmt::Debug for Stealer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Stealer {{ ... }}")
    }
}

/// Creates a work-stealing deque, returning its worker and stealer sides.
///
/// The deque and its storage are destructed as soon as the worker and all stealers get dropped.
///
/// # Examples
///
/// ```
/// use steal_deque::deque;
/// use std::thread;
///
/// let (mut worker, stealer) = deque();
///
/// worker.push(1);
/// worker.push(2);
///
/// thread::spawn(move || {
///     assert_eq!(stealer.steal(), Some(1));
/// }).join().unwrap();
///
/// assert_eq!(worker.pop(), Some(2));
/// ```
pub fn deque<T>() -> (Worker<T>, Stealer<T>) {
    let inner = Arc::new(CachePadded::new(Inner::new()));

    let stealer = Stealer {
        epoch: inner.reclaimer.register(),
        inner: inner.clone(),
    };
    let worker = Worker { inner: inner };

    (worker, stealer)
}

#[cfg(test)]
mod tests {
    extern crate rand;

    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::atomic::Ordering::{Relaxed, SeqCst};
    use std::thread;

    use self::rand::Rng;

    use super::{deque, LOG_INITIAL_CAP};

    #[test]
    fn smoke() {
        let (mut w, s) = deque();
        assert_eq!(w.pop(), None);
        assert_eq!(s.steal(), None);
        assert_eq!(w.len(), 0);
        assert_eq!(s.len(), 0);

        w.push(100);
        assert_eq!(w.len(), 1);
        assert_eq!(s.len(), 1);
        assert_eq!(w.pop(), Some(100));
        assert_eq!(w.pop(), None);
        assert_eq!(s.steal(), None);

        w.push(100);
        assert_eq!(s.steal(), Some(100));
        assert_eq!(s.steal(), None);
        assert_eq!(w.pop(), None);

        w.push(3);
        w.push(4);
        w.push(5);
        assert_eq!(s.steal(), Some(3));
        assert_eq!(w.pop(), Some(5));
        assert_eq!(s.steal(), Some(4));
        assert_eq!(s.steal(), None);
    }

    #[test]
    fn grow_preserves_order() {
        let (mut w, s) = deque();

        // Crosses the initial capacity several times.
        for i in 0..100 {
            w.push(i);
        }
        for i in 0..100 {
            assert_eq!(s.steal(), Some(i));
        }
        assert_eq!(s.steal(), None);
    }

    #[test]
    fn one_element_many_stealers() {
        let (mut w, s) = deque();
        w.push(100);

        let seen = Arc::new(AtomicUsize::new(0));

        let threads = (0..4)
            .map(|_| {
                let s = s.clone();
                let seen = seen.clone();

                thread::spawn(move || {
                    if let Some(x) = s.steal() {
                        assert_eq!(x, 100);
                        seen.fetch_add(1, SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(seen.load(SeqCst), 1);
        assert_eq!(w.pop(), None);
    }

    #[test]
    fn steal_push() {
        const STEPS: usize = 50_000;

        let (mut w, s) = deque();
        let t = thread::spawn(move || {
            for i in 0..STEPS {
                loop {
                    if let Some(v) = s.steal() {
                        assert_eq!(i, v);
                        break;
                    }
                }
            }
        });

        for i in 0..STEPS {
            w.push(i);
        }
        t.join().unwrap();
    }

    #[test]
    fn push_against_steals() {
        const COUNT: usize = 100_000;

        let (mut w, s) = deque();
        let remaining = Arc::new(AtomicUsize::new(COUNT));

        let threads = (0..4)
            .map(|_| {
                let s = s.clone();
                let remaining = remaining.clone();

                thread::spawn(move || {
                    while remaining.load(SeqCst) > 0 {
                        if let Some(x) = s.steal() {
                            assert_eq!(x, 1);
                            remaining.fetch_sub(1, SeqCst);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for _ in 0..COUNT {
            w.push(1);
        }

        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(remaining.load(SeqCst), 0);
    }

    #[test]
    fn pop_and_steal() {
        const COUNT: usize = 100_000;

        struct Job {
            label: usize,
            path: String,
        }

        let (mut w, s) = deque();
        let remaining = Arc::new(AtomicUsize::new(COUNT));

        for _ in 0..COUNT {
            w.push(Job {
                label: 1,
                path: "/some/random/path".to_string(),
            });
        }

        let threads = (0..4)
            .map(|_| {
                let s = s.clone();
                let remaining = remaining.clone();

                thread::spawn(move || {
                    while remaining.load(SeqCst) > 0 {
                        if let Some(job) = s.steal() {
                            assert_eq!(job.label, 1);
                            remaining.fetch_sub(1, SeqCst);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        while remaining.load(SeqCst) > 0 {
            if let Some(job) = w.pop() {
                assert_eq!(job.label, 1);
                assert!(!job.path.is_empty());
                remaining.fetch_sub(1, SeqCst);
            }
        }

        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(remaining.load(SeqCst), 0);
    }

    #[test]
    fn stampede() {
        const COUNT: usize = 50_000;

        let (mut w, s) = deque();

        for i in 0..COUNT {
            w.push(Box::new(i + 1));
        }
        let remaining = Arc::new(AtomicUsize::new(COUNT));

        let threads = (0..8)
            .map(|_| {
                let s = s.clone();
                let remaining = remaining.clone();

                thread::spawn(move || {
                    let mut last = 0;
                    while remaining.load(SeqCst) > 0 {
                        if let Some(x) = s.steal() {
                            assert!(last < *x);
                            last = *x;
                            remaining.fetch_sub(1, SeqCst);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut last = COUNT + 1;
        while remaining.load(SeqCst) > 0 {
            if let Some(x) = w.pop() {
                assert!(last > *x);
                last = *x;
                remaining.fetch_sub(1, SeqCst);
            }
        }

        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn stress() {
        const COUNT: usize = 50_000;

        let (mut w, s) = deque();
        let done = Arc::new(AtomicBool::new(false));
        let hits = Arc::new(AtomicUsize::new(0));

        let threads = (0..8)
            .map(|_| {
                let s = s.clone();
                let done = done.clone();
                let hits = hits.clone();

                thread::spawn(move || {
                    while !done.load(SeqCst) {
                        if s.steal().is_some() {
                            hits.fetch_add(1, SeqCst);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut rng = rand::thread_rng();
        let mut expected = 0;
        while expected < COUNT {
            if rng.gen_range(0..3) == 0 {
                if w.pop().is_some() {
                    hits.fetch_add(1, SeqCst);
                }
            } else {
                w.push(expected);
                expected += 1;
            }
        }

        while hits.load(SeqCst) < COUNT {
            if w.pop().is_some() {
                hits.fetch_add(1, SeqCst);
            }
        }
        done.store(true, SeqCst);

        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn push_then_drain() {
        const COUNT: usize = 1_000_000;

        let (mut w, s) = deque();
        for i in 0..COUNT {
            w.push(i);
        }

        for i in (0..COUNT).rev() {
            assert_eq!(w.pop(), Some(i));
        }
        assert_eq!(w.pop(), None);
        assert_eq!(s.steal(), None);
    }

    #[test]
    fn shrink_keeps_floor() {
        let (mut w, s) = deque::<usize>();

        for i in 0..10_000 {
            w.push(i);
        }
        while w.pop().is_some() {}

        let a = w.inner.buffer.load(Relaxed);
        unsafe {
            assert!((*a).cap() >= 1 << LOG_INITIAL_CAP);
        }
        drop(s);
    }

    #[test]
    fn resize_churn_under_steals() {
        let (mut w, s) = deque();
        let done = Arc::new(AtomicBool::new(false));
        let stolen = Arc::new(AtomicUsize::new(0));

        let threads = (0..8)
            .map(|_| {
                let s = s.clone();
                let done = done.clone();
                let stolen = stolen.clone();

                thread::spawn(move || {
                    while !done.load(SeqCst) {
                        if s.steal().is_some() {
                            stolen.fetch_add(1, SeqCst);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        // Every round fills the deque up well past the initial capacity and drains it back,
        // forcing a burst of grows and shrinks while the stealers keep racing.
        let mut pushed = 0;
        let mut popped = 0;
        for _ in 0..100 {
            for _ in 0..1_000 {
                w.push(pushed);
                pushed += 1;
            }
            for _ in 0..1_000 {
                if w.pop().is_some() {
                    popped += 1;
                }
            }
        }

        done.store(true, SeqCst);
        for t in threads {
            t.join().unwrap();
        }

        while w.pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped + stolen.load(SeqCst), pushed);
    }

    #[test]
    fn destructors() {
        const COUNT: usize = 50_000;

        struct Elem(usize, Arc<Mutex<Vec<usize>>>);

        impl Drop for Elem {
            fn drop(&mut self) {
                self.1.lock().unwrap().push(self.0);
            }
        }

        let (mut w, s) = deque();

        let dropped = Arc::new(Mutex::new(Vec::new()));
        let remaining = Arc::new(AtomicUsize::new(COUNT));
        for i in 0..COUNT {
            w.push(Elem(i, dropped.clone()));
        }

        let threads = (0..8)
            .map(|_| {
                let s = s.clone();
                let remaining = remaining.clone();

                thread::spawn(move || {
                    for _ in 0..1000 {
                        if s.steal().is_some() {
                            remaining.fetch_sub(1, SeqCst);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for _ in 0..1000 {
            if w.pop().is_some() {
                remaining.fetch_sub(1, SeqCst);
            }
        }

        for t in threads {
            t.join().unwrap();
        }

        let rem = remaining.load(SeqCst);
        assert!(rem > 0);
        assert_eq!(w.len(), rem);

        {
            let mut v = dropped.lock().unwrap();
            assert_eq!(v.len(), COUNT - rem);
            v.clear();
        }

        drop(w);
        drop(s);

        {
            let mut v = dropped.lock().unwrap();
            assert_eq!(v.len(), rem);
            v.sort();
            for pair in v.windows(2) {
                assert_eq!(pair[0] + 1, pair[1]);
            }
        }
    }
}
