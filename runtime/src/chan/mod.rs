// Copyright 2026 Weft Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Channels: typed FIFOs that rendezvous or buffer, with close semantics and
//! multiway `select`.
//!
//! The core is the untyped [`RawChannel`]; [`Chan`] is the typed, cloneable
//! handle over it. Blocked tasks enqueue an intrusive [`Waiter`] node that
//! lives on their own (parked, hence immovable) stack — the channel owns the
//! list, the node points back at the task, and whoever completes an operation
//! against a waiter unlinks it before waking its task. Select enrollment adds
//! a claim token; the token CAS is what makes one case win atomically.

mod select;

pub use select::{RecvSlot, Select, SelectOutcome, SendSlot};

use crate::sched;
use crate::task::{Task, WaitReason};
use crate::util::rtabort;
use crate::{panicking, sync};
use cordyceps::{Linked, list, list::List};
use core::cell::Cell;
use core::marker::{PhantomData, PhantomPinned};
use core::mem::{ManuallyDrop, MaybeUninit};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use smallvec::SmallVec;
use std::sync::{Arc, OnceLock};

/// Token value while no select case has won.
pub(crate) const SELECT_UNCLAIMED: usize = usize::MAX;

/// The error returned by [`Chan::try_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// Nothing buffered and no sender waiting.
    Empty,
    /// The channel is closed and drained.
    Closed,
}

/// A task parked on (or select-enrolled in) a channel queue.
///
/// Lives on the blocked task's stack; valid exactly while it is linked, which
/// is why every unlink happens under the owning channel's mutex.
pub(crate) struct Waiter {
    links: list::Links<Waiter>,
    task: NonNull<Task>,
    /// Transfer slot: source for senders, destination for receivers.
    elem: *mut u8,
    /// Receive outcome; false means "channel closed".
    ok: Cell<bool>,
    /// Select enrollment, if this waiter is one case of a select.
    select: Option<SelectRef>,
    /// Still linked in a channel list. Written only under that channel's
    /// mutex; read by the owner after it resumes.
    queued: Cell<bool>,
    _pin: PhantomPinned,
}

#[derive(Clone, Copy)]
pub(crate) struct SelectRef {
    pub(crate) token: NonNull<AtomicUsize>,
    pub(crate) index: usize,
}

impl Waiter {
    pub(crate) fn new(task: NonNull<Task>, elem: *mut u8, select: Option<SelectRef>) -> Waiter {
        Waiter {
            links: list::Links::new(),
            task,
            elem,
            ok: Cell::new(true),
            select,
            queued: Cell::new(false),
            _pin: PhantomPinned,
        }
    }

    pub(crate) fn task(&self) -> NonNull<Task> {
        self.task
    }

    pub(crate) fn elem(&self) -> *mut u8 {
        self.elem
    }

    pub(crate) fn ok(&self) -> bool {
        self.ok.get()
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.queued.get()
    }

    pub(crate) fn mark_queued(&self) {
        self.queued.set(true);
    }

    pub(crate) fn clear_queued(&self) {
        self.queued.set(false);
    }

    pub(crate) fn set_ok(&self, ok: bool) {
        self.ok.set(ok);
    }
}

// Safety: waiters are pinned on a parked task's stack for exactly as long as
// they are linked; the channel mutex serializes all link/unlink operations.
unsafe impl Linked<list::Links<Waiter>> for Waiter {
    type Handle = NonNull<Waiter>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Waiter> {
        handle
    }

    unsafe fn from_ptr(ptr: NonNull<Waiter>) -> Self::Handle {
        ptr
    }

    unsafe fn links(ptr: NonNull<Waiter>) -> NonNull<list::Links<Waiter>> {
        // Safety: links is a field of a live Waiter
        unsafe { NonNull::new_unchecked(&raw mut (*ptr.as_ptr()).links) }
    }
}

/// Pops the first waiter that is still claimable.
///
/// A plain (non-select) waiter is always claimable. A select waiter must win
/// its token CAS; losers were already claimed through another case and are
/// dropped from the list here — their owner skips the unlink when it cleans
/// up, keyed off `queued`.
pub(crate) fn pop_claimable(queue: &mut List<Waiter>) -> Option<NonNull<Waiter>> {
    loop {
        let waiter = queue.pop_front()?;
        // Safety: linked waiters are live (see Waiter invariant)
        let w = unsafe { waiter.as_ref() };
        w.queued.set(false);
        match w.select {
            None => return Some(waiter),
            Some(sel) => {
                // Safety: the token lives on the selecting task's stack,
                // which is parked while any enrollment is linked
                let token = unsafe { sel.token.as_ref() };
                if token
                    .compare_exchange(
                        SELECT_UNCLAIMED,
                        sel.index,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Some(waiter);
                }
                // Stale: another case already won this select.
            }
        }
    }
}

/// Channel state behind the per-channel mutex.
pub(crate) struct ChanInner {
    /// Ring storage, word-backed so buffered pointers stay word-aligned for
    /// the collector's scan.
    buf: Box<[usize]>,
    head: usize,
    len: usize,
    closed: bool,
    pub(crate) sendq: List<Waiter>,
    pub(crate) recvq: List<Waiter>,
}

// Safety: ChanInner is only accessed under the channel mutex; the waiter
// pointers it holds follow the Waiter protocol.
unsafe impl Send for ChanInner {}

static_assertions::assert_impl_all!(RawChannel: Send, Sync);
static_assertions::assert_impl_all!(Chan<u8>: Send, Sync);

/// The untyped channel: element size, ring buffer, wait queues, closed flag,
/// one mutex.
pub struct RawChannel {
    elem_size: usize,
    cap: usize,
    /// Destructor for buffered elements still present when the channel dies.
    drop_elem: Option<unsafe fn(*mut u8)>,
    pub(crate) inner: sync::Mutex<ChanInner>,
}

impl RawChannel {
    pub(crate) fn new(
        elem_size: usize,
        cap: usize,
        drop_elem: Option<unsafe fn(*mut u8)>,
    ) -> Arc<RawChannel> {
        let words = (cap * elem_size).div_ceil(size_of::<usize>());
        let ch = Arc::new(RawChannel {
            elem_size,
            cap,
            drop_elem,
            inner: sync::Mutex::new(ChanInner {
                buf: vec![0_usize; words].into_boxed_slice(),
                head: 0,
                len: 0,
                closed: false,
                sendq: List::new(),
                recvq: List::new(),
            }),
        });
        registry().lock().push(Arc::as_ptr(&ch) as usize);
        ch
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot_ptr(&self, inner: &mut ChanInner, index: usize) -> *mut u8 {
        debug_assert!(index < self.cap);
        let base = inner.buf.as_mut_ptr().cast::<u8>();
        // Safety: index is within the ring
        unsafe { base.add(index * self.elem_size) }
    }

    /// Copies `src` into the ring tail. Caller checked `len < cap`.
    pub(crate) fn buffer_put(&self, inner: &mut ChanInner, src: *const u8) {
        debug_assert!(inner.len < self.cap);
        let tail = (inner.head + inner.len) % self.cap;
        let dst = self.slot_ptr(inner, tail);
        // Safety: src provides elem_size readable bytes, dst is ours
        unsafe { core::ptr::copy_nonoverlapping(src, dst, self.elem_size) };
        inner.len += 1;
    }

    /// Copies the ring head out to `dst`. Caller checked `len > 0`.
    pub(crate) fn buffer_take(&self, inner: &mut ChanInner, dst: *mut u8) {
        debug_assert!(inner.len > 0);
        let src = self.slot_ptr(inner, inner.head);
        // Safety: dst provides elem_size writable bytes, src is ours
        unsafe { core::ptr::copy_nonoverlapping(src, dst, self.elem_size) };
        inner.head = (inner.head + 1) % self.cap;
        inner.len -= 1;
    }

    /// Blocking send; parks until a receiver or buffer slot takes the value.
    ///
    /// Sending on a closed channel panics the task.
    pub fn send(&self, src: *const u8) {
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            panicking::panic_any("send on closed channel");
        }

        // A waiting receiver takes the value directly.
        if let Some(waiter) = pop_claimable(&mut inner.recvq) {
            // Safety: claimed waiters are live until their task is unblocked
            let w = unsafe { waiter.as_ref() };
            // Safety: the receiver's slot accepts elem_size bytes
            unsafe { core::ptr::copy_nonoverlapping(src, w.elem, self.elem_size) };
            w.ok.set(true);
            let peer = w.task();
            drop(inner);
            sched::get().unblock(peer);
            return;
        }

        if inner.len < self.cap {
            self.buffer_put(&mut inner, src);
            return;
        }

        // Block with the value still in our frame; the receiver that claims
        // us copies it out before waking us.
        let Some(task) = sched::current_task() else {
            rtabort!("blocking channel send outside a task");
        };
        let waiter = Waiter::new(task, src.cast_mut(), None);
        inner.sendq.push_back(NonNull::from(&waiter));
        waiter.queued.set(true);
        sched::park(WaitReason::ChanSend, move || drop(inner));
        debug_assert!(!waiter.is_queued());
    }

    /// Blocking receive into `dst`. Returns false (and zeroes `dst`) once the
    /// channel is closed and drained.
    pub fn recv(&self, dst: *mut u8) -> bool {
        let mut inner = self.inner.lock();

        if self.cap == 0 {
            // Rendezvous: take a waiting sender's value directly.
            if let Some(waiter) = pop_claimable(&mut inner.sendq) {
                // Safety: claimed waiters are live until their task is unblocked
                let w = unsafe { waiter.as_ref() };
                // Safety: the sender's slot holds elem_size readable bytes
                unsafe { core::ptr::copy_nonoverlapping(w.elem, dst, self.elem_size) };
                let peer = w.task();
                drop(inner);
                sched::get().unblock(peer);
                return true;
            }
        } else if inner.len > 0 {
            self.buffer_take(&mut inner, dst);
            // A sender blocked on the full buffer moves into the freed slot.
            if let Some(waiter) = pop_claimable(&mut inner.sendq) {
                // Safety: claimed waiters are live until their task is unblocked
                let w = unsafe { waiter.as_ref() };
                self.buffer_put(&mut inner, w.elem);
                let peer = w.task();
                drop(inner);
                sched::get().unblock(peer);
            }
            return true;
        }

        if inner.closed {
            // Safety: dst accepts elem_size bytes; closed receive is zero
            unsafe { core::ptr::write_bytes(dst, 0, self.elem_size) };
            return false;
        }

        let Some(task) = sched::current_task() else {
            rtabort!("blocking channel receive outside a task");
        };
        let waiter = Waiter::new(task, dst, None);
        inner.recvq.push_back(NonNull::from(&waiter));
        waiter.queued.set(true);
        sched::park(WaitReason::ChanRecv, move || drop(inner));
        debug_assert!(!waiter.is_queued());
        waiter.ok()
    }

    /// Non-blocking send. Returns false when the operation would block.
    /// Panics the task if the channel is closed.
    pub fn try_send(&self, src: *const u8) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            panicking::panic_any("send on closed channel");
        }
        if let Some(waiter) = pop_claimable(&mut inner.recvq) {
            // Safety: claimed waiters are live until their task is unblocked
            let w = unsafe { waiter.as_ref() };
            // Safety: the receiver's slot accepts elem_size bytes
            unsafe { core::ptr::copy_nonoverlapping(src, w.elem, self.elem_size) };
            w.ok.set(true);
            let peer = w.task();
            drop(inner);
            sched::get().unblock(peer);
            return true;
        }
        if inner.len < self.cap {
            self.buffer_put(&mut inner, src);
            return true;
        }
        false
    }

    /// Non-blocking receive.
    pub fn try_recv(&self, dst: *mut u8) -> Result<(), TryRecvError> {
        let mut inner = self.inner.lock();

        if self.cap == 0 {
            if let Some(waiter) = pop_claimable(&mut inner.sendq) {
                // Safety: claimed waiters are live until their task is unblocked
                let w = unsafe { waiter.as_ref() };
                // Safety: the sender's slot holds elem_size readable bytes
                unsafe { core::ptr::copy_nonoverlapping(w.elem, dst, self.elem_size) };
                let peer = w.task();
                drop(inner);
                sched::get().unblock(peer);
                return Ok(());
            }
        } else if inner.len > 0 {
            self.buffer_take(&mut inner, dst);
            if let Some(waiter) = pop_claimable(&mut inner.sendq) {
                // Safety: claimed waiters are live until their task is unblocked
                let w = unsafe { waiter.as_ref() };
                self.buffer_put(&mut inner, w.elem);
                let peer = w.task();
                drop(inner);
                sched::get().unblock(peer);
            }
            return Ok(());
        }

        if inner.closed {
            // Safety: dst accepts elem_size bytes
            unsafe { core::ptr::write_bytes(dst, 0, self.elem_size) };
            return Err(TryRecvError::Closed);
        }
        Err(TryRecvError::Empty)
    }

    /// Closes the channel: every blocked receiver wakes with the zero value
    /// and `ok == false`. Closing twice panics the task; closing with blocked
    /// senders is a fatal runtime error.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            panicking::panic_any("close of closed channel");
        }
        inner.closed = true;

        if pop_claimable(&mut inner.sendq).is_some() {
            rtabort!("close of channel with blocked senders");
        }

        let mut woken: SmallVec<[NonNull<Task>; 4]> = SmallVec::new();
        while let Some(waiter) = pop_claimable(&mut inner.recvq) {
            // Safety: claimed waiters are live until their task is unblocked
            let w = unsafe { waiter.as_ref() };
            // Safety: the receiver's slot accepts elem_size bytes
            unsafe { core::ptr::write_bytes(w.elem, 0, self.elem_size) };
            w.ok.set(false);
            woken.push(w.task());
        }
        drop(inner);

        let sched = sched::get();
        for task in woken {
            sched.unblock(task);
        }
    }

    /// Reports the occupied ring region to the collector. World is stopped.
    pub(crate) fn scan_buffered(&self, mut visit: impl FnMut(usize, usize)) {
        let mut inner = self.inner.lock();
        let len = inner.len;
        let head = inner.head;
        for i in 0..len {
            let idx = (head + i) % self.cap;
            let addr = self.slot_ptr(&mut inner, idx) as usize;
            visit(addr, self.elem_size);
        }
    }
}

impl Drop for RawChannel {
    fn drop(&mut self) {
        let me = core::ptr::from_ref(self) as usize;
        registry().lock().retain(|&p| p != me);

        if let Some(drop_elem) = self.drop_elem {
            let inner = self.inner.get_mut();
            for i in 0..inner.len {
                let idx = (inner.head + i) % self.cap;
                let base = inner.buf.as_mut_ptr().cast::<u8>();
                // Safety: the slot holds a live element that nobody else can
                // reach any more
                unsafe { drop_elem(base.add(idx * self.elem_size)) };
            }
        }
    }
}

/// All live channels; the collector treats their buffers as roots.
fn registry() -> &'static sync::Mutex<Vec<usize>> {
    static REGISTRY: OnceLock<sync::Mutex<Vec<usize>>> = OnceLock::new();
    REGISTRY.get_or_init(|| sync::Mutex::new(Vec::new()))
}

/// Runs `visit` on every live channel. World must be stopped.
pub(crate) fn for_each_channel(mut visit: impl FnMut(&RawChannel)) {
    let channels = registry().lock();
    for &addr in channels.iter() {
        // Safety: entries are removed in RawChannel::drop before the memory
        // dies, and no channel can be dropped while the world is stopped
        visit(unsafe { &*(addr as *const RawChannel) });
    }
}

/// A typed channel handle. Clones share the same channel.
pub struct Chan<T> {
    raw: Arc<RawChannel>,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: Send> Chan<T> {
    /// Creates a channel of the given capacity (0 = unbuffered rendezvous).
    pub fn new(cap: usize) -> Chan<T> {
        unsafe fn drop_elem<T>(slot: *mut u8) {
            // Safety: slot holds a forgotten, initialized T
            unsafe { core::ptr::drop_in_place(slot.cast::<T>()) };
        }
        let hook = core::mem::needs_drop::<T>().then_some(drop_elem::<T> as unsafe fn(*mut u8));
        // Zero-sized elements are legal (signal channels); every copy below
        // degenerates to a no-op for them.
        Chan {
            raw: RawChannel::new(size_of::<T>(), cap, hook),
            _marker: PhantomData,
        }
    }

    /// Sends `value`, blocking until it is taken. See [`RawChannel::send`].
    pub fn send(&self, value: T) {
        let value = ManuallyDrop::new(value);
        self.raw.send(core::ptr::from_ref(&*value).cast::<u8>());
    }

    /// Receives the next value; `None` once the channel is closed and drained.
    pub fn recv(&self) -> Option<T> {
        let mut slot = MaybeUninit::<T>::uninit();
        if self.raw.recv(slot.as_mut_ptr().cast::<u8>()) {
            // Safety: the channel moved a full element into the slot
            Some(unsafe { slot.assume_init() })
        } else {
            None
        }
    }

    /// Non-blocking send; gives the value back if the channel is full.
    pub fn try_send(&self, value: T) -> Result<(), T> {
        let value = ManuallyDrop::new(value);
        if self.raw.try_send(core::ptr::from_ref(&*value).cast::<u8>()) {
            Ok(())
        } else {
            Err(ManuallyDrop::into_inner(value))
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut slot = MaybeUninit::<T>::uninit();
        self.raw.try_recv(slot.as_mut_ptr().cast::<u8>()).map(|()| {
            // Safety: Ok means the channel moved a full element into the slot
            unsafe { slot.assume_init() }
        })
    }

    /// Closes the channel. See [`RawChannel::close`].
    pub fn close(&self) {
        self.raw.close();
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    pub(crate) fn raw(&self) -> &RawChannel {
        &self.raw
    }
}

impl<T> Clone for Chan<T> {
    fn clone(&self) -> Self {
        Chan {
            raw: Arc::clone(&self.raw),
            _marker: PhantomData,
        }
    }
}

impl<T> core::fmt::Debug for Chan<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Chan")
            .field("cap", &self.raw.capacity())
            .field("len", &self.raw.len())
            .finish_non_exhaustive()
    }
}
