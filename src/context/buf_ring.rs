use crate::context;
use crate::context::ring::Ring;
use anyhow::{anyhow, ensure, Context, Result};
use io_uring::types::BufRingEntry;
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;

/// The single buffer group every recv in this worker selects from. Published
/// once per worker at registration time.
pub(crate) const BUFFER_GROUP_ID: u16 = 0;

const CACHE_LINE_SIZE: usize = 64;

fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Per-worker pool of fixed-size receive buffers shared with the kernel.
///
/// The control ring is the kernel-visible list of offered buffers; the borrow
/// bitmap tracks which buffers handler code currently holds. A buffer is in
/// exactly one of {kernel-offered, borrowed} after registration. Returning a
/// borrow re-publishes the buffer at the ring tail.
pub(crate) struct BufRing {
    // Control ring, shared with the kernel.
    ring_ptr: NonNull<BufRingEntry>,
    ring_layout: Layout,
    tail: NonNull<AtomicU16>,

    // Backing buffer memory, user space only.
    pool_ptr: NonNull<u8>,
    pool_layout: Layout,

    buf_size: usize,
    entries: u16,
    mask: u16,

    // Borrow bitmap, one bit per buffer id.
    borrowed: Vec<u64>,
    borrowed_count: usize,

    registered: bool,
}

impl BufRing {
    /// Allocates ring metadata and buffer memory. The ring is not visible to
    /// the kernel until [`BufRing::register`] runs.
    pub(crate) fn try_new(entries: u16, buf_size: usize) -> Result<Self> {
        // The ring mask arithmetic requires a power-of-two capacity.
        ensure!(
            entries > 0 && entries.is_power_of_two(),
            "buffer ring capacity must be a non-zero power of two, got {}",
            entries
        );
        ensure!(buf_size > 0, "buffer size must be non-zero");

        let ring_layout = Layout::from_size_align(
            std::mem::size_of::<BufRingEntry>() * entries as usize,
            page_size(),
        )?;
        let ring_ptr = NonNull::new(unsafe { alloc_zeroed(ring_layout).cast() })
            .ok_or_else(|| anyhow!("OOM: failed to allocate buffer control ring"))?;

        let tail = unsafe {
            let tail_ptr = BufRingEntry::tail(ring_ptr.as_ptr());
            NonNull::new_unchecked(tail_ptr as *mut AtomicU16)
        };

        let pool_layout = Layout::from_size_align(buf_size * entries as usize, CACHE_LINE_SIZE)?;
        let pool_ptr = NonNull::new(unsafe { alloc(pool_layout) })
            .ok_or_else(|| anyhow!("OOM: failed to allocate buffer pool"))?;

        Ok(Self {
            ring_ptr,
            ring_layout,
            tail,
            pool_ptr,
            pool_layout,
            buf_size,
            entries,
            mask: entries - 1,
            borrowed: vec![0; (entries as usize).div_ceil(64)],
            borrowed_count: 0,
            registered: false,
        })
    }

    /// Registers the control ring under [`BUFFER_GROUP_ID`] and publishes
    /// every buffer to the kernel. Must run exactly once per worker, before
    /// the first buffer-select recv.
    pub(crate) fn register(&mut self, ring: &Ring) -> Result<()> {
        ensure!(!self.registered, "buffer ring registered twice");

        unsafe {
            ring.submitter()
                .register_buf_ring(
                    self.ring_ptr.as_ptr() as u64,
                    self.entries,
                    BUFFER_GROUP_ID,
                )
                .context("registering buffer ring with the kernel")?;
        }

        for bid in 0..self.entries {
            self.write_entry(bid, bid);
        }
        self.advance(self.entries);

        self.registered = true;
        Ok(())
    }

    pub(crate) fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub(crate) fn entries(&self) -> u16 {
        self.entries
    }

    /// Number of buffers currently held by handler code.
    pub(crate) fn borrowed_count(&self) -> usize {
        self.borrowed_count
    }

    /// Marks buffer `bid` borrowed and returns a length-limited view of it.
    ///
    /// The caller must have received `bid` from a buffer-select recv
    /// completion. Borrowing an id twice is a programming error and panics:
    /// it means a completion was delivered for a buffer the kernel no longer
    /// owned.
    pub(crate) fn borrow(&mut self, bid: u16, len: usize) -> BorrowedBuf {
        assert!(bid < self.entries, "kernel selected invalid buffer id {}", bid);
        assert!(
            len <= self.buf_size,
            "kernel reported {} bytes for a {} byte buffer",
            len,
            self.buf_size
        );

        let (word, bit) = (bid as usize / 64, 1u64 << (bid % 64));
        assert!(
            self.borrowed[word] & bit == 0,
            "buffer {} is already borrowed",
            bid
        );
        self.borrowed[word] |= bit;
        self.borrowed_count += 1;

        let ptr = unsafe {
            NonNull::new_unchecked(self.pool_ptr.as_ptr().add(bid as usize * self.buf_size))
        };

        BorrowedBuf {
            ptr,
            bid,
            len,
            _not_send: PhantomData,
        }
    }

    /// Clears the borrow bit and re-publishes the buffer to the kernel.
    pub(crate) fn recycle(&mut self, bid: u16) {
        let (word, bit) = (bid as usize / 64, 1u64 << (bid % 64));
        debug_assert!(self.borrowed[word] & bit != 0, "recycling unborrowed buffer");
        self.borrowed[word] &= !bit;
        self.borrowed_count -= 1;

        self.write_entry(bid, self.tail());
        self.advance(1);
    }

    pub(crate) fn tail(&self) -> u16 {
        // We own the writer side; Relaxed is enough for our own reads.
        unsafe { self.tail.as_ref().load(Ordering::Relaxed) }
    }

    fn write_entry(&mut self, bid: u16, tail_offset: u16) {
        let idx = (tail_offset & self.mask) as usize;

        unsafe {
            let buf_ptr = self.pool_ptr.as_ptr().add(bid as usize * self.buf_size);
            let entry = self.ring_ptr.as_ptr().add(idx);

            (*entry).set_addr(buf_ptr as u64);
            (*entry).set_len(self.buf_size as u32);
            (*entry).set_bid(bid);
        }
    }

    fn advance(&self, count: u16) {
        unsafe {
            self.tail.as_ref().fetch_add(count, Ordering::Release);
        }
    }
}

impl Drop for BufRing {
    fn drop(&mut self) {
        // No explicit unregister: the buffer ring lives exactly as long as
        // the worker's io_uring instance, and closing the ring fd releases
        // every registration with it.
        unsafe {
            dealloc(self.ring_ptr.as_ptr().cast(), self.ring_layout);
            dealloc(self.pool_ptr.as_ptr().cast(), self.pool_layout);
        }
    }
}

/// RAII view of a kernel-selected receive buffer.
///
/// Holds the borrow until dropped, then re-publishes the buffer through the
/// worker context, so every handler path, including error paths, returns its
/// buffer. Contents beyond `len` are stale bytes from earlier requests and
/// are never exposed.
pub(crate) struct BorrowedBuf {
    ptr: NonNull<u8>,
    bid: u16,
    len: usize,

    // The view points into thread-local pool memory.
    _not_send: PhantomData<*const ()>,
}

impl BorrowedBuf {
    pub(crate) fn bid(&self) -> u16 {
        self.bid
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Deref for BorrowedBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl Drop for BorrowedBuf {
    fn drop(&mut self) {
        // `try_`: tolerate guards dropped during thread teardown.
        context::try_with_buffers_mut(|buffers| buffers.recycle(self.bid));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0)]
    #[case::three(3)]
    #[case::not_pow2(100)]
    fn test_rejects_invalid_capacity(#[case] entries: u16) {
        assert!(BufRing::try_new(entries, 1024).is_err());
    }

    #[test]
    fn test_register_publishes_all_buffers() {
        let _rt = init_test_runtime();

        crate::context::with_buffers_mut(|buffers| {
            assert_eq!(buffers.tail(), buffers.entries());
            assert_eq!(buffers.borrowed_count(), 0);
        });
    }

    #[test]
    fn test_borrow_and_recycle_cycle() {
        let _rt = init_test_runtime();

        let entries = crate::context::with_buffers_mut(|buffers| buffers.entries());

        let buf = crate::context::with_buffers_mut(|buffers| {
            let buf = buffers.borrow(3, 100);
            assert_eq!(buffers.borrowed_count(), 1);
            buf
        });

        assert_eq!(buf.bid(), 3);
        assert_eq!(buf.len(), 100);

        // Guard drop republishes to the kernel ring.
        drop(buf);

        crate::context::with_buffers_mut(|buffers| {
            assert_eq!(buffers.borrowed_count(), 0);
            assert_eq!(buffers.tail(), entries + 1);
        });
    }

    #[test]
    #[should_panic(expected = "already borrowed")]
    fn test_double_borrow_is_fatal() {
        let _rt = init_test_runtime();

        let _first = crate::context::with_buffers_mut(|buffers| buffers.borrow(0, 10));
        let _second = crate::context::with_buffers_mut(|buffers| buffers.borrow(0, 10));
    }

    #[test]
    #[should_panic(expected = "invalid buffer id")]
    fn test_out_of_range_bid_is_fatal() {
        let _rt = init_test_runtime();

        let entries = crate::context::with_buffers_mut(|buffers| buffers.entries());
        let _buf = crate::context::with_buffers_mut(move |buffers| buffers.borrow(entries, 10));
    }
}
