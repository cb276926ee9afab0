//! Split virtqueue.
//!
//! Note: the virtio spec explicitly allows the device to use chains in
//! any order, so used ids can arrive out of submission order. Completion
//! promises therefore fire in used-ring order; callers that care about
//! ordering must attach it to the completion, not to submission time.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU16, Ordering};

use bitflags::bitflags;
use tokio::sync::{oneshot, Semaphore};

use crate::error::{Error, Result};
use crate::eventfd::{CallEventFd, KickEventFd};
use crate::{align_up, le16, le32, le64};

// Descriptor flag bits, VirtIO 1.1 spec #2.6.5.
bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        const NEXT = 1;
        const WRITE = 2;
        const INDIRECT = 4;
    }
}

// Both flags are advisory.
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;
pub const VRING_USED_F_NO_NOTIFY: u16 = 1;

#[repr(C)]
struct VirtqDesc {
    addr: le64,
    len: le32,
    flags: le16,
    next: le16,
}

const _: () = assert!(core::mem::size_of::<VirtqDesc>() == 16);

#[repr(C)]
#[derive(Clone, Copy)]
struct VirtqUsedElem {
    id: le32,
    len: le32,
}

const _: () = assert!(core::mem::size_of::<VirtqUsedElem>() == 8);

// Segment offsets of one virtqueue, per VirtIO 1.1 spec #2.6.
#[derive(Clone, Copy, Debug)]
pub struct VringLayout {
    pub size: u16,
    pub avail_offset: usize,
    pub used_offset: usize,
    pub bytes: usize,
}

impl VringLayout {
    pub fn for_size(size: u16) -> VringLayout {
        let n = size as usize;
        let avail_offset = 16 * n;
        let used_offset = align_up((avail_offset + 2 * n + 6) as u64, 4096) as usize;
        VringLayout {
            size,
            avail_offset,
            used_offset,
            bytes: used_offset + 8 * n + 6,
        }
    }
}

/// The pointers must stay valid for as long as the queue and the host
/// may touch them.
#[derive(Clone, Copy)]
pub struct VringConfig {
    pub descs: *mut u8,
    pub avail: *mut u8,
    pub used: *mut u8,
    pub size: u16,
    pub event_index: bool,
    pub indirect: bool,
    pub mergeable_buffers: bool,
}

pub struct VringStorage {
    mem: *mut u8,
    alloc: std::alloc::Layout,
    layout: VringLayout,
}

impl VringStorage {
    pub fn new(size: u16) -> Result<VringStorage> {
        if size == 0 || !size.is_power_of_two() || size > (1 << 15) {
            log::error!("bad virtqueue size: 0x{:x}", size);
            return Err(Error::RingSize(size));
        }

        let layout = VringLayout::for_size(size);
        let alloc = std::alloc::Layout::from_size_align(layout.bytes, 4096)
            .expect("vring allocation layout");
        let mem = unsafe { std::alloc::alloc_zeroed(alloc) };
        assert!(!mem.is_null(), "vring allocation failed");

        Ok(VringStorage { mem, alloc, layout })
    }

    pub fn layout(&self) -> VringLayout {
        self.layout
    }

    pub fn desc_addr(&self) -> u64 {
        self.mem as usize as u64
    }

    pub fn avail_addr(&self) -> u64 {
        self.desc_addr() + self.layout.avail_offset as u64
    }

    pub fn used_addr(&self) -> u64 {
        self.desc_addr() + self.layout.used_offset as u64
    }

    pub fn config(
        &self,
        event_index: bool,
        indirect: bool,
        mergeable_buffers: bool,
    ) -> VringConfig {
        VringConfig {
            descs: self.mem,
            avail: self.avail_addr() as *mut u8,
            used: self.used_addr() as *mut u8,
            size: self.layout.size,
            event_index,
            indirect,
            mergeable_buffers,
        }
    }
}

impl Drop for VringStorage {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.mem, self.alloc) };
    }
}

/// `completed` fires with the number of bytes the host wrote. Only the
/// first buffer's promise survives publication; the host identifies a
/// used chain by its head alone.
pub struct Buffer {
    pub addr: u64,
    pub len: u32,
    pub writeable: bool,
    pub indirect: bool,
    pub completed: oneshot::Sender<u32>,
}

// Host-writable buffers must follow host-readable ones.
pub type BufferChain = Vec<Buffer>;

pub type ProducerFuture = Pin<Box<dyn Future<Output = Vec<BufferChain>>>>;

/// The producer must consume permits from the free-descriptor semaphore
/// (one per buffer) before returning the chains that use them.
pub type Producer = Box<dyn FnMut(Rc<Semaphore>) -> ProducerFuture>;

// Updated by the driver.
struct AvailRing {
    shared: *mut u8,
    mask: u16,
    head: u16,
}

impl AvailRing {
    fn flags(&self) -> &AtomicU16 {
        unsafe { AtomicU16::from_ptr(self.shared as *mut u16) }
    }

    fn idx(&self) -> &AtomicU16 {
        unsafe { AtomicU16::from_ptr(self.shared.add(2) as *mut u16) }
    }

    fn ring_slot(&self, idx: u16) -> *mut le16 {
        unsafe { (self.shared.add(4) as *mut le16).add((idx & self.mask) as usize) }
    }
}

// Updated by the host.
struct UsedRing {
    shared: *mut u8,
    mask: u16,
    tail: u16,
}

impl UsedRing {
    fn flags(&self) -> &AtomicU16 {
        unsafe { AtomicU16::from_ptr(self.shared as *mut u16) }
    }

    fn idx(&self) -> &AtomicU16 {
        unsafe { AtomicU16::from_ptr(self.shared.add(2) as *mut u16) }
    }

    fn read_elem(&self, idx: u16) -> VirtqUsedElem {
        unsafe {
            (self.shared.add(4) as *const VirtqUsedElem)
                .add((idx & self.mask) as usize)
                .read_volatile()
        }
    }
}

struct VringShared {
    descs: *mut VirtqDesc,
    avail: AvailRing,
    used: UsedRing,
    size: u16,
    // One slot per descriptor; only chain-head slots are ever occupied.
    completions: Vec<Option<oneshot::Sender<u32>>>,
    free_head: Option<u16>,
    available: Rc<Semaphore>,
}

impl VringShared {
    fn desc(&self, idx: u16) -> &VirtqDesc {
        debug_assert!(idx < self.size);
        unsafe { &*self.descs.add(idx as usize) }
    }

    fn desc_mut(&mut self, idx: u16) -> &mut VirtqDesc {
        debug_assert!(idx < self.size);
        unsafe { &mut *self.descs.add(idx as usize) }
    }

    // Callers must have consumed one free-descriptor permit.
    fn allocate_desc(&mut self) -> u16 {
        let idx = self.free_head.expect("descriptor free list empty");
        self.free_head = if self.desc(idx).next == idx {
            None
        } else {
            Some(self.desc(idx).next)
        };
        idx
    }

    fn free_desc(&mut self, idx: u16) {
        debug_assert!(self.completions[idx as usize].is_none());
        // An empty list is encoded as a self-link.
        self.desc_mut(idx).next = match self.free_head {
            Some(head) => head,
            None => idx,
        };
        self.free_head = Some(idx);
        self.available.add_permits(1);
    }

    // Chains are linked in reverse so that each `next` field points at
    // an already-written descriptor.
    fn publish_chain(&mut self, chain: BufferChain) -> u16 {
        assert!(!chain.is_empty());

        let mut has_next = false;
        let mut next_idx: u16 = 0;
        for (pos, buf) in chain.into_iter().enumerate().rev() {
            let idx = self.allocate_desc();

            let mut flags = DescFlags::empty();
            if buf.writeable {
                flags |= DescFlags::WRITE;
            }
            if buf.indirect {
                flags |= DescFlags::INDIRECT;
            }
            if has_next {
                flags |= DescFlags::NEXT;
            }

            let desc = self.desc_mut(idx);
            desc.addr = buf.addr;
            desc.len = buf.len;
            desc.flags = flags.bits();
            desc.next = next_idx;

            if pos == 0 {
                self.completions[idx as usize] = Some(buf.completed);
            }
            // Non-head promises are dropped here: the host identifies a
            // used chain by its head alone.

            has_next = true;
            next_idx = idx;
        }

        let head = next_idx;
        unsafe { self.avail.ring_slot(self.avail.head).write_volatile(head) };
        self.avail.head = self.avail.head.wrapping_add(1);
        head
    }

    fn flush_avail(&self) {
        self.avail.idx().store(self.avail.head, Ordering::Release);
    }

    fn notifications_disabled(&self) -> bool {
        (self.used.flags().load(Ordering::Relaxed) & VRING_USED_F_NO_NOTIFY) != 0
    }

    fn reap(&mut self) -> usize {
        let used_head = self.used.idx().load(Ordering::Acquire);
        let mut reaped = 0;

        while self.used.tail != used_head {
            let elem = self.used.read_elem(self.used.tail);
            self.used.tail = self.used.tail.wrapping_add(1);

            assert!(
                elem.id < self.size as u32,
                "used entry id {} out of range",
                elem.id
            );
            let head = elem.id as u16;
            let completed = self.completions[head as usize]
                .take()
                .expect("used entry for a chain the host does not own");

            // Read each link before free_desc rewrites it.
            let mut capacity: u64 = 0;
            let mut idx = head;
            loop {
                let desc = self.desc(idx);
                let next = desc.next;
                let flags = DescFlags::from_bits_truncate(desc.flags);
                capacity += desc.len as u64;
                self.free_desc(idx);
                if !flags.contains(DescFlags::NEXT) {
                    break;
                }
                idx = next;
            }

            assert!(
                elem.len as u64 <= capacity,
                "host wrote {} bytes into a {}-byte chain",
                elem.len,
                capacity
            );

            let _ = completed.send(elem.len);
            reaped += 1;
        }

        reaped
    }
}

pub struct Virtqueue {
    shared: Rc<RefCell<VringShared>>,
    available: Rc<Semaphore>,
    call: CallEventFd,
    kick: KickEventFd,
    producer: Producer,
}

impl Virtqueue {
    pub fn new(
        config: VringConfig,
        call: CallEventFd,
        kick: KickEventFd,
        producer: Producer,
    ) -> Result<Virtqueue> {
        if config.size == 0 || !config.size.is_power_of_two() || config.size > (1 << 15) {
            log::error!("bad virtqueue size: 0x{:x}", config.size);
            return Err(Error::RingSize(config.size));
        }

        let available = Rc::new(Semaphore::new(0));
        let mut shared = VringShared {
            descs: config.descs as *mut VirtqDesc,
            avail: AvailRing {
                shared: config.avail,
                mask: config.size - 1,
                head: 0,
            },
            used: UsedRing {
                shared: config.used,
                mask: config.size - 1,
                tail: 0,
            },
            size: config.size,
            completions: (0..config.size).map(|_| None).collect(),
            free_head: None,
            available: available.clone(),
        };

        for idx in 0..config.size {
            shared.free_desc(idx);
        }

        Ok(Virtqueue {
            shared: Rc::new(RefCell::new(shared)),
            available,
            call,
            kick,
            producer,
        })
    }

    pub fn size(&self) -> u16 {
        self.shared.borrow().size
    }

    // One permit per free descriptor.
    pub fn available(&self) -> Rc<Semaphore> {
        self.available.clone()
    }

    pub fn disable_interrupts(&self) {
        let shared = self.shared.borrow();
        let flags = shared.avail.flags();
        flags.store(
            flags.load(Ordering::Relaxed) | VRING_AVAIL_F_NO_INTERRUPT,
            Ordering::Relaxed,
        );
    }

    pub fn enable_interrupts(&self) {
        let shared = self.shared.borrow();
        let flags = shared.avail.flags();
        flags.store(
            flags.load(Ordering::Relaxed) & !VRING_AVAIL_F_NO_INTERRUPT,
            Ordering::Relaxed,
        );
    }

    #[cfg(test)]
    pub(crate) fn free_list_len(&self) -> usize {
        let shared = self.shared.borrow();
        let mut count = 0;
        let mut cursor = shared.free_head;
        while let Some(idx) = cursor {
            count += 1;
            let next = shared.desc(idx).next;
            cursor = if next == idx { None } else { Some(next) };
        }
        count
    }

    // Start the submit and reap loops; they run until the executor is
    // dropped.
    pub fn run(self) {
        let Virtqueue {
            shared,
            available,
            call,
            kick,
            mut producer,
        } = self;

        let submit_shared = shared.clone();
        tokio::task::spawn_local(async move {
            loop {
                let chains = producer(available.clone()).await;
                if chains.is_empty() {
                    continue;
                }

                let notify = {
                    let mut vq = submit_shared.borrow_mut();
                    for chain in chains {
                        vq.publish_chain(chain);
                    }
                    vq.flush_avail();
                    !vq.notifications_disabled()
                };
                if notify {
                    kick.signal(1).expect("kick eventfd write failed");
                }
            }
        });

        tokio::task::spawn_local(async move {
            loop {
                shared.borrow_mut().reap();
                call.wait().await.expect("call eventfd read failed");
            }
        });
    }
}
