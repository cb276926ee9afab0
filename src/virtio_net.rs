// Virtio-net on top of the split virtqueues.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use tokio::sync::{oneshot, Semaphore};
use zerocopy::{FromZeros, Immutable, IntoBytes};

use crate::error::Result;
use crate::eventfd::{CallEventFd, KickEventFd};
use crate::packet::Packet;
use crate::vhost::{VhostNet, VIRTIO_F_RING_INDIRECT_DESC};
use crate::virtio_queue::{Buffer, BufferChain, Producer, Virtqueue, VringConfig, VringStorage};
use crate::{le16, tap, virt_to_phys};

pub const VIRTIO_NET_HDR_LEN: usize = 10;
pub const VIRTIO_NET_HDR_MRG_LEN: usize = 12;

pub const VIRTIO_NET_HDR_GSO_NONE: u8 = 0;
pub const VIRTIO_NET_HDR_GSO_TCPV4: u8 = 1;
pub const VIRTIO_NET_HDR_GSO_UDP: u8 = 3;
pub const VIRTIO_NET_HDR_GSO_TCPV6: u8 = 4;
pub const VIRTIO_NET_HDR_GSO_ECN: u8 = 0x80;

// VirtIO 1.1 spec #5.1.6. `num_buffers` is on the wire only when merged
// RX buffers are negotiated; Linux requires the header to be sane even
// with GSO off, which all-zeroes is.
#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone, FromZeros, IntoBytes, Immutable)]
struct VirtioNetHdr {
    flags: u8,
    gso_type: u8,
    hdr_len: le16,
    gso_size: le16,
    csum_start: le16,
    csum_offset: le16,
    num_buffers: le16,
}

const _: () = assert!(core::mem::size_of::<VirtioNetHdr>() == VIRTIO_NET_HDR_MRG_LEN);

const RX_BUF_LEN: usize = 4096;

// `post` stays pending while the FIFO is at its high-water mark.
pub struct TxFifo {
    packets: RefCell<VecDeque<Packet>>,
    len: Semaphore,
    space: Semaphore,
}

impl TxFifo {
    fn new(depth: usize) -> TxFifo {
        TxFifo {
            packets: RefCell::new(VecDeque::new()),
            len: Semaphore::new(0),
            space: Semaphore::new(depth),
        }
    }

    pub async fn post(&self, packet: Packet) {
        self.space
            .acquire()
            .await
            .expect("tx space semaphore closed")
            .forget();
        self.packets.borrow_mut().push_back(packet);
        self.len.add_permits(1);
    }
}

pub struct RxFifo {
    packets: RefCell<VecDeque<Packet>>,
    len: Semaphore,
}

impl RxFifo {
    fn new() -> RxFifo {
        RxFifo {
            packets: RefCell::new(VecDeque::new()),
            len: Semaphore::new(0),
        }
    }

    fn enqueue(&self, packet: Packet) {
        self.packets.borrow_mut().push_back(packet);
        self.len.add_permits(1);
    }

    pub async fn receive(&self) -> Packet {
        self.len
            .acquire()
            .await
            .expect("rx length semaphore closed")
            .forget();
        self.packets
            .borrow_mut()
            .pop_front()
            .expect("rx length semaphore out of sync")
    }
}

pub struct TxQueue {
    ring: Virtqueue,
    fifo: Rc<TxFifo>,
}

impl TxQueue {
    pub fn new(
        config: VringConfig,
        call: CallEventFd,
        kick: KickEventFd,
        header_len: usize,
        depth: usize,
    ) -> Result<TxQueue> {
        let fifo = Rc::new(TxFifo::new(depth));
        let ring = Virtqueue::new(config, call, kick, Self::producer(fifo.clone(), header_len))?;
        Ok(TxQueue { ring, fifo })
    }

    pub fn fifo(&self) -> Rc<TxFifo> {
        self.fifo.clone()
    }

    pub fn run(self) {
        self.ring.run();
    }

    #[cfg(test)]
    pub(crate) fn ring(&self) -> &Virtqueue {
        &self.ring
    }

    fn producer(fifo: Rc<TxFifo>, header_len: usize) -> Producer {
        Box::new(move |available: Rc<Semaphore>| {
            let fifo = fifo.clone();
            Box::pin(async move {
                fifo.len
                    .acquire()
                    .await
                    .expect("tx length semaphore closed")
                    .forget();
                let mut packet = fifo
                    .packets
                    .borrow_mut()
                    .pop_front()
                    .expect("tx length semaphore out of sync");
                fifo.space.add_permits(1);

                let header = VirtioNetHdr::new_zeroed();
                packet.prepend(&header.as_bytes()[..header_len]);

                let nbufs = packet.fragments().len();
                available
                    .acquire_many(nbufs as u32)
                    .await
                    .expect("descriptor semaphore closed")
                    .forget();

                let mut chain: BufferChain = Vec::with_capacity(nbufs);
                let mut head_completed = None;
                for (pos, frag) in packet.fragments().iter().enumerate() {
                    let (tx, rx) = oneshot::channel();
                    if pos == 0 {
                        head_completed = Some(rx);
                    }
                    chain.push(Buffer {
                        addr: virt_to_phys(frag.base),
                        len: frag.size as u32,
                        writeable: false,
                        indirect: false,
                        completed: tx,
                    });
                }

                // The continuation owns the packet, so its storage stays
                // valid until the host has consumed the chain.
                let head_completed = head_completed.expect("empty packet");
                tokio::task::spawn_local(async move {
                    let _ = head_completed.await;
                    drop(packet);
                });

                vec![chain]
            })
        })
    }
}

pub struct RxQueue {
    ring: Virtqueue,
    fifo: Rc<RxFifo>,
}

impl RxQueue {
    pub fn new(
        config: VringConfig,
        call: CallEventFd,
        kick: KickEventFd,
        header_len: usize,
    ) -> Result<RxQueue> {
        let fifo = Rc::new(RxFifo::new());
        let ring = Virtqueue::new(config, call, kick, Self::producer(fifo.clone(), header_len))?;
        Ok(RxQueue { ring, fifo })
    }

    pub fn fifo(&self) -> Rc<RxFifo> {
        self.fifo.clone()
    }

    pub fn run(self) {
        self.ring.run();
    }

    #[cfg(test)]
    pub(crate) fn ring(&self) -> &Virtqueue {
        &self.ring
    }

    fn producer(fifo: Rc<RxFifo>, header_len: usize) -> Producer {
        Box::new(move |available: Rc<Semaphore>| {
            let fifo = fifo.clone();
            Box::pin(async move {
                available
                    .acquire()
                    .await
                    .expect("descriptor semaphore closed")
                    .forget();
                // Take whatever else is free right now and batch it.
                let mut count = 1;
                let opportunistic = available.available_permits();
                if opportunistic > 0 {
                    if let Ok(permits) = available.try_acquire_many(opportunistic as u32) {
                        permits.forget();
                        count += opportunistic;
                    }
                }

                let mut batch = Vec::with_capacity(count);
                for _ in 0..count {
                    let storage = vec![0u8; RX_BUF_LEN].into_boxed_slice();
                    let base = Box::into_raw(storage) as *mut u8;
                    let (tx, rx) = oneshot::channel();

                    let fifo = fifo.clone();
                    tokio::task::spawn_local(async move {
                        let free_storage = move || unsafe {
                            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                                base, RX_BUF_LEN,
                            )));
                        };
                        match rx.await {
                            Ok(len) => {
                                let len = len as usize;
                                assert!(
                                    (header_len..=RX_BUF_LEN).contains(&len),
                                    "host reported bad rx length {}",
                                    len
                                );
                                let packet = unsafe {
                                    Packet::from_raw(
                                        base.add(header_len),
                                        len - header_len,
                                        free_storage,
                                    )
                                };
                                fifo.enqueue(packet);
                            }
                            // The ring is gone; just release the buffer.
                            Err(_) => free_storage(),
                        }
                    });

                    batch.push(vec![Buffer {
                        addr: virt_to_phys(base),
                        len: RX_BUF_LEN as u32,
                        writeable: true,
                        indirect: false,
                        completed: tx,
                    }]);
                }

                batch
            })
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> MacAddress {
        MacAddress(octets)
    }

    pub fn raw(&self) -> [u8; 6] {
        self.0
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl std::fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

impl std::str::FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes: Vec<&str> = s.split(':').collect();
        if bytes.len() != 6 {
            return Err(format!("failed to parse MAC: {}", s));
        }

        let mut mac = [0_u8; 6];
        for (idx, part) in bytes.iter().enumerate() {
            mac[idx] =
                u8::from_str_radix(part, 16).map_err(|_| format!("failed to parse MAC: {}", s))?;
        }
        Ok(MacAddress(mac))
    }
}

#[derive(Clone, Debug)]
pub struct NetConfig {
    pub tap_name: String,
    pub ring_size: u16,
    // High-water mark of the outgoing packet FIFO.
    pub tx_queue_depth: usize,
    pub mergeable_buffers: bool,
}

impl Default for NetConfig {
    fn default() -> NetConfig {
        NetConfig {
            tap_name: "tap0".to_owned(),
            ring_size: 256,
            tx_queue_depth: 256,
            mergeable_buffers: false,
        }
    }
}

pub struct NetDev {
    header_len: usize,
    tx: Rc<TxFifo>,
    rx: Rc<RxFifo>,
    _tap: File,
    _vhost: VhostNet,
    _txq_storage: VringStorage,
    _rxq_storage: VringStorage,
}

impl NetDev {
    const VRING_RX: u32 = 0;
    const VRING_TX: u32 = 1;

    // Must run inside a current-thread runtime with I/O enabled; the
    // queue loops are spawned locally.
    pub fn new(config: &NetConfig) -> Result<NetDev> {
        let header_len = if config.mergeable_buffers {
            VIRTIO_NET_HDR_MRG_LEN
        } else {
            VIRTIO_NET_HDR_LEN
        };

        let tap = tap::open(&config.tap_name)?;
        let vhost = VhostNet::open()?;

        let txq_storage = VringStorage::new(config.ring_size)?;
        let rxq_storage = VringStorage::new(config.ring_size)?;

        let txq_kick = KickEventFd::new()?;
        let txq_call = CallEventFd::new()?;
        let rxq_kick = KickEventFd::new()?;
        let rxq_call = CallEventFd::new()?;

        vhost.set_owner()?;
        vhost.set_mem_table_identity()?;
        vhost.set_features(VIRTIO_F_RING_INDIRECT_DESC)?;

        for (index, storage, kick, call) in [
            (Self::VRING_RX, &rxq_storage, &rxq_kick, &rxq_call),
            (Self::VRING_TX, &txq_storage, &txq_kick, &txq_call),
        ] {
            vhost.set_vring_num(index, config.ring_size as u32)?;
            vhost.set_vring_addr(
                index,
                storage.desc_addr(),
                storage.used_addr(),
                storage.avail_addr(),
            )?;
            vhost.set_vring_kick(index, kick.as_raw_fd())?;
            vhost.set_vring_call(index, call.as_raw_fd())?;
        }
        vhost.net_set_backend(Self::VRING_RX, tap.as_raw_fd())?;
        vhost.net_set_backend(Self::VRING_TX, tap.as_raw_fd())?;

        let txq = TxQueue::new(
            txq_storage.config(false, false, false),
            txq_call,
            txq_kick,
            header_len,
            config.tx_queue_depth,
        )?;
        let rxq = RxQueue::new(
            rxq_storage.config(false, false, config.mergeable_buffers),
            rxq_call,
            rxq_kick,
            header_len,
        )?;

        let tx = txq.fifo();
        let rx = rxq.fifo();
        txq.run();
        rxq.run();

        log::debug!(
            "virtio-net device up on tap {:?}, ring size {}",
            config.tap_name,
            config.ring_size
        );

        Ok(NetDev {
            header_len,
            tx,
            rx,
            _tap: tap,
            _vhost: vhost,
            _txq_storage: txq_storage,
            _rxq_storage: rxq_storage,
        })
    }

    pub async fn send(&self, packet: Packet) {
        self.tx.post(packet).await;
    }

    // Delivered packets arrive with the header already stripped.
    pub async fn receive(&self) -> Packet {
        self.rx.receive().await
    }

    pub fn hw_address(&self) -> MacAddress {
        MacAddress([0x12, 0x23, 0x34, 0x56, 0x67, 0x78])
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }
}
