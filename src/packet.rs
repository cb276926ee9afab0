// A move-only packet: an ordered sequence of byte fragments plus the
// storage backing them and an optional hook run on drop. The driver
// publishes fragment addresses into the rings, so a packet must stay
// alive while a chain referencing it is in flight.

#[derive(Clone, Copy, Debug)]
pub struct Fragment {
    pub base: *mut u8,
    pub size: usize,
}

pub struct Packet {
    frags: Vec<Fragment>,
    storage: Vec<Box<[u8]>>,
    on_free: Option<Box<dyn FnOnce()>>,
}

impl Packet {
    pub fn from_vec(data: Vec<u8>) -> Packet {
        let mut packet = Packet {
            frags: Vec::new(),
            storage: Vec::new(),
            on_free: None,
        };
        packet.append(&data);
        packet
    }

    /// The caller must guarantee `base..base+size` stays valid until the
    /// packet is dropped; `on_free` releases the underlying storage.
    pub unsafe fn from_raw(base: *mut u8, size: usize, on_free: impl FnOnce() + 'static) -> Packet {
        Packet {
            frags: vec![Fragment { base, size }],
            storage: Vec::new(),
            on_free: Some(Box::new(on_free)),
        }
    }

    pub fn with_deleter(mut self, hook: impl FnOnce() + 'static) -> Packet {
        self.on_free = match self.on_free.take() {
            None => Some(Box::new(hook)),
            Some(prev) => Some(Box::new(move || {
                prev();
                hook();
            })),
        };
        self
    }

    pub fn prepend(&mut self, bytes: &[u8]) {
        let mut owned: Box<[u8]> = bytes.to_vec().into_boxed_slice();
        self.frags.insert(
            0,
            Fragment {
                base: owned.as_mut_ptr(),
                size: owned.len(),
            },
        );
        self.storage.push(owned);
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let mut owned: Box<[u8]> = bytes.to_vec().into_boxed_slice();
        self.frags.push(Fragment {
            base: owned.as_mut_ptr(),
            size: owned.len(),
        });
        self.storage.push(owned);
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.frags
    }

    pub fn len(&self) -> usize {
        self.frags.iter().map(|f| f.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for f in &self.frags {
            out.extend_from_slice(unsafe { std::slice::from_raw_parts(f.base, f.size) });
        }
        out
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(hook) = self.on_free.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("fragments", &self.frags.len())
            .field("len", &self.len())
            .finish()
    }
}
