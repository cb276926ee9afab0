// The two eventfd roles of a virtqueue: the kick fd is written by the
// driver and read by the vhost worker, the call fd the other way round.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use tokio::io::unix::AsyncFd;
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use crate::error::{Error, Result};

pub struct KickEventFd {
    fd: EventFd,
}

impl KickEventFd {
    pub fn new() -> Result<KickEventFd> {
        let fd = EventFd::new(EFD_NONBLOCK).map_err(Error::EventFd)?;
        Ok(KickEventFd { fd })
    }

    pub fn signal(&self, n: u64) -> io::Result<()> {
        self.fd.write(n)
    }
}

impl From<EventFd> for KickEventFd {
    fn from(fd: EventFd) -> KickEventFd {
        KickEventFd { fd }
    }
}

impl AsRawFd for KickEventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

pub struct CallEventFd {
    fd: AsyncFd<EventFd>,
}

impl CallEventFd {
    // Must be called from within a runtime with I/O enabled.
    pub fn new() -> Result<CallEventFd> {
        let fd = EventFd::new(EFD_NONBLOCK).map_err(Error::EventFd)?;
        CallEventFd::from_eventfd(fd)
    }

    pub fn from_eventfd(fd: EventFd) -> Result<CallEventFd> {
        let fd = AsyncFd::new(fd).map_err(Error::EventFd)?;
        Ok(CallEventFd { fd })
    }

    pub async fn wait(&self) -> io::Result<u64> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read()) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsRawFd for CallEventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}
