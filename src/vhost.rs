// The /dev/vhost-net control channel. Request numbers and argument
// layouts are from linux/vhost.h.

use std::fs::{File, OpenOptions};
use std::os::fd::RawFd;
use std::os::raw::{c_int, c_uint};

use vmm_sys_util::ioctl::{ioctl, ioctl_with_ptr, ioctl_with_ref};

use crate::error::{Error, Result};

// Ring/transport feature bits, VirtIO 1.1 spec #6.
pub const VIRTIO_F_RING_INDIRECT_DESC: u64 = 1u64 << 28;
pub const VIRTIO_F_RING_EVENT_IDX: u64 = 1u64 << 29;

const VHOST: c_uint = 0xAF;

ioctl_iow_nr!(VHOST_SET_FEATURES, VHOST, 0x00, u64);
ioctl_io_nr!(VHOST_SET_OWNER, VHOST, 0x01);
ioctl_iow_nr!(VHOST_SET_MEM_TABLE, VHOST, 0x03, vhost_memory);
ioctl_iow_nr!(VHOST_SET_VRING_NUM, VHOST, 0x10, vhost_vring_state);
ioctl_iow_nr!(VHOST_SET_VRING_ADDR, VHOST, 0x11, vhost_vring_addr);
ioctl_iow_nr!(VHOST_SET_VRING_KICK, VHOST, 0x20, vhost_vring_file);
ioctl_iow_nr!(VHOST_SET_VRING_CALL, VHOST, 0x21, vhost_vring_file);
ioctl_iow_nr!(VHOST_NET_SET_BACKEND, VHOST, 0x30, vhost_vring_file);

#[allow(non_camel_case_types)]
#[repr(C)]
struct vhost_vring_state {
    index: c_uint,
    num: c_uint,
}

#[allow(non_camel_case_types)]
#[repr(C)]
struct vhost_vring_file {
    index: c_uint,
    fd: c_int,
}

#[allow(non_camel_case_types)]
#[repr(C)]
struct vhost_vring_addr {
    index: c_uint,
    flags: c_uint,
    desc_user_addr: u64,
    used_user_addr: u64,
    avail_user_addr: u64,
    log_guest_addr: u64,
}

#[allow(non_camel_case_types)]
#[repr(C)]
struct vhost_memory_region {
    guest_phys_addr: u64,
    memory_size: u64,
    userspace_addr: u64,
    flags_padding: u64,
}

// The kernel struct ends in a flexible array of regions; the ioctl
// number is computed over this header alone.
#[allow(non_camel_case_types)]
#[repr(C)]
struct vhost_memory {
    nregions: u32,
    padding: u32,
}

#[repr(C)]
struct VhostMemorySingleRegion {
    header: vhost_memory,
    region: vhost_memory_region,
}

pub struct VhostNet {
    fd: File,
}

impl VhostNet {
    pub fn open() -> Result<VhostNet> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vhost-net")
            .map_err(|source| Error::Open {
                path: "/dev/vhost-net",
                source,
            })?;
        Ok(VhostNet { fd })
    }

    fn check(op: &'static str, ret: c_int) -> Result<()> {
        if ret < 0 {
            Err(Error::Vhost {
                op,
                source: std::io::Error::last_os_error(),
            })
        } else {
            Ok(())
        }
    }

    pub fn set_owner(&self) -> Result<()> {
        let ret = unsafe { ioctl(&self.fd, VHOST_SET_OWNER()) };
        Self::check("SET_OWNER", ret)
    }

    pub fn set_features(&self, features: u64) -> Result<()> {
        let ret = unsafe { ioctl_with_ref(&self.fd, VHOST_SET_FEATURES(), &features) };
        Self::check("SET_FEATURES", ret)
    }

    /// Registers the whole process address space as one region with
    /// `gpa == uva`, the identity map `virt_to_phys` relies on.
    pub fn set_mem_table_identity(&self) -> Result<()> {
        let table = VhostMemorySingleRegion {
            header: vhost_memory {
                nregions: 1,
                padding: 0,
            },
            region: vhost_memory_region {
                guest_phys_addr: 0,
                memory_size: (1u64 << 47) - 4096,
                userspace_addr: 0,
                flags_padding: 0,
            },
        };
        let ret = unsafe {
            ioctl_with_ptr(
                &self.fd,
                VHOST_SET_MEM_TABLE(),
                &table as *const VhostMemorySingleRegion,
            )
        };
        Self::check("SET_MEM_TABLE", ret)
    }

    pub fn set_vring_num(&self, index: u32, num: u32) -> Result<()> {
        let state = vhost_vring_state { index, num };
        let ret = unsafe { ioctl_with_ref(&self.fd, VHOST_SET_VRING_NUM(), &state) };
        Self::check("SET_VRING_NUM", ret)
    }

    pub fn set_vring_addr(&self, index: u32, desc: u64, used: u64, avail: u64) -> Result<()> {
        let addr = vhost_vring_addr {
            index,
            flags: 0,
            desc_user_addr: desc,
            used_user_addr: used,
            avail_user_addr: avail,
            log_guest_addr: 0,
        };
        let ret = unsafe { ioctl_with_ref(&self.fd, VHOST_SET_VRING_ADDR(), &addr) };
        Self::check("SET_VRING_ADDR", ret)
    }

    pub fn set_vring_kick(&self, index: u32, fd: RawFd) -> Result<()> {
        let file = vhost_vring_file { index, fd };
        let ret = unsafe { ioctl_with_ref(&self.fd, VHOST_SET_VRING_KICK(), &file) };
        Self::check("SET_VRING_KICK", ret)
    }

    pub fn set_vring_call(&self, index: u32, fd: RawFd) -> Result<()> {
        let file = vhost_vring_file { index, fd };
        let ret = unsafe { ioctl_with_ref(&self.fd, VHOST_SET_VRING_CALL(), &file) };
        Self::check("SET_VRING_CALL", ret)
    }

    pub fn net_set_backend(&self, index: u32, fd: RawFd) -> Result<()> {
        let file = vhost_vring_file { index, fd };
        let ret = unsafe { ioctl_with_ref(&self.fd, VHOST_NET_SET_BACKEND(), &file) };
        Self::check("NET_SET_BACKEND", ret)
    }
}
