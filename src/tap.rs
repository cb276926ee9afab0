// Tap device plumbing. Flags and layouts are from linux/if_tun.h and
// linux/if.h.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::raw::{c_int, c_uint};
use std::os::unix::fs::OpenOptionsExt;

use vmm_sys_util::ioctl::ioctl_with_ref;

use crate::error::{Error, Result};

const TUNTAP: c_uint = 0x54; // 'T'

ioctl_iow_nr!(TUNSETIFF, TUNTAP, 202, c_int);

const IFF_TAP: u16 = 0x0002;
const IFF_NO_PI: u16 = 0x1000;
const IFF_ONE_QUEUE: u16 = 0x2000;
const IFF_VNET_HDR: u16 = 0x4000;

const IFNAMSIZ: usize = 16;

#[allow(non_camel_case_types)]
#[repr(C)]
struct ifreq {
    ifr_name: [u8; IFNAMSIZ],
    ifr_flags: u16,
    _pad: [u8; 22],
}

const _: () = assert!(core::mem::size_of::<ifreq>() == 40);

pub fn open(name: &str) -> Result<File> {
    if name.len() + 1 > IFNAMSIZ {
        return Err(Error::IfaceName(name.to_owned()));
    }

    let tap = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open("/dev/net/tun")
        .map_err(|source| Error::Open {
            path: "/dev/net/tun",
            source,
        })?;

    let mut ifr = ifreq {
        ifr_name: [0; IFNAMSIZ],
        ifr_flags: IFF_TAP | IFF_NO_PI | IFF_ONE_QUEUE | IFF_VNET_HDR,
        _pad: [0; 22],
    };
    ifr.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

    let ret = unsafe { ioctl_with_ref(&tap, TUNSETIFF(), &ifr) };
    if ret < 0 {
        return Err(Error::TapSetup(io::Error::last_os_error()));
    }

    log::debug!("tap interface {:?} attached", name);
    Ok(tap)
}
