// SPDX-License-Identifier: Apache-2.0

//! OS integration: anonymous mappings for heap blocks and NUMA policy.
//!
//! Blocks are mapped with `mmap` and bound to their NUMA node with a raw
//! `mbind` syscall (the binding itself is not wrapped by `nix`). Binding is
//! applied before first touch, so the kernel places every faulted page on
//! the requested node. On hosts without NUMA support the bind syscall is
//! absent; node 0 requests are accepted there, anything else fails.

use crate::error::Error;
use taskmill_config::NumaNodeId;

#[cfg(unix)]
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// Maps `size` bytes of zeroed anonymous memory bound to `numa_node_id`.
///
/// The mapping is page aligned, which satisfies every alignment the block
/// allocator hands out.
pub fn map_block(numa_node_id: NumaNodeId, size: usize) -> Result<NonNull<u8>, Error> {
    #[cfg(unix)]
    {
        use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous};

        let length = NonZeroUsize::new(size).ok_or(Error::Map { size, errno: 0 })?;
        // Safety: an anonymous private mapping aliases nothing.
        let addr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|errno| Error::Map {
            size,
            errno: errno as i32,
        })?;

        let addr = addr.cast::<u8>();
        bind_to_node(addr, size, numa_node_id)?;
        Ok(addr)
    }

    #[cfg(not(unix))]
    {
        use std::alloc::{Layout, alloc_zeroed};

        let layout = Layout::from_size_align(size, 4096).map_err(|_| Error::Map { size, errno: 0 })?;
        if numa_node_id != 0 {
            return Err(Error::NumaBind {
                size,
                numa_node_id,
                errno: 0,
            });
        }
        // Safety: layout has non-zero size, checked above via map error.
        let raw = unsafe { alloc_zeroed(layout) };
        NonNull::new(raw).ok_or(Error::Map { size, errno: 0 })
    }
}

/// Releases a mapping created by [`map_block`].
///
/// # Safety
/// `addr`/`size` must denote exactly one live mapping returned by
/// [`map_block`], and no reference into it may outlive this call.
pub unsafe fn unmap_block(addr: NonNull<u8>, size: usize) -> Result<(), Error> {
    #[cfg(unix)]
    {
        // Safety: forwarded contract.
        unsafe { nix::sys::mman::munmap(addr.cast(), size) }.map_err(|errno| Error::Unmap {
            size,
            errno: errno as i32,
        })
    }

    #[cfg(not(unix))]
    {
        use std::alloc::{Layout, dealloc};
        let layout = Layout::from_size_align(size, 4096).map_err(|_| Error::Unmap { size, errno: 0 })?;
        // Safety: forwarded contract.
        unsafe { dealloc(addr.as_ptr(), layout) };
        Ok(())
    }
}

#[cfg(target_os = "linux")]
const MPOL_BIND: libc::c_long = 2;
#[cfg(target_os = "linux")]
const MPOL_F_NODE: libc::c_ulong = 1;
#[cfg(target_os = "linux")]
const MPOL_F_ADDR: libc::c_ulong = 2;

/// Applies a strict `MPOL_BIND` policy for `numa_node_id` to the mapping.
#[cfg(target_os = "linux")]
fn bind_to_node(addr: NonNull<u8>, size: usize, numa_node_id: NumaNodeId) -> Result<(), Error> {
    let mask: libc::c_ulong = 1 << numa_node_id;
    // Safety: addr/size describe the fresh mapping; the mask outlives the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr.as_ptr(),
            size,
            MPOL_BIND,
            &mask as *const libc::c_ulong,
            (size_of::<libc::c_ulong>() * 8) as libc::c_ulong,
            0_u32,
        )
    };
    if rc == 0 {
        return Ok(());
    }

    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    // Kernels without CONFIG_NUMA reject the syscall outright; node 0 is
    // trivially correct there.
    if numa_node_id == 0 && (errno == libc::ENOSYS || errno == libc::EPERM) {
        return Ok(());
    }
    Err(Error::NumaBind {
        size,
        numa_node_id,
        errno,
    })
}

#[cfg(all(unix, not(target_os = "linux")))]
fn bind_to_node(_addr: NonNull<u8>, size: usize, numa_node_id: NumaNodeId) -> Result<(), Error> {
    if numa_node_id == 0 {
        Ok(())
    } else {
        Err(Error::NumaBind {
            size,
            numa_node_id,
            errno: 0,
        })
    }
}

/// Asks the kernel which NUMA node currently backs `addr`.
///
/// Returns `None` when the page is not faulted in yet or the platform has
/// no NUMA support.
#[must_use]
pub fn node_of_address(addr: NonNull<u8>) -> Option<NumaNodeId> {
    #[cfg(target_os = "linux")]
    {
        let mut node: libc::c_int = -1;
        // Safety: out-pointer and address are valid for the call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_get_mempolicy,
                &mut node as *mut libc::c_int,
                std::ptr::null_mut::<libc::c_ulong>(),
                0_u64,
                addr.as_ptr(),
                MPOL_F_NODE | MPOL_F_ADDR,
            )
        };
        if rc == 0 && node >= 0 {
            return Some(node as NumaNodeId);
        }
        None
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = addr;
        None
    }
}
