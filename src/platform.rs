//! Thin virtual-memory layer: reserve/commit/decommit/free, page size and
//! huge-page queries, over-allocate-and-trim alignment. The rest of the
//! crate only ever calls through here, never libc/winapi directly, matching
//! how the teacher isolates OS calls in its own `os` module.
//!
//! NUMA pinning and huge-page privilege acquisition belong to a platform
//! adaptation layer this crate does not own; `reserve` accepts a `numa_node`
//! hint but a mismatch is not independently verified on platforms without a
//! portable NUMA query (logged, not enforced).

use log::warn;

#[cfg(unix)]
use libc::{MADV_DONTNEED, MAP_ANONYMOUS, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE};

#[cfg(windows)]
use winapi::shared::minwindef::DWORD;
#[cfg(windows)]
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
#[cfg(windows)]
use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
#[cfg(windows)]
use winapi::um::winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

/// Default OS page size fallback when a query is unavailable.
const DEFAULT_PAGE_SIZE: usize = 4096;

pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if result > 0 {
            return result as usize;
        }
        DEFAULT_PAGE_SIZE
    }
    #[cfg(windows)]
    {
        let mut info: SYSTEM_INFO = unsafe { core::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        if info.dwPageSize > 0 {
            info.dwPageSize as usize
        } else {
            DEFAULT_PAGE_SIZE
        }
    }
}

/// Minimum huge page size supported by the platform, or `None` if huge pages
/// are unavailable/unrequested. Matches `VirtualMemory::get_minimum_huge_page_size`.
pub fn minimum_huge_page_size() -> Option<usize> {
    #[cfg(unix)]
    {
        // 2 MiB is the standard x86-64 Linux huge page size; a production
        // platform layer would read /sys/kernel/mm/hugepages.
        Some(2 * 1024 * 1024)
    }
    #[cfg(windows)]
    {
        let size = unsafe { winapi::um::memoryapi::GetLargePageMinimum() };
        if size > 0 {
            Some(size)
        } else {
            None
        }
    }
}

fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align > 0 && (align & (align - 1)) == 0);
    (value + align - 1) & !(align - 1)
}

fn align_up_ptr(ptr: *mut u8, align: usize) -> *mut u8 {
    align_up(ptr as usize, align) as *mut u8
}

/// Reserves and commits `size` bytes from the OS, page aligned. Returns null
/// on failure. `use_huge_pages` is a best-effort request; failure silently
/// falls back to regular pages.
pub fn reserve(size: usize, use_huge_pages: bool, numa_node: i32) -> *mut u8 {
    if size == 0 {
        return core::ptr::null_mut();
    }
    let _ = numa_node; // no portable NUMA-aware reservation path here.

    #[cfg(unix)]
    {
        let mut flags = MAP_PRIVATE | MAP_ANONYMOUS;
        if use_huge_pages {
            flags |= libc::MAP_HUGETLB;
        }
        let protect = PROT_READ | PROT_WRITE;
        let mut ptr = unsafe {
            libc::mmap(core::ptr::null_mut(), size, protect, flags, -1, 0)
        };
        if ptr == libc::MAP_FAILED && use_huge_pages {
            warn!("huge page reservation failed, falling back to regular pages");
            flags &= !libc::MAP_HUGETLB;
            ptr = unsafe { libc::mmap(core::ptr::null_mut(), size, protect, flags, -1, 0) };
        }
        if ptr == libc::MAP_FAILED {
            warn!("mmap failed: {}, size {}", errno::errno(), size);
            return core::ptr::null_mut();
        }
        ptr as *mut u8
    }
    #[cfg(windows)]
    {
        let mut flags: DWORD = MEM_RESERVE | MEM_COMMIT;
        if use_huge_pages {
            flags |= winapi::um::winnt::MEM_LARGE_PAGES;
        }
        let mut ptr = unsafe {
            VirtualAlloc(core::ptr::null_mut(), size, flags, PAGE_READWRITE)
        };
        if ptr.is_null() && use_huge_pages {
            warn!("huge page reservation failed, falling back to regular pages");
            ptr = unsafe {
                VirtualAlloc(core::ptr::null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
            };
        }
        if ptr.is_null() {
            warn!("VirtualAlloc failed: {}", unsafe { winapi::um::errhandlingapi::GetLastError() });
        }
        ptr as *mut u8
    }
}

/// Reserves `size` bytes aligned to `align` (a power of two, at least the
/// page size) by over-allocating and trimming the surplus at both ends.
pub fn reserve_aligned(size: usize, align: usize, use_huge_pages: bool, numa_node: i32) -> *mut u8 {
    debug_assert!(align >= page_size() && (align & (align - 1)) == 0);

    let first = reserve(size, use_huge_pages, numa_node);
    if first.is_null() {
        return core::ptr::null_mut();
    }
    if (first as usize) % align == 0 {
        return first;
    }

    free(first, size);
    if size >= usize::MAX - align {
        return core::ptr::null_mut();
    }
    let over_size = size + align;
    let over = reserve(over_size, use_huge_pages, numa_node);
    if over.is_null() {
        return core::ptr::null_mut();
    }

    let aligned = align_up_ptr(over, align);
    let pre = aligned as usize - over as usize;
    let post = over_size - pre - size;

    if pre > 0 {
        free(over, pre);
    }
    if post > 0 {
        free(unsafe { aligned.add(size) }, post);
    }
    aligned
}

/// Releases a previously reserved region back to the OS.
pub fn free(addr: *mut u8, size: usize) -> bool {
    if addr.is_null() || size == 0 {
        return true;
    }
    #[cfg(unix)]
    {
        let err = unsafe { libc::munmap(addr as *mut libc::c_void, size) } == -1;
        if err {
            warn!("munmap failed: {}, addr {:p}, size {}", errno::errno(), addr, size);
        }
        !err
    }
    #[cfg(windows)]
    {
        let err = unsafe { VirtualFree(addr as _, 0, MEM_RELEASE) } == 0;
        if err {
            warn!("VirtualFree failed: {}", unsafe { winapi::um::errhandlingapi::GetLastError() });
        }
        !err
    }
}

/// Advises the OS that `[addr, addr+size)` is no longer needed, releasing
/// physical pages while leaving the mapping committed.
pub fn decommit(addr: *mut u8, size: usize) -> bool {
    if addr.is_null() || size == 0 {
        return true;
    }
    #[cfg(unix)]
    {
        let err = unsafe { libc::madvise(addr as *mut libc::c_void, size, MADV_DONTNEED) };
        if err != 0 {
            warn!("madvise(MADV_DONTNEED) failed: {}, addr {:p}, size {}", errno::errno(), addr, size);
        }
        err == 0
    }
    #[cfg(windows)]
    {
        let err = unsafe { VirtualFree(addr as _, size, MEM_DECOMMIT) } == 0;
        if err {
            warn!("VirtualFree(MEM_DECOMMIT) failed: {}", unsafe { winapi::um::errhandlingapi::GetLastError() });
        }
        !err
    }
}

/// Marks `[addr, addr+size)` inaccessible. Used only in debug-assisted test
/// builds to catch use-after-recycle; never called on the hot path.
#[allow(dead_code)]
pub fn protect(addr: *mut u8, size: usize) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::mprotect(addr as *mut libc::c_void, size, PROT_NONE) == 0 }
    }
    #[cfg(windows)]
    {
        let mut old = 0;
        unsafe { VirtualProtect(addr as _, size, PAGE_NOACCESS, &mut old) != 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_sane_and_pow2() {
        let ps = page_size();
        assert!(ps >= 4096);
        assert_eq!(ps & (ps - 1), 0);
    }

    #[test]
    fn reserve_and_free_round_trips() {
        let size = page_size() * 4;
        let ptr = reserve(size, false, -1);
        assert!(!ptr.is_null());
        assert_eq!((ptr as usize) % page_size(), 0);
        unsafe {
            core::ptr::write_bytes(ptr, 0xAB, size);
            assert_eq!(*ptr, 0xAB);
        }
        assert!(free(ptr, size));
    }

    #[test]
    fn reserve_aligned_honours_alignment() {
        let align = page_size() * 16;
        let ptr = reserve_aligned(align, align, false, -1);
        assert!(!ptr.is_null());
        assert_eq!((ptr as usize) % align, 0);
        assert!(free(ptr, align));
    }
}
