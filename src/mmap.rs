//! OS memory layer: megablock-aligned anonymous reservations plus the two
//! page primitives the storage manager needs from the host (page size
//! query and the executable-protection toggle for the code allocator).

#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect},
        sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
        winnt::{
            MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_READWRITE,
        },
    };

    pub struct Mmap {
        start: *mut u8,
        size: usize,
        align: usize,
    }

    impl Mmap {
        /// Reserve and commit `size` bytes; `aligned()` yields the first
        /// `align`-aligned address inside the mapping. `size` must include
        /// the alignment slack.
        pub fn new(size: usize, align: usize) -> Self {
            unsafe {
                let mem = VirtualAlloc(
                    null_mut(),
                    size,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                );
                if mem.is_null() {
                    panic!("VirtualAlloc failed");
                }
                Self {
                    start: mem as *mut u8,
                    size,
                    align,
                }
            }
        }

        pub fn aligned(&self) -> *mut u8 {
            let offset = (self.align - (self.start as usize) % self.align) % self.align;
            unsafe { self.start.add(offset) }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub const fn size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }

    pub fn page_size() -> usize {
        unsafe {
            let mut info: SYSTEM_INFO = core::mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        }
    }

    /// Toggle execute permission on a page range.
    pub fn set_executable(p: *mut u8, bytes: usize, executable: bool) {
        unsafe {
            let mut old = 0;
            let prot = if executable {
                PAGE_EXECUTE_READWRITE
            } else {
                PAGE_READWRITE
            };
            if VirtualProtect(p.cast(), bytes, prot, &mut old) == 0 {
                panic!("VirtualProtect failed");
            }
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    pub struct Mmap {
        start: *mut u8,
        size: usize,
        align: usize,
    }

    impl Mmap {
        /// Reserve and commit `size` bytes; `aligned()` yields the first
        /// `align`-aligned address inside the mapping. `size` must include
        /// the alignment slack.
        pub fn new(size: usize, align: usize) -> Self {
            unsafe {
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    panic!("mmap failed");
                }
                Self {
                    start: map as *mut u8,
                    size,
                    align,
                }
            }
        }

        pub fn aligned(&self) -> *mut u8 {
            let offset = (self.align - (self.start as usize) % self.align) % self.align;
            unsafe { self.start.add(offset) }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub const fn size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start as *mut _, self.size as _);
            }
        }
    }

    pub fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    /// Toggle execute permission on a page range.
    pub fn set_executable(p: *mut u8, bytes: usize, executable: bool) {
        unsafe {
            let prot = if executable {
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
            } else {
                libc::PROT_READ | libc::PROT_WRITE
            };
            if libc::mprotect(p as *mut _, bytes as _, prot) != 0 {
                panic!("mprotect failed");
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;
