//! Executable code memory.
//!
//! Code is staged into a fresh anonymous mapping, then flipped to
//! read+execute before first use; it is never writable and executable at
//! the same time, and never written again after the flip.

use anyhow::{bail, Context, Result};

/// An owned W^X mapping holding one function's code.
pub struct CodeMemory {
    ptr: *mut u8,
    len: usize,
}

// The mapping is immutable after construction.
unsafe impl Send for CodeMemory {}
unsafe impl Sync for CodeMemory {}

impl CodeMemory {
    /// Map `code` into executable memory.
    pub fn allocate(code: &[u8]) -> Result<CodeMemory> {
        if code.is_empty() {
            bail!("cannot map empty code");
        }
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                Self::allocate_unix(code)
            } else {
                let _ = code;
                bail!("executable mappings are not supported on this platform");
            }
        }
    }

    #[cfg(unix)]
    fn allocate_unix(code: &[u8]) -> Result<CodeMemory> {
        use rustix::mm::{mmap_anonymous, mprotect, MapFlags, MprotectFlags, ProtFlags};

        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = (code.len() + page - 1) & !(page - 1);
        let ptr = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
            .context("mmap for code failed")?
        };
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());
            mprotect(ptr, len, MprotectFlags::READ | MprotectFlags::EXEC)
                .context("mprotect(rx) failed")?;
        }
        #[cfg(target_arch = "aarch64")]
        unsafe {
            // The instruction cache must observe the fresh code before the
            // first branch into it.
            extern "C" {
                fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
            }
            __clear_cache(ptr as *mut libc::c_char, (ptr as *mut libc::c_char).add(len));
        }
        Ok(CodeMemory {
            ptr: ptr as *mut u8,
            len,
        })
    }

    pub fn ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for CodeMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            let _ = rustix::mm::munmap(self.ptr as *mut _, self.len);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn maps_and_rounds_to_page_size() {
        let code = CodeMemory::allocate(&[0xc3]).unwrap();
        assert!(!code.ptr().is_null());
        assert!(code.len() >= 1);
        assert_eq!(code.len() % 4096, 0);
    }
}
