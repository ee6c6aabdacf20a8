//! Linear memory instances.

use capstan_environ::{MemoryDecl, WASM_PAGE_SIZE};

/// A linear memory. The leading header (buffer pointer + byte length) is
/// read directly by generated code; the backing storage lives behind it.
#[repr(C)]
pub struct MemoryInstance {
    buffer: *mut u8,
    buffer_len: u64,

    data: Vec<u8>,
    min_pages: u32,
    max_pages: Option<u32>,
    shared: bool,
}

impl MemoryInstance {
    pub fn new(decl: &MemoryDecl) -> Box<MemoryInstance> {
        let mut memory = Box::new(MemoryInstance {
            buffer: std::ptr::null_mut(),
            buffer_len: 0,
            data: vec![0; decl.min_pages as usize * WASM_PAGE_SIZE as usize],
            min_pages: decl.min_pages,
            max_pages: decl.max_pages,
            shared: decl.shared,
        });
        memory.refresh_header();
        memory
    }

    fn refresh_header(&mut self) {
        self.buffer = self.data.as_mut_ptr();
        self.buffer_len = self.data.len() as u64;
    }

    pub fn size_pages(&self) -> u32 {
        (self.data.len() as u64 / WASM_PAGE_SIZE) as u32
    }

    pub fn len_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// `memory.grow`: returns the previous page count, or -1 when the
    /// limit is exceeded.
    pub fn grow(&mut self, delta_pages: u32) -> i32 {
        let old_pages = self.size_pages();
        let new_pages = match old_pages.checked_add(delta_pages) {
            Some(pages) => pages,
            None => return -1,
        };
        let limit = self.max_pages.unwrap_or(65536);
        if new_pages > limit || new_pages > 65536 {
            return -1;
        }
        self.data
            .resize(new_pages as usize * WASM_PAGE_SIZE as usize, 0);
        self.refresh_header();
        old_pages as i32
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.data.len();
        // Generated code writes through the header pointer; hand out the
        // same region here.
        unsafe { std::slice::from_raw_parts_mut(self.buffer, len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_environ as env;
    use memoffset::offset_of;

    #[test]
    fn memory_layout_matches_the_offset_table() {
        assert_eq!(
            offset_of!(MemoryInstance, buffer),
            env::MEMORY_INSTANCE_BUFFER as usize
        );
        assert_eq!(
            offset_of!(MemoryInstance, buffer_len),
            env::MEMORY_INSTANCE_BUFFER_LEN as usize
        );
    }

    #[test]
    fn grow_reports_previous_size_and_respects_the_limit() {
        let mut memory = MemoryInstance::new(&MemoryDecl {
            min_pages: 1,
            max_pages: Some(2),
            shared: false,
        });
        assert_eq!(memory.grow(1), 1);
        assert_eq!(memory.size_pages(), 2);
        assert_eq!(memory.grow(1), -1);
        assert_eq!(memory.size_pages(), 2);
    }
}
