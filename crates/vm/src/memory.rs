use crate::types::{Limits, MAX_MEMORY_PAGES};
use crate::value::LittleEndian;
use crate::WASM_PAGE_SIZE;

/// A linear memory. Host code creates one directly to provide it as an import.
pub struct MemoryInstance {
    data: Vec<u8>,
    max: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("cannot grow memory by {delta} pages beyond the maximum of {max} pages")]
    GrowOverMaximumSize { delta: u64, max: u32 },
    #[error("out of bounds memory access, try to access {try_to_access:?} but size of memory is {memory_size}")]
    AccessOutOfBounds {
        /// `None` when the address computation overflowed
        try_to_access: Option<usize>,
        memory_size: usize,
    },
}

type Result<T> = std::result::Result<T, Error>;

impl MemoryInstance {
    pub fn new(initial: u32, maximum: Option<u32>) -> Self {
        Self {
            data: vec![0; initial as usize * WASM_PAGE_SIZE],
            max: maximum,
        }
    }

    pub fn validate_region(&self, offset: usize, size: usize) -> Result<()> {
        match offset.checked_add(size) {
            Some(max_addr) if max_addr <= self.data_len() => Ok(()),
            Some(max_addr) => Err(Error::AccessOutOfBounds {
                try_to_access: Some(max_addr),
                memory_size: self.data_len(),
            }),
            None => Err(Error::AccessOutOfBounds {
                try_to_access: None,
                memory_size: self.data_len(),
            }),
        }
    }

    pub fn store(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.validate_region(offset, data.len())?;
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn load(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.validate_region(offset, buf.len())?;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    pub fn load_as<T: LittleEndian>(&self, offset: usize) -> Result<T> {
        self.validate_region(offset, T::WIDTH)?;
        Ok(T::read_le(&self.data[offset..]))
    }

    pub fn fill(&mut self, offset: usize, value: u8, len: usize) -> Result<()> {
        self.validate_region(offset, len)?;
        self.data[offset..offset + len].fill(value);
        Ok(())
    }

    /// Overlapping ranges are copied as if through a temporary buffer.
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) -> Result<()> {
        self.validate_region(src, len)?;
        self.validate_region(dst, len)?;
        self.data.copy_within(src..src + len, dst);
        Ok(())
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    pub fn page_count(&self) -> u32 {
        (self.data_len() / WASM_PAGE_SIZE) as u32
    }

    pub fn max(&self) -> Option<u32> {
        self.max
    }

    /// Current size and maximum, as matched against an import declaration.
    pub fn limits(&self) -> Limits {
        Limits {
            min: self.page_count(),
            max: self.max,
        }
    }

    /// Grows by `delta` pages and returns the previous page count.
    pub fn grow(&mut self, delta: u32) -> Result<u32> {
        let max = self.max.unwrap_or(MAX_MEMORY_PAGES).min(MAX_MEMORY_PAGES);
        let old = self.page_count();
        let len = old as u64 + delta as u64;
        if len > max as u64 {
            return Err(Error::GrowOverMaximumSize {
                delta: delta as u64,
                max,
            });
        }
        let new_len = len as usize * WASM_PAGE_SIZE;
        self.data
            .try_reserve_exact(new_len - self.data.len())
            .map_err(|_| Error::GrowOverMaximumSize {
                delta: delta as u64,
                max,
            })?;
        self.data.resize(new_len, 0);
        Ok(old)
    }

    pub fn raw_data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_returns_previous_size() {
        let mut mem = MemoryInstance::new(1, Some(3));
        assert_eq!(mem.grow(1), Ok(1));
        assert_eq!(mem.grow(1), Ok(2));
        assert!(mem.grow(1).is_err());
        assert_eq!(mem.page_count(), 3);
        assert_eq!(mem.data_len(), 3 * WASM_PAGE_SIZE);
    }

    #[test]
    fn unbounded_memory_caps_at_4gib() {
        let mut mem = MemoryInstance::new(0, None);
        assert!(mem.grow(MAX_MEMORY_PAGES + 1).is_err());
        assert_eq!(mem.page_count(), 0);
    }

    #[test]
    fn accesses_are_bounds_checked() {
        let mut mem = MemoryInstance::new(1, None);
        mem.store(10, &[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.load_as::<u32>(10).unwrap(), 0x0403_0201);
        assert_eq!(
            mem.store(WASM_PAGE_SIZE - 2, &[0; 4]),
            Err(Error::AccessOutOfBounds {
                try_to_access: Some(WASM_PAGE_SIZE + 2),
                memory_size: WASM_PAGE_SIZE
            })
        );
        assert!(mem.load_as::<u8>(usize::MAX).is_err());
    }

    #[test]
    fn copy_within_handles_overlap() {
        let mut mem = MemoryInstance::new(1, None);
        mem.store(0, &[1, 2, 3, 4, 5]).unwrap();
        mem.copy_within(0, 2, 5).unwrap();
        assert_eq!(&mem.raw_data()[0..7], &[1, 2, 1, 2, 3, 4, 5]);
        mem.fill(1, 9, 2).unwrap();
        assert_eq!(&mem.raw_data()[0..4], &[1, 9, 9, 2]);
    }
}
