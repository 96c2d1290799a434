#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("out of bounds data segment access, try to access {try_to_access:?} but size of segment is {segment_size}")]
    AccessOutOfBounds {
        try_to_access: Option<usize>,
        segment_size: usize,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Runtime copy of a data segment, the source of `memory.init`.
pub struct DataInstance {
    bytes: Vec<u8>,
}

impl DataInstance {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn validate_region(&self, offset: usize, size: usize) -> Result<()> {
        let len = self.bytes.len();
        match offset.checked_add(size) {
            Some(max_addr) if max_addr <= len => Ok(()),
            Some(max_addr) => Err(Error::AccessOutOfBounds {
                try_to_access: Some(max_addr),
                segment_size: len,
            }),
            None => Err(Error::AccessOutOfBounds {
                try_to_access: None,
                segment_size: len,
            }),
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.bytes
    }

    /// Dropped segments behave as if they were empty.
    pub fn drop_bytes(&mut self) {
        self.bytes = vec![];
    }
}
