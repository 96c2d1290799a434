use crate::types::Limits;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("out of bounds table access, try to access {try_to_access:?} but size of table is {table_size}")]
    AccessOutOfBounds {
        try_to_access: Option<usize>,
        table_size: usize,
    },
    #[error("uninitialized element, try to access {0}")]
    UninitializedElement(usize),
}

type Result<T> = std::result::Result<T, Error>;

/// A table of function references. Elements are indices into the function
/// index space of the instance that wrote them.
pub struct TableInstance {
    buffer: Vec<Option<u32>>,
    max: Option<u32>,
}

impl TableInstance {
    pub fn new(initial: u32, maximum: Option<u32>) -> Self {
        Self {
            buffer: vec![None; initial as usize],
            max: maximum,
        }
    }

    pub fn validate_region(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(max_addr) if max_addr <= self.buffer_len() => Ok(()),
            Some(max_addr) => Err(Error::AccessOutOfBounds {
                try_to_access: Some(max_addr),
                table_size: self.buffer_len(),
            }),
            None => Err(Error::AccessOutOfBounds {
                try_to_access: None,
                table_size: self.buffer_len(),
            }),
        }
    }

    pub fn initialize(&mut self, offset: usize, funcs: &[u32]) -> Result<()> {
        self.validate_region(offset, funcs.len())?;
        for (slot, func) in self.buffer[offset..].iter_mut().zip(funcs) {
            *slot = Some(*func);
        }
        Ok(())
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn limits(&self) -> Limits {
        Limits {
            min: self.buffer_len() as u32,
            max: self.max,
        }
    }

    pub fn get_at(&self, index: usize) -> Result<u32> {
        self.buffer
            .get(index)
            .ok_or(Error::AccessOutOfBounds {
                try_to_access: Some(index),
                table_size: self.buffer_len(),
            })
            .and_then(|func| func.ok_or(Error::UninitializedElement(index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinguishes_missing_and_empty_slots() {
        let mut table = TableInstance::new(4, None);
        table.initialize(1, &[7, 8]).unwrap();
        assert_eq!(table.get_at(1), Ok(7));
        assert_eq!(table.get_at(0), Err(Error::UninitializedElement(0)));
        assert!(matches!(
            table.get_at(4),
            Err(Error::AccessOutOfBounds { .. })
        ));
        assert!(table.initialize(3, &[1, 2]).is_err());
        assert_eq!(table.get_at(3), Err(Error::UninitializedElement(3)));
    }
}
