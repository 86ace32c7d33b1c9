use std::{cell::RefCell, collections::VecDeque};

use crate::core::item::{ItemReader, ItemReaderResult};

/// Hands out items that were already gathered in memory, in their original order.
///
/// Extraction happens before loading (an empty extraction must abort the run
/// before the destination table is truncated), so the load step reads from here.
pub struct InMemoryItemReader<T> {
    items: RefCell<VecDeque<T>>,
}

impl<T> InMemoryItemReader<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: RefCell::new(items.into()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.items.borrow().len()
    }
}

impl<T> ItemReader<T> for InMemoryItemReader<T> {
    fn read(&self) -> ItemReaderResult<T> {
        Ok(self.items.borrow_mut().pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_are_read_in_order_then_exhausted() {
        let reader = InMemoryItemReader::new(vec!["a", "b"]);

        assert_eq!(reader.read().unwrap(), Some("a"));
        assert_eq!(reader.remaining(), 1);
        assert_eq!(reader.read().unwrap(), Some("b"));
        assert_eq!(reader.read().unwrap(), None);
        assert_eq!(reader.read().unwrap(), None);
    }
}
