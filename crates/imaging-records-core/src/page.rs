//! Typed page of results for list operations.
//!
//! Storage layers compute `LIMIT`/`OFFSET` through [`window`] and wrap the
//! rows in a [`Page`]; callers never need to know how the rows were
//! fetched.

use serde::Serialize;

use crate::error::RecordsError;

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, page: u32, page_size: u32) -> Self {
        Self {
            items,
            total,
            page,
            page_size,
        }
    }

    pub fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.page_size))
    }

    pub fn has_next(&self) -> bool {
        u64::from(self.page) < self.total_pages()
    }
}

/// Validate a 1-based page request and return `(limit, offset)`.
pub fn window(page: u32, page_size: u32) -> Result<(i64, i64), RecordsError> {
    if page == 0 {
        return Err(RecordsError::validation("page numbers start at 1"));
    }
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(RecordsError::validation(format!(
            "page_size must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    let limit = i64::from(page_size);
    let offset = i64::from(page - 1) * limit;
    Ok((limit, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_one_based() {
        assert_eq!(window(1, 25).unwrap(), (25, 0));
        assert_eq!(window(3, 25).unwrap(), (25, 50));
        assert!(window(0, 25).is_err());
        assert!(window(1, 0).is_err());
        assert!(window(1, MAX_PAGE_SIZE + 1).is_err());
    }

    #[test]
    fn page_counts() {
        let page = Page::new(vec![1, 2], 5, 1, 2);
        assert_eq!(page.total_pages(), 3);
        assert!(page.has_next());

        let last = Page::new(vec![5], 5, 3, 2);
        assert!(!last.has_next());

        let empty: Page<i32> = Page::new(vec![], 0, 1, 10);
        assert_eq!(empty.total_pages(), 0);
        assert!(!empty.has_next());
    }
}
