use matchbook_core::MatchError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// A 1-indexed page request. Only [`PageRequest::new`] builds one, so
/// `page >= 1` and `1 <= page_size <= MAX_PAGE_SIZE` always hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPageRequest")]
pub struct PageRequest {
    page: u32,
    page_size: u32,
}

#[derive(Deserialize)]
struct RawPageRequest {
    page: u32,
    page_size: u32,
}

impl TryFrom<RawPageRequest> for PageRequest {
    type Error = MatchError;

    fn try_from(raw: RawPageRequest) -> Result<Self, Self::Error> {
        PageRequest::new(raw.page, raw.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Result<Self, MatchError> {
        if page == 0 {
            return Err(MatchError::Validation("page must be at least 1".into()));
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(MatchError::Validation(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"
            )));
        }
        Ok(Self { page, page_size })
    }

    pub fn page(self) -> u32 {
        self.page
    }

    pub fn page_size(self) -> u32 {
        self.page_size
    }

    pub fn limit(self) -> i64 {
        i64::from(self.page_size)
    }

    /// Offset for SQL LIMIT/OFFSET.
    pub fn offset(self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: i64,
    pub total_pages: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, request: PageRequest, total: i64) -> Self {
        let size = i64::from(request.page_size.max(1));
        Self {
            items,
            page: request.page,
            page_size: request.page_size,
            total,
            total_pages: (total + size - 1) / size,
        }
    }
}
