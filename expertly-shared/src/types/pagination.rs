use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationParams {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
}

fn default_page() -> u64 { 1 }
fn default_per_page() -> u64 { 50 }

impl PaginationParams {
    pub fn new(page: u64, per_page: u64) -> Self {
        Self { page, per_page }
    }

    pub fn offset(&self) -> u64 {
        self.page.max(1).saturating_sub(1).saturating_mul(self.limit())
    }

    /// Page size, clamped to `1..=200`.
    pub fn limit(&self) -> u64 {
        self.per_page.clamp(1, 200)
    }
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self { page: default_page(), per_page: default_per_page() }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Paginated<T: Serialize> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    pub total_pages: u64,
}

impl<T: Serialize> Paginated<T> {
    pub fn new(items: Vec<T>, total: u64, params: &PaginationParams) -> Self {
        let per_page = params.limit();
        Self {
            items,
            total,
            page: params.page.max(1),
            per_page,
            total_pages: total.div_ceil(per_page),
        }
    }
}
