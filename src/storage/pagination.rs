//! Offset/size pagination over backends with a per-request result cap.
//!
//! A search backend returns at most a fixed number of hits per request,
//! together with the total number of matches. [`PageWalker::collect`]
//! issues windows `from = 0, cap, 2*cap, ...` until the reported total is
//! exhausted and returns the concatenation. Any failed page aborts the walk
//! and the pages already fetched are dropped.

use std::future::Future;

use tracing::debug;

use crate::context::RequestContext;
use crate::storage::StorageResult;

/// Default page cap, matching the search backend's per-request limit.
pub const MAX_PAGE_SIZE: usize = 1000;

/// One window of a paginated query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub from: usize,
    pub size: usize,
}

/// A fetched window and the backend's total match count.
#[derive(Clone, Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64) -> Self {
        Self { items, total }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
        }
    }
}

/// Drains a paginated query.
#[derive(Clone, Copy, Debug)]
pub struct PageWalker {
    page_cap: usize,
}

impl Default for PageWalker {
    fn default() -> Self {
        Self::new(MAX_PAGE_SIZE)
    }
}

impl PageWalker {
    /// Creates a walker. A zero cap is raised to one.
    pub fn new(page_cap: usize) -> Self {
        Self {
            page_cap: page_cap.max(1),
        }
    }

    /// Fetches pages until the total reported by the backend is covered.
    ///
    /// Each fetch is raced against the context's cancellation.
    pub async fn collect<T, F, Fut>(&self, ctx: &RequestContext, mut fetch: F) -> StorageResult<Vec<T>>
    where
        F: FnMut(PageRequest) -> Fut,
        Fut: Future<Output = StorageResult<Page<T>>>,
    {
        let mut results = Vec::new();
        let mut from = 0usize;

        loop {
            let request = PageRequest {
                from,
                size: self.page_cap,
            };
            let page = ctx.run(fetch(request)).await?;
            let received = page.items.len();
            results.extend(page.items);

            from += self.page_cap;
            debug!(from = request.from, received, total = page.total, "fetched page");

            // A page that comes back empty while the total still claims more
            // means the result set shrank under us.
            if page.total <= from as u64 || received == 0 {
                break;
            }
        }

        Ok(results)
    }
}
