use serde::{Deserialize, Serialize};

use super::JobStatus;

/// Constraints for listing jobs. An empty filter matches every job.
///
/// # Example
///
/// ```
/// # use bonfire_sched::prelude::*;
/// let filter = JobFilter::default()
///     .name_contains("report")
///     .in_group("nightly")
///     .with_status(JobStatus::Paused);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub name_contains: Option<String>,
    pub group: Option<String>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn name_contains(self, name: impl Into<String>) -> Self {
        Self {
            name_contains: Some(name.into()),
            ..self
        }
    }

    pub fn in_group(self, group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            ..self
        }
    }

    pub fn with_status(self, status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..self
        }
    }
}

/// A one based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub number: u32,
    pub size: u32,
}

impl Page {
    pub const DEFAULT_SIZE: u32 = 10;

    pub const fn new(number: u32, size: u32) -> Self {
        Self { number, size }
    }

    /// The number of items to skip. Page zero is treated as the first page.
    pub fn offset(&self) -> u64 {
        u64::from(self.number.max(1) - 1) * u64::from(self.size)
    }

    pub fn limit(&self) -> u64 {
        u64::from(self.size)
    }

    /// Apply the page to an already ordered list of items.
    pub fn slice<T>(&self, items: Vec<T>) -> Paged<T> {
        let total = items.len() as u64;
        let items = items
            .into_iter()
            .skip(self.offset() as usize)
            .take(self.size as usize)
            .collect();
        Paged { items, total }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, Self::DEFAULT_SIZE)
    }
}

/// One page of results together with the total number of matching items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> Paged<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paged<U> {
        Paged {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filter_builder() {
        let filter = JobFilter::default()
            .name_contains("report")
            .with_status(JobStatus::Active);

        assert_eq!(filter.name_contains.as_deref(), Some("report"));
        assert_eq!(filter.group, None);
        assert_eq!(filter.status, Some(JobStatus::Active));
    }

    #[test]
    fn page_slice() {
        let items: Vec<_> = (0..25).collect();

        let page = Page::new(3, 10).slice(items.clone());
        assert_eq!(page.items, (20..25).collect::<Vec<_>>());
        assert_eq!(page.total, 25);

        let page = Page::new(0, 10).slice(items.clone());
        assert_eq!(page.items, (0..10).collect::<Vec<_>>());

        let page = Page::new(4, 10).slice(items);
        assert!(page.items.is_empty());
        assert_eq!(page.total, 25);
    }
}
