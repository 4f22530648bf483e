pub mod page_manager;

pub use page_manager::{PageManager, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
