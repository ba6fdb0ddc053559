#![forbid(unsafe_code)]

mod frame;
mod pager;

pub use pager::{
    PageLatch, Pager, PagerOptions, PagerStats, PinMode, PinnedPage, Synchronous, Txn,
    MAX_TXN_PAGES,
};
