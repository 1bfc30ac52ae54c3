//! On-disk page formats: branch/leaf/overflow pages and the two meta pages.
#![forbid(unsafe_code)]

pub mod meta;
pub mod page;

pub use meta::{decode_meta, encode_meta, load_meta, valid_page_size, DbRecord, Meta};
pub use page::{NodeData, NodeFlags, PageFlags, PAGE_HDR};
