//! A Rust library for detecting, listing, extracting and packing game archive containers.
//!
//! Every container format decodes its directory into a [table::ResourceTable]
//! of [types::ArchiveEntry] values. An entry only describes where its bytes live
//! and which [types::Transform] turns them into content; nothing is read until
//! the entry is opened.
pub mod decode;
pub mod detect;
pub mod error;
pub mod ext;
pub mod formats;
pub mod reader;
pub mod table;
pub mod transform;
pub mod types;
pub mod utils;
pub mod validate;

pub use error::{ArcError, Result};
pub use formats::Archive;
