//! A pure Rust library for reading bcachefs filesystem images.
//!
//! The decoder is read-only: it parses the superblock, walks the inode,
//! directory-entry and extent btrees once at open time, and serves all
//! lookups, listings and file reads from the resulting in-memory indices.
//! It is meant for treating a bcachefs image as a seekable archive of many
//! small files, readable concurrently from any number of threads or worker
//! processes, without mounting anything.
//!
//! # Example
//!
//! ```no_run
//! use std::io::Read;
//! use bcachefs_rs::Bcachefs;
//!
//! let fs = Bcachefs::open("image.img").unwrap();
//!
//! for name in fs.namelist() {
//!     println!("{name}");
//! }
//!
//! let mut file = fs.open_file("dir/subdir/file2").unwrap();
//! let mut content = Vec::new();
//! file.read_to_end(&mut content).unwrap();
//! ```

mod btree;
mod cursor;
mod dirent;
mod error;
pub mod file;
pub mod filesystem;
mod index;
mod resolve;
mod traits;
pub mod types;
pub mod walk;

pub use cursor::Cursor;
pub use dirent::{Dirent, DirentType};
pub use error::*;
pub use file::File;
pub use filesystem::Bcachefs;
pub use types::{Inode, Superblock, ROOT_INODE};
pub use walk::{Walk, WalkEntry};
