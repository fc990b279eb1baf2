//! Layer archive helpers.
//!
//! `tar` applies layers onto a root directory (whiteout aware), `writer`
//! packs a filesystem delta into a layer blob.

mod tar;
mod writer;

pub use tar::{apply_layer, apply_layer_file};
pub use writer::{Change, LayerBlob, write_layer};
