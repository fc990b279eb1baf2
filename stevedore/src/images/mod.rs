//! Images: references, base resolution, layer archives and the store.

pub mod archive;
pub mod base;
mod index;
pub mod record;
pub mod reference;
mod store;

pub use base::{BaseImage, BaseImageSource, BaseRootfs, LocalBaseImages};
pub use index::ImageIndex;
pub use record::{BaseRecord, ImageConfig, ImageRecord};
pub use reference::ImageRef;
pub use store::ImageStore;
