pub mod layout;
pub mod lock;
pub mod options;

pub use layout::FilesystemLayout;
pub use lock::StoreLock;
pub use options::{BuildOptions, Isolation, StevedoreOptions};
