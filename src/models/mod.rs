pub mod blob;
pub mod file;
pub mod folder;
pub mod owner;
pub mod quota;
pub mod version;

pub use blob::*;
pub use file::*;
pub use folder::*;
pub use owner::*;
pub use quota::*;
pub use version::*;
