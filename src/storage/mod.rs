pub mod local;
pub mod provider;

pub use local::LocalStorage;
pub use provider::{locator_for, ContentSink};
