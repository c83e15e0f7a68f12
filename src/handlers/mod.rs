pub mod file;
pub mod folder;
pub mod trash;
pub mod usage;
