pub mod discovery;
pub mod file;
pub mod token;

pub use discovery::{Action, AppName, DiscoveryDescriptor};
pub use file::{FileHandle, FileId, FileInfo};
pub use token::{AccessToken, Permission, TokenRecord};
