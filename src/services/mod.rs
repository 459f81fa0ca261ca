pub mod authz;
pub mod file;
pub mod token;

pub use authz::{AuthorizationEngine, Operation};
pub use file::{Download, FileService, StagedUpload};
pub use token::{KeySource, RemoteKeySet, StaticKeySet, TokenVerifier};
