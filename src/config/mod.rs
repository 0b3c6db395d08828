mod registry;

pub use registry::{BackupConfig, BackupRegistry, BackupRegistryCreationError};
