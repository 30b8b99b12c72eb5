//! Storage collaborator: verifies the medium backing a namespace and lays
//! out its on-disk directory structure.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Name of the SQLite database file inside a namespace's directory.
pub const DATABASE_FILE_NAME: &str = "sqlite.db";

/// Directory-structure-verification service consulted before any connection
/// is opened for a namespace.
///
/// A failed [`Storage::verify_available`] is fatal for the whole namespace:
/// the factory purges every cached connection for it and surfaces the error.
pub trait Storage: Send + Sync + 'static {
   /// Check that the storage medium backing this namespace is usable.
   fn verify_available(&self, namespace: &str) -> Result<()>;

   /// Create the namespace's directory tree if it does not exist yet.
   fn assert_directory_structure(&self, namespace: &str) -> Result<()>;

   /// Absolute path of the namespace's database file.
   fn database_path(&self, namespace: &str) -> PathBuf;
}

/// Stock [`Storage`] rooted at a base directory; each namespace owns
/// `<base>/<namespace>/sqlite.db`.
#[derive(Debug, Clone)]
pub struct DirStorage {
   base: PathBuf,
}

impl DirStorage {
   pub fn new(base: impl AsRef<Path>) -> Self {
      Self {
         base: base.as_ref().to_path_buf(),
      }
   }

   pub fn base(&self) -> &Path {
      &self.base
   }
}

impl Storage for DirStorage {
   fn verify_available(&self, namespace: &str) -> Result<()> {
      if self.base.is_dir() {
         Ok(())
      } else {
         Err(Error::StorageUnavailable {
            namespace: namespace.to_string(),
            reason: format!("base directory '{}' is not available", self.base.display()),
         })
      }
   }

   fn assert_directory_structure(&self, namespace: &str) -> Result<()> {
      std::fs::create_dir_all(self.base.join(namespace)).map_err(|e| Error::StorageUnavailable {
         namespace: namespace.to_string(),
         reason: format!("could not create namespace directory: {e}"),
      })
   }

   fn database_path(&self, namespace: &str) -> PathBuf {
      self.base.join(namespace).join(DATABASE_FILE_NAME)
   }
}
