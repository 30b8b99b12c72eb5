//! Session handles: opaque qualifiers naming one logical session within a
//! namespace.
//!
//! Three forms exist:
//!
//! - *primary*: equals the namespace itself; reserved for schema
//!   initialization and never handed out through the public API;
//! - *group-instance*: `"<group>--<instance>"`, scoping one client-visible
//!   transaction to a correlation token (e.g. a bridge generation);
//! - *bare*: a generated UUID, optionally carrying the internal-use suffix
//!   that exempts it from service-connection cleanup.

use std::fmt;

use uuid::Uuid;

use crate::{Error, Result};

/// Reserved divider between the group and instance portions of a composite
/// qualifier. Must not appear inside a bare qualifier or a group token.
pub const GROUP_DIVIDER: &str = "--";

/// Suffix marking a handle as created for non-service (in-process) use.
pub const INTERNAL_SUFFIX: &str = "-internal";

/// An opaque token identifying one logical session within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(String);

impl SessionHandle {
   /// Wrap a caller-supplied bare qualifier.
   ///
   /// Rejects empty qualifiers and qualifiers containing the reserved group
   /// divider; composite qualifiers must be built with
   /// [`SessionHandle::group_instance`].
   pub fn new(qualifier: impl Into<String>) -> Result<Self> {
      let qualifier = qualifier.into();
      if qualifier.is_empty() {
         return Err(Error::InvalidQualifier("qualifier cannot be empty".into()));
      }
      if qualifier.contains(GROUP_DIVIDER) {
         return Err(Error::InvalidQualifier(format!(
            "bare qualifier '{qualifier}' contains the reserved divider '{GROUP_DIVIDER}'"
         )));
      }
      Ok(Self(qualifier))
   }

   /// Generate a handle suitable for database-service use.
   pub fn service() -> Self {
      Self(Uuid::new_v4().to_string())
   }

   /// Generate a handle suitable for non-service (in-process) use. These are
   /// exempt from bulk service-connection cleanup.
   pub fn internal() -> Self {
      Self(format!("{}{INTERNAL_SUFFIX}", Uuid::new_v4()))
   }

   /// Compose a group-instance qualifier, `"<group>--<instance>"`.
   pub fn group_instance(group: &str, instance: i64) -> Result<Self> {
      if group.is_empty() {
         return Err(Error::InvalidQualifier("group cannot be empty".into()));
      }
      if group.contains(GROUP_DIVIDER) {
         return Err(Error::InvalidQualifier(format!(
            "group '{group}' contains the reserved divider '{GROUP_DIVIDER}'"
         )));
      }
      Ok(Self(format!("{group}{GROUP_DIVIDER}{instance}")))
   }

   /// Wrap a qualifier string that is already known to be well formed, e.g.
   /// one read back out of the registry.
   pub(crate) fn raw(qualifier: impl Into<String>) -> Self {
      Self(qualifier.into())
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }

   /// The group portion of a composite qualifier, if this is one.
   pub fn group(&self) -> Option<&str> {
      self.0.rfind(GROUP_DIVIDER).map(|idx| &self.0[..idx])
   }

   pub fn is_group_instance(&self) -> bool {
      self.0.contains(GROUP_DIVIDER)
   }

   pub fn is_internal(&self) -> bool {
      self.0.ends_with(INTERNAL_SUFFIX)
   }
}

impl fmt::Display for SessionHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

/// The group portion of a qualifier string, if it is a composite one.
pub(crate) fn group_of(qualifier: &str) -> Option<&str> {
   qualifier.rfind(GROUP_DIVIDER).map(|idx| &qualifier[..idx])
}
