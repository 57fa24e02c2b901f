use crate::spsc::Sector;
use thiserror::Error;

/// Why a producer-side operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
   /// A required argument was absent.
   #[error("invalid argument: a required sector was not supplied")]
   InvalidArgument,
   /// No room for the item and no spare sector to rotate in, or a sector too
   /// small to host a single item.
   #[error("out of space")]
   OutOfSpace,
}

/// A rejected `write_item`; the item is handed back untouched.
#[derive(Debug, PartialEq, Eq, Error)]
#[error("write rejected: {kind}")]
pub struct PushError<T> {
   pub kind: QueueError,
   pub item: T,
}

impl<T> PushError<T> {
   pub(crate) fn out_of_space(item: T) -> Self {
      Self { kind: QueueError::OutOfSpace, item }
   }

   pub fn into_inner(self) -> T {
      self.item
   }
}

/// A rejected `submit_sector`; the caller keeps ownership of its storage.
#[derive(Debug, Error)]
#[error("sector rejected: {kind}")]
pub struct SubmitError<T> {
   pub kind: QueueError,
   pub sector: Option<Box<Sector<T>>>,
}
