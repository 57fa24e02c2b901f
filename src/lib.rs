//! Zero-allocation single-producer / single-consumer transport queue whose
//! storage is handed in by the caller one [`Sector`] at a time.
//!
//! The queue never allocates or frees: the producer submits sectors, writes
//! items, and recovers drained sectors for reuse, while the consumer reads
//! items in FIFO order. Neither side ever blocks.
//!
//! ```
//! use sector_spsc::{Sector, SectorQueue};
//!
//! let mut queue = SectorQueue::<&str>::new();
//! let (mut tx, mut rx) = queue.split();
//!
//! tx.submit_sector(Sector::with_capacity(2)).unwrap();
//! tx.write_item("a").unwrap();
//! tx.write_item("b").unwrap();
//! assert!(tx.write_item("c").is_err()); // one sector: no spare to rotate in
//!
//! assert_eq!(rx.read_item(), Some("a"));
//! assert_eq!(rx.read_item(), Some("b"));
//! assert_eq!(rx.read_item(), None);
//! ```

pub mod error;
pub mod spsc;

pub use error::{PushError, QueueError, SubmitError};
pub use spsc::{Consumer, Producer, Sector, SectorQueue};
