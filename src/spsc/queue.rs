// Sector-chained SPSC transport queue.
//
// The chain runs head -> ... -> cursor -> ... -> tail. Sectors before the
// cursor are drained spares, the cursor is where the consumer reads, the tail
// is where the producer writes. A full tail is retired by rotating the oldest
// spare in behind it; drained spares leave through `recover_sector`.
//
// `head`/`tail` belong to the producer alone. `cursor` is advanced by the
// consumer while data remains; the producer only nulls it once the queue is
// drained, or sets it from null to the tail. `draining` is raised by the
// consumer for the duration of a read so the producer can tell when the
// sector under the cursor is in use.

use super::{invariants, Sector};
use crate::error::{PushError, QueueError, SubmitError};
use crossbeam::utils::CachePadded;
use log::{debug, trace};
use std::{
   cell::Cell,
   fmt,
   marker::PhantomData,
   ptr,
   sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};

/*──────────────────────────────────────────────────────────────────────────*/
/*  Control block                                                           */
/*──────────────────────────────────────────────────────────────────────────*/

struct ProducerSide<T> {
   head   : Cell<*mut Sector<T>>,  // oldest sector, next to reclaim
   tail   : Cell<*mut Sector<T>>,  // write target, `next` always null
   sectors: Cell<usize>,           // sectors currently linked
}

struct SharedSide<T> {
   cursor  : AtomicPtr<Sector<T>>, // sector being drained, null when none
   draining: AtomicBool,           // consumer inside `read_item`
}

/// The queue's control block. It owns no storage of its own: every slot it
/// uses lives in a [`Sector`] the producer submitted.
///
/// With zero or one sector the queue can be empty and full at the same time;
/// recycling storage while data flows needs at least two.
///
/// Use [`split`](Self::split) to obtain the two ends.
pub struct SectorQueue<T: Send> {
   prod  : CachePadded<ProducerSide<T>>,
   shared: CachePadded<SharedSide<T>>,
   _owns : PhantomData<Box<Sector<T>>>,
}

// `prod` is only touched through the unique `Producer` (or `&mut self`);
// `shared` is atomics only.
unsafe impl<T: Send> Send for SectorQueue<T> {}
unsafe impl<T: Send> Sync for SectorQueue<T> {}

impl<T: Send> SectorQueue<T> {
   /// An empty queue with no storage: reads yield nothing, writes fail.
   pub const fn new() -> Self {
      Self {
         prod: CachePadded::new(ProducerSide {
            head   : Cell::new(ptr::null_mut()),
            tail   : Cell::new(ptr::null_mut()),
            sectors: Cell::new(0),
         }),
         shared: CachePadded::new(SharedSide {
            cursor  : AtomicPtr::new(ptr::null_mut()),
            draining: AtomicBool::new(false),
         }),
         _owns: PhantomData,
      }
   }

   /// Borrow the producer and consumer ends. Each end may move to its own
   /// thread; neither can be shared or duplicated.
   pub fn split(&mut self) -> (Producer<'_, T>, Consumer<'_, T>) {
      let queue = &*self;
      (
         Producer { queue, _unsync: PhantomData },
         Consumer { queue, _unsync: PhantomData },
      )
   }
}

impl<T: Send> Default for SectorQueue<T> {
   fn default() -> Self {
      Self::new()
   }
}

impl<T: Send> Drop for SectorQueue<T> {
   fn drop(&mut self) {
      let mut sector = self.prod.head.replace(ptr::null_mut());
      while !sector.is_null() {
         // SAFETY: every linked sector came from `Box::into_raw` in
         // `submit_sector` and is still owned by the chain.
         let owned = unsafe { Box::from_raw(sector) };
         sector = owned.next.load(Ordering::Relaxed);
      }
   }
}

impl<T: Send> SectorQueue<T> {
   // Only the atomics: the consumer may format from its own thread while
   // the producer is mid-operation.
   fn fmt_shared(&self, d: &mut fmt::DebugStruct<'_, '_>) {
      d.field("reading", &!self.shared.cursor.load(Ordering::Relaxed).is_null())
         .field("draining", &self.shared.draining.load(Ordering::Relaxed));
   }
}

// `&self` here means no `Producer` is alive, so `prod` is quiet.
impl<T: Send> fmt::Debug for SectorQueue<T> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut d = f.debug_struct("SectorQueue");
      d.field("sectors", &self.prod.sectors.get());
      self.fmt_shared(&mut d);
      d.finish()
   }
}

/*──────────────────────────────────────────────────────────────────────────*/
/*  Producer end                                                            */
/*──────────────────────────────────────────────────────────────────────────*/

/// Writing end. Submits storage, writes items and recovers drained storage;
/// all three are serialized by living on this one handle.
pub struct Producer<'q, T: Send> {
   queue  : &'q SectorQueue<T>,
   _unsync: PhantomData<Cell<()>>,
}

impl<'q, T: Send> Producer<'q, T> {
   #[inline]
   fn side(&self) -> &ProducerSide<T> {
      &self.queue.prod
   }

   #[inline]
   fn shared(&self) -> &SharedSide<T> {
      &self.queue.shared
   }

   /// Number of sectors the queue currently holds.
   pub fn sector_count(&self) -> usize {
      self.side().sectors.get()
   }

   /// Run the structural checker over the current chain.
   pub fn is_consistent(&self) -> bool {
      let p = self.side();
      let cursor = self.shared().cursor.load(Ordering::Acquire);
      // SAFETY: we are the producer, so head/tail and the links between them
      // are ours and every sector on the chain is alive.
      unsafe { invariants::chain_is_consistent(p.head.get(), p.tail.get(), cursor, p.sectors.get()) }
   }

   #[inline]
   fn check(&self) {
      if cfg!(any(debug_assertions, feature = "verify")) {
         assert!(self.is_consistent(), "sector chain invariants violated: {self:?}");
      }
   }

   /// Hand a sector of storage to the queue.
   ///
   /// The sector joins at the head as a drained spare; it only becomes
   /// writable once a full tail rotates it in. Passing `None` (e.g. a
   /// `recover_sector` that found nothing) fails with
   /// [`QueueError::InvalidArgument`]; a sector without a single slot fails
   /// with [`QueueError::OutOfSpace`] and is handed back.
   pub fn submit_sector<S>(&mut self, sector: S) -> Result<(), SubmitError<T>>
   where
      S: Into<Option<Box<Sector<T>>>>,
   {
      let Some(mut sector) = sector.into() else {
         return Err(SubmitError { kind: QueueError::InvalidArgument, sector: None });
      };
      if sector.capacity() == 0 {
         debug!("submit_sector: rejected sector with no room for an item");
         return Err(SubmitError { kind: QueueError::OutOfSpace, sector: Some(sector) });
      }

      self.check();
      let (p, shared) = (self.side(), self.shared());

      sector.prime();
      let old_head = p.head.get();
      *sector.next.get_mut() = old_head;
      let raw = Box::into_raw(sector);

      p.head.set(raw);
      if old_head.is_null() {
         p.tail.set(raw);
      }
      p.sectors.set(p.sectors.get() + 1);
      if shared.cursor.load(Ordering::Acquire).is_null() {
         shared.cursor.store(p.tail.get(), Ordering::SeqCst);
      }

      trace!("submit_sector: {} sectors linked", p.sectors.get());
      self.check();
      Ok(())
   }

   /// Append one item.
   ///
   /// Fails with [`QueueError::OutOfSpace`] (item handed back, queue
   /// untouched) when no sector was ever submitted, or when the tail is full
   /// and every other sector is still waiting to be read.
   pub fn write_item(&mut self, item: T) -> Result<(), PushError<T>> {
      let tail = self.side().tail.get();
      if tail.is_null() {
         debug!("write_item: no storage submitted");
         return Err(PushError::out_of_space(item));
      }
      self.check();

      let (p, shared) = (self.side(), self.shared());
      // SAFETY: the tail is linked, hence alive and producer-owned.
      let t = unsafe { &*tail };

      // Reader caught up inside the only active sector: reuse it in place.
      if shared.cursor.load(Ordering::Acquire) == tail
         && t.read.load(Ordering::Acquire) == t.write.load(Ordering::Relaxed)
      {
         self.rewind_caught_up(t);
      }

      let w = t.write.load(Ordering::Relaxed);
      if w < t.capacity() {
         // SAFETY: slots at or past `write` hold nothing and the consumer
         // does not look at them until `write` moves.
         unsafe { t.put(w, item) };
         t.write.store(w + 1, Ordering::Release);
         if shared.cursor.load(Ordering::Acquire).is_null() {
            shared.cursor.store(tail, Ordering::SeqCst);
         }
         self.check();
         return Ok(());
      }

      // Tail is full; rotate the oldest spare in behind it.
      let head = p.head.get();
      if head == shared.cursor.load(Ordering::Acquire) || head == tail {
         debug!("write_item: out of space, {} sectors all in use", p.sectors.get());
         return Err(PushError::out_of_space(item));
      }
      // SAFETY: head lies strictly before the cursor, so the consumer has
      // moved past it for good.
      let spare = unsafe { &*head };
      p.head.set(spare.next.load(Ordering::Relaxed));
      spare.next.store(ptr::null_mut(), Ordering::Relaxed);
      spare.rewind();
      unsafe { spare.put(0, item) };
      spare.write.store(1, Ordering::Relaxed);
      t.next.store(head, Ordering::Release);
      p.tail.set(head);

      trace!("write_item: rotated spare of {} slots in as tail", spare.capacity());
      self.check();
      Ok(())
   }

   // Rewinding touches the consumer's read cursor, so it needs the draining
   // flag for itself. A reader in flight means no rewind this time.
   fn rewind_caught_up(&self, tail: &Sector<T>) {
      let draining = &self.shared().draining;
      if draining
         .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
         .is_err()
      {
         trace!("write_item: reader active, tail rewind skipped");
         return;
      }
      tail.rewind();
      draining.store(false, Ordering::Release);
   }

   /// Take back one sector whose items have all been read, or `None` when
   /// nothing can be reclaimed yet. Never waits for the consumer.
   pub fn recover_sector(&mut self) -> Option<Box<Sector<T>>> {
      let head = self.side().head.get();
      if head.is_null() {
         return None;
      }
      self.check();

      let (p, shared) = (self.side(), self.shared());
      let tail = p.tail.get();
      let cursor = shared.cursor.load(Ordering::Acquire);

      let fully_drained = cursor.is_null()
         || (cursor == head && head == tail && {
            // SAFETY: head is linked and alive.
            let s = unsafe { &*head };
            s.read.load(Ordering::Acquire) == s.write.load(Ordering::Relaxed)
         });

      if fully_drained {
         // Mark the queue drained before looking at the flag: a reader that
         // raises it after this store finds no cursor.
         shared.cursor.store(ptr::null_mut(), Ordering::SeqCst);
         if shared.draining.load(Ordering::SeqCst) {
            debug!("recover_sector: reader active on last sector, try later");
            return None;
         }
         p.head.set(ptr::null_mut());
         p.tail.set(ptr::null_mut());
         p.sectors.set(p.sectors.get() - 1);
         // SAFETY: unlinked above and the consumer can no longer reach it.
         let sector = unsafe { Box::from_raw(head) };
         trace!("recover_sector: reclaimed last sector, queue empty");
         self.check();
         return Some(sector);
      }

      if head == cursor {
         return None;
      }

      // SAFETY: head lies strictly before the cursor.
      let mut sector = unsafe { Box::from_raw(head) };
      p.head.set(*sector.next.get_mut());
      *sector.next.get_mut() = ptr::null_mut();
      p.sectors.set(p.sectors.get() - 1);

      trace!("recover_sector: reclaimed spare, {} sectors linked", p.sectors.get());
      self.check();
      Some(sector)
   }
}

impl<T: Send> fmt::Debug for Producer<'_, T> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut d = f.debug_struct("Producer");
      d.field("sectors", &self.sector_count());
      self.queue.fmt_shared(&mut d);
      d.finish()
   }
}

/*──────────────────────────────────────────────────────────────────────────*/
/*  Consumer end                                                            */
/*──────────────────────────────────────────────────────────────────────────*/

/// Reading end.
pub struct Consumer<'q, T: Send> {
   queue  : &'q SectorQueue<T>,
   _unsync: PhantomData<Cell<()>>,
}

impl<'q, T: Send> Consumer<'q, T> {
   /// Pop the oldest unread item, or `None` if there is nothing to read
   /// right now.
   pub fn read_item(&mut self) -> Option<T> {
      let shared = &self.queue.shared;
      if shared.cursor.load(Ordering::Acquire).is_null() {
         return None;
      }
      // Producer holds the flag while rewinding the tail under us.
      if shared.draining.swap(true, Ordering::SeqCst) {
         return None;
      }
      let item = self.pop_from_cursor();
      shared.draining.store(false, Ordering::Release);
      item
   }

   fn pop_from_cursor(&self) -> Option<T> {
      let shared = &self.queue.shared;
      let mut sector = shared.cursor.load(Ordering::SeqCst);
      while !sector.is_null() {
         // SAFETY: the cursor sector cannot be reclaimed while `draining`
         // is raised, and sectors after it are not reclaimed at all.
         let s = unsafe { &*sector };
         let read = s.read.load(Ordering::Acquire);
         if read < s.write.load(Ordering::Acquire) {
            // SAFETY: `read < write`, published by the producer's release.
            let item = unsafe { s.take(read) };
            s.read.store(read + 1, Ordering::Release);
            return Some(item);
         }
         if read < s.capacity() {
            // producer may still fill this sector
            return None;
         }
         let next = s.next.load(Ordering::Acquire);
         if next.is_null() {
            return None;
         }
         shared.cursor.store(next, Ordering::Release);
         sector = next;
      }
      None
   }
}

impl<T: Send> fmt::Debug for Consumer<'_, T> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut d = f.debug_struct("Consumer");
      self.queue.fmt_shared(&mut d);
      d.finish()
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::sync::Arc;

   #[test]
   fn reader_mid_call_blocks_reclaiming_last_sector() {
      let mut q = SectorQueue::<u32>::new();
      let (mut tx, mut rx) = q.split();
      tx.submit_sector(Sector::with_capacity(2)).unwrap();
      tx.write_item(7u32).unwrap();
      assert_eq!(rx.read_item(), Some(7));

      // a read suspended on the head sector
      tx.shared().draining.store(true, Ordering::SeqCst);
      assert!(tx.recover_sector().is_none());
      assert!(tx.shared().cursor.load(Ordering::SeqCst).is_null());
      assert_eq!(tx.sector_count(), 1);
      assert!(tx.is_consistent());

      tx.shared().draining.store(false, Ordering::SeqCst);
      // no read point: the reader reports empty and leaves everything alone
      assert_eq!(rx.read_item(), None);
      assert!(tx.shared().cursor.load(Ordering::SeqCst).is_null());
      assert!(!tx.shared().draining.load(Ordering::SeqCst));
      assert_eq!(tx.sector_count(), 1);
      assert!(tx.is_consistent());

      let sector = tx.recover_sector().expect("drained sector");
      assert_eq!(sector.capacity(), 2);
      assert_eq!(tx.sector_count(), 0);
      assert_eq!(rx.read_item(), None);
   }

   #[test]
   fn write_after_aborted_reclaim_restores_read_point() {
      let mut q = SectorQueue::<u32>::new();
      let (mut tx, mut rx) = q.split();
      tx.submit_sector(Sector::with_capacity(2)).unwrap();
      tx.write_item(1u32).unwrap();
      assert_eq!(rx.read_item(), Some(1));

      tx.shared().draining.store(true, Ordering::SeqCst);
      assert!(tx.recover_sector().is_none());
      tx.shared().draining.store(false, Ordering::SeqCst);
      assert_eq!(rx.read_item(), None);

      tx.write_item(2u32).unwrap();
      assert_eq!(tx.shared().cursor.load(Ordering::SeqCst), tx.side().tail.get());
      assert!(tx.is_consistent());
      assert_eq!(rx.read_item(), Some(2));
      assert_eq!(rx.read_item(), None);
   }

   #[test]
   fn reader_backs_off_while_producer_rewinds() {
      let mut q = SectorQueue::<u32>::new();
      let (mut tx, mut rx) = q.split();
      tx.submit_sector(Sector::with_capacity(4)).unwrap();
      tx.write_item(1u32).unwrap();

      tx.shared().draining.store(true, Ordering::SeqCst);
      assert_eq!(rx.read_item(), None);
      // the reader must not clear a flag it did not raise
      assert!(tx.shared().draining.load(Ordering::SeqCst));

      tx.shared().draining.store(false, Ordering::SeqCst);
      assert_eq!(rx.read_item(), Some(1));
      assert!(!tx.shared().draining.load(Ordering::SeqCst));
   }

   #[test]
   fn no_rewind_under_an_active_reader() {
      let mut q = SectorQueue::<char>::new();
      let (mut tx, mut rx) = q.split();
      tx.submit_sector(Sector::with_capacity(1)).unwrap();
      tx.write_item('a').unwrap();
      assert_eq!(rx.read_item(), Some('a'));

      tx.shared().draining.store(true, Ordering::SeqCst);
      let err = tx.write_item('b').unwrap_err();
      assert_eq!(err.kind, QueueError::OutOfSpace);
      assert_eq!(err.into_inner(), 'b');

      tx.shared().draining.store(false, Ordering::SeqCst);
      tx.write_item('b').unwrap();
      assert_eq!(rx.read_item(), Some('b'));
      assert!(tx.is_consistent());
   }

   #[test]
   fn dropping_the_queue_releases_unread_items() {
      let marker = Arc::new(());
      {
         let mut q = SectorQueue::<Arc<()>>::new();
         let (mut tx, mut rx) = q.split();
         tx.submit_sector(Sector::with_capacity(2)).unwrap();
         tx.submit_sector(Sector::with_capacity(2)).unwrap();
         for _ in 0..4 {
            tx.write_item(Arc::clone(&marker)).unwrap();
         }
         drop(rx.read_item());
         assert_eq!(Arc::strong_count(&marker), 4);
      }
      assert_eq!(Arc::strong_count(&marker), 1);
   }
}
