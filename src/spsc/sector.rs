// One caller-supplied block of item slots.
//
// A sector is the unit the queue borrows storage in: the producer hands one in
// with `submit_sector`, the queue chains it, and `recover_sector` hands it back
// once every item stored in it has been read. Cursors only ever move forward
// except when the producer rewinds a sector it has exclusive use of.

use std::{
   cell::UnsafeCell,
   fmt,
   mem::{size_of, MaybeUninit},
   ptr,
   sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

type Slot<T> = UnsafeCell<MaybeUninit<T>>;

/*──────────────────────────────────────────────────────────────────────────*/
/*  Sector header + slots                                                   */
/*──────────────────────────────────────────────────────────────────────────*/

pub struct Sector<T> {
   capacity: usize,
   pub(crate) read : AtomicUsize,            // advanced by consumer
   pub(crate) write: AtomicUsize,            // advanced by producer
   pub(crate) next : AtomicPtr<Sector<T>>,   // null at the tail
   slots: Box<[Slot<T>]>,
}

impl<T> Sector<T> {
   /// Bookkeeping bytes charged against a block before any slot fits.
   pub const HEADER_BYTES: usize = size_of::<Self>();
   /// Bytes charged per item slot.
   pub const SLOT_BYTES: usize = if size_of::<Slot<T>>() == 0 { 1 } else { size_of::<Slot<T>>() };

   /// A sector with room for exactly `capacity` items.
   ///
   /// The new sector starts fully drained (`read == write == capacity`), so
   /// the queue treats it as a spare until rotation makes it the write target.
   pub fn with_capacity(capacity: usize) -> Box<Self> {
      let slots = (0..capacity)
         .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
         .collect::<Vec<_>>()
         .into_boxed_slice();

      Box::new(Self {
         capacity,
         read : AtomicUsize::new(capacity),
         write: AtomicUsize::new(capacity),
         next : AtomicPtr::new(ptr::null_mut()),
         slots,
      })
   }

   /// A sector carved out of a block of `bytes` bytes: whatever is left after
   /// the header, divided into slots. Too small a block yields capacity 0,
   /// which `submit_sector` rejects.
   pub fn from_block_size(bytes: usize) -> Box<Self> {
      Self::with_capacity(Self::capacity_for(bytes))
   }

   /// Item slots that fit in a block of `bytes` bytes.
   pub const fn capacity_for(bytes: usize) -> usize {
      bytes.saturating_sub(Self::HEADER_BYTES) / Self::SLOT_BYTES
   }

   /// Bytes a block needs to hold `capacity` items.
   pub const fn block_size(capacity: usize) -> usize {
      Self::HEADER_BYTES + capacity * Self::SLOT_BYTES
   }

   #[inline]
   pub fn capacity(&self) -> usize {
      self.capacity
   }

   /// Items written but not yet read.
   pub fn unread(&self) -> usize {
      let read = self.read.load(Ordering::Acquire);
      self.write.load(Ordering::Acquire).saturating_sub(read)
   }

   /// True when every slot has been written and read.
   pub fn is_drained(&self) -> bool {
      self.read.load(Ordering::Acquire) == self.capacity
         && self.write.load(Ordering::Acquire) == self.capacity
   }

   /// Back to the spare state, detached from any chain.
   pub(crate) fn prime(&mut self) {
      *self.read.get_mut() = self.capacity;
      *self.write.get_mut() = self.capacity;
      *self.next.get_mut() = ptr::null_mut();
   }

   /// Both cursors to 0. Caller must hold exclusive use of the sector: either
   /// it is unreachable by the consumer or the draining flag is claimed.
   #[inline]
   pub(crate) fn rewind(&self) {
      self.write.store(0, Ordering::Relaxed);
      self.read.store(0, Ordering::Relaxed);
   }

   /// # Safety
   /// Producer only; slot `idx` must lie at or past the write cursor and
   /// hold no live item.
   #[inline]
   pub(crate) unsafe fn put(&self, idx: usize, item: T) {
      debug_assert!(idx < self.capacity);
      ptr::write((*self.slots.get_unchecked(idx)).get(), MaybeUninit::new(item));
   }

   /// # Safety
   /// Consumer only; slot `idx` must lie in `[read, write)` as published by
   /// the producer. The slot is logically empty afterwards.
   #[inline]
   pub(crate) unsafe fn take(&self, idx: usize) -> T {
      debug_assert!(idx < self.capacity);
      ptr::read((*self.slots.get_unchecked(idx)).get()).assume_init()
   }
}

impl<T> Drop for Sector<T> {
   fn drop(&mut self) {
      if !std::mem::needs_drop::<T>() {
         return;
      }
      let read = *self.read.get_mut();
      let write = (*self.write.get_mut()).min(self.capacity);
      for idx in read..write {
         unsafe { self.slots[idx].get_mut().assume_init_drop() };
      }
   }
}

impl<T> fmt::Debug for Sector<T> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Sector")
         .field("capacity", &self.capacity)
         .field("read", &self.read.load(Ordering::Relaxed))
         .field("write", &self.write.load(Ordering::Relaxed))
         .field("linked", &!self.next.load(Ordering::Relaxed).is_null())
         .finish()
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::rc::Rc;

   #[test]
   fn new_sector_is_a_drained_spare() {
      let s = Sector::<u64>::with_capacity(4);
      assert_eq!(s.capacity(), 4);
      assert!(s.is_drained());
      assert_eq!(s.unread(), 0);
   }

   #[test]
   fn block_size_and_capacity_agree() {
      for cap in [1usize, 2, 7, 64] {
         let bytes = Sector::<usize>::block_size(cap);
         assert_eq!(Sector::<usize>::capacity_for(bytes), cap);
         assert_eq!(Sector::<usize>::capacity_for(bytes - 1), cap - 1);
      }
   }

   #[test]
   fn block_smaller_than_header_has_no_room() {
      let s = Sector::<usize>::from_block_size(Sector::<usize>::HEADER_BYTES);
      assert_eq!(s.capacity(), 0);
      assert_eq!(Sector::<usize>::capacity_for(0), 0);
   }

   #[test]
   fn drop_releases_only_unread_items() {
      let marker = Rc::new(());
      let s = Sector::with_capacity(3);
      s.rewind();
      for i in 0..3 {
         unsafe { s.put(i, Rc::clone(&marker)) };
         s.write.store(i + 1, Ordering::Release);
      }
      let first = unsafe { s.take(0) };
      s.read.store(1, Ordering::Release);
      assert_eq!(Rc::strong_count(&marker), 4);

      drop(first);
      drop(s);
      assert_eq!(Rc::strong_count(&marker), 1);
   }
}
