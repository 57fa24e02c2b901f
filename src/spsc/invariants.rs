// Structural consistency of a sector chain.
//
// Works on a snapshot of the three links. Every loop is bounded by the number
// of sectors the producer believes it owns, so a corrupted chain (cycle or
// stray link) is reported instead of walked forever.

use super::Sector;
use std::sync::atomic::Ordering;

/// # Safety
/// `head`, `tail` and `cursor` must each be null or point to a live sector of
/// this queue's chain, and only the producer thread may call this.
pub(crate) unsafe fn chain_is_consistent<T>(
   head: *const Sector<T>,
   tail: *const Sector<T>,
   cursor: *const Sector<T>,
   sectors: usize,
) -> bool {
   if head.is_null() && tail.is_null() && cursor.is_null() {
      return sectors == 0;
   }
   if head.is_null() || tail.is_null() {
      return false;
   }
   // without a read point there is nothing but the single tail sector
   if cursor.is_null() && head != tail {
      return false;
   }
   if !(*tail).next.load(Ordering::Acquire).is_null() {
      return false;
   }

   // head reaches tail in exactly `sectors` hops; cursor lies on the way
   let mut seen = 1;
   let mut cursor_on_chain = cursor.is_null() || cursor == head;
   let mut qs = head;
   while qs != tail {
      if seen >= sectors {
         return false;
      }
      qs = (*qs).next.load(Ordering::Acquire);
      if qs.is_null() {
         return false;
      }
      cursor_on_chain |= qs == cursor;
      seen += 1;
   }
   if seen != sectors || !cursor_on_chain {
      return false;
   }

   let mut qs = head;
   if !cursor.is_null() {
      // behind the reader: drained spares
      while qs != cursor {
         let s = &*qs;
         let next = s.next.load(Ordering::Acquire);
         if s.read.load(Ordering::Acquire) != s.capacity()
            || s.write.load(Ordering::Acquire) != s.capacity()
            || next.is_null()
         {
            return false;
         }
         qs = next;
      }
      // reader up to tail: full sectors with reads in bounds
      while qs != tail {
         let s = &*qs;
         let next = s.next.load(Ordering::Acquire);
         if s.write.load(Ordering::Acquire) != s.capacity()
            || s.read.load(Ordering::Acquire) > s.capacity()
            || next.is_null()
         {
            return false;
         }
         qs = next;
      }
   }

   let s = &*qs;
   let read = s.read.load(Ordering::Acquire);
   let write = s.write.load(Ordering::Acquire);
   read <= write && write <= s.capacity()
}
