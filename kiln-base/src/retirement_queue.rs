use std::collections::VecDeque;

struct RetiredItem<T> {
    item: T,
    retirement_frame: u64,
}

/// Holds items until a fixed number of frames have passed since they were retired.
///
/// All items wait the same number of frames, so the queue is naturally ordered with the items
/// that become ready first at the front. Draining stops at the first item that is not ready yet.
///
/// The queue does not destroy anything itself. The owner takes ready items out and destroys them
/// however it needs to, usually outside of whatever lock guards the queue.
pub struct RetirementQueue<T> {
    retired: VecDeque<RetiredItem<T>>,
    frame_delay: u64,
}

impl<T> RetirementQueue<T> {
    /// An item retired during frame F becomes ready once the frame count reaches
    /// F + `frame_delay`
    pub fn new(frame_delay: u64) -> Self {
        RetirementQueue {
            retired: Default::default(),
            frame_delay,
        }
    }

    pub fn frame_delay(&self) -> u64 {
        self.frame_delay
    }

    pub fn len(&self) -> usize {
        self.retired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retired.is_empty()
    }

    /// Stamp the item with the current frame count and push it to the back
    pub fn retire(
        &mut self,
        item: T,
        retirement_frame: u64,
    ) {
        debug_assert!(
            self.retired
                .back()
                .map(|x| x.retirement_frame <= retirement_frame)
                .unwrap_or(true),
            "items must be retired in frame order"
        );

        self.retired.push_back(RetiredItem {
            item,
            retirement_frame,
        });
    }

    /// Returns true if an item retired at `retirement_frame` may be destroyed at `frame_count`
    pub fn is_ready(
        &self,
        retirement_frame: u64,
        frame_count: u64,
    ) -> bool {
        retirement_frame + self.frame_delay <= frame_count
    }

    /// Remove every item from the front of the queue that is ready at `frame_count`
    pub fn take_ready(
        &mut self,
        frame_count: u64,
    ) -> Vec<T> {
        let ready_count = self
            .retired
            .iter()
            .take_while(|x| self.is_ready(x.retirement_frame, frame_count))
            .count();

        self.retired.drain(0..ready_count).map(|x| x.item).collect()
    }

    /// Remove everything regardless of age
    pub fn take_all(&mut self) -> Vec<T> {
        self.retired.drain(..).map(|x| x.item).collect()
    }
}

impl<T> Drop for RetirementQueue<T> {
    fn drop(&mut self) {
        if !self.retired.is_empty() {
            log::warn!(
                "RetirementQueue dropped with {} items that were never destroyed",
                self.retired.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_waits_for_frame_delay() {
        let mut queue = RetirementQueue::new(2);
        queue.retire("buffer", 0);

        assert!(queue.take_ready(0).is_empty());
        assert!(queue.take_ready(1).is_empty());
        assert_eq!(vec!["buffer"], queue.take_ready(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_stops_at_first_not_ready() {
        let mut queue = RetirementQueue::new(2);
        queue.retire(1, 0);
        queue.retire(2, 0);
        queue.retire(3, 1);
        queue.retire(4, 3);

        assert_eq!(vec![1, 2], queue.take_ready(2));
        assert_eq!(2, queue.len());
        assert_eq!(vec![3], queue.take_ready(4));
        assert_eq!(vec![4], queue.take_ready(5));
    }

    #[test]
    fn test_take_all_ignores_age() {
        let mut queue = RetirementQueue::new(2);
        queue.retire(1, 10);
        queue.retire(2, 11);

        assert_eq!(vec![1, 2], queue.take_all());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_delay_is_ready_immediately() {
        let mut queue = RetirementQueue::new(0);
        queue.retire(7, 5);
        assert_eq!(vec![7], queue.take_ready(5));
    }
}
