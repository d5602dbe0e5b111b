use std::collections::BTreeMap;

use std_msgs::msg::Header;

/// (sec, nanosec)
pub type Stamp = (i32, u32);

pub fn stamp_of(header: &Header) -> Stamp {
    (header.stamp.sec, header.stamp.nanosec)
}

struct Slot<D, T, I> {
    depth: Option<D>,
    detections: Option<T>,
    image: Option<I>,
}

impl<D, T, I> Default for Slot<D, T, I> {
    fn default() -> Self {
        Self { depth: None, detections: None, image: None }
    }
}

/// 时间戳完全一致的一组消息
#[derive(Debug)]
pub struct Frame<D, T, I> {
    pub stamp: Stamp,
    pub depth: D,
    pub detections: T,
    pub image: Option<I>,
}

/// 精确时间同步器: 深度图 + 检测结果 (+ 可选彩色图)
pub struct ExactTimeSync<D, T, I> {
    slots: BTreeMap<Stamp, Slot<D, T, I>>,
    queue_size: usize,
    with_image: bool,
}

impl<D, T, I> ExactTimeSync<D, T, I> {
    pub fn new(queue_size: usize, with_image: bool) -> Self {
        Self {
            slots: BTreeMap::new(),
            queue_size: queue_size.max(1),
            with_image,
        }
    }

    pub fn pending(&self) -> usize {
        self.slots.len()
    }

    pub fn add_depth(&mut self, stamp: Stamp, depth: D) -> Option<Frame<D, T, I>> {
        self.slot(stamp).depth = Some(depth);
        self.try_emit(stamp)
    }

    pub fn add_detections(&mut self, stamp: Stamp, detections: T) -> Option<Frame<D, T, I>> {
        self.slot(stamp).detections = Some(detections);
        self.try_emit(stamp)
    }

    /// 未启用彩色图时直接丢弃
    pub fn add_image(&mut self, stamp: Stamp, image: I) -> Option<Frame<D, T, I>> {
        if !self.with_image {
            return None;
        }
        self.slot(stamp).image = Some(image);
        self.try_emit(stamp)
    }

    fn slot(&mut self, stamp: Stamp) -> &mut Slot<D, T, I> {
        if !self.slots.contains_key(&stamp) {
            // 队列满时丢弃最旧的时间戳
            while self.slots.len() >= self.queue_size {
                self.slots.pop_first();
            }
        }
        self.slots.entry(stamp).or_default()
    }

    fn try_emit(&mut self, stamp: Stamp) -> Option<Frame<D, T, I>> {
        let slot = self.slots.get(&stamp)?;
        let complete = slot.depth.is_some()
            && slot.detections.is_some()
            && (!self.with_image || slot.image.is_some());
        if !complete {
            return None;
        }
        // 更旧的未完成组不会再被用到
        self.slots = self.slots.split_off(&stamp);
        let slot = self.slots.remove(&stamp)?;
        Some(Frame {
            stamp,
            depth: slot.depth?,
            detections: slot.detections?,
            image: slot.image,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestSync = ExactTimeSync<&'static str, u32, char>;

    #[test]
    fn emits_when_depth_and_detections_share_stamp() {
        let mut sync = TestSync::new(10, false);
        assert!(sync.add_depth((1, 0), "d1").is_none());
        let frame = sync.add_detections((1, 0), 7).unwrap();
        assert_eq!(frame.stamp, (1, 0));
        assert_eq!(frame.depth, "d1");
        assert_eq!(frame.detections, 7);
        assert!(frame.image.is_none());
        assert_eq!(sync.pending(), 0);
    }

    #[test]
    fn different_stamps_never_pair() {
        let mut sync = TestSync::new(10, false);
        assert!(sync.add_depth((1, 0), "d1").is_none());
        assert!(sync.add_detections((1, 1), 7).is_none());
        assert_eq!(sync.pending(), 2);
    }

    #[test]
    fn image_is_required_when_enabled() {
        let mut sync = TestSync::new(10, true);
        sync.add_depth((2, 0), "d2");
        assert!(sync.add_detections((2, 0), 3).is_none());
        let frame = sync.add_image((2, 0), 'i').unwrap();
        assert_eq!(frame.image, Some('i'));
    }

    #[test]
    fn image_is_ignored_when_disabled() {
        let mut sync = TestSync::new(10, false);
        assert!(sync.add_image((2, 0), 'i').is_none());
        assert_eq!(sync.pending(), 0);
    }

    #[test]
    fn completing_a_stamp_drops_older_partial_sets() {
        let mut sync = TestSync::new(10, false);
        sync.add_depth((1, 0), "old");
        sync.add_depth((2, 0), "d2");
        sync.add_depth((3, 0), "newer");
        assert!(sync.add_detections((2, 0), 1).is_some());
        assert_eq!(sync.pending(), 1);
        assert!(sync.add_detections((1, 0), 1).is_none());
        assert!(sync.add_detections((3, 0), 1).is_some());
    }

    #[test]
    fn full_queue_evicts_oldest_stamp() {
        let mut sync = TestSync::new(2, false);
        sync.add_depth((1, 0), "d1");
        sync.add_depth((2, 0), "d2");
        sync.add_depth((3, 0), "d3");
        assert_eq!(sync.pending(), 2);
        // (1, 0) 已被淘汰, 只会重新开一组
        assert!(sync.add_detections((1, 0), 5).is_none());
        assert!(sync.add_detections((3, 0), 5).is_some());
    }
}
