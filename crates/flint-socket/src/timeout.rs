use std::collections::{BTreeSet, HashMap};

use tokio::time::Instant;

use crate::queue::OpId;

/// 按截止时间排序的操作超时表。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 每个操作的截止时间在入队时就已确定，驱动任务只需要知道“最早的那个”来设置一个定时器；
/// - 操作完成时要能 O(log n) 取消，避免为每个操作单独起定时任务。
///
/// ## 逻辑 (How)
/// - `ordered` 以 `(deadline, id)` 排序，`next_deadline` 取首元素；
/// - `by_id` 反查截止时间，用于取消。
///
/// ## 契约 (What)
/// - `schedule` 传入 `None` 表示不限时，不会登记；
/// - `expired(now)` 移除并按截止顺序返回所有 `deadline <= now` 的操作。
#[derive(Debug, Default)]
pub(crate) struct TimeoutManager {
    ordered: BTreeSet<(Instant, OpId)>,
    by_id: HashMap<OpId, Instant>,
}

impl TimeoutManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn schedule(&mut self, id: OpId, deadline: Option<Instant>) {
        let Some(deadline) = deadline else {
            return;
        };
        if let Some(previous) = self.by_id.insert(id, deadline) {
            self.ordered.remove(&(previous, id));
        }
        self.ordered.insert((deadline, id));
    }

    pub(crate) fn cancel(&mut self, id: OpId) {
        if let Some(deadline) = self.by_id.remove(&id) {
            self.ordered.remove(&(deadline, id));
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.ordered.first().map(|(deadline, _)| *deadline)
    }

    pub(crate) fn expired(&mut self, now: Instant) -> Vec<OpId> {
        let mut expired = Vec::new();
        while let Some(&(deadline, id)) = self.ordered.first() {
            if deadline > now {
                break;
            }
            self.ordered.pop_first();
            self.by_id.remove(&id);
            expired.push(id);
        }
        expired
    }

    pub(crate) fn clear(&mut self) {
        self.ordered.clear();
        self.by_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expired_returns_ids_in_deadline_order() {
        let base = Instant::now();
        let mut timeouts = TimeoutManager::new();
        timeouts.schedule(1, Some(base + Duration::from_millis(30)));
        timeouts.schedule(2, Some(base + Duration::from_millis(10)));
        timeouts.schedule(3, None);
        timeouts.schedule(4, Some(base + Duration::from_millis(50)));

        assert_eq!(timeouts.next_deadline(), Some(base + Duration::from_millis(10)));
        assert_eq!(timeouts.expired(base + Duration::from_millis(30)), vec![2, 1]);
        assert_eq!(timeouts.next_deadline(), Some(base + Duration::from_millis(50)));
    }

    #[test]
    fn cancel_removes_pending_deadline() {
        let base = Instant::now();
        let mut timeouts = TimeoutManager::new();
        timeouts.schedule(1, Some(base));
        timeouts.cancel(1);
        timeouts.cancel(1);
        assert_eq!(timeouts.next_deadline(), None);
        assert!(timeouts.expired(base + Duration::from_secs(1)).is_empty());
    }
}
