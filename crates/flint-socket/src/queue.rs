//! 读写操作队列：每个方向严格 FIFO，只推进队首操作。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 把“应用想要什么”（读到长度、读到分隔符、读当前可用）与“套接字此刻给了多少”解耦；
//! - 队列本身不做 IO：读方向从 [`ByteBuffer`] 取字节，写方向交给 [`WriteSink`]，
//!   因此明文与 TLS 两条路径共用同一套完成判定。
//!
//! ## 逻辑 (How)
//! - 读：队首操作按条件从源缓冲中只取自己需要的字节；分隔符扫描只检查新字节加上
//!   `delimiter.len() - 1` 的重叠窗口；完成后继续评估下一个队首，直到无法推进；
//! - 写：队首操作尽力发送剩余字节，全部交给汇之后再等待汇确认“落地”才算完成；
//! - TLS 升级以屏障形式同时进入两个方向的队列，屏障之前的操作全部完成后才能开始握手。
//!
//! ## 契约 (What)
//! - 任一时刻每个方向至多一个操作处于推进状态；
//! - 每个被移出队列的操作都恰好产生一个完成或失败事件（由驱动层负责发出）。

use std::{collections::VecDeque, io};

use bytes::Bytes;
use flint_buffer::ByteBuffer;

use crate::error::{Direction, SocketError};

/// 调用方提供的关联标签，原样出现在完成事件中。
pub type Tag = u64;

/// 队列内部分配的操作标识，用于超时取消。
pub(crate) type OpId = u64;

/// 读操作的完成条件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadCondition {
    /// 恰好读满 `n` 个字节。
    ToLength(usize),
    /// 读到首个分隔符为止（包含分隔符）。
    ToDelimiter(Bytes),
    /// 读取当前已缓冲的全部字节；缓冲为空时，在下一次可读事件上以零字节完成。
    Available,
}

#[derive(Debug)]
pub(crate) struct ReadOperation {
    id: OpId,
    tag: Tag,
    condition: ReadCondition,
    max_length: usize,
    accumulated: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct WriteOperation {
    id: OpId,
    tag: Tag,
    data: Bytes,
    sent: usize,
    flush_mark: Option<u64>,
}

#[derive(Debug)]
enum Entry<T> {
    Op(T),
    Upgrade,
}

/// 读方向推进产生的事件。
#[derive(Debug)]
pub(crate) enum ReadEvent {
    Completed { id: OpId, tag: Tag, data: Bytes },
    Progress { tag: Tag, done: usize },
    Failed { id: OpId, tag: Tag, error: SocketError },
}

/// 写方向推进产生的事件。
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WriteEvent {
    Completed { id: OpId, tag: Tag },
    Progress { tag: Tag, done: usize },
}

/// 写方向的字节去处：明文直接写套接字，TLS 模式下先加密进密文缓冲。
pub(crate) trait WriteSink {
    /// 尽力接收字节，返回接收的字节数；无法接收时返回 `WouldBlock`。
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// 截至目前已接收字节对应的落地标记。
    fn commit_mark(&self) -> u64;

    /// 标记对应的字节是否已经真正写入套接字。
    fn is_flushed(&self, mark: u64) -> bool;
}

enum Step {
    Complete,
    Pending,
    Oversized,
}

impl ReadOperation {
    fn advance(&mut self, source: &mut ByteBuffer, readable_event: bool) -> Result<Step, SocketError> {
        match &self.condition {
            ReadCondition::ToLength(target) => {
                let wanted = target - self.accumulated.len();
                let take = wanted.min(source.available_to_read());
                source.consume_into(take, &mut self.accumulated)?;
                if self.accumulated.len() == *target {
                    Ok(Step::Complete)
                } else {
                    Ok(Step::Pending)
                }
            }
            ReadCondition::Available => {
                let available = source.available_to_read();
                if available == 0 {
                    return Ok(if readable_event {
                        Step::Complete
                    } else {
                        Step::Pending
                    });
                }
                let take = if self.max_length > 0 {
                    available.min(self.max_length)
                } else {
                    available
                };
                source.consume_into(take, &mut self.accumulated)?;
                Ok(Step::Complete)
            }
            ReadCondition::ToDelimiter(delimiter) => {
                let overlap = (delimiter.len() - 1).min(self.accumulated.len());
                let tail = &self.accumulated[self.accumulated.len() - overlap..];
                let found = match_end(tail, source.readable(), delimiter);
                if let Some(take) = found {
                    if self.max_length > 0 && self.accumulated.len() + take > self.max_length {
                        return Ok(Step::Oversized);
                    }
                    source.consume_into(take, &mut self.accumulated)?;
                    return Ok(Step::Complete);
                }
                let available = source.available_to_read();
                let take = if self.max_length > 0 {
                    available.min(self.max_length - self.accumulated.len())
                } else {
                    available
                };
                source.consume_into(take, &mut self.accumulated)?;
                if self.max_length > 0 && self.accumulated.len() >= self.max_length {
                    Ok(Step::Oversized)
                } else {
                    Ok(Step::Pending)
                }
            }
        }
    }
}

/// 在 `tail ++ fresh` 中查找首个分隔符，返回需要从 `fresh` 取走的字节数（含分隔符）。
///
/// `tail` 是此前已扫描字节的末尾 `delimiter.len() - 1` 个字节，只用于捕获跨批次的匹配。
fn match_end(tail: &[u8], fresh: &[u8], delimiter: &[u8]) -> Option<usize> {
    let width = delimiter.len();
    if !tail.is_empty() {
        let mut joined = Vec::with_capacity(tail.len() + width - 1);
        joined.extend_from_slice(tail);
        joined.extend_from_slice(&fresh[..fresh.len().min(width - 1)]);
        if let Some(position) = find(&joined, delimiter) {
            return Some(position + width - tail.len());
        }
    }
    find(fresh, delimiter).map(|position| position + width)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// 双向操作队列。
#[derive(Debug, Default)]
pub(crate) struct OperationQueue {
    reads: VecDeque<Entry<ReadOperation>>,
    writes: VecDeque<Entry<WriteOperation>>,
    next_id: OpId,
}

impl OperationQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> OpId {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn enqueue_read(
        &mut self,
        condition: ReadCondition,
        max_length: usize,
        tag: Tag,
    ) -> OpId {
        let id = self.allocate_id();
        self.reads.push_back(Entry::Op(ReadOperation {
            id,
            tag,
            condition,
            max_length,
            accumulated: Vec::new(),
        }));
        id
    }

    pub(crate) fn enqueue_write(&mut self, data: Bytes, tag: Tag) -> OpId {
        let id = self.allocate_id();
        self.writes.push_back(Entry::Op(WriteOperation {
            id,
            tag,
            data,
            sent: 0,
            flush_mark: None,
        }));
        id
    }

    /// 在两个方向同时插入 TLS 升级屏障。
    pub(crate) fn enqueue_upgrade(&mut self) {
        self.reads.push_back(Entry::Upgrade);
        self.writes.push_back(Entry::Upgrade);
    }

    /// 两个方向的队首都是升级屏障时，屏障之前的操作已全部完成。
    pub(crate) fn upgrade_ready(&self) -> bool {
        matches!(self.reads.front(), Some(Entry::Upgrade))
            && matches!(self.writes.front(), Some(Entry::Upgrade))
    }

    pub(crate) fn take_upgrade(&mut self) {
        if self.upgrade_ready() {
            self.reads.pop_front();
            self.writes.pop_front();
        }
    }

    pub(crate) fn has_pending_read(&self) -> bool {
        matches!(self.reads.front(), Some(Entry::Op(_)))
    }

    /// 队首写操作仍有字节未交给汇。
    pub(crate) fn head_write_pending(&self) -> bool {
        matches!(self.writes.front(), Some(Entry::Op(op)) if op.sent < op.data.len())
    }

    pub(crate) fn reads_idle(&self) -> bool {
        self.reads.is_empty()
    }

    pub(crate) fn writes_idle(&self) -> bool {
        self.writes.is_empty()
    }

    pub(crate) fn head_read_id(&self) -> Option<OpId> {
        match self.reads.front() {
            Some(Entry::Op(op)) => Some(op.id),
            _ => None,
        }
    }

    pub(crate) fn head_write_id(&self) -> Option<OpId> {
        match self.writes.front() {
            Some(Entry::Op(op)) => Some(op.id),
            _ => None,
        }
    }

    /// 推进读方向：反复评估队首，直到无法继续。
    ///
    /// `readable_event` 表示本轮由一次可读事件驱动，只用于让空缓冲上的
    /// [`ReadCondition::Available`] 以零字节完成，且最多消费一次。
    pub(crate) fn advance_reads(
        &mut self,
        source: &mut ByteBuffer,
        readable_event: bool,
    ) -> Vec<ReadEvent> {
        let mut events = Vec::new();
        let mut readable_event = readable_event;
        while let Some(Entry::Op(head)) = self.reads.front_mut() {
            let before = head.accumulated.len();
            let step = head.advance(source, readable_event);
            let (id, tag) = (head.id, head.tag);
            match step {
                Ok(Step::Complete) => {
                    readable_event = false;
                    if let Some(Entry::Op(op)) = self.reads.pop_front() {
                        events.push(ReadEvent::Completed {
                            id,
                            tag,
                            data: Bytes::from(op.accumulated),
                        });
                    }
                }
                Ok(Step::Pending) => {
                    if head.accumulated.len() > before {
                        events.push(ReadEvent::Progress {
                            tag,
                            done: head.accumulated.len(),
                        });
                    }
                    break;
                }
                Ok(Step::Oversized) => {
                    let max_length = head.max_length;
                    self.reads.pop_front();
                    events.push(ReadEvent::Failed {
                        id,
                        tag,
                        error: SocketError::OversizedRead { tag, max_length },
                    });
                    break;
                }
                Err(error) => {
                    self.reads.pop_front();
                    events.push(ReadEvent::Failed { id, tag, error });
                    break;
                }
            }
        }
        events
    }

    /// 推进写方向：只处理队首，按顺序完成已落地的操作。
    pub(crate) fn advance_writes<S: WriteSink>(&mut self, sink: &mut S) -> io::Result<Vec<WriteEvent>> {
        let mut events = Vec::new();
        while let Some(Entry::Op(head)) = self.writes.front_mut() {
            let before = head.sent;
            while head.sent < head.data.len() {
                match sink.send(&head.data[head.sent..]) {
                    Ok(0) => break,
                    Ok(n) => head.sent += n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }
            if head.sent < head.data.len() {
                if head.sent > before {
                    events.push(WriteEvent::Progress {
                        tag: head.tag,
                        done: head.sent,
                    });
                }
                break;
            }
            let mark = *head.flush_mark.get_or_insert_with(|| sink.commit_mark());
            if !sink.is_flushed(mark) {
                break;
            }
            let (id, tag) = (head.id, head.tag);
            self.writes.pop_front();
            events.push(WriteEvent::Completed { id, tag });
        }
        Ok(events)
    }

    /// 按 id 移除一个尚未完成的操作（超时路径）。
    pub(crate) fn remove(&mut self, id: OpId) -> Option<(Direction, Tag)> {
        if let Some(index) = self
            .reads
            .iter()
            .position(|entry| matches!(entry, Entry::Op(op) if op.id == id))
            && let Some(Entry::Op(op)) = self.reads.remove(index)
        {
            return Some((Direction::Read, op.tag));
        }
        if let Some(index) = self
            .writes
            .iter()
            .position(|entry| matches!(entry, Entry::Op(op) if op.id == id))
            && let Some(Entry::Op(op)) = self.writes.remove(index)
        {
            return Some((Direction::Write, op.tag));
        }
        None
    }

    /// 清空两个方向，按 FIFO 顺序返回尚未完成的操作，屏障被丢弃。
    pub(crate) fn drain(&mut self) -> Vec<(Direction, OpId, Tag)> {
        let reads = self.reads.drain(..).filter_map(|entry| match entry {
            Entry::Op(op) => Some((Direction::Read, op.id, op.tag)),
            Entry::Upgrade => None,
        });
        let writes = self.writes.drain(..).filter_map(|entry| match entry {
            Entry::Op(op) => Some((Direction::Write, op.id, op.tag)),
            Entry::Upgrade => None,
        });
        reads.chain(writes).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn completed(events: &[ReadEvent]) -> Vec<(Tag, Vec<u8>)> {
        events
            .iter()
            .filter_map(|event| match event {
                ReadEvent::Completed { tag, data, .. } => Some((*tag, data.to_vec())),
                _ => None,
            })
            .collect()
    }

    /// 记录写入字节的内存汇，可设定每次最多接收的字节数与落地进度。
    struct MemorySink {
        written: Vec<u8>,
        per_call: usize,
        flushed: u64,
    }

    impl WriteSink for MemorySink {
        fn send(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.per_call == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = data.len().min(self.per_call);
            self.written.extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn commit_mark(&self) -> u64 {
            self.written.len() as u64
        }

        fn is_flushed(&self, mark: u64) -> bool {
            self.flushed >= mark
        }
    }

    #[test]
    fn delimiter_split_across_deliveries_matches_first_occurrence() {
        let mut queue = OperationQueue::new();
        let mut source = ByteBuffer::new();
        queue.enqueue_read(ReadCondition::ToDelimiter(Bytes::from_static(b"\r\n")), 0, 1);
        queue.enqueue_read(ReadCondition::ToDelimiter(Bytes::from_static(b"\r\n")), 0, 2);

        source.append(b"GET / HTTP/1.1\r");
        let events = queue.advance_reads(&mut source, false);
        assert!(completed(&events).is_empty());
        assert!(matches!(events.as_slice(), [ReadEvent::Progress { tag: 1, done: 15 }]));

        source.append(b"\nHost: a\r\nrest");
        let events = queue.advance_reads(&mut source, false);
        assert_eq!(
            completed(&events),
            vec![
                (1, b"GET / HTTP/1.1\r\n".to_vec()),
                (2, b"Host: a\r\n".to_vec()),
            ]
        );
        assert_eq!(source.readable(), b"rest", "匹配之后的字节留给下一个操作");
    }

    #[test]
    fn delimiter_without_match_within_max_length_is_oversized() {
        let mut queue = OperationQueue::new();
        let mut source = ByteBuffer::new();
        queue.enqueue_read(ReadCondition::ToDelimiter(Bytes::from_static(b"\n")), 4, 9);
        source.append(b"abcdef");
        let events = queue.advance_reads(&mut source, false);
        assert!(matches!(
            events.as_slice(),
            [ReadEvent::Failed {
                tag: 9,
                error: SocketError::OversizedRead { max_length: 4, .. },
                ..
            }]
        ));
        assert!(queue.reads_idle());
    }

    #[test]
    fn delimiter_ending_past_max_length_is_oversized() {
        let mut queue = OperationQueue::new();
        let mut source = ByteBuffer::new();
        queue.enqueue_read(ReadCondition::ToDelimiter(Bytes::from_static(b"\r\n")), 4, 3);
        source.append(b"abc\r\n");
        let events = queue.advance_reads(&mut source, false);
        assert!(matches!(events.as_slice(), [ReadEvent::Failed { tag: 3, .. }]));
    }

    #[test]
    fn exact_length_takes_only_what_it_needs() {
        let mut queue = OperationQueue::new();
        let mut source = ByteBuffer::new();
        queue.enqueue_read(ReadCondition::ToLength(3), 0, 1);
        source.append(b"abcdef");
        let events = queue.advance_reads(&mut source, false);
        assert_eq!(completed(&events), vec![(1, b"abc".to_vec())]);
        assert_eq!(source.available_to_read(), 3);
    }

    #[test]
    fn available_completes_with_zero_bytes_only_on_readable_event() {
        let mut queue = OperationQueue::new();
        let mut source = ByteBuffer::new();
        queue.enqueue_read(ReadCondition::Available, 0, 1);
        queue.enqueue_read(ReadCondition::Available, 0, 2);
        assert!(queue.advance_reads(&mut source, false).is_empty());

        let events = queue.advance_reads(&mut source, true);
        assert_eq!(completed(&events), vec![(1, Vec::new())]);
        assert!(queue.has_pending_read(), "一次可读事件只完成一个空读");
    }

    #[test]
    fn available_respects_max_length() {
        let mut queue = OperationQueue::new();
        let mut source = ByteBuffer::new();
        queue.enqueue_read(ReadCondition::Available, 4, 1);
        source.append(b"0123456789");
        let events = queue.advance_reads(&mut source, false);
        assert_eq!(completed(&events), vec![(1, b"0123".to_vec())]);
    }

    #[test]
    fn upgrade_barrier_blocks_later_operations() {
        let mut queue = OperationQueue::new();
        let mut source = ByteBuffer::new();
        queue.enqueue_read(ReadCondition::ToLength(2), 0, 1);
        queue.enqueue_upgrade();
        queue.enqueue_read(ReadCondition::ToLength(2), 0, 2);
        source.append(b"abcd");

        let events = queue.advance_reads(&mut source, false);
        assert_eq!(completed(&events), vec![(1, b"ab".to_vec())]);
        assert_eq!(source.readable(), b"cd", "屏障之后的字节保持未消费");
        assert!(queue.upgrade_ready());
        queue.take_upgrade();
        let events = queue.advance_reads(&mut source, false);
        assert_eq!(completed(&events), vec![(2, b"cd".to_vec())]);
    }

    #[test]
    fn writes_complete_in_order_after_flush() {
        let mut queue = OperationQueue::new();
        let a = queue.enqueue_write(Bytes::from_static(b"hello"), 1);
        let b = queue.enqueue_write(Bytes::from_static(b"world"), 2);
        let mut sink = MemorySink {
            written: Vec::new(),
            per_call: 3,
            flushed: 0,
        };

        let events = queue.advance_writes(&mut sink).expect("内存汇不会报错");
        assert!(
            !events.iter().any(|e| matches!(e, WriteEvent::Completed { .. })),
            "尚未落地的写不能完成"
        );
        assert_eq!(sink.written, b"hello");

        sink.flushed = 5;
        let events = queue.advance_writes(&mut sink).expect("内存汇不会报错");
        assert_eq!(events.first(), Some(&WriteEvent::Completed { id: a, tag: 1 }));

        sink.flushed = u64::MAX;
        let events = queue.advance_writes(&mut sink).expect("内存汇不会报错");
        assert_eq!(events.last(), Some(&WriteEvent::Completed { id: b, tag: 2 }));
        assert_eq!(sink.written, b"helloworld");
        assert!(queue.writes_idle());
    }

    #[test]
    fn blocked_sink_reports_no_progress() {
        let mut queue = OperationQueue::new();
        queue.enqueue_write(Bytes::from_static(b"data"), 1);
        let mut sink = MemorySink {
            written: Vec::new(),
            per_call: 0,
            flushed: 0,
        };
        let events = queue.advance_writes(&mut sink).expect("WouldBlock 不是错误");
        assert!(events.is_empty());
        assert!(queue.head_write_pending());
    }

    #[test]
    fn remove_and_drain_skip_barriers() {
        let mut queue = OperationQueue::new();
        let r = queue.enqueue_read(ReadCondition::ToLength(1), 0, 10);
        queue.enqueue_upgrade();
        let w = queue.enqueue_write(Bytes::from_static(b"x"), 20);
        assert_eq!(queue.remove(r), Some((Direction::Read, 10)));
        assert_eq!(queue.remove(r), None);
        assert_eq!(queue.drain(), vec![(Direction::Write, w, 20)]);
        assert!(queue.reads_idle() && queue.writes_idle());
    }

    proptest! {
        #[test]
        fn exact_length_survives_any_fragmentation(
            payload in prop::collection::vec(any::<u8>(), 1..512),
            cuts in prop::collection::vec(1usize..64, 1..64),
        ) {
            let mut queue = OperationQueue::new();
            let mut source = ByteBuffer::new();
            queue.enqueue_read(ReadCondition::ToLength(payload.len()), 0, 7);

            let mut delivered = 0;
            let mut results = Vec::new();
            let mut cuts = cuts.into_iter().cycle();
            while delivered < payload.len() {
                let size = cuts.next().unwrap_or(1).min(payload.len() - delivered);
                source.append(&payload[delivered..delivered + size]);
                delivered += size;
                results.extend(completed(&queue.advance_reads(&mut source, true)));
            }
            prop_assert_eq!(results, vec![(7, payload)]);
        }

        #[test]
        fn delimiter_found_at_first_occurrence_under_fragmentation(
            prefix in prop::collection::vec(0u8..8, 0..128),
            suffix in prop::collection::vec(any::<u8>(), 0..32),
            cuts in prop::collection::vec(1usize..8, 1..32),
        ) {
            let delimiter: &[u8] = &[0xAB, 0xCD, 0xEF];
            let mut stream = prefix.clone();
            stream.extend_from_slice(delimiter);
            stream.extend_from_slice(&suffix);

            let mut queue = OperationQueue::new();
            let mut source = ByteBuffer::new();
            queue.enqueue_read(ReadCondition::ToDelimiter(Bytes::copy_from_slice(delimiter)), 0, 1);

            let mut delivered = 0;
            let mut results = Vec::new();
            let mut cuts = cuts.into_iter().cycle();
            while delivered < stream.len() {
                let size = cuts.next().unwrap_or(1).min(stream.len() - delivered);
                source.append(&stream[delivered..delivered + size]);
                delivered += size;
                results.extend(completed(&queue.advance_reads(&mut source, false)));
            }
            let mut expected = prefix;
            expected.extend_from_slice(delimiter);
            prop_assert_eq!(results, vec![(1, expected)]);
            prop_assert_eq!(source.readable(), suffix.as_slice());
        }
    }
}
