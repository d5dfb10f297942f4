use std::{fmt, io};

use bytes::{Buf, Bytes};

use crate::error::BufferError;

/// 读游标越过该位置时触发机会式压缩。
pub const DEFAULT_SHRINK_THRESHOLD: usize = 64 * 1024;

/// 首次分配或扩容时的最小容量。
const MIN_CAPACITY: usize = 1024;

/// 带独立读写游标的字节缓冲。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 为套接字引擎提供“预读缓冲”“待写缓冲”“TLS 明文暂存”三类用途的统一实现；
/// - 支持从套接字直接读入（`spare` + `commit`），避免额外的中转拷贝。
///
/// ## 逻辑 (How)
/// - `storage` 的长度始终等于容量，且已零初始化，因此 `spare` 可以直接返回 `&mut [u8]`；
/// - 读写游标分别推进；读空时两个游标归零，读游标越过 `shrink_threshold` 时把未读字节
///   搬回起点；
/// - 写入空间不足时先尝试压缩，仍不足则按倍数扩容。
///
/// ## 契约 (What)
/// - `read ≤ write ≤ capacity` 在任何公开方法返回后都成立；
/// - `peek`/`consume`/`skip` 越界时返回 [`BufferError::InsufficientData`]；
/// - 不提供内部同步，调用方需保证串行访问。
///
/// ## 注意事项 (Trade-offs)
/// - 压缩采用 `copy_within`，代价与未读字节数成正比；阈值越大，拷贝越少但内存占用越高。
#[derive(Clone)]
pub struct ByteBuffer {
    storage: Vec<u8>,
    read: usize,
    write: usize,
    shrink_threshold: usize,
}

impl ByteBuffer {
    /// 创建空缓冲，首次写入时才分配内存。
    pub fn new() -> Self {
        Self {
            storage: Vec::new(),
            read: 0,
            write: 0,
            shrink_threshold: DEFAULT_SHRINK_THRESHOLD,
        }
    }

    /// 预分配指定容量。
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity],
            ..Self::new()
        }
    }

    /// 调整触发压缩的读游标阈值。
    pub fn with_shrink_threshold(mut self, threshold: usize) -> Self {
        self.shrink_threshold = threshold.max(1);
        self
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// 当前可读字节数。
    pub fn available_to_read(&self) -> usize {
        self.write - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// 借出全部未读字节，不推进读游标。
    pub fn readable(&self) -> &[u8] {
        &self.storage[self.read..self.write]
    }

    /// 借出前 `n` 个未读字节，不推进读游标。
    pub fn peek(&self, n: usize) -> Result<&[u8], BufferError> {
        self.check_available(n)?;
        Ok(&self.storage[self.read..self.read + n])
    }

    /// 取走前 `n` 个未读字节。
    pub fn consume(&mut self, n: usize) -> Result<Bytes, BufferError> {
        let out = Bytes::copy_from_slice(self.peek(n)?);
        self.advance_read(n);
        Ok(out)
    }

    /// 取走前 `n` 个未读字节并追加到 `dst`。
    pub fn consume_into(&mut self, n: usize, dst: &mut Vec<u8>) -> Result<(), BufferError> {
        dst.extend_from_slice(self.peek(n)?);
        self.advance_read(n);
        Ok(())
    }

    /// 丢弃前 `n` 个未读字节。
    pub fn skip(&mut self, n: usize) -> Result<(), BufferError> {
        self.check_available(n)?;
        self.advance_read(n);
        Ok(())
    }

    /// 追加字节，必要时扩容。
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.reserve(data.len());
        self.storage[self.write..self.write + data.len()].copy_from_slice(data);
        self.write += data.len();
    }

    /// 返回至少 `min` 字节的可写区域，配合 [`Self::commit`] 实现零拷贝填充。
    ///
    /// 返回的切片可能大于 `min`；写入多少字节就 `commit` 多少字节。
    pub fn spare(&mut self, min: usize) -> &mut [u8] {
        self.reserve(min.max(1));
        &mut self.storage[self.write..]
    }

    /// 确认 `spare` 区域中已写入 `n` 个字节。
    pub fn commit(&mut self, n: usize) -> Result<(), BufferError> {
        let spare = self.capacity() - self.write;
        if n > spare {
            return Err(BufferError::CommitOverflow {
                requested: n,
                spare,
            });
        }
        self.write += n;
        Ok(())
    }

    /// 将未读字节搬到起点，释放读游标之前的空间。
    pub fn compact(&mut self) {
        if self.read == 0 {
            return;
        }
        let len = self.available_to_read();
        self.storage.copy_within(self.read..self.write, 0);
        self.read = 0;
        self.write = len;
    }

    /// 丢弃所有未读字节，保留容量。
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    fn check_available(&self, requested: usize) -> Result<(), BufferError> {
        let available = self.available_to_read();
        if requested > available {
            return Err(BufferError::InsufficientData {
                requested,
                available,
            });
        }
        Ok(())
    }

    fn advance_read(&mut self, n: usize) {
        self.read += n;
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        } else if self.read >= self.shrink_threshold {
            self.compact();
        }
    }

    fn reserve(&mut self, additional: usize) {
        let tail = self.capacity() - self.write;
        if tail >= additional {
            return;
        }
        let len = self.available_to_read();
        // 压缩即可腾出足够空间时不扩容。
        if self.capacity() - len >= additional {
            self.compact();
            return;
        }
        let required = len + additional;
        let mut capacity = self.capacity().max(MIN_CAPACITY);
        while capacity < required {
            capacity = capacity.checked_mul(2).unwrap_or(required);
        }
        self.compact();
        self.storage.resize(capacity, 0);
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("read", &self.read)
            .field("write", &self.write)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Buf for ByteBuffer {
    fn remaining(&self) -> usize {
        self.available_to_read()
    }

    fn chunk(&self) -> &[u8] {
        self.readable()
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.available_to_read(),
            "cannot advance past the readable region"
        );
        self.advance_read(cnt);
    }
}

impl io::Read for ByteBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.available_to_read());
        buf[..n].copy_from_slice(&self.storage[self.read..self.read + n]);
        self.advance_read(n);
        Ok(n)
    }
}

impl io::Write for ByteBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
