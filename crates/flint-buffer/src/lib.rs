//! `flint-buffer` 提供套接字引擎内部使用的字节缓冲实现。
//!
//! # 模块定位（Why）
//! - 套接字引擎需要在“逻辑读写”与“物理套接字就绪”之间做解耦：待写数据、预读数据以及
//!   TLS 解密后尚未交付的明文都要暂存在一块可增长的内存中。
//! - 该缓冲由单个套接字独占，所有访问都发生在该套接字的串行执行域内，因此不做任何内部加锁。
//!
//! # 设计概要（How）
//! - [`ByteBuffer`] 以一块零初始化的 `Vec<u8>` 作为后备存储，维护独立的读游标与写游标；
//! - 写满时容量翻倍，读游标越过收缩阈值时机会式压缩，摊薄拷贝成本；
//! - 同时实现 `bytes::Buf`、`std::io::Read` 与 `std::io::Write`，可直接作为 TLS 记录层的
//!   输入源与输出汇。
//!
//! # 契约（What）
//! - 恒成立：`read ≤ write ≤ capacity`；
//! - `consume`/`peek` 请求超过可读字节时返回 [`BufferError::InsufficientData`]，从不截断。

mod byte_buffer;
mod error;

pub use byte_buffer::{ByteBuffer, DEFAULT_SHRINK_THRESHOLD};
pub use error::BufferError;
