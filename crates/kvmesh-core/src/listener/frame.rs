use bytes::{Bytes, BytesMut};

use crate::error::KvError;

/// 流式配置文档之间的分隔符。
pub const FRAME_DELIMITER: &[u8] = b"\n\n\n\n";

/// 把任意切分的字节块还原为完整的配置文档。
///
/// # 教案式说明
/// - **意图 (Why)**：HTTP 分块边界与文档边界无关，一个块可能包含半个文档或多个文档；
/// - **契约 (What)**：
///   - [`FrameDecoder::push`] 返回本次输入后完整出现的全部文档，按到达顺序排列；
///   - 仅含空白的文档被丢弃；
///   - 未完成文档累计超过 `max_frame_bytes` 时返回 [`KvError::Protocol`]，解码器随后不可再用；
/// - **执行 (How)**：记录已扫描位置，新输入只需从上次末尾回退 3 字节处继续查找分隔符。
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    scanned: usize,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            max_frame_bytes,
        }
    }

    /// 追加一个块并取出完整文档。
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, KvError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            let start = self.scanned.saturating_sub(FRAME_DELIMITER.len() - 1);
            let found = self.buffer[start..]
                .windows(FRAME_DELIMITER.len())
                .position(|window| window == FRAME_DELIMITER);
            let Some(offset) = found else {
                self.scanned = self.buffer.len();
                break;
            };
            let end = start + offset;
            let frame = self.buffer.split_to(end).freeze();
            let _ = self.buffer.split_to(FRAME_DELIMITER.len());
            self.scanned = 0;
            if frame.len() > self.max_frame_bytes {
                return Err(oversize(self.max_frame_bytes));
            }
            if !frame.iter().all(u8::is_ascii_whitespace) {
                frames.push(frame);
            }
        }
        if self.buffer.len() > self.max_frame_bytes {
            return Err(oversize(self.max_frame_bytes));
        }
        Ok(frames)
    }

    /// 尚未构成完整文档的字节数。
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn oversize(limit: usize) -> KvError {
    KvError::protocol(format!("config frame exceeds {limit} bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_documents_across_arbitrary_chunks() {
        let mut decoder = FrameDecoder::new(1024);
        assert!(decoder.push(b"{\"rev\":1}\n\n").expect("partial").is_empty());
        let frames = decoder.push(b"\n\n{\"rev\":2}\n\n\n\n{\"re").expect("two frames");
        assert_eq!(frames, vec![Bytes::from_static(b"{\"rev\":1}"), Bytes::from_static(b"{\"rev\":2}")]);
        assert_eq!(decoder.pending(), 4);
        let frames = decoder.push(b"v\":3}\n\n\n\n").expect("third");
        assert_eq!(frames, vec![Bytes::from_static(b"{\"rev\":3}")]);
    }

    #[test]
    fn blank_documents_are_skipped() {
        let mut decoder = FrameDecoder::new(1024);
        let frames = decoder.push(b"\n\n\n\n  \n\n\n\n{}\n\n\n\n").expect("frames");
        assert_eq!(frames, vec![Bytes::from_static(b"{}")]);
    }

    #[test]
    fn delimiter_split_byte_by_byte() {
        let mut decoder = FrameDecoder::new(1024);
        let mut frames = Vec::new();
        for byte in b"{\"a\":1}\n\n\n\n" {
            frames.extend(decoder.push(std::slice::from_ref(byte)).expect("push"));
        }
        assert_eq!(frames, vec![Bytes::from_static(b"{\"a\":1}")]);
    }

    #[test]
    fn oversize_frames_are_rejected() {
        let mut decoder = FrameDecoder::new(8);
        let err = decoder.push(b"0123456789").expect_err("too large");
        assert_eq!(err.code(), "kvmesh.connection.protocol");

        let mut decoder = FrameDecoder::new(8);
        assert!(decoder.push(b"0123456789\n\n\n\n").is_err());
    }
}
