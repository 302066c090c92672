//! JSON Lines 编解码
//!
//! 每帧一行紧凑 JSON。serde_json 会转义字符串里的所有控制字符，因此负载中不会出现裸换行。
//! 解码侧不因坏帧报错：格式错误与超长帧都作为 [`Frame`] 变体交给上层记录并丢弃，
//! 否则 `FramedRead` 会在第一个错误后终止整条连接。

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::envelope::Envelope;

/// 解码结果
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Envelope(Envelope),
    /// 不是合法报文；preview 为行首若干字符
    Malformed { error: String, preview: String },
    /// 超过 max_frame_bytes，整行已被跳过
    Oversized,
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

const PREVIEW_CHARS: usize = 80;

#[derive(Debug)]
pub struct EnvelopeCodec {
    lines: LinesCodec,
    max_frame: usize,
}

impl EnvelopeCodec {
    pub fn new(max_frame: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_frame),
            max_frame,
        }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    fn parse(line: String) -> Frame {
        match serde_json::from_str::<Envelope>(&line) {
            Ok(envelope) => Frame::Envelope(envelope),
            Err(e) => Frame::Malformed {
                error: e.to_string(),
                preview: line.chars().take(PREVIEW_CHARS).collect(),
            },
        }
    }

    fn next_frame(
        &mut self,
        src: &mut BytesMut,
        at_eof: bool,
    ) -> Result<Option<Frame>, CodecError> {
        loop {
            let line = if at_eof {
                self.lines.decode_eof(src)
            } else {
                self.lines.decode(src)
            };
            match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Ok(Some(Self::parse(line))),
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => return Ok(Some(Frame::Oversized)),
                Err(LinesCodecError::Io(e)) => return Err(CodecError::Io(e)),
            }
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        self.next_frame(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        self.next_frame(src, true)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), CodecError> {
        let encoded = serde_json::to_vec(&item)?;
        dst.reserve(encoded.len() + 1);
        dst.put_slice(&encoded);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CallId, Response};
    use serde_json::json;

    fn decode_all(codec: &mut EnvelopeCodec, raw: &str) -> Vec<Frame> {
        let mut buf = BytesMut::from(raw);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        while let Some(frame) = codec.decode_eof(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_encoded_frame_is_single_line() {
        let mut codec = EnvelopeCodec::new(1024);
        let mut dst = BytesMut::new();
        let env = Envelope::Response(Response::ok(CallId::from("s1-1"), json!("line one\nline two")));
        codec.encode(env.clone(), &mut dst).unwrap();

        let text = std::str::from_utf8(&dst).unwrap();
        assert_eq!(text.matches('\n').count(), 1);
        assert!(text.ends_with('\n'));

        let frames = decode_all(&mut codec, text);
        assert_eq!(frames, vec![Frame::Envelope(env)]);
    }

    #[test]
    fn test_malformed_line_does_not_stop_stream() {
        let mut codec = EnvelopeCodec::new(1024);
        let raw = "not json at all\n\n{\"type\":\"cancel\",\"id\":\"s1-4\"}\n";
        let frames = decode_all(&mut codec, raw);
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], Frame::Malformed { preview, .. } if preview == "not json at all"));
        assert_eq!(
            frames[1],
            Frame::Envelope(Envelope::Cancel { id: CallId::from("s1-4") })
        );
    }

    #[test]
    fn test_oversized_line_skipped() {
        let mut codec = EnvelopeCodec::new(32);
        let raw = format!("{}\n{{\"type\":\"cancel\",\"id\":\"a\"}}\n", "x".repeat(100));
        let frames = decode_all(&mut codec, &raw);
        assert_eq!(frames[0], Frame::Oversized);
        assert_eq!(
            frames.last(),
            Some(&Frame::Envelope(Envelope::Cancel { id: CallId::from("a") }))
        );
    }

    #[test]
    fn test_partial_line_waits_for_more() {
        let mut codec = EnvelopeCodec::new(1024);
        let mut buf = BytesMut::from("{\"type\":\"cancel\",");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\"id\":\"b\"}\n");
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Frame::Envelope(_))));
    }
}
