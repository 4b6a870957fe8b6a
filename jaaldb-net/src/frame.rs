// SPDX-License-Identifier: AGPL-3.0-or-later
// JaalDB - Distributed Caching Object Store
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Length-prefixed message framing.
//!
//! Every connection carries frames of the shape
//! `[4-byte BE length][1-byte kind][payload]`. The length counts the payload
//! only. All multi-byte integers on this protocol are big-endian.

use std::io::{self, Read, Write};

use jaaldb_core::{JaalError, Result};

/// Upper bound on a single frame payload.
pub const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A typed request to the server.
    Request = 0,
    /// A typed response from the server.
    Response = 1,
    /// An error response; the payload is a UTF-8 message.
    Error = 2,
    /// A server-initiated callback request.
    Callback = 3,
    /// The boolean reply to a callback request.
    CallbackReply = 4,
    /// An update-queue item.
    Update = 5,
    /// Acknowledgement of an update-queue item.
    UpdateAck = 6,
}

impl TryFrom<u8> for FrameKind {
    type Error = JaalError;

    fn try_from(value: u8) -> std::result::Result<Self, JaalError> {
        match value {
            0 => Ok(FrameKind::Request),
            1 => Ok(FrameKind::Response),
            2 => Ok(FrameKind::Error),
            3 => Ok(FrameKind::Callback),
            4 => Ok(FrameKind::CallbackReply),
            5 => Ok(FrameKind::Update),
            6 => Ok(FrameKind::UpdateAck),
            other => Err(JaalError::Protocol(format!(
                "invalid frame kind: {}",
                other
            ))),
        }
    }
}

/// A complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn error(message: &str) -> Self {
        Self::new(FrameKind::Error, message.as_bytes().to_vec())
    }
}

/// Reads frames from a byte stream.
pub struct FrameReader<R: Read> {
    reader: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next frame. An EOF before the first header byte is
    /// surfaced as `Io` with `UnexpectedEof`; callers treat it as a closed
    /// connection.
    pub fn read_frame(&mut self) -> Result<Frame> {
        let mut header = [0u8; 5];
        self.reader.read_exact(&mut header)?;
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if length > MAX_PAYLOAD {
            return Err(JaalError::Protocol(format!(
                "frame payload of {} bytes exceeds the {} byte limit",
                length, MAX_PAYLOAD
            )));
        }
        let kind = FrameKind::try_from(header[4])?;
        let mut payload = vec![0u8; length as usize];
        self.reader.read_exact(&mut payload)?;
        Ok(Frame { kind, payload })
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writes frames to a byte stream.
pub struct FrameWriter<W: Write> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let length = frame.payload.len() as u32;
        if length > MAX_PAYLOAD {
            return Err(JaalError::Protocol(format!(
                "frame payload of {} bytes exceeds the {} byte limit",
                length, MAX_PAYLOAD
            )));
        }
        self.writer.write_all(&length.to_be_bytes())?;
        self.writer.write_all(&[frame.kind as u8])?;
        self.writer.write_all(&frame.payload)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Whether an error means the peer closed the connection.
pub fn is_closed(err: &JaalError) -> bool {
    matches!(err, JaalError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new(FrameKind::Request, b"hello".to_vec());
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(&frame).unwrap();
        let bytes = writer.into_inner();

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let parsed = reader.read_frame().unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_empty_payload() {
        let frame = Frame::new(FrameKind::UpdateAck, Vec::new());
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(&frame).unwrap();

        let mut reader = FrameReader::new(Cursor::new(writer.into_inner()));
        assert_eq!(reader.read_frame().unwrap(), frame);
    }

    #[test]
    fn test_rejects_oversized_length() {
        let mut bytes = (MAX_PAYLOAD + 1).to_be_bytes().to_vec();
        bytes.push(FrameKind::Request as u8);
        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_frame(),
            Err(JaalError::Protocol(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let mut bytes = 0u32.to_be_bytes().to_vec();
        bytes.push(200);
        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_frame(),
            Err(JaalError::Protocol(_))
        ));
    }

    #[test]
    fn test_eof_is_closed() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(is_closed(&err));
    }
}
