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

//! The typed protocol client.
//!
//! [`StoreServer`] is the seam between the caching store and the
//! authoritative server: one method per remote call, stateless, safe to
//! invoke from any thread. [`RemoteStoreServer`] speaks the wire protocol
//! over TCP with one request in flight per connection; tests substitute an
//! in-memory implementation. Retrying transient failures is the caller's
//! job, so a single failed call maps to a single `Io` error here.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;

use parking_lot::Mutex;
use tracing::debug;

use jaaldb_core::{JaalError, Result};

use crate::frame::{Frame, FrameKind, FrameReader, FrameWriter};
use crate::message::{
    GetBindingForRemoveResults, GetBindingForUpdateResults, GetBindingResults,
    GetObjectForUpdateResults, GetObjectResults, NextBoundNameResults, NextObjectResults,
    ObjectIdRange, RegisterNodeResult, Request, Response, UpdateItem, UpgradeObjectResults,
};

/// The authoritative server's request interface.
pub trait StoreServer: Send + Sync {
    fn register_node(&self, callback_port: u16) -> Result<RegisterNodeResult>;
    fn new_object_ids(&self, node_id: u64, count: u64) -> Result<ObjectIdRange>;
    fn get_object(&self, node_id: u64, oid: u64) -> Result<GetObjectResults>;
    fn get_object_for_update(&self, node_id: u64, oid: u64) -> Result<GetObjectForUpdateResults>;
    fn upgrade_object(&self, node_id: u64, oid: u64) -> Result<UpgradeObjectResults>;
    fn get_binding(&self, node_id: u64, name: &str) -> Result<GetBindingResults>;
    fn get_binding_for_update(&self, node_id: u64, name: &str)
        -> Result<GetBindingForUpdateResults>;
    fn get_binding_for_remove(&self, node_id: u64, name: &str)
        -> Result<GetBindingForRemoveResults>;
    fn next_bound_name(&self, node_id: u64, name: Option<&str>) -> Result<NextBoundNameResults>;
    fn next_object_id(&self, node_id: u64, oid: Option<u64>) -> Result<Option<NextObjectResults>>;
    fn get_class_id(&self, node_id: u64, info: &[u8]) -> Result<u32>;
    fn get_class_info(&self, node_id: u64, class_id: u32) -> Result<Option<Vec<u8>>>;
}

/// The update-queue connection: ships one item and blocks until the server
/// acknowledges it.
pub trait UpdateSender: Send + Sync {
    fn send(&self, item: UpdateItem) -> Result<()>;
}

// =============================================================================
// TCP connection plumbing
// =============================================================================

struct Connection {
    reader: FrameReader<BufReader<TcpStream>>,
    writer: FrameWriter<BufWriter<TcpStream>>,
}

impl Connection {
    fn open(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        let reader = FrameReader::new(BufReader::new(stream.try_clone()?));
        let writer = FrameWriter::new(BufWriter::new(stream));
        Ok(Self { reader, writer })
    }

    fn round_trip(&mut self, frame: &Frame) -> Result<Frame> {
        self.writer.write_frame(frame)?;
        self.reader.read_frame()
    }
}

/// Shared connect-on-demand state. The connection is dropped on any error
/// so the next call reconnects from scratch.
struct Endpoint {
    host: String,
    port: u16,
    conn: Mutex<Option<Connection>>,
}

impl Endpoint {
    fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            conn: Mutex::new(None),
        }
    }

    fn round_trip(&self, frame: &Frame) -> Result<Frame> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            debug!(host = %self.host, port = self.port, "connecting");
            *guard = Some(Connection::open(&self.host, self.port)?);
        }
        let result = match guard.as_mut() {
            Some(conn) => conn.round_trip(frame),
            None => return Err(JaalError::IllegalState("connection unavailable".into())),
        };
        if result.is_err() {
            *guard = None;
        }
        result
    }
}

// =============================================================================
// RemoteStoreServer
// =============================================================================

/// [`StoreServer`] over a TCP connection to the authoritative server.
pub struct RemoteStoreServer {
    endpoint: Endpoint,
}

impl RemoteStoreServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: Endpoint::new(host.into(), port),
        }
    }

    fn call(&self, request: Request) -> Result<Response> {
        let op = request.op();
        let frame = Frame::new(FrameKind::Request, request.encode());
        let reply = self.endpoint.round_trip(&frame)?;
        match reply.kind {
            FrameKind::Response => Response::decode(&reply.payload, op),
            FrameKind::Error => {
                let message = String::from_utf8_lossy(&reply.payload).into_owned();
                Err(JaalError::Protocol(format!("server error: {}", message)))
            }
            other => Err(JaalError::Protocol(format!(
                "unexpected frame kind {:?} in reply",
                other
            ))),
        }
    }
}

/// Maps an unexpected response variant to a protocol error.
macro_rules! expect_response {
    ($value:expr, $variant:ident) => {
        match $value {
            Response::$variant(results) => Ok(results),
            other => Err(JaalError::Protocol(format!(
                "mismatched response variant for {} call: {:?}",
                stringify!($variant),
                other
            ))),
        }
    };
}

impl StoreServer for RemoteStoreServer {
    fn register_node(&self, callback_port: u16) -> Result<RegisterNodeResult> {
        expect_response!(
            self.call(Request::RegisterNode { callback_port })?,
            RegisterNode
        )
    }

    fn new_object_ids(&self, node_id: u64, count: u64) -> Result<ObjectIdRange> {
        expect_response!(
            self.call(Request::NewObjectIds { node_id, count })?,
            NewObjectIds
        )
    }

    fn get_object(&self, node_id: u64, oid: u64) -> Result<GetObjectResults> {
        expect_response!(self.call(Request::GetObject { node_id, oid })?, GetObject)
    }

    fn get_object_for_update(&self, node_id: u64, oid: u64) -> Result<GetObjectForUpdateResults> {
        expect_response!(
            self.call(Request::GetObjectForUpdate { node_id, oid })?,
            GetObjectForUpdate
        )
    }

    fn upgrade_object(&self, node_id: u64, oid: u64) -> Result<UpgradeObjectResults> {
        expect_response!(
            self.call(Request::UpgradeObject { node_id, oid })?,
            UpgradeObject
        )
    }

    fn get_binding(&self, node_id: u64, name: &str) -> Result<GetBindingResults> {
        expect_response!(
            self.call(Request::GetBinding {
                node_id,
                name: name.to_string(),
            })?,
            GetBinding
        )
    }

    fn get_binding_for_update(
        &self,
        node_id: u64,
        name: &str,
    ) -> Result<GetBindingForUpdateResults> {
        expect_response!(
            self.call(Request::GetBindingForUpdate {
                node_id,
                name: name.to_string(),
            })?,
            GetBindingForUpdate
        )
    }

    fn get_binding_for_remove(
        &self,
        node_id: u64,
        name: &str,
    ) -> Result<GetBindingForRemoveResults> {
        expect_response!(
            self.call(Request::GetBindingForRemove {
                node_id,
                name: name.to_string(),
            })?,
            GetBindingForRemove
        )
    }

    fn next_bound_name(&self, node_id: u64, name: Option<&str>) -> Result<NextBoundNameResults> {
        expect_response!(
            self.call(Request::NextBoundName {
                node_id,
                name: name.map(str::to_string),
            })?,
            NextBoundName
        )
    }

    fn next_object_id(&self, node_id: u64, oid: Option<u64>) -> Result<Option<NextObjectResults>> {
        expect_response!(
            self.call(Request::NextObjectId { node_id, oid })?,
            NextObjectId
        )
    }

    fn get_class_id(&self, node_id: u64, info: &[u8]) -> Result<u32> {
        expect_response!(
            self.call(Request::GetClassId {
                node_id,
                info: info.to_vec(),
            })?,
            GetClassId
        )
    }

    fn get_class_info(&self, node_id: u64, class_id: u32) -> Result<Option<Vec<u8>>> {
        expect_response!(
            self.call(Request::GetClassInfo { node_id, class_id })?,
            GetClassInfo
        )
    }
}

// =============================================================================
// RemoteUpdateSender
// =============================================================================

/// [`UpdateSender`] over the dedicated update-queue connection.
pub struct RemoteUpdateSender {
    endpoint: Endpoint,
}

impl RemoteUpdateSender {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: Endpoint::new(host.into(), port),
        }
    }
}

impl UpdateSender for RemoteUpdateSender {
    fn send(&self, item: UpdateItem) -> Result<()> {
        let frame = Frame::new(FrameKind::Update, item.encode());
        let reply = self.endpoint.round_trip(&frame)?;
        match reply.kind {
            FrameKind::UpdateAck => Ok(()),
            FrameKind::Error => {
                let message = String::from_utf8_lossy(&reply.payload).into_owned();
                Err(JaalError::Protocol(format!(
                    "server rejected update: {}",
                    message
                )))
            }
            other => Err(JaalError::Protocol(format!(
                "unexpected frame kind {:?} on update queue",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::GetObjectResults;
    use std::net::TcpListener;
    use std::thread;

    /// One-shot server thread answering a single request with a canned
    /// response.
    fn serve_one(response: Response) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = FrameReader::new(BufReader::new(stream.try_clone().unwrap()));
            let mut writer = FrameWriter::new(BufWriter::new(stream));
            let frame = reader.read_frame().unwrap();
            assert_eq!(frame.kind, FrameKind::Request);
            Request::decode(&frame.payload).unwrap();
            writer
                .write_frame(&Frame::new(FrameKind::Response, response.encode()))
                .unwrap();
        });
        port
    }

    #[test]
    fn test_remote_get_object() {
        let port = serve_one(Response::GetObject(GetObjectResults {
            data: Some(vec![9, 9, 9]),
            callback_evict: false,
        }));
        let client = RemoteStoreServer::new("127.0.0.1", port);
        let results = client.get_object(1, 77).unwrap();
        assert_eq!(results.data, Some(vec![9, 9, 9]));
    }

    #[test]
    fn test_connection_error_is_transient() {
        // Nothing is listening on this port.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let client = RemoteStoreServer::new("127.0.0.1", port);
        let err = client.get_object(1, 1).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_update_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = FrameReader::new(BufReader::new(stream.try_clone().unwrap()));
            let mut writer = FrameWriter::new(BufWriter::new(stream));
            let frame = reader.read_frame().unwrap();
            assert_eq!(frame.kind, FrameKind::Update);
            UpdateItem::decode(&frame.payload).unwrap();
            writer
                .write_frame(&Frame::new(FrameKind::UpdateAck, Vec::new()))
                .unwrap();
        });
        let sender = RemoteUpdateSender::new("127.0.0.1", port);
        sender
            .send(UpdateItem::EvictObject { node_id: 1, oid: 5 })
            .unwrap();
    }
}
