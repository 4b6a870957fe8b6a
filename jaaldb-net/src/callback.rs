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

//! The inbound callback listener.
//!
//! The authoritative server initiates evict and downgrade requests against
//! this node over a dedicated connection. Each request is answered with a
//! boolean: `true` means the request was satisfied synchronously, `false`
//! promises the node will settle it through the update queue once the entry
//! is quiescent. Requests are idempotent; the server may repeat them.

use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use jaaldb_core::{BindingKey, Result};

use crate::frame::{is_closed, Frame, FrameKind, FrameReader, FrameWriter};
use crate::message::CallbackRequest;

/// What the caching store exposes to server callbacks.
pub trait CallbackHandler: Send + Sync {
    fn request_evict_object(&self, oid: u64) -> bool;
    fn request_downgrade_object(&self, oid: u64) -> bool;
    fn request_evict_binding(&self, key: BindingKey) -> bool;
    fn request_downgrade_binding(&self, key: BindingKey) -> bool;
}

/// Accepts callback connections and dispatches requests to the handler.
pub struct CallbackListener {
    port: u16,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Binds the listener and starts the accept loop. Port 0 picks an
    /// ephemeral port; `port()` reports the bound one.
    pub fn spawn(port: u16, handler: Arc<dyn CallbackHandler>) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let bound_port = listener.local_addr()?.port();
        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = thread::Builder::new()
            .name("jaaldb-callback-accept".to_string())
            .spawn(move || accept_loop(listener, handler, accept_shutdown))?;
        Ok(Self {
            port: bound_port,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stops accepting connections and joins the accept thread. Connection
    /// threads exit when their peers disconnect.
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the blocking accept with a throwaway connection.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn CallbackHandler>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                warn!(error = %err, "callback accept failed");
                continue;
            }
        };
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        debug!(peer = %peer, "callback connection accepted");
        let conn_handler = Arc::clone(&handler);
        let result = thread::Builder::new()
            .name("jaaldb-callback-conn".to_string())
            .spawn(move || serve_connection(stream, conn_handler));
        if let Err(err) = result {
            warn!(error = %err, "could not spawn callback connection thread");
        }
    }
}

fn serve_connection(stream: TcpStream, handler: Arc<dyn CallbackHandler>) {
    let reader_stream = match stream.try_clone() {
        Ok(clone) => clone,
        Err(err) => {
            warn!(error = %err, "could not clone callback stream");
            return;
        }
    };
    let mut reader = FrameReader::new(BufReader::new(reader_stream));
    let mut writer = FrameWriter::new(BufWriter::new(stream));
    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(err) => {
                if !is_closed(&err) {
                    warn!(error = %err, "callback connection failed");
                }
                return;
            }
        };
        if frame.kind != FrameKind::Callback {
            warn!(kind = ?frame.kind, "unexpected frame on callback connection");
            return;
        }
        let reply = match CallbackRequest::decode(&frame.payload) {
            Ok(request) => {
                let done = dispatch(&*handler, request);
                Frame::new(FrameKind::CallbackReply, vec![done as u8])
            }
            Err(err) => Frame::error(&err.to_string()),
        };
        if let Err(err) = writer.write_frame(&reply) {
            warn!(error = %err, "could not write callback reply");
            return;
        }
    }
}

fn dispatch(handler: &dyn CallbackHandler, request: CallbackRequest) -> bool {
    match request {
        CallbackRequest::EvictObject { oid, .. } => handler.request_evict_object(oid),
        CallbackRequest::DowngradeObject { oid, .. } => handler.request_downgrade_object(oid),
        CallbackRequest::EvictBinding { key, .. } => handler.request_evict_binding(key),
        CallbackRequest::DowngradeBinding { key, .. } => handler.request_downgrade_binding(key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recording {
        calls: Mutex<Vec<String>>,
    }

    impl CallbackHandler for Recording {
        fn request_evict_object(&self, oid: u64) -> bool {
            self.calls.lock().push(format!("evict-object {}", oid));
            true
        }
        fn request_downgrade_object(&self, oid: u64) -> bool {
            self.calls.lock().push(format!("downgrade-object {}", oid));
            false
        }
        fn request_evict_binding(&self, key: BindingKey) -> bool {
            self.calls.lock().push(format!("evict-binding {}", key));
            true
        }
        fn request_downgrade_binding(&self, key: BindingKey) -> bool {
            self.calls.lock().push(format!("downgrade-binding {}", key));
            true
        }
    }

    fn send_callback(port: u16, request: &CallbackRequest) -> bool {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut reader = FrameReader::new(BufReader::new(stream.try_clone().unwrap()));
        let mut writer = FrameWriter::new(BufWriter::new(stream));
        writer
            .write_frame(&Frame::new(FrameKind::Callback, request.encode()))
            .unwrap();
        let reply = reader.read_frame().unwrap();
        assert_eq!(reply.kind, FrameKind::CallbackReply);
        reply.payload[0] != 0
    }

    #[test]
    fn test_listener_dispatches_and_replies() {
        let handler = Arc::new(Recording {
            calls: Mutex::new(Vec::new()),
        });
        let mut listener = CallbackListener::spawn(0, handler.clone()).unwrap();
        let port = listener.port();

        assert!(send_callback(
            port,
            &CallbackRequest::EvictObject { node_id: 1, oid: 7 }
        ));
        assert!(!send_callback(
            port,
            &CallbackRequest::DowngradeObject { node_id: 1, oid: 8 }
        ));
        assert!(send_callback(
            port,
            &CallbackRequest::EvictBinding {
                node_id: 1,
                key: BindingKey::for_name("n"),
            }
        ));

        let calls = handler.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                "evict-object 7".to_string(),
                "downgrade-object 8".to_string(),
                "evict-binding \"n\"".to_string(),
            ]
        );
        listener.shutdown();
    }

    #[test]
    fn test_shutdown_joins() {
        let handler = Arc::new(Recording {
            calls: Mutex::new(Vec::new()),
        });
        let mut listener = CallbackListener::spawn(0, handler).unwrap();
        listener.shutdown();
        // A second shutdown is a no-op.
        listener.shutdown();
    }
}
