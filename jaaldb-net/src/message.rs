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

//! Typed protocol messages and their encoding.
//!
//! All integers are big-endian. Strings are length-prefixed UTF-8. Binding
//! keys are tagged so the FIRST and LAST sentinels travel as tags, never as
//! strings. Absent object ids are transmitted as `-1` in a 64-bit field.
//! Every request except `RegisterNode` carries the node id.

use jaaldb_core::{BindingKey, JaalError, Result};

// =============================================================================
// Primitive encoding
// =============================================================================

pub(crate) struct Enc {
    buf: Vec<u8>,
}

impl Enc {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Object id field where `None` travels as -1.
    pub fn put_opt_oid(&mut self, v: Option<u64>) {
        match v {
            Some(oid) => self.put_i64(oid as i64),
            None => self.put_i64(-1),
        }
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn put_opt_bytes(&mut self, v: Option<&[u8]>) {
        match v {
            Some(b) => {
                self.put_u8(1);
                self.put_bytes(b);
            }
            None => self.put_u8(0),
        }
    }

    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    pub fn put_key(&mut self, key: &BindingKey) {
        match key {
            BindingKey::First => self.put_u8(0),
            BindingKey::Name(name) => {
                self.put_u8(1);
                self.put_str(name);
            }
            BindingKey::Last => self.put_u8(2),
        }
    }

    pub fn put_opt_key(&mut self, key: Option<&BindingKey>) {
        match key {
            Some(k) => {
                self.put_u8(1);
                self.put_key(k);
            }
            None => self.put_u8(0),
        }
    }
}

pub(crate) struct Dec<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Dec<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(JaalError::Protocol("message truncated".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(JaalError::Protocol(format!(
                "{} trailing bytes after message",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(JaalError::Protocol(format!("invalid bool byte {}", other))),
        }
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    pub fn get_opt_oid(&mut self) -> Result<Option<u64>> {
        let v = self.get_i64()?;
        if v < 0 {
            Ok(None)
        } else {
            Ok(Some(v as u64))
        }
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_opt_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        match self.get_u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.get_bytes()?)),
            other => Err(JaalError::Protocol(format!(
                "invalid option tag {}",
                other
            ))),
        }
    }

    pub fn get_str(&mut self) -> Result<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes).map_err(|_| JaalError::Protocol("invalid UTF-8 string".into()))
    }

    pub fn get_key(&mut self) -> Result<BindingKey> {
        match self.get_u8()? {
            0 => Ok(BindingKey::First),
            1 => Ok(BindingKey::Name(self.get_str()?)),
            2 => Ok(BindingKey::Last),
            other => Err(JaalError::Protocol(format!(
                "invalid binding key tag {}",
                other
            ))),
        }
    }

    pub fn get_opt_key(&mut self) -> Result<Option<BindingKey>> {
        match self.get_u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.get_key()?)),
            other => Err(JaalError::Protocol(format!(
                "invalid option tag {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

const OP_REGISTER_NODE: u8 = 1;
const OP_NEW_OBJECT_IDS: u8 = 2;
const OP_GET_OBJECT: u8 = 3;
const OP_GET_OBJECT_FOR_UPDATE: u8 = 4;
const OP_UPGRADE_OBJECT: u8 = 5;
const OP_GET_BINDING: u8 = 6;
const OP_GET_BINDING_FOR_UPDATE: u8 = 7;
const OP_GET_BINDING_FOR_REMOVE: u8 = 8;
const OP_NEXT_BOUND_NAME: u8 = 9;
const OP_NEXT_OBJECT_ID: u8 = 10;
const OP_GET_CLASS_ID: u8 = 11;
const OP_GET_CLASS_INFO: u8 = 12;

/// A request on the main server connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    RegisterNode { callback_port: u16 },
    NewObjectIds { node_id: u64, count: u64 },
    GetObject { node_id: u64, oid: u64 },
    GetObjectForUpdate { node_id: u64, oid: u64 },
    UpgradeObject { node_id: u64, oid: u64 },
    GetBinding { node_id: u64, name: String },
    GetBindingForUpdate { node_id: u64, name: String },
    GetBindingForRemove { node_id: u64, name: String },
    NextBoundName { node_id: u64, name: Option<String> },
    NextObjectId { node_id: u64, oid: Option<u64> },
    GetClassId { node_id: u64, info: Vec<u8> },
    GetClassInfo { node_id: u64, class_id: u32 },
}

impl Request {
    pub fn op(&self) -> u8 {
        match self {
            Request::RegisterNode { .. } => OP_REGISTER_NODE,
            Request::NewObjectIds { .. } => OP_NEW_OBJECT_IDS,
            Request::GetObject { .. } => OP_GET_OBJECT,
            Request::GetObjectForUpdate { .. } => OP_GET_OBJECT_FOR_UPDATE,
            Request::UpgradeObject { .. } => OP_UPGRADE_OBJECT,
            Request::GetBinding { .. } => OP_GET_BINDING,
            Request::GetBindingForUpdate { .. } => OP_GET_BINDING_FOR_UPDATE,
            Request::GetBindingForRemove { .. } => OP_GET_BINDING_FOR_REMOVE,
            Request::NextBoundName { .. } => OP_NEXT_BOUND_NAME,
            Request::NextObjectId { .. } => OP_NEXT_OBJECT_ID,
            Request::GetClassId { .. } => OP_GET_CLASS_ID,
            Request::GetClassInfo { .. } => OP_GET_CLASS_INFO,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        enc.put_u8(self.op());
        match self {
            Request::RegisterNode { callback_port } => {
                enc.put_u16(*callback_port);
            }
            Request::NewObjectIds { node_id, count } => {
                enc.put_u64(*node_id);
                enc.put_u64(*count);
            }
            Request::GetObject { node_id, oid }
            | Request::GetObjectForUpdate { node_id, oid }
            | Request::UpgradeObject { node_id, oid } => {
                enc.put_u64(*node_id);
                enc.put_u64(*oid);
            }
            Request::GetBinding { node_id, name }
            | Request::GetBindingForUpdate { node_id, name }
            | Request::GetBindingForRemove { node_id, name } => {
                enc.put_u64(*node_id);
                enc.put_str(name);
            }
            Request::NextBoundName { node_id, name } => {
                enc.put_u64(*node_id);
                match name {
                    Some(n) => {
                        enc.put_u8(1);
                        enc.put_str(n);
                    }
                    None => enc.put_u8(0),
                }
            }
            Request::NextObjectId { node_id, oid } => {
                enc.put_u64(*node_id);
                enc.put_opt_oid(*oid);
            }
            Request::GetClassId { node_id, info } => {
                enc.put_u64(*node_id);
                enc.put_bytes(info);
            }
            Request::GetClassInfo { node_id, class_id } => {
                enc.put_u64(*node_id);
                enc.put_u32(*class_id);
            }
        }
        enc.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut dec = Dec::new(payload);
        let op = dec.get_u8()?;
        let request = match op {
            OP_REGISTER_NODE => Request::RegisterNode {
                callback_port: dec.get_u16()?,
            },
            OP_NEW_OBJECT_IDS => Request::NewObjectIds {
                node_id: dec.get_u64()?,
                count: dec.get_u64()?,
            },
            OP_GET_OBJECT => Request::GetObject {
                node_id: dec.get_u64()?,
                oid: dec.get_u64()?,
            },
            OP_GET_OBJECT_FOR_UPDATE => Request::GetObjectForUpdate {
                node_id: dec.get_u64()?,
                oid: dec.get_u64()?,
            },
            OP_UPGRADE_OBJECT => Request::UpgradeObject {
                node_id: dec.get_u64()?,
                oid: dec.get_u64()?,
            },
            OP_GET_BINDING => Request::GetBinding {
                node_id: dec.get_u64()?,
                name: dec.get_str()?,
            },
            OP_GET_BINDING_FOR_UPDATE => Request::GetBindingForUpdate {
                node_id: dec.get_u64()?,
                name: dec.get_str()?,
            },
            OP_GET_BINDING_FOR_REMOVE => Request::GetBindingForRemove {
                node_id: dec.get_u64()?,
                name: dec.get_str()?,
            },
            OP_NEXT_BOUND_NAME => {
                let node_id = dec.get_u64()?;
                let name = match dec.get_u8()? {
                    0 => None,
                    1 => Some(dec.get_str()?),
                    other => {
                        return Err(JaalError::Protocol(format!(
                            "invalid option tag {}",
                            other
                        )))
                    }
                };
                Request::NextBoundName { node_id, name }
            }
            OP_NEXT_OBJECT_ID => Request::NextObjectId {
                node_id: dec.get_u64()?,
                oid: dec.get_opt_oid()?,
            },
            OP_GET_CLASS_ID => Request::GetClassId {
                node_id: dec.get_u64()?,
                info: dec.get_bytes()?,
            },
            OP_GET_CLASS_INFO => Request::GetClassInfo {
                node_id: dec.get_u64()?,
                class_id: dec.get_u32()?,
            },
            other => {
                return Err(JaalError::Protocol(format!(
                    "unknown request op {}",
                    other
                )))
            }
        };
        dec.finish()?;
        Ok(request)
    }
}

// =============================================================================
// Result records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterNodeResult {
    pub node_id: u64,
    pub update_queue_port: u16,
}

/// A contiguous range of freshly allocated object ids, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectIdRange {
    pub first: u64,
    pub last: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetObjectResults {
    /// The object bytes, or `None` if the object does not exist.
    pub data: Option<Vec<u8>>,
    pub callback_evict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetObjectForUpdateResults {
    pub data: Option<Vec<u8>>,
    pub callback_evict: bool,
    pub callback_downgrade: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeObjectResults {
    pub callback_evict: bool,
}

/// Results of a binding lookup. When `found`, `oid` is the binding's value
/// and `next_name` is absent. When not found, `next_name` is the next bound
/// name (possibly the LAST sentinel) and `oid` is that name's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBindingResults {
    pub found: bool,
    pub oid: Option<u64>,
    pub next_name: Option<BindingKey>,
    pub callback_evict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBindingForUpdateResults {
    pub found: bool,
    pub oid: Option<u64>,
    pub next_name: Option<BindingKey>,
    pub callback_evict: bool,
    pub callback_downgrade: bool,
}

/// Results of a binding lookup for removal. The next name is always
/// supplied because the remove protocol updates the successor as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBindingForRemoveResults {
    pub found: bool,
    pub oid: Option<u64>,
    pub next_name: BindingKey,
    pub next_oid: Option<u64>,
    pub callback_evict: bool,
    pub callback_downgrade: bool,
    pub next_callback_evict: bool,
    pub next_callback_downgrade: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextBoundNameResults {
    /// The next bound name, possibly the LAST sentinel when none exists.
    pub next_name: BindingKey,
    pub oid: Option<u64>,
    pub callback_evict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextObjectResults {
    pub oid: u64,
    pub data: Option<Vec<u8>>,
    pub callback_evict: bool,
}

/// A response on the main server connection, tagged with the request op it
/// answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    RegisterNode(RegisterNodeResult),
    NewObjectIds(ObjectIdRange),
    GetObject(GetObjectResults),
    GetObjectForUpdate(GetObjectForUpdateResults),
    UpgradeObject(UpgradeObjectResults),
    GetBinding(GetBindingResults),
    GetBindingForUpdate(GetBindingForUpdateResults),
    GetBindingForRemove(GetBindingForRemoveResults),
    NextBoundName(NextBoundNameResults),
    NextObjectId(Option<NextObjectResults>),
    GetClassId(u32),
    GetClassInfo(Option<Vec<u8>>),
}

impl Response {
    pub fn op(&self) -> u8 {
        match self {
            Response::RegisterNode(_) => OP_REGISTER_NODE,
            Response::NewObjectIds(_) => OP_NEW_OBJECT_IDS,
            Response::GetObject(_) => OP_GET_OBJECT,
            Response::GetObjectForUpdate(_) => OP_GET_OBJECT_FOR_UPDATE,
            Response::UpgradeObject(_) => OP_UPGRADE_OBJECT,
            Response::GetBinding(_) => OP_GET_BINDING,
            Response::GetBindingForUpdate(_) => OP_GET_BINDING_FOR_UPDATE,
            Response::GetBindingForRemove(_) => OP_GET_BINDING_FOR_REMOVE,
            Response::NextBoundName(_) => OP_NEXT_BOUND_NAME,
            Response::NextObjectId(_) => OP_NEXT_OBJECT_ID,
            Response::GetClassId(_) => OP_GET_CLASS_ID,
            Response::GetClassInfo(_) => OP_GET_CLASS_INFO,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        enc.put_u8(self.op());
        match self {
            Response::RegisterNode(r) => {
                enc.put_u64(r.node_id);
                enc.put_u16(r.update_queue_port);
            }
            Response::NewObjectIds(r) => {
                enc.put_u64(r.first);
                enc.put_u64(r.last);
            }
            Response::GetObject(r) => {
                enc.put_opt_bytes(r.data.as_deref());
                enc.put_bool(r.callback_evict);
            }
            Response::GetObjectForUpdate(r) => {
                enc.put_opt_bytes(r.data.as_deref());
                enc.put_bool(r.callback_evict);
                enc.put_bool(r.callback_downgrade);
            }
            Response::UpgradeObject(r) => {
                enc.put_bool(r.callback_evict);
            }
            Response::GetBinding(r) => {
                enc.put_bool(r.found);
                enc.put_opt_oid(r.oid);
                enc.put_opt_key(r.next_name.as_ref());
                enc.put_bool(r.callback_evict);
            }
            Response::GetBindingForUpdate(r) => {
                enc.put_bool(r.found);
                enc.put_opt_oid(r.oid);
                enc.put_opt_key(r.next_name.as_ref());
                enc.put_bool(r.callback_evict);
                enc.put_bool(r.callback_downgrade);
            }
            Response::GetBindingForRemove(r) => {
                enc.put_bool(r.found);
                enc.put_opt_oid(r.oid);
                enc.put_key(&r.next_name);
                enc.put_opt_oid(r.next_oid);
                enc.put_bool(r.callback_evict);
                enc.put_bool(r.callback_downgrade);
                enc.put_bool(r.next_callback_evict);
                enc.put_bool(r.next_callback_downgrade);
            }
            Response::NextBoundName(r) => {
                enc.put_key(&r.next_name);
                enc.put_opt_oid(r.oid);
                enc.put_bool(r.callback_evict);
            }
            Response::NextObjectId(r) => match r {
                Some(r) => {
                    enc.put_u8(1);
                    enc.put_u64(r.oid);
                    enc.put_opt_bytes(r.data.as_deref());
                    enc.put_bool(r.callback_evict);
                }
                None => enc.put_u8(0),
            },
            Response::GetClassId(id) => {
                enc.put_u32(*id);
            }
            Response::GetClassInfo(info) => {
                enc.put_opt_bytes(info.as_deref());
            }
        }
        enc.finish()
    }

    /// Decodes a response, checking it answers the expected request op.
    pub fn decode(payload: &[u8], expected_op: u8) -> Result<Self> {
        let mut dec = Dec::new(payload);
        let op = dec.get_u8()?;
        if op != expected_op {
            return Err(JaalError::Protocol(format!(
                "response op {} does not match request op {}",
                op, expected_op
            )));
        }
        let response = match op {
            OP_REGISTER_NODE => Response::RegisterNode(RegisterNodeResult {
                node_id: dec.get_u64()?,
                update_queue_port: dec.get_u16()?,
            }),
            OP_NEW_OBJECT_IDS => Response::NewObjectIds(ObjectIdRange {
                first: dec.get_u64()?,
                last: dec.get_u64()?,
            }),
            OP_GET_OBJECT => Response::GetObject(GetObjectResults {
                data: dec.get_opt_bytes()?,
                callback_evict: dec.get_bool()?,
            }),
            OP_GET_OBJECT_FOR_UPDATE => Response::GetObjectForUpdate(GetObjectForUpdateResults {
                data: dec.get_opt_bytes()?,
                callback_evict: dec.get_bool()?,
                callback_downgrade: dec.get_bool()?,
            }),
            OP_UPGRADE_OBJECT => Response::UpgradeObject(UpgradeObjectResults {
                callback_evict: dec.get_bool()?,
            }),
            OP_GET_BINDING => Response::GetBinding(GetBindingResults {
                found: dec.get_bool()?,
                oid: dec.get_opt_oid()?,
                next_name: dec.get_opt_key()?,
                callback_evict: dec.get_bool()?,
            }),
            OP_GET_BINDING_FOR_UPDATE => {
                Response::GetBindingForUpdate(GetBindingForUpdateResults {
                    found: dec.get_bool()?,
                    oid: dec.get_opt_oid()?,
                    next_name: dec.get_opt_key()?,
                    callback_evict: dec.get_bool()?,
                    callback_downgrade: dec.get_bool()?,
                })
            }
            OP_GET_BINDING_FOR_REMOVE => {
                Response::GetBindingForRemove(GetBindingForRemoveResults {
                    found: dec.get_bool()?,
                    oid: dec.get_opt_oid()?,
                    next_name: dec.get_key()?,
                    next_oid: dec.get_opt_oid()?,
                    callback_evict: dec.get_bool()?,
                    callback_downgrade: dec.get_bool()?,
                    next_callback_evict: dec.get_bool()?,
                    next_callback_downgrade: dec.get_bool()?,
                })
            }
            OP_NEXT_BOUND_NAME => Response::NextBoundName(NextBoundNameResults {
                next_name: dec.get_key()?,
                oid: dec.get_opt_oid()?,
                callback_evict: dec.get_bool()?,
            }),
            OP_NEXT_OBJECT_ID => Response::NextObjectId(match dec.get_u8()? {
                0 => None,
                1 => Some(NextObjectResults {
                    oid: dec.get_u64()?,
                    data: dec.get_opt_bytes()?,
                    callback_evict: dec.get_bool()?,
                }),
                other => {
                    return Err(JaalError::Protocol(format!(
                        "invalid option tag {}",
                        other
                    )))
                }
            }),
            OP_GET_CLASS_ID => Response::GetClassId(dec.get_u32()?),
            OP_GET_CLASS_INFO => Response::GetClassInfo(dec.get_opt_bytes()?),
            other => {
                return Err(JaalError::Protocol(format!(
                    "unknown response op {}",
                    other
                )))
            }
        };
        dec.finish()?;
        Ok(response)
    }
}

// =============================================================================
// Update-queue items
// =============================================================================

const UPDATE_COMMIT: u8 = 1;
const UPDATE_EVICT_OBJECT: u8 = 2;
const UPDATE_EVICT_BINDING: u8 = 3;
const UPDATE_DOWNGRADE_OBJECT: u8 = 4;
const UPDATE_DOWNGRADE_BINDING: u8 = 5;

/// One object write within a commit batch. `None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUpdate {
    pub oid: u64,
    pub data: Option<Vec<u8>>,
}

/// One binding write within a commit batch. `oid` of `None` removes the
/// binding. The previous-key fields carry the unbound-range certificate the
/// writer held so the server can validate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingUpdate {
    pub key: BindingKey,
    pub oid: Option<u64>,
    pub previous_key: Option<BindingKey>,
    pub previous_key_unbound: bool,
}

/// The atomic set of writes one transaction ships at commit, ordered by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitBatch {
    pub node_id: u64,
    pub context_id: u64,
    pub created_oids: Vec<u64>,
    pub object_updates: Vec<ObjectUpdate>,
    pub binding_updates: Vec<BindingUpdate>,
}

/// An item on the update-queue connection. Each is acknowledged by the
/// server before the next is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateItem {
    Commit(CommitBatch),
    EvictObject { node_id: u64, oid: u64 },
    EvictBinding { node_id: u64, key: BindingKey },
    DowngradeObject { node_id: u64, oid: u64 },
    DowngradeBinding { node_id: u64, key: BindingKey },
}

impl UpdateItem {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        match self {
            UpdateItem::Commit(batch) => {
                enc.put_u8(UPDATE_COMMIT);
                enc.put_u64(batch.node_id);
                enc.put_u64(batch.context_id);
                enc.put_u32(batch.created_oids.len() as u32);
                for oid in &batch.created_oids {
                    enc.put_u64(*oid);
                }
                enc.put_u32(batch.object_updates.len() as u32);
                for update in &batch.object_updates {
                    enc.put_u64(update.oid);
                    enc.put_opt_bytes(update.data.as_deref());
                }
                enc.put_u32(batch.binding_updates.len() as u32);
                for update in &batch.binding_updates {
                    enc.put_key(&update.key);
                    enc.put_opt_oid(update.oid);
                    enc.put_opt_key(update.previous_key.as_ref());
                    enc.put_bool(update.previous_key_unbound);
                }
            }
            UpdateItem::EvictObject { node_id, oid } => {
                enc.put_u8(UPDATE_EVICT_OBJECT);
                enc.put_u64(*node_id);
                enc.put_u64(*oid);
            }
            UpdateItem::EvictBinding { node_id, key } => {
                enc.put_u8(UPDATE_EVICT_BINDING);
                enc.put_u64(*node_id);
                enc.put_key(key);
            }
            UpdateItem::DowngradeObject { node_id, oid } => {
                enc.put_u8(UPDATE_DOWNGRADE_OBJECT);
                enc.put_u64(*node_id);
                enc.put_u64(*oid);
            }
            UpdateItem::DowngradeBinding { node_id, key } => {
                enc.put_u8(UPDATE_DOWNGRADE_BINDING);
                enc.put_u64(*node_id);
                enc.put_key(key);
            }
        }
        enc.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut dec = Dec::new(payload);
        let item = match dec.get_u8()? {
            UPDATE_COMMIT => {
                let node_id = dec.get_u64()?;
                let context_id = dec.get_u64()?;
                let mut created_oids = Vec::new();
                for _ in 0..dec.get_u32()? {
                    created_oids.push(dec.get_u64()?);
                }
                let mut object_updates = Vec::new();
                for _ in 0..dec.get_u32()? {
                    object_updates.push(ObjectUpdate {
                        oid: dec.get_u64()?,
                        data: dec.get_opt_bytes()?,
                    });
                }
                let mut binding_updates = Vec::new();
                for _ in 0..dec.get_u32()? {
                    binding_updates.push(BindingUpdate {
                        key: dec.get_key()?,
                        oid: dec.get_opt_oid()?,
                        previous_key: dec.get_opt_key()?,
                        previous_key_unbound: dec.get_bool()?,
                    });
                }
                UpdateItem::Commit(CommitBatch {
                    node_id,
                    context_id,
                    created_oids,
                    object_updates,
                    binding_updates,
                })
            }
            UPDATE_EVICT_OBJECT => UpdateItem::EvictObject {
                node_id: dec.get_u64()?,
                oid: dec.get_u64()?,
            },
            UPDATE_EVICT_BINDING => UpdateItem::EvictBinding {
                node_id: dec.get_u64()?,
                key: dec.get_key()?,
            },
            UPDATE_DOWNGRADE_OBJECT => UpdateItem::DowngradeObject {
                node_id: dec.get_u64()?,
                oid: dec.get_u64()?,
            },
            UPDATE_DOWNGRADE_BINDING => UpdateItem::DowngradeBinding {
                node_id: dec.get_u64()?,
                key: dec.get_key()?,
            },
            other => {
                return Err(JaalError::Protocol(format!(
                    "unknown update item kind {}",
                    other
                )))
            }
        };
        dec.finish()?;
        Ok(item)
    }
}

// =============================================================================
// Callback requests
// =============================================================================

const CALLBACK_EVICT_OBJECT: u8 = 1;
const CALLBACK_DOWNGRADE_OBJECT: u8 = 2;
const CALLBACK_EVICT_BINDING: u8 = 3;
const CALLBACK_DOWNGRADE_BINDING: u8 = 4;

/// A server-initiated request on the callback connection. The boolean reply
/// means "handled synchronously"; a `false` reply promises an eventual
/// evict or downgrade through the update queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackRequest {
    EvictObject { node_id: u64, oid: u64 },
    DowngradeObject { node_id: u64, oid: u64 },
    EvictBinding { node_id: u64, key: BindingKey },
    DowngradeBinding { node_id: u64, key: BindingKey },
}

impl CallbackRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        match self {
            CallbackRequest::EvictObject { node_id, oid } => {
                enc.put_u8(CALLBACK_EVICT_OBJECT);
                enc.put_u64(*node_id);
                enc.put_u64(*oid);
            }
            CallbackRequest::DowngradeObject { node_id, oid } => {
                enc.put_u8(CALLBACK_DOWNGRADE_OBJECT);
                enc.put_u64(*node_id);
                enc.put_u64(*oid);
            }
            CallbackRequest::EvictBinding { node_id, key } => {
                enc.put_u8(CALLBACK_EVICT_BINDING);
                enc.put_u64(*node_id);
                enc.put_key(key);
            }
            CallbackRequest::DowngradeBinding { node_id, key } => {
                enc.put_u8(CALLBACK_DOWNGRADE_BINDING);
                enc.put_u64(*node_id);
                enc.put_key(key);
            }
        }
        enc.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut dec = Dec::new(payload);
        let request = match dec.get_u8()? {
            CALLBACK_EVICT_OBJECT => CallbackRequest::EvictObject {
                node_id: dec.get_u64()?,
                oid: dec.get_u64()?,
            },
            CALLBACK_DOWNGRADE_OBJECT => CallbackRequest::DowngradeObject {
                node_id: dec.get_u64()?,
                oid: dec.get_u64()?,
            },
            CALLBACK_EVICT_BINDING => CallbackRequest::EvictBinding {
                node_id: dec.get_u64()?,
                key: dec.get_key()?,
            },
            CALLBACK_DOWNGRADE_BINDING => CallbackRequest::DowngradeBinding {
                node_id: dec.get_u64()?,
                key: dec.get_key()?,
            },
            other => {
                return Err(JaalError::Protocol(format!(
                    "unknown callback kind {}",
                    other
                )))
            }
        };
        dec.finish()?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let request = Request::GetBinding {
            node_id: 42,
            name: "players.alice".into(),
        };
        let decoded = Request::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_binding_results_with_last_sentinel() {
        let response = Response::GetBinding(GetBindingResults {
            found: false,
            oid: None,
            next_name: Some(BindingKey::Last),
            callback_evict: true,
        });
        let decoded = Response::decode(&response.encode(), Request::GetBinding {
            node_id: 0,
            name: String::new(),
        }
        .op())
        .unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_response_op_mismatch_rejected() {
        let response = Response::GetClassId(9);
        let err = Response::decode(&response.encode(), OP_GET_OBJECT).unwrap_err();
        assert!(matches!(err, JaalError::Protocol(_)));
    }

    #[test]
    fn test_commit_batch_with_tombstones() {
        let item = UpdateItem::Commit(CommitBatch {
            node_id: 3,
            context_id: 17,
            created_oids: vec![100, 101],
            object_updates: vec![
                ObjectUpdate {
                    oid: 100,
                    data: Some(vec![1, 2, 3]),
                },
                ObjectUpdate {
                    oid: 55,
                    data: None,
                },
            ],
            binding_updates: vec![BindingUpdate {
                key: BindingKey::for_name("x"),
                oid: None,
                previous_key: Some(BindingKey::First),
                previous_key_unbound: false,
            }],
        });
        let decoded = UpdateItem::decode(&item.encode()).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_callback_roundtrip() {
        let request = CallbackRequest::DowngradeBinding {
            node_id: 7,
            key: BindingKey::for_name("k"),
        };
        assert_eq!(CallbackRequest::decode(&request.encode()).unwrap(), request);
    }

    #[test]
    fn test_truncated_message_rejected() {
        let payload = Request::GetObject {
            node_id: 1,
            oid: 2,
        }
        .encode();
        let err = Request::decode(&payload[..payload.len() - 1]).unwrap_err();
        assert!(matches!(err, JaalError::Protocol(_)));
    }

    #[test]
    fn test_next_bound_name_from_first() {
        let request = Request::NextBoundName {
            node_id: 1,
            name: None,
        };
        assert_eq!(Request::decode(&request.encode()).unwrap(), request);
    }
}
