//! The object model: a self-describing binary record with a typed header
//! and an immutable payload.
//!
//! Marshaled record format (all integers little-endian):
//!
//! ```text
//! +--------+-------------+--------+---------+
//! | Magic  | Header      | CRC32C | Payload |
//! | 4B     | var         | 4B     | var     |
//! +--------+-------------+--------+---------+
//! ```
//!
//! The CRC covers the header bytes only; payload integrity follows from
//! content addressing (the object id is the payload digest).

use crate::checksum::{compute_crc32c, payload_digest, verify_crc32c};
use crate::error::{Error, Result};
use crate::types::{Address, ContainerId, ObjectId};
use bytes::Bytes;

/// Object record magic number ("AMO1").
const OBJECT_MAGIC: u32 = 0x414D_4F31;

/// Fixed part of the header: container + object + payload_size + type +
/// flags + created_epoch + payload_crc.
const HEADER_FIXED_SIZE: usize = 32 + 32 + 8 + 1 + 1 + 8 + 4;

const FLAG_SPLIT: u8 = 0b0000_0001;
const FLAG_LAST_PART: u8 = 0b0000_0010;
const FLAG_LINK: u8 = 0b0000_0100;

/// Object type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    /// Regular payload-carrying object.
    Regular = 0,
    /// Deletion marker.
    Tombstone = 1,
    /// Storage-group bookkeeping object.
    StorageGroup = 2,
    /// Object lock marker.
    Lock = 3,
}

impl ObjectType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Regular),
            1 => Some(Self::Tombstone),
            2 => Some(Self::StorageGroup),
            3 => Some(Self::Lock),
            _ => None,
        }
    }
}

/// Split (multipart) information carried by parts of a virtual object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitInfo {
    /// Identifier of the virtual parent.
    pub parent_id: ObjectId,
    /// Last part of the chain, when known.
    pub last_part_id: Option<ObjectId>,
    /// Link object enumerating all parts, when known.
    pub link_id: Option<ObjectId>,
}

impl SplitInfo {
    /// Create split info naming only the parent.
    #[must_use]
    pub const fn new(parent_id: ObjectId) -> Self {
        Self {
            parent_id,
            last_part_id: None,
            link_id: None,
        }
    }

    /// Merge details learned from another part of the same chain.
    pub fn merge(&mut self, other: &SplitInfo) {
        if self.last_part_id.is_none() {
            self.last_part_id = other.last_part_id;
        }
        if self.link_id.is_none() {
            self.link_id = other.link_id;
        }
    }
}

/// Object header: identity, size, type, split and integrity fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Container the object belongs to.
    pub container_id: ContainerId,
    /// Object identifier (digest of the payload).
    pub object_id: ObjectId,
    /// Payload size in bytes.
    pub payload_size: u64,
    /// Object type.
    pub object_type: ObjectType,
    /// Split information for parts of a virtual object.
    pub split: Option<SplitInfo>,
    /// CRC32C of the payload for fast verification.
    pub payload_checksum: u32,
    /// Epoch the object was created in.
    pub created_epoch: u64,
}

impl ObjectHeader {
    /// Address of the object this header describes.
    #[must_use]
    pub fn address(&self) -> Address {
        Address::new(self.container_id, self.object_id)
    }

    /// Encoded size of this header in bytes.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        match &self.split {
            None => HEADER_FIXED_SIZE,
            Some(si) => {
                let mut sz = HEADER_FIXED_SIZE + 32;
                if si.last_part_id.is_some() {
                    sz += 32;
                }
                if si.link_id.is_some() {
                    sz += 32;
                }
                sz
            }
        }
    }

    /// Serialize the header.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        buf.extend_from_slice(self.container_id.as_bytes());
        buf.extend_from_slice(self.object_id.as_bytes());
        buf.extend_from_slice(&self.payload_size.to_le_bytes());
        buf.push(self.object_type as u8);

        let mut flags = 0u8;
        if let Some(si) = &self.split {
            flags |= FLAG_SPLIT;
            if si.last_part_id.is_some() {
                flags |= FLAG_LAST_PART;
            }
            if si.link_id.is_some() {
                flags |= FLAG_LINK;
            }
        }
        buf.push(flags);

        buf.extend_from_slice(&self.created_epoch.to_le_bytes());
        buf.extend_from_slice(&self.payload_checksum.to_le_bytes());

        if let Some(si) = &self.split {
            buf.extend_from_slice(si.parent_id.as_bytes());
            if let Some(last) = &si.last_part_id {
                buf.extend_from_slice(last.as_bytes());
            }
            if let Some(link) = &si.link_id {
                buf.extend_from_slice(link.as_bytes());
            }
        }

        buf
    }

    /// Deserialize a header, returning the header and the number of bytes
    /// consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < HEADER_FIXED_SIZE {
            return Err(Error::corrupted("object header truncated"));
        }

        let container_id = ContainerId::from_bytes(read_digest(&data[0..32]));
        let object_id = ObjectId::from_bytes(read_digest(&data[32..64]));
        let payload_size = u64::from_le_bytes(data[64..72].try_into().unwrap());
        let object_type = ObjectType::from_u8(data[72])
            .ok_or_else(|| Error::corrupted(format!("unknown object type {}", data[72])))?;
        let flags = data[73];
        let created_epoch = u64::from_le_bytes(data[74..82].try_into().unwrap());
        let payload_checksum = u32::from_le_bytes(data[82..86].try_into().unwrap());

        let mut off = HEADER_FIXED_SIZE;
        let split = if flags & FLAG_SPLIT != 0 {
            let mut need = 32;
            if flags & FLAG_LAST_PART != 0 {
                need += 32;
            }
            if flags & FLAG_LINK != 0 {
                need += 32;
            }
            if data.len() < off + need {
                return Err(Error::corrupted("split info truncated"));
            }

            let parent_id = ObjectId::from_bytes(read_digest(&data[off..off + 32]));
            off += 32;
            let last_part_id = if flags & FLAG_LAST_PART != 0 {
                let id = ObjectId::from_bytes(read_digest(&data[off..off + 32]));
                off += 32;
                Some(id)
            } else {
                None
            };
            let link_id = if flags & FLAG_LINK != 0 {
                let id = ObjectId::from_bytes(read_digest(&data[off..off + 32]));
                off += 32;
                Some(id)
            } else {
                None
            };

            Some(SplitInfo {
                parent_id,
                last_part_id,
                link_id,
            })
        } else {
            None
        };

        Ok((
            Self {
                container_id,
                object_id,
                payload_size,
                object_type,
                split,
                payload_checksum,
                created_epoch,
            },
            off,
        ))
    }
}

/// An immutable binary object: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    /// Object header.
    pub header: ObjectHeader,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Object {
    /// Build a regular object over a payload; the object identifier is
    /// derived from the payload digest.
    #[must_use]
    pub fn new_regular(container_id: ContainerId, payload: Bytes) -> Self {
        let object_id = ObjectId::from_bytes(payload_digest(&payload));
        let header = ObjectHeader {
            container_id,
            object_id,
            payload_size: payload.len() as u64,
            object_type: ObjectType::Regular,
            split: None,
            payload_checksum: compute_crc32c(&payload),
            created_epoch: 0,
        };
        Self { header, payload }
    }

    /// Address of this object.
    #[must_use]
    pub fn address(&self) -> Address {
        self.header.address()
    }

    /// Size of the marshaled record without allocating it.
    #[must_use]
    pub fn marshaled_size(&self) -> u64 {
        (4 + self.header.encoded_size() + 4 + self.payload.len()) as u64
    }

    /// Marshal to the on-disk record format.
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let header = self.header.encode();
        let mut buf = Vec::with_capacity(4 + header.len() + 4 + self.payload.len());
        buf.extend_from_slice(&OBJECT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&compute_crc32c(&header).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Unmarshal from the on-disk record format.
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corrupted("object record truncated"));
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != OBJECT_MAGIC {
            return Err(Error::corrupted(format!(
                "bad object magic {magic:#010x}"
            )));
        }

        let (header, header_len) = ObjectHeader::decode(&data[4..])?;
        let crc_off = 4 + header_len;
        if data.len() < crc_off + 4 {
            return Err(Error::corrupted("object record truncated"));
        }
        let crc = u32::from_le_bytes(data[crc_off..crc_off + 4].try_into().unwrap());
        if !verify_crc32c(&data[4..crc_off], crc) {
            return Err(Error::corrupted("object header crc mismatch"));
        }

        let payload = &data[crc_off + 4..];
        if payload.len() as u64 != header.payload_size {
            return Err(Error::corrupted(format!(
                "payload size mismatch: header says {}, record carries {}",
                header.payload_size,
                payload.len()
            )));
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Verify content-address integrity: the object id must equal the
    /// payload digest and the payload CRC must match.
    #[must_use]
    pub fn verify_integrity(&self) -> bool {
        if self.header.object_type != ObjectType::Regular || self.header.split.is_some() {
            // Only plain regular objects are addressed by payload digest.
            return verify_crc32c(&self.payload, self.header.payload_checksum);
        }
        payload_digest(&self.payload) == *self.header.object_id.as_bytes()
            && verify_crc32c(&self.payload, self.header.payload_checksum)
    }
}

fn read_digest(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(data);
    out
}
