//! Metabase: the persistent index from address to header, location hint
//! and status.
//!
//! One redb file with four tables:
//! - `primary`: address → record (header bytes, optional hint, timestamp);
//! - `container`: container id → object id list;
//! - `graveyard`: tombstoned address → tombstone timestamp;
//! - `split`: virtual parent address → part address list.
//!
//! Deletion tombstones an address but retains its header; further reads
//! report `AlreadyRemoved`.

use amphora_common::{
    Address, ContainerId, Error, Object, ObjectHeader, ObjectId, ObjectType, Result, SplitInfo,
};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

const PRIMARY: TableDefinition<&str, &[u8]> = TableDefinition::new("primary");
const CONTAINER: TableDefinition<&str, &[u8]> = TableDefinition::new("container");
const GRAVEYARD: TableDefinition<&str, u64> = TableDefinition::new("graveyard");
const SPLIT: TableDefinition<&str, &[u8]> = TableDefinition::new("split");

const FLAG_HINT: u8 = 0b0000_0001;
const FLAG_VIRTUAL: u8 = 0b0000_0010;
const FLAG_LAST_PART: u8 = 0b0000_0100;
const FLAG_LINK: u8 = 0b0000_1000;

/// Status of an indexed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStatus {
    /// Indexed and readable.
    Present,
    /// Tombstoned by a delete.
    Tombstoned,
}

/// Result of a header lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadRecord {
    /// Header of a materialized object.
    Header {
        header: ObjectHeader,
        /// Blobovnicza file holding the payload, when known.
        hint: Option<String>,
    },
    /// The address names a virtual (split) object.
    Virtual(SplitInfo),
}

/// Persistent address index.
pub struct Metabase {
    db: Database,
    path: PathBuf,
}

impl Metabase {
    /// Open (or create) the metabase file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)?;

        let wtx = db.begin_write()?;
        wtx.open_table(PRIMARY)?;
        wtx.open_table(CONTAINER)?;
        wtx.open_table(GRAVEYARD)?;
        wtx.open_table(SPLIT)?;
        wtx.commit()?;

        info!(path = %path.display(), "opened metabase");
        Ok(Self { db, path })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index an object header with its optional location hint.
    ///
    /// Parts of a split object additionally update the virtual parent's
    /// split record and the `split` table.
    pub fn put(&self, obj: &Object, hint: Option<&str>) -> Result<()> {
        let addr = obj.address();
        let key = addr.encode_to_string();
        let now = unix_now();

        let wtx = self.db.begin_write()?;
        {
            let mut primary = wtx.open_table(PRIMARY)?;
            let record = encode_header_record(&obj.header, hint, now);
            primary.insert(key.as_str(), record.as_slice())?;

            if let Some(si) = &obj.header.split {
                let parent_addr = Address::new(obj.header.container_id, si.parent_id);
                let parent_key = parent_addr.encode_to_string();

                // Merge split details from this part into the parent record.
                // A parent that already has a materialized header keeps it.
                let mut merged = *si;
                let mut write_virtual = true;
                if let Some(existing) = primary.get(parent_key.as_str())? {
                    let existing = existing.value().to_vec();
                    match decode_record(&existing)? {
                        Record::Virtual { info, .. } => merged.merge(&info),
                        Record::Header { .. } => write_virtual = false,
                    }
                }
                if write_virtual {
                    let parent_record = encode_virtual_record(&merged, now);
                    primary.insert(parent_key.as_str(), parent_record.as_slice())?;
                }

                let mut split = wtx.open_table(SPLIT)?;
                append_to_list(&mut split, &parent_key, &key)?;
            }

            let mut container = wtx.open_table(CONTAINER)?;
            let cid = addr.container.to_string();
            let oid = addr.object.to_string();
            append_to_list(&mut container, &cid, &oid)?;
        }
        wtx.commit()?;
        Ok(())
    }

    /// Look up the header stored for `addr`.
    ///
    /// For a virtual object, `raw = false` reconstructs the parent header
    /// and `raw = true` surfaces the raw split info.
    pub fn get(&self, addr: &Address, raw: bool) -> Result<HeadRecord> {
        let key = addr.encode_to_string();
        let rtx = self.db.begin_read()?;

        let graveyard = rtx.open_table(GRAVEYARD)?;
        if graveyard.get(key.as_str())?.is_some() {
            return Err(Error::AlreadyRemoved);
        }

        let primary = rtx.open_table(PRIMARY)?;
        let record = primary
            .get(key.as_str())?
            .map(|g| g.value().to_vec())
            .ok_or(Error::NotFound)?;

        match decode_record(&record)? {
            Record::Header { header, hint, .. } => Ok(HeadRecord::Header { header, hint }),
            Record::Virtual { info, .. } => {
                if raw {
                    Ok(HeadRecord::Virtual(info))
                } else {
                    Ok(HeadRecord::Header {
                        header: virtual_parent_header(addr, &info),
                        hint: None,
                    })
                }
            }
        }
    }

    /// Header-only lookup; the metabase stores headers, so this is `get`.
    pub fn head(&self, addr: &Address, raw: bool) -> Result<HeadRecord> {
        self.get(addr, raw)
    }

    /// Tombstone an address. The header is retained; subsequent lookups
    /// report `AlreadyRemoved`. Deleting a tombstoned address reports
    /// `AlreadyRemoved`; deleting an unknown one reports `NotFound`.
    pub fn delete(&self, addr: &Address) -> Result<()> {
        let key = addr.encode_to_string();
        let wtx = self.db.begin_write()?;
        {
            let mut graveyard = wtx.open_table(GRAVEYARD)?;
            if graveyard.get(key.as_str())?.is_some() {
                return Err(Error::AlreadyRemoved);
            }
            let primary = wtx.open_table(PRIMARY)?;
            if primary.get(key.as_str())?.is_none() {
                return Err(Error::NotFound);
            }
            graveyard.insert(key.as_str(), unix_now())?;
        }
        wtx.commit()?;
        Ok(())
    }

    /// Check whether an address is indexed and not tombstoned.
    pub fn exists(&self, addr: &Address) -> Result<bool> {
        match self.get(addr, true) {
            Ok(_) => Ok(true),
            Err(Error::NotFound) | Err(Error::AlreadyRemoved) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Status of an indexed address.
    pub fn status(&self, addr: &Address) -> Result<ObjectStatus> {
        let key = addr.encode_to_string();
        let rtx = self.db.begin_read()?;

        let graveyard = rtx.open_table(GRAVEYARD)?;
        if graveyard.get(key.as_str())?.is_some() {
            return Ok(ObjectStatus::Tombstoned);
        }
        let primary = rtx.open_table(PRIMARY)?;
        if primary.get(key.as_str())?.is_some() {
            Ok(ObjectStatus::Present)
        } else {
            Err(Error::NotFound)
        }
    }

    /// Location hint recorded for an address, when any.
    pub fn blobovnicza_id(&self, addr: &Address) -> Result<Option<String>> {
        match self.get(addr, true)? {
            HeadRecord::Header { hint, .. } => Ok(hint),
            HeadRecord::Virtual(_) => Ok(None),
        }
    }

    /// All indexed addresses (tombstoned ones included), in key order.
    pub fn list(&self) -> Result<Vec<Address>> {
        let rtx = self.db.begin_read()?;
        let primary = rtx.open_table(PRIMARY)?;
        let mut out = Vec::new();
        for entry in primary.iter()? {
            let (key, _) = entry?;
            out.push(key.value().parse()?);
        }
        Ok(out)
    }

    /// All container ids with indexed objects.
    pub fn containers(&self) -> Result<Vec<ContainerId>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(CONTAINER)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            out.push(key.value().parse().map_err(Error::InvalidAddress)?);
        }
        Ok(out)
    }

    /// Addresses of every object indexed under a container.
    pub fn container_objects(&self, container: &ContainerId) -> Result<Vec<Address>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(CONTAINER)?;
        let Some(list) = table.get(container.to_string().as_str())? else {
            return Ok(Vec::new());
        };
        let raw = list.value().to_vec();
        let mut out = Vec::new();
        for line in std::str::from_utf8(&raw)
            .map_err(|_| Error::corrupted("container index is not utf-8"))?
            .lines()
        {
            let object: ObjectId = line.parse().map_err(Error::InvalidAddress)?;
            out.push(Address::new(*container, object));
        }
        Ok(out)
    }

    /// Part addresses recorded for a virtual parent.
    pub fn split_parts(&self, parent: &Address) -> Result<Vec<Address>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(SPLIT)?;
        let Some(list) = table.get(parent.encode_to_string().as_str())? else {
            return Ok(Vec::new());
        };
        let raw = list.value().to_vec();
        let mut out = Vec::new();
        for line in std::str::from_utf8(&raw)
            .map_err(|_| Error::corrupted("split index is not utf-8"))?
            .lines()
        {
            out.push(line.parse()?);
        }
        Ok(out)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn virtual_parent_header(addr: &Address, info: &SplitInfo) -> ObjectHeader {
    ObjectHeader {
        container_id: addr.container,
        object_id: addr.object,
        payload_size: 0,
        object_type: ObjectType::Regular,
        split: Some(*info),
        payload_checksum: 0,
        created_epoch: 0,
    }
}

/// Append `item` to the newline-separated list under `key`, once.
fn append_to_list(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    key: &str,
    item: &str,
) -> Result<()> {
    let existing = table.get(key)?.map(|g| g.value().to_vec());
    let mut list = match existing {
        Some(raw) => {
            let text = std::str::from_utf8(&raw)
                .map_err(|_| Error::corrupted("index list is not utf-8"))?;
            if text.lines().any(|l| l == item) {
                return Ok(());
            }
            raw
        }
        None => Vec::new(),
    };
    if !list.is_empty() {
        list.push(b'\n');
    }
    list.extend_from_slice(item.as_bytes());
    table.insert(key, list.as_slice())?;
    Ok(())
}

enum Record {
    Header {
        header: ObjectHeader,
        hint: Option<String>,
        #[allow(dead_code)]
        stored_at: u64,
    },
    Virtual {
        info: SplitInfo,
        #[allow(dead_code)]
        stored_at: u64,
    },
}

fn encode_header_record(header: &ObjectHeader, hint: Option<&str>, stored_at: u64) -> Vec<u8> {
    let header_bytes = header.encode();
    let hint_bytes = hint.unwrap_or_default().as_bytes();

    let mut buf = Vec::with_capacity(1 + 8 + 2 + hint_bytes.len() + 4 + header_bytes.len());
    let mut flags = 0u8;
    if hint.is_some() {
        flags |= FLAG_HINT;
    }
    buf.push(flags);
    buf.extend_from_slice(&stored_at.to_le_bytes());
    buf.extend_from_slice(&(hint_bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(hint_bytes);
    buf.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(&header_bytes);
    buf
}

fn encode_virtual_record(info: &SplitInfo, stored_at: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + 32 + 64);
    let mut flags = FLAG_VIRTUAL;
    if info.last_part_id.is_some() {
        flags |= FLAG_LAST_PART;
    }
    if info.link_id.is_some() {
        flags |= FLAG_LINK;
    }
    buf.push(flags);
    buf.extend_from_slice(&stored_at.to_le_bytes());
    buf.extend_from_slice(info.parent_id.as_bytes());
    if let Some(last) = &info.last_part_id {
        buf.extend_from_slice(last.as_bytes());
    }
    if let Some(link) = &info.link_id {
        buf.extend_from_slice(link.as_bytes());
    }
    buf
}

fn decode_record(data: &[u8]) -> Result<Record> {
    if data.len() < 9 {
        return Err(Error::corrupted("metabase record truncated"));
    }
    let flags = data[0];
    let stored_at = u64::from_le_bytes(data[1..9].try_into().unwrap());
    let mut off = 9;

    if flags & FLAG_VIRTUAL != 0 {
        let mut need = 32;
        if flags & FLAG_LAST_PART != 0 {
            need += 32;
        }
        if flags & FLAG_LINK != 0 {
            need += 32;
        }
        if data.len() < off + need {
            return Err(Error::corrupted("metabase split record truncated"));
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
            Some(ObjectId::from_bytes(read_digest(&data[off..off + 32])))
        } else {
            None
        };
        return Ok(Record::Virtual {
            info: SplitInfo {
                parent_id,
                last_part_id,
                link_id,
            },
            stored_at,
        });
    }

    if data.len() < off + 2 {
        return Err(Error::corrupted("metabase record truncated"));
    }
    let hint_len = u16::from_le_bytes(data[off..off + 2].try_into().unwrap()) as usize;
    off += 2;
    if data.len() < off + hint_len + 4 {
        return Err(Error::corrupted("metabase record truncated"));
    }
    let hint = if flags & FLAG_HINT != 0 {
        let s = std::str::from_utf8(&data[off..off + hint_len])
            .map_err(|_| Error::corrupted("metabase hint is not utf-8"))?;
        Some(s.to_string())
    } else {
        None
    };
    off += hint_len;

    let header_len = u32::from_le_bytes(data[off..off + 4].try_into().unwrap()) as usize;
    off += 4;
    if data.len() < off + header_len {
        return Err(Error::corrupted("metabase record truncated"));
    }
    let (header, _) = ObjectHeader::decode(&data[off..off + header_len])?;

    Ok(Record::Header {
        header,
        hint,
        stored_at,
    })
}

fn read_digest(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(data);
    out
}
