//! RetroNet dispatch seam and per-connection blob storage.
//!
//! RetroNet gets first refusal on unclaimed request bytes, gated on the
//! selected channel's flag (its opcode space collides with NHACP's). The
//! verb set itself -- the file/HTTP shim -- lives behind this seam; what
//! the adaptor core owns is the storage bag and its teardown on reboot.

use std::collections::HashMap;

use crate::conn::Connection;
use crate::conn_io::ConnIo;

#[derive(Debug)]
pub struct RnBlob {
    pub url: String,
    pub data: Vec<u8>,
}

/// Slot-addressed blob storage for one connection's RetroNet session.
#[derive(Debug, Default)]
pub struct RnStore {
    blobs: HashMap<u8, RnBlob>,
}

impl RnStore {
    pub fn store(&mut self, slot: u8, url: String, data: Vec<u8>) {
        self.blobs.insert(slot, RnBlob { url, data });
    }

    pub fn size(&self, slot: u8) -> Option<usize> {
        self.blobs.get(&slot).map(|b| b.data.len())
    }

    /// Read up to `len` bytes at `offset`; reads past the end clamp.
    pub fn read(&self, slot: u8, offset: usize, len: usize) -> Option<&[u8]> {
        let blob = self.blobs.get(&slot)?;
        let start = offset.min(blob.data.len());
        let end = offset.saturating_add(len).min(blob.data.len());
        Some(&blob.data[start..end])
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

/// Stash a blob on the connection, creating the session bag on first use.
pub fn store_blob(conn: &Connection, slot: u8, url: String, data: Vec<u8>) {
    let mut store = conn.retronet.lock().unwrap();
    store.get_or_insert_with(RnStore::default).store(slot, url, data);
}

pub fn blob_size(conn: &Connection, slot: u8) -> Option<usize> {
    conn.retronet.lock().unwrap().as_ref()?.size(slot)
}

/// Check for a RetroNet request. Channels that don't carry RetroNet never
/// claim anything, leaving the byte for the NHACP classifier.
pub async fn request(io: &mut ConnIo, _msg: u8) -> bool {
    if !io.conn().retronet_enabled() {
        return false;
    }
    // The verb set is not wired up; decline and let NHACP look at it.
    false
}

/// Free any stored blobs (client reboot or connection destruction).
pub fn conn_fini(conn: &Connection) {
    let store = conn.retronet.lock().unwrap().take();
    if let Some(store) = store {
        log::info!(
            target: "retronet",
            "[{}] Clearing previous RetroNet state ({} blob(s)).",
            conn.name(),
            store.len()
        );
    }
}
