//! Per-client connection state and its thread-safe accessors.
//!
//! A `Connection` is shared between its worker task, the registry, and
//! anything enumerating connections, so everything mutable sits behind a
//! mutex. The locks are never held across an await point and the selected-
//! file copy-out never allocates while holding one.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::image::{Channel, Image};
use crate::nhacp::NhacpSession;
use crate::registry::Registry;
use crate::retronet::RnStore;

pub type ConnRef = Arc<Connection>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnKind {
    /// A passive TCP socket; has no byte channel of its own.
    Listener,
    /// Serial parameters are captured for display only.
    Serial {
        baud: u32,
        stop_bits: u8,
        flow_control: bool,
    },
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Ok,
    Eof,
    Cancelled,
    Aborted,
}

#[derive(Default)]
struct Selected {
    channel: Option<Arc<Channel>>,
    file: Option<String>,
    last_image: Option<Arc<Image>>,
    retronet_enabled: bool,
}

pub struct Connection {
    id: u64,
    kind: ConnKind,
    name: String,
    pub file_root: Option<PathBuf>,

    state: Mutex<ConnState>,
    cancel: Notify,
    select: Mutex<Selected>,

    pub nhacp_sessions: Mutex<BTreeMap<u8, NhacpSession>>,
    pub retronet: Mutex<Option<RnStore>>,
}

impl Connection {
    pub fn new(kind: ConnKind, name: String, file_root: Option<PathBuf>) -> ConnRef {
        static IDS: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: IDS.fetch_add(1, Ordering::Relaxed),
            kind,
            name,
            file_root,
            state: Mutex::new(ConnState::Ok),
            cancel: Notify::new(),
            select: Mutex::new(Selected::default()),
            nhacp_sessions: Mutex::new(BTreeMap::new()),
            retronet: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &ConnKind {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: ConnState) {
        *self.state.lock().unwrap() = state;
    }

    /// True while the connection is still usable; any terminal state
    /// (EOF, cancelled, aborted) makes the worker wind down.
    pub fn check_state(&self) -> bool {
        self.state() == ConnState::Ok
    }

    /// Mark the connection cancelled and unwedge a blocked read.
    pub fn cancel(&self) {
        self.set_state(ConnState::Cancelled);
        self.cancel.notify_one();
    }

    pub async fn cancelled(&self) {
        self.cancel.notified().await
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.select.lock().unwrap().channel.clone()
    }

    /// Select `chan` (or clear the selection). Changing the channel
    /// implicitly clears the selected file and mirrors the channel's
    /// RetroNet flag.
    pub fn set_channel(&self, chan: Option<Arc<Channel>>) {
        let old_file;
        {
            let mut sel = self.select.lock().unwrap();
            sel.retronet_enabled = chan.as_ref().is_some_and(|c| c.retronet_enabled);
            sel.channel = chan;
            old_file = sel.file.take();
        }
        drop(old_file);
    }

    pub fn retronet_enabled(&self) -> bool {
        self.select.lock().unwrap().retronet_enabled
    }

    fn selected_file_logic(sel: &Selected) -> Option<&str> {
        if let Some(file) = sel.file.as_deref() {
            return Some(file);
        }
        sel.channel.as_ref().and_then(|c| c.default_file.as_deref())
    }

    /// Copy out the selected file (explicit selection, else the channel
    /// default). The buffer is allocated outside the lock and the
    /// selection re-checked afterwards; if it grew in between, retry.
    pub fn selected_file(&self) -> Option<String> {
        loop {
            let len = {
                let sel = self.select.lock().unwrap();
                Self::selected_file_logic(&sel)?.len()
            };

            let mut out = String::with_capacity(len);

            let sel = self.select.lock().unwrap();
            match Self::selected_file_logic(&sel) {
                Some(name) if name.len() <= len => {
                    out.push_str(name);
                    return Some(out);
                }
                Some(_) => continue,
                None => return None,
            }
        }
    }

    pub fn set_selected_file(&self, name: Option<String>) {
        let old = {
            let mut sel = self.select.lock().unwrap();
            std::mem::replace(&mut sel.file, name)
        };
        drop(old);
    }

    pub fn last_image(&self) -> Option<Arc<Image>> {
        self.select.lock().unwrap().last_image.clone()
    }

    /// Install `img` as the most recently served image, returning the old
    /// value.
    pub fn set_last_image(&self, img: Option<Arc<Image>>) -> Option<Arc<Image>> {
        let mut sel = self.select.lock().unwrap();
        std::mem::replace(&mut sel.last_image, img)
    }

    /// Like [`set_last_image`](Self::set_last_image), but only if the slot
    /// still holds `expect`; a concurrent replacement wins the race.
    pub fn set_last_image_if(
        &self,
        expect: &Arc<Image>,
        img: Option<Arc<Image>>,
    ) -> Option<Arc<Image>> {
        let mut sel = self.select.lock().unwrap();
        let matches = sel
            .last_image
            .as_ref()
            .is_some_and(|cur| Arc::ptr_eq(cur, expect));
        if matches {
            std::mem::replace(&mut sel.last_image, img)
        } else {
            None
        }
    }

    /// Client reboot: throw away all sub-protocol state.
    pub fn reboot(&self) {
        crate::nhacp::conn_fini(self);
        crate::retronet::conn_fini(self);
    }

    /// Tear the connection down: deregister (waiting out any enumerators),
    /// release the cached image, and run reboot cleanup. The byte channel
    /// itself closes when the worker drops its I/O halves.
    pub fn destroy(self: &Arc<Self>, registry: &Registry) {
        registry.remove(self);
        drop(self.set_last_image(None));
        self.reboot();
    }
}
