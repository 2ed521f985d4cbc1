//! The channel catalogue and the disk-backed image provider.
//!
//! Images are shared as `Arc<Image>`; the provider hands out clones and a
//! per-connection cache keeps the most recently served image alive across
//! the segment requests of one boot.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::config::{ChannelConfig, ChannelKindConfig};
use crate::conn::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Raw images; every segment gets wrapped on the way out.
    Nabu,
    /// Pre-wrapped segment archives; extraction refreshes the CRC.
    Pak,
}

#[derive(Debug)]
pub struct Channel {
    pub number: i16,
    pub name: String,
    pub kind: ChannelKind,
    pub directory: PathBuf,
    pub default_file: Option<String>,
    pub retronet_enabled: bool,
}

/// A loaded, resolvable artifact. `channel` is absent for synthetic
/// images such as the clock packet.
#[derive(Debug)]
pub struct Image {
    pub name: String,
    /// 24-bit image number.
    pub number: u32,
    pub data: Vec<u8>,
    pub channel: Option<Arc<Channel>>,
}

impl Image {
    pub fn is_pak(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|c| c.kind == ChannelKind::Pak)
    }
}

pub struct Catalogue {
    channels: HashMap<i16, Arc<Channel>>,
}

impl Catalogue {
    pub fn from_config(channels: &[ChannelConfig]) -> Result<Self> {
        let mut map = HashMap::new();
        for cfg in channels {
            let chan = Arc::new(Channel {
                number: cfg.number,
                name: cfg.name.clone(),
                kind: match cfg.kind {
                    ChannelKindConfig::Nabu => ChannelKind::Nabu,
                    ChannelKindConfig::Pak => ChannelKind::Pak,
                },
                directory: cfg.directory.clone(),
                default_file: cfg.default_file.clone(),
                retronet_enabled: cfg.retronet,
            });
            if map.insert(cfg.number, chan).is_some() {
                bail!("duplicate channel number {}", cfg.number);
            }
        }
        Ok(Self { channels: map })
    }

    pub fn lookup(&self, number: i16) -> Option<Arc<Channel>> {
        self.channels.get(&number).cloned()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Resolve `(connection, image number)` to image bytes.
///
/// Pak channels store one archive per image number; nabu channels serve
/// the selected file (or the channel default) regardless of the requested
/// number, falling back to a number-derived name.
pub fn load(conn: &Connection, number: u32) -> Option<Arc<Image>> {
    if let Some(img) = conn.last_image() {
        if img.number == number {
            log::debug!(
                target: "image",
                "[{}] Reusing last image {} ({:06X}).",
                conn.name(),
                img.name,
                number
            );
            return Some(img);
        }
    }

    let Some(chan) = conn.channel() else {
        log::error!(target: "image", "[{}] No channel selected.", conn.name());
        return None;
    };

    let fname = match chan.kind {
        ChannelKind::Pak => format!("{number:06X}.pak"),
        ChannelKind::Nabu => conn
            .selected_file()
            .unwrap_or_else(|| format!("{number:06X}.nabu")),
    };

    let path = chan.directory.join(&fname);
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(err) => {
            log::error!(
                target: "image",
                "[{}] Unable to load image {:06X} from {}: {}",
                conn.name(),
                number,
                path.display(),
                err
            );
            return None;
        }
    };

    log::info!(
        target: "image",
        "[{}] Loaded image {:06X} from {} ({} bytes).",
        conn.name(),
        number,
        path.display(),
        data.len()
    );

    let img = Arc::new(Image {
        name: fname,
        number,
        data,
        channel: Some(chan),
    });
    drop(conn.set_last_image(Some(img.clone())));
    Some(img)
}

/// Release an image handed out by [`load`]. Once the final segment has
/// been sent the boot is over; drop the cached copy unless something else
/// already replaced it.
pub fn unload(conn: &Connection, img: &Arc<Image>, was_last_segment: bool) {
    if was_last_segment {
        drop(conn.set_last_image_if(img, None));
    }
}

/// Point the connection at catalogue channel `number`; an unknown number
/// clears the selection.
pub fn channel_select(catalogue: &Catalogue, conn: &Connection, number: i16) {
    match catalogue.lookup(number) {
        Some(chan) => {
            log::info!(
                target: "image",
                "[{}] Selected channel 0x{:04x} ({}).",
                conn.name(),
                number as u16,
                chan.name
            );
            conn.set_channel(Some(chan));
        }
        None => {
            log::warn!(
                target: "image",
                "[{}] Unknown channel 0x{:04x}; clearing selection.",
                conn.name(),
                number as u16
            );
            conn.set_channel(None);
        }
    }
}
