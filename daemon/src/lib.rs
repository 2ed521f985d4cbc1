//! The Adaptor daemon: accepts NABU clients over serial or TCP, walks each
//! one through the classic boot protocol, and serves channel images from
//! disk. The binary in `main.rs` is a thin CLI wrapper around this crate.

pub mod adaptor;
pub mod config;
pub mod conn;
pub mod conn_io;
pub mod image;
pub mod nhacp;
pub mod registry;
pub mod retronet;

use image::Catalogue;
use registry::Registry;

/// Process-wide state shared by every connection worker.
pub struct Server {
    pub registry: Registry,
    pub catalogue: Catalogue,
}

impl Server {
    pub fn new(catalogue: Catalogue) -> Self {
        Self {
            registry: Registry::new(),
            catalogue,
        }
    }
}
