//! Runtime for the vioduct tunnel.
//!
//! Two peers share one bidirectional byte stream (a virtio-serial port, or
//! a unix socket standing in for one): [`guest::GuestProxy`] accepts SOCKS5
//! clients inside the VM and multiplexes them into slot-tagged frames;
//! [`host::HostProxy`] demultiplexes on the other side and performs the
//! real TCP egress. Each peer is one single-threaded mio loop; the slot
//! table, framed transport and endpoint plumbing here are shared by both.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod guest;
pub mod host;
pub mod table;
pub mod transport;
