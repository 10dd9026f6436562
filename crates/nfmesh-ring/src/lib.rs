//! Descriptor rings and frame address pools used both inside a single NF
//! process (sibling routing) and as the building blocks the AF_XDP socket
//! layer maps onto kernel-shared memory.

pub mod pool;
pub mod ring;

pub use pool::FramePool;
pub use ring::{mpsc, spsc, MpscConsumer, MpscProducer, MpscReservation, Peeked, Reservation, SpscConsumer, SpscProducer};

/// The wire-compatible descriptor exchanged on rings that carry packets
/// rather than bare frame addresses: `(addr, len, options)`, matching the
/// kernel's `xdp_desc` layout so it can be copied directly onto a real
/// AF_XDP TX/RX ring.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

impl Descriptor {
    /// Fragmentation continuation bit (`CONTD`): set on every segment of a
    /// fragmented packet except the last.
    pub const OPT_CONTD: u32 = 1 << 0;

    pub fn is_fragment_continuation(&self) -> bool {
        self.options & Self::OPT_CONTD != 0
    }

    /// Stamp the upper 16 bits of `options` with a sibling routing tag,
    /// leaving the low 16 bits (fragmentation/protocol flags) untouched.
    pub fn with_sibling_tag(mut self, tag: u16) -> Self {
        self.options = (self.options & 0xffff) | (u32::from(tag) << 16);
        self
    }

    pub fn sibling_tag(&self) -> u16 {
        (self.options >> 16) as u16
    }
}
