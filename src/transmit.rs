//! Frame transmit collaborator.

use crate::portset::PortSet;

use parking_lot::Mutex;

use std::sync::Arc;

/// How a frame is tagged on egress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tagging {
    pub pcp: u8,

    /// send untagged regardless of the port's VLAN membership
    pub force_untag: bool,
}

/// Hands complete frames to the ports in `ports`.
///
/// The engine has already removed ports that are down, not forwarding or
/// not members of `vid`, and picked one port per aggregation.
pub trait Transmit: Send {
    fn transmit(&mut self, frame: &[u8], ports: PortSet, vid: u16, tagging: Tagging) -> std::io::Result<()>;
}

impl<T: Transmit> Transmit for Arc<Mutex<T>> {
    fn transmit(&mut self, frame: &[u8], ports: PortSet, vid: u16, tagging: Tagging) -> std::io::Result<()> {
        self.lock().transmit(frame, ports, vid, tagging)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub frame: Vec<u8>,
    pub ports: PortSet,
    pub vid: u16,
    pub tagging: Tagging,
}

/// Keeps every frame it is given.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransmit {
    frames: Vec<SentFrame>,
}

impl RecordingTransmit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(self))
    }

    pub fn frames(&self) -> &[SentFrame] {
        &self.frames
    }

    pub fn take(&mut self) -> Vec<SentFrame> {
        std::mem::take(&mut self.frames)
    }
}

impl Transmit for RecordingTransmit {
    fn transmit(&mut self, frame: &[u8], ports: PortSet, vid: u16, tagging: Tagging) -> std::io::Result<()> {
        self.frames.push(SentFrame {
            frame: frame.to_vec(),
            ports,
            vid,
            tagging,
        });
        Ok(())
    }
}
