//! Wake Notifications
//!
//! Blocked consumers sleep on a per-process doorbell, a Unix datagram
//! socket at `{shm_root}/{process}_{instance}.bell`. A producer that finds a
//! sleeping consumer slot clears its flag and sends one tagged frame naming
//! the channel, the consumer slot and the kind of wake-up.

use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, trace};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{ChannelError, Result};
use crate::ring::{Role, ShmRing};
use shmq_config::limits::{CHANNEL_NAME_LEN, MAX_ENDPOINTS};

const DOORBELL_EXT: &str = "bell";

/// Why a consumer was woken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WakeKind {
    /// Data pending on a channel
    Data = 1,
    /// Control message pending on the command channel
    Command = 2,
}

impl WakeKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(WakeKind::Data),
            2 => Some(WakeKind::Command),
            _ => None,
        }
    }
}

/// Wire frame of a wake-up
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct WakeFrame {
    kind: u8,
    slot: u8,
    _reserved: [u8; 2],
    sender_pid: u32,
    channel: [u8; CHANNEL_NAME_LEN],
}

const FRAME_LEN: usize = std::mem::size_of::<WakeFrame>();

/// A decoded wake-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeMessage {
    pub kind: WakeKind,
    /// Consumer slot of the woken endpoint on `channel`
    pub slot: usize,
    pub channel: String,
    pub sender_pid: u32,
}

impl WakeMessage {
    pub fn data(channel: &str, slot: usize) -> Self {
        Self {
            kind: WakeKind::Data,
            slot,
            channel: channel.to_string(),
            sender_pid: std::process::id(),
        }
    }

    pub fn command(channel: &str) -> Self {
        Self {
            kind: WakeKind::Command,
            slot: 0,
            channel: channel.to_string(),
            sender_pid: std::process::id(),
        }
    }

    fn encode(&self) -> Result<WakeFrame> {
        let name = self.channel.as_bytes();
        if name.len() > CHANNEL_NAME_LEN || self.slot >= MAX_ENDPOINTS {
            return Err(ChannelError::invalid_argument(format!(
                "cannot encode wake for {:?} slot {}",
                self.channel, self.slot
            )));
        }
        let mut channel = [0u8; CHANNEL_NAME_LEN];
        channel[..name.len()].copy_from_slice(name);
        Ok(WakeFrame {
            kind: self.kind as u8,
            slot: self.slot as u8,
            _reserved: [0; 2],
            sender_pid: self.sender_pid,
            channel,
        })
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let frame = WakeFrame::read_from(bytes).ok_or_else(|| {
            ChannelError::corrupted(format!("wake frame of {} bytes", bytes.len()))
        })?;
        let kind = WakeKind::from_u8(frame.kind)
            .ok_or_else(|| ChannelError::corrupted(format!("unknown wake kind {}", frame.kind)))?;
        if frame.slot as usize >= MAX_ENDPOINTS {
            return Err(ChannelError::corrupted(format!("wake for slot {}", frame.slot)));
        }
        let end = frame
            .channel
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(CHANNEL_NAME_LEN);
        Ok(Self {
            kind,
            slot: frame.slot as usize,
            channel: String::from_utf8_lossy(&frame.channel[..end]).into_owned(),
            sender_pid: frame.sender_pid,
        })
    }
}

/// Receiving side: one per process instance
#[derive(Debug)]
pub struct Doorbell {
    path: PathBuf,
    socket: UnixDatagram,
    cleanup_on_drop: bool,
}

impl Doorbell {
    /// Socket path of the endpoint `{process}_{instance}`
    pub fn path_for(root: &Path, endpoint: &str) -> PathBuf {
        root.join(format!("{}.{}", endpoint, DOORBELL_EXT))
    }

    /// Bind the doorbell, replacing a stale socket left by a crash
    pub fn bind(root: &Path, endpoint: &str) -> Result<Self> {
        let path = Self::path_for(root, endpoint);

        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| ChannelError::io("Failed to remove existing doorbell", e))?;
        }
        std::fs::create_dir_all(root)
            .map_err(|e| ChannelError::io("Failed to create doorbell directory", e))?;

        let socket = UnixDatagram::bind(&path)
            .map_err(|e| ChannelError::io(format!("Failed to bind doorbell {:?}", path), e))?;

        info!("Doorbell listening on: {:?}", path);
        Ok(Self {
            path,
            socket,
            cleanup_on_drop: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block up to `timeout` for one wake-up
    ///
    /// `Ok(None)` means nothing arrived; callers are expected to loop.
    pub fn wait(&self, timeout: Duration) -> Result<Option<WakeMessage>> {
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .map_err(|e| ChannelError::io("Failed to arm doorbell timeout", e))?;

        let mut buf = [0u8; FRAME_LEN];
        match self.socket.recv(&mut buf) {
            Ok(len) => {
                let message = WakeMessage::decode(&buf[..len])?;
                trace!("Doorbell {:?} woke for {:?}", self.path, message);
                Ok(Some(message))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(ChannelError::io("Failed to read doorbell", e)),
        }
    }
}

impl Drop for Doorbell {
    fn drop(&mut self) {
        if self.cleanup_on_drop && self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Sending side, shared by every channel of a process
#[derive(Debug)]
pub struct Notifier {
    root: PathBuf,
    socket: UnixDatagram,
}

impl Notifier {
    pub fn new(root: &Path) -> Result<Self> {
        let socket = UnixDatagram::unbound()
            .map_err(|e| ChannelError::io("Failed to create notifier socket", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ChannelError::io("Failed to configure notifier socket", e))?;
        Ok(Self {
            root: root.to_path_buf(),
            socket,
        })
    }

    /// Wake the first sleeping consumer of `ring`
    ///
    /// Clears that consumer's sleep flag and sends it one wake-up. Returns
    /// the woken slot, `None` if no consumer was asleep. Delivery failures
    /// are logged only: the consumer's wait times out and it polls anyway.
    pub fn notify(&self, ring: &ShmRing) -> Option<usize> {
        let (slot, name) = ring
            .endpoints(Role::Consumer)
            .iter()
            .enumerate()
            .find(|(_, endpoint)| endpoint.take_sleeping())
            .map(|(slot, endpoint)| (slot, endpoint.name()))?;

        if let Err(e) = self.send(&name, &WakeMessage::data(ring.name(), slot)) {
            debug!("Wake for {} on {} not delivered: {}", name, ring.name(), e);
        }
        Some(slot)
    }

    /// Wake the command receiver registered in slot zero of `ring`
    pub fn notify_control(&self, ring: &ShmRing) -> Result<()> {
        let receiver = ring
            .endpoints(Role::Consumer)
            .get(0)
            .ok_or_else(|| ChannelError::not_found("command receiver", ring.name()))?;
        self.send(&receiver.name(), &WakeMessage::command(ring.name()))
    }

    fn send(&self, endpoint: &str, message: &WakeMessage) -> Result<()> {
        let path = Doorbell::path_for(&self.root, endpoint);
        let frame = message.encode()?;
        self.socket
            .send_to(frame.as_bytes(), &path)
            .map_err(|e| ChannelError::io(format!("Failed to ring doorbell {:?}", path), e))?;
        Ok(())
    }
}
