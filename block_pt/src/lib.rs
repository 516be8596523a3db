// Copyright (c) 2024 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Host optical-drive passthrough backend.
//!
//! This crate owns the storage-facing half of ATAPI passthrough: the
//! `SG_IO` v4 plumbing towards a host BSG node, and the shared media
//! presence state that lets several consumers of one physical drive
//! agree on whether a disc is in the tray.

pub mod sgio;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockPtError {
    #[error("Failed to open passthrough node {path}")]
    OpenNode {
        path: String,
        source: std::io::Error,
    },
    #[error("SG_IO ioctl failed")]
    SgIo { source: std::io::Error },
    #[error("SG_GET_RESERVED_SIZE ioctl failed")]
    ReservedSize { source: std::io::Error },
}

/// Media presence as last observed on the host drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MediaState {
    Unknown = 0,
    Present = 1,
    Absent = 2,
}

impl From<u32> for MediaState {
    fn from(v: u32) -> Self {
        match v {
            1 => MediaState::Present,
            2 => MediaState::Absent,
            _ => MediaState::Unknown,
        }
    }
}

/// Media presence bookkeeping for one physical drive.
///
/// `last` is what this consumer most recently reported to its guest.
/// `shared` is common to every consumer of the drive and may be updated
/// out of band, eg by a management daemon watching the physical tray.
/// The two are compared to decide when a synthetic media event must be
/// injected into an idle event poll.
pub struct MediaStateChannel {
    last: AtomicU32,
    shared: Arc<AtomicU32>,
}

impl MediaStateChannel {
    pub fn new(shared: Arc<AtomicU32>) -> Self {
        MediaStateChannel {
            last: AtomicU32::new(MediaState::Unknown as u32),
            shared,
        }
    }

    pub fn set_unknown(&self) {
        self.last.store(MediaState::Unknown as u32, Ordering::SeqCst);
        self.shared
            .store(MediaState::Unknown as u32, Ordering::SeqCst);
    }

    pub fn set_present(&self) {
        self.last.store(MediaState::Present as u32, Ordering::SeqCst);
        self.shared
            .store(MediaState::Present as u32, Ordering::SeqCst);
    }

    pub fn set_absent(&self) {
        self.last.store(MediaState::Absent as u32, Ordering::SeqCst);
        self.shared
            .store(MediaState::Absent as u32, Ordering::SeqCst);
    }

    pub fn last_state(&self) -> MediaState {
        MediaState::from(self.last.load(Ordering::SeqCst))
    }

    pub fn shared_state(&self) -> MediaState {
        MediaState::from(self.shared.load(Ordering::SeqCst))
    }
}

impl Default for MediaStateChannel {
    fn default() -> Self {
        MediaStateChannel::new(Arc::new(AtomicU32::new(MediaState::Unknown as u32)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_state_from_raw() {
        assert_eq!(MediaState::from(0), MediaState::Unknown);
        assert_eq!(MediaState::from(1), MediaState::Present);
        assert_eq!(MediaState::from(2), MediaState::Absent);
        assert_eq!(MediaState::from(77), MediaState::Unknown);
    }

    #[test]
    fn test_media_channel_transitions() {
        let channel = MediaStateChannel::default();
        assert_eq!(channel.last_state(), MediaState::Unknown);
        assert_eq!(channel.shared_state(), MediaState::Unknown);

        channel.set_present();
        assert_eq!(channel.last_state(), MediaState::Present);
        assert_eq!(channel.shared_state(), MediaState::Present);

        channel.set_absent();
        assert_eq!(channel.last_state(), MediaState::Absent);
        assert_eq!(channel.shared_state(), MediaState::Absent);
    }

    #[test]
    fn test_media_channel_external_update() {
        let shared = Arc::new(AtomicU32::new(MediaState::Unknown as u32));
        let channel = MediaStateChannel::new(shared.clone());
        channel.set_present();

        // Another consumer ejected the disc.
        shared.store(MediaState::Absent as u32, Ordering::SeqCst);
        assert_eq!(channel.last_state(), MediaState::Present);
        assert_eq!(channel.shared_state(), MediaState::Absent);
    }
}
