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

//! Linux BSG (`SG_IO` v4) command submission.

use std::fs::File;
use std::io;

use anyhow::{Context, Result};
use log::error;
use vmm_sys_util::ioctl::ioctl_with_mut_ref;

use crate::BlockPtError;

const SG_IO: u64 = 0x2285;
const SG_GET_RESERVED_SIZE: u64 = 0x2272;

const BSG_GUARD: i32 = 'Q' as i32;
const BSG_PROTOCOL_SCSI: u32 = 0;
const BSG_SUB_PROTOCOL_SCSI_CMD: u32 = 0;

/// `struct sg_io_v4` from linux/bsg.h.
#[repr(C)]
#[derive(Default, Clone, Copy)]
pub struct SgIoV4 {
    pub guard: i32,
    pub protocol: u32,
    pub subprotocol: u32,

    pub request_len: u32,
    pub request: u64,
    pub request_tag: u64,
    pub request_attr: u32,
    pub request_priority: u32,
    pub request_extra: u32,
    pub max_response_len: u32,
    pub response: u64,

    pub dout_iovec_count: u32,
    pub dout_xfer_len: u32,
    pub din_iovec_count: u32,
    pub din_xfer_len: u32,
    pub dout_xferp: u64,
    pub din_xferp: u64,

    pub timeout: u32,
    pub flags: u32,
    pub usr_ptr: u64,
    pub spare_in: u32,

    pub driver_status: u32,
    pub transport_status: u32,
    pub device_status: u32,
    pub retry_delay: u32,
    pub info: u32,
    pub duration: u32,
    pub response_len: u32,
    pub din_resid: i32,
    pub dout_resid: i32,
    pub generated_tag: u64,
    pub spare_out: u32,

    pub padding: u32,
}

/// Data phase of one passthrough command. A packet command moves payload
/// in at most one direction.
pub enum PtData<'a> {
    None,
    Out(&'a [u8]),
    In(&'a mut [u8]),
}

pub struct PtRequest<'a> {
    pub cdb: &'a [u8],
    pub data: PtData<'a>,
    pub sense: &'a mut [u8],
    pub timeout_ms: u32,
}

/// Raw status triple reported by the host for one command.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtStatus {
    pub driver: u32,
    pub transport: u32,
    pub device: u32,
}

impl PtStatus {
    /// Collapse the triple into one result code. Driver status takes
    /// precedence over transport status, transport over device.
    pub fn result(&self) -> i32 {
        if self.driver != 0 {
            self.driver as i32
        } else if self.transport != 0 {
            self.transport as i32
        } else {
            self.device as i32
        }
    }
}

/// Seam between the command translator and the host drive.
pub trait PassthroughOps: Send + Sync {
    /// Issue one SCSI command to the host device. `Ok` carries the raw
    /// status triple even when the command failed on the drive; `Err`
    /// means the submission itself could not be made.
    fn submit(&self, req: PtRequest) -> Result<PtStatus>;

    /// Largest single transfer the host interface accepts, in bytes.
    fn max_transfer_len(&self) -> Result<u32>;
}

/// A host optical drive reached through its BSG character node,
/// eg /dev/bsg/1:0:0:0.
pub struct HostBsgDevice {
    file: File,
}

impl HostBsgDevice {
    pub fn open(path: &str) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| BlockPtError::OpenNode {
                path: path.to_string(),
                source: e,
            })?;
        Ok(HostBsgDevice { file })
    }
}

impl PassthroughOps for HostBsgDevice {
    fn submit(&self, req: PtRequest) -> Result<PtStatus> {
        let mut msg = SgIoV4 {
            guard: BSG_GUARD,
            protocol: BSG_PROTOCOL_SCSI,
            subprotocol: BSG_SUB_PROTOCOL_SCSI_CMD,
            request_len: req.cdb.len() as u32,
            request: req.cdb.as_ptr() as u64,
            max_response_len: req.sense.len() as u32,
            response: req.sense.as_mut_ptr() as u64,
            timeout: req.timeout_ms,
            ..Default::default()
        };
        match req.data {
            PtData::None => {}
            PtData::Out(buf) => {
                msg.dout_xfer_len = buf.len() as u32;
                msg.dout_xferp = buf.as_ptr() as u64;
            }
            PtData::In(buf) => {
                msg.din_xfer_len = buf.len() as u32;
                msg.din_xferp = buf.as_mut_ptr() as u64;
            }
        }

        // SAFETY: every pointer stored in msg refers to a buffer borrowed
        // by req, which outlives the ioctl, and the kernel writes no more
        // than the lengths given alongside each pointer.
        let ret = unsafe { ioctl_with_mut_ref(&self.file, SG_IO, &mut msg) };
        if ret < 0 {
            let source = io::Error::last_os_error();
            error!("SG_IO ioctl returned {}: {:?}", ret, source);
            return Err(BlockPtError::SgIo { source }.into());
        }

        Ok(PtStatus {
            driver: msg.driver_status,
            transport: msg.transport_status,
            device: msg.device_status,
        })
    }

    fn max_transfer_len(&self) -> Result<u32> {
        let mut size: i32 = 0;
        // SAFETY: SG_GET_RESERVED_SIZE writes a single i32.
        let ret = unsafe { ioctl_with_mut_ref(&self.file, SG_GET_RESERVED_SIZE, &mut size) };
        if ret < 0 {
            return Err(BlockPtError::ReservedSize {
                source: io::Error::last_os_error(),
            }
            .into());
        }
        u32::try_from(size).with_context(|| format!("Invalid reserved size {}", size))
    }
}
