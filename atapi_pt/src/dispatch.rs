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

//! Command submission towards the host, with transfer segmentation.

use std::cmp;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, warn};

use block_pt::sgio::{PassthroughOps, PtData, PtRequest};

use crate::command::{
    ASC_INV_FIELD_IN_CMD_PACKET, CD_FRAME_SIZE, ILLEGAL_REQUEST, READ_10, WRITE_10,
    WRITE_AND_VERIFY_10,
};
use crate::device::{AtapiPtState, DEFAULT_TIMEOUT_MS};
use crate::sizes::cmd_name;

/// Submit the prepared command to the host drive, splitting the transfer
/// into segments of at most `max_xfer_len` bytes. Only the three
/// LBA-addressed transfers can be split and re-encoded per segment; any
/// other command whose transfer exceeds the host limit fails locally.
/// The loop runs once even for commands that move no data.
pub(crate) fn dispatch_cmd(state: &mut AtapiPtState, ops: &dyn PassthroughOps) {
    let op = state.request[0];
    let is_dout = state.dout_xfer_len > 0;
    let total = if is_dout {
        state.dout_xfer_len
    } else {
        state.din_xfer_len
    };

    if state.timeout != DEFAULT_TIMEOUT_MS {
        debug!("'{}' timeout raised to {} ms", cmd_name(op), state.timeout);
    }

    let mut request = state.request;
    let mut seg_offset: u32 = 0;

    loop {
        let seg_len = cmp::min(state.max_xfer_len, total - seg_offset);

        if total > state.max_xfer_len {
            if matches!(op, READ_10 | WRITE_10 | WRITE_AND_VERIFY_10) {
                // LBA arithmetic wraps like the 32-bit field it lives in;
                // the drive rejects the out-of-range address itself.
                let lba = BigEndian::read_u32(&state.request[2..6])
                    .wrapping_add(seg_offset / CD_FRAME_SIZE);
                BigEndian::write_u32(&mut request[2..6], lba);
                BigEndian::write_u16(&mut request[7..9], (seg_len / CD_FRAME_SIZE) as u16);
                debug!(
                    "'{}' segment at lba {}, {} of {} bytes",
                    cmd_name(op),
                    lba,
                    seg_len,
                    total
                );
            } else {
                warn!(
                    "'{}' transfer of {} bytes exceeds the host limit of {}",
                    cmd_name(op),
                    total,
                    state.max_xfer_len
                );
                state
                    .sense
                    .set_fixed(ILLEGAL_REQUEST, ASC_INV_FIELD_IN_CMD_PACKET, 0);
                state.result = -1;
                return;
            }
        }

        let range = seg_offset as usize..(seg_offset + seg_len) as usize;
        let data = if seg_len == 0 {
            PtData::None
        } else if is_dout {
            PtData::Out(&state.io_buffer[range])
        } else {
            PtData::In(&mut state.io_buffer[range])
        };

        state.result = match ops.submit(PtRequest {
            cdb: &request,
            data,
            sense: state.sense.as_mut_bytes(),
            timeout_ms: state.timeout,
        }) {
            Ok(status) => status.result(),
            Err(e) => {
                error!("SG_IO submission failed for '{}': {:?}", cmd_name(op), e);
                -libc::EIO
            }
        };

        seg_offset += seg_len;
        if state.result != 0 || seg_offset >= total {
            break;
        }
    }

    if state.result != 0 {
        match state.sense.format() {
            0x70..=0x71 => error!(
                "'{}' failed, sense {:x}.{:x}.{:x}",
                cmd_name(op),
                state.sense.sense_key(),
                state.sense.asc(),
                state.sense.ascq()
            ),
            0x72..=0x73 => {
                warn!(
                    "'{}' returned descriptor format sense {:x}.{:x}.{:x}",
                    cmd_name(op),
                    state.sense.sense_key(),
                    state.sense.asc(),
                    state.sense.ascq()
                );
                // Some host drives report descriptor sense for commands
                // that actually completed.
                if state.suppress_descriptor_sense {
                    state.result = 0;
                }
            }
            format => error!(
                "'{}' failed with unrecognised sense format 0x{:x}",
                cmd_name(op),
                format
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::Result;
    use byteorder::{BigEndian, ByteOrder};

    use block_pt::sgio::{PassthroughOps, PtData, PtRequest, PtStatus};

    use super::*;
    use crate::command::{
        ATAPI_PACKET_LEN, CHECK_CONDITION, READ_BUFFER, SENSE_DATA_LEN, TEST_UNIT_READY,
    };

    #[derive(Clone)]
    struct SubmitRecord {
        cdb: [u8; ATAPI_PACKET_LEN],
        din_len: usize,
        dout_len: usize,
        timeout_ms: u32,
    }

    struct FakeDrive {
        max_len: u32,
        calls: Mutex<Vec<SubmitRecord>>,
        /// Zero-based call index that fails with the given sense bytes.
        fail_on: Option<(usize, [u8; SENSE_DATA_LEN])>,
    }

    impl FakeDrive {
        fn new(max_len: u32) -> Self {
            FakeDrive {
                max_len,
                calls: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }

        fn failing(max_len: u32, index: usize, sense: [u8; SENSE_DATA_LEN]) -> Self {
            FakeDrive {
                fail_on: Some((index, sense)),
                ..FakeDrive::new(max_len)
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl PassthroughOps for FakeDrive {
        fn submit(&self, req: PtRequest) -> Result<PtStatus> {
            let mut cdb = [0_u8; ATAPI_PACKET_LEN];
            cdb.copy_from_slice(req.cdb);
            let (din_len, dout_len) = match &req.data {
                PtData::None => (0, 0),
                PtData::Out(buf) => (0, buf.len()),
                PtData::In(buf) => (buf.len(), 0),
            };
            let mut calls = self.calls.lock().unwrap();
            let index = calls.len();
            calls.push(SubmitRecord {
                cdb,
                din_len,
                dout_len,
                timeout_ms: req.timeout_ms,
            });

            if let Some((fail_index, sense)) = &self.fail_on {
                if index == *fail_index {
                    req.sense[..SENSE_DATA_LEN].copy_from_slice(sense);
                    return Ok(PtStatus {
                        device: u32::from(CHECK_CONDITION),
                        ..Default::default()
                    });
                }
            }
            Ok(PtStatus::default())
        }

        fn max_transfer_len(&self) -> Result<u32> {
            Ok(self.max_len)
        }
    }

    fn read_10_state(lba: u32, blocks: u16, max_xfer_len: u32) -> AtapiPtState {
        let mut state = AtapiPtState::new(max_xfer_len, true);
        state.request[0] = READ_10;
        BigEndian::write_u32(&mut state.request[2..6], lba);
        BigEndian::write_u16(&mut state.request[7..9], blocks);
        state.din_xfer_len = u32::from(blocks) * CD_FRAME_SIZE;
        state.io_buffer = vec![0; state.din_xfer_len as usize];
        state
    }

    #[test]
    fn test_zero_length_command_submits_once() {
        let drive = FakeDrive::new(4096);
        let mut state = AtapiPtState::new(4096, true);
        state.request[0] = TEST_UNIT_READY;

        dispatch_cmd(&mut state, &drive);

        assert_eq!(state.result, 0);
        let calls = drive.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].din_len, 0);
        assert_eq!(calls[0].dout_len, 0);
    }

    #[test]
    fn test_read_10_segments_advance_lba() {
        // 6 blocks against a 2-block host limit.
        let drive = FakeDrive::new(2 * CD_FRAME_SIZE);
        let mut state = read_10_state(100, 6, 2 * CD_FRAME_SIZE);

        dispatch_cmd(&mut state, &drive);

        assert_eq!(state.result, 0);
        let calls = drive.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        for (i, call) in calls.iter().enumerate() {
            assert_eq!(BigEndian::read_u32(&call.cdb[2..6]), 100 + 2 * i as u32);
            assert_eq!(BigEndian::read_u16(&call.cdb[7..9]), 2);
            assert_eq!(call.din_len, 2 * CD_FRAME_SIZE as usize);
        }
        // The guest-visible packet is untouched.
        assert_eq!(BigEndian::read_u32(&state.request[2..6]), 100);
    }

    #[test]
    fn test_read_10_segment_lba_wraps() {
        // 4 blocks starting at the last addressable LBA, 2-block limit.
        let drive = FakeDrive::new(2 * CD_FRAME_SIZE);
        let mut state = read_10_state(u32::MAX, 4, 2 * CD_FRAME_SIZE);

        dispatch_cmd(&mut state, &drive);

        assert_eq!(state.result, 0);
        let calls = drive.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(BigEndian::read_u32(&calls[0].cdb[2..6]), u32::MAX);
        // The second segment wraps through zero, as a 32-bit LBA field does.
        assert_eq!(BigEndian::read_u32(&calls[1].cdb[2..6]), 1);
    }

    #[test]
    fn test_failed_segment_stops_the_loop() {
        let mut sense = [0_u8; SENSE_DATA_LEN];
        sense[0] = 0x70;
        sense[2] = 3;
        let drive = FakeDrive::failing(2 * CD_FRAME_SIZE, 1, sense);
        let mut state = read_10_state(100, 6, 2 * CD_FRAME_SIZE);

        dispatch_cmd(&mut state, &drive);

        assert_eq!(state.result, i32::from(CHECK_CONDITION));
        assert_eq!(drive.call_count(), 2);
        assert_eq!(state.sense.sense_key(), 3);
    }

    #[test]
    fn test_overlong_unsegmentable_command_fails_locally() {
        let drive = FakeDrive::new(4096);
        let mut state = AtapiPtState::new(4096, true);
        state.request[0] = READ_BUFFER;
        state.din_xfer_len = 8192;
        state.io_buffer = vec![0; 8192];

        dispatch_cmd(&mut state, &drive);

        assert_eq!(state.result, -1);
        assert_eq!(drive.call_count(), 0);
        assert_eq!(state.sense.sense_key(), ILLEGAL_REQUEST);
        assert_eq!(state.sense.asc(), ASC_INV_FIELD_IN_CMD_PACKET);
    }

    #[test]
    fn test_timeout_reaches_the_host() {
        let drive = FakeDrive::new(4096);
        let mut state = AtapiPtState::new(4096, true);
        state.request[0] = TEST_UNIT_READY;
        state.timeout = 60_000;

        dispatch_cmd(&mut state, &drive);
        assert_eq!(drive.calls.lock().unwrap()[0].timeout_ms, 60_000);
    }

    #[test]
    fn test_descriptor_sense_suppression() {
        let mut sense = [0_u8; SENSE_DATA_LEN];
        sense[0] = 0x72;
        sense[1] = 5;
        sense[2] = 0x24;

        let drive = FakeDrive::failing(4096, 0, sense);
        let mut state = AtapiPtState::new(4096, true);
        state.request[0] = TEST_UNIT_READY;
        dispatch_cmd(&mut state, &drive);
        assert_eq!(state.result, 0);

        let drive = FakeDrive::failing(4096, 0, sense);
        let mut state = AtapiPtState::new(4096, false);
        state.request[0] = TEST_UNIT_READY;
        dispatch_cmd(&mut state, &drive);
        assert_eq!(state.result, i32::from(CHECK_CONDITION));
    }
}
