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

//! Per-opcode transfer length recipes.
//!
//! For every supported packet opcode the table declares how to compute
//! three sizes: the outbound payload length (read from the CDB), the
//! inbound buffer capacity the guest allocated (also from the CDB), and
//! the byte count the device actually produced (read from the reply
//! header). All three share one shape,
//!
//! ```text
//! length = constant + big_endian_field(offset, width) * block_size
//! ```
//!
//! with a zero-width field contributing nothing. Opcodes without a table
//! entry are unsupported.

use byteorder::{BigEndian, ByteOrder};

use crate::command::*;

/// Marks a size that equals whatever the requested buffer length turned
/// out to be, used where no header field reports the produced count.
pub const SIZE_MATCHES_BUFFER: u32 = u32::MAX;

#[derive(Clone, Copy)]
struct SizeRecipe {
    len_const: u32,
    len_offset: usize,
    len_size: u32,
    block_size: u32,
}

#[derive(Clone, Copy)]
pub struct CmdRecipe {
    name: &'static str,
    dout: SizeRecipe,
    buffer: SizeRecipe,
    din: SizeRecipe,
}

/// Which of the three sizes to resolve.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SizeKind {
    /// Outbound payload length, from the CDB.
    Dout,
    /// Guest receive buffer capacity, from the CDB.
    Buffer,
    /// Byte count the device produced, from the reply data.
    Din,
}

const fn rcp(len_const: u32, len_offset: usize, len_size: u32, block_size: u32) -> SizeRecipe {
    SizeRecipe {
        len_const,
        len_offset,
        len_size,
        block_size,
    }
}

const NONE: SizeRecipe = rcp(0, 0, 0, 0);
const MATCHES: SizeRecipe = rcp(SIZE_MATCHES_BUFFER, 0, 0, 0);

const fn cmd(
    name: &'static str,
    dout: SizeRecipe,
    buffer: SizeRecipe,
    din: SizeRecipe,
) -> Option<CmdRecipe> {
    Some(CmdRecipe {
        name,
        dout,
        buffer,
        din,
    })
}

const fn no_data(name: &'static str) -> Option<CmdRecipe> {
    cmd(name, NONE, NONE, NONE)
}

static CMD_TABLE: [Option<CmdRecipe>; 256] = build_table();

const fn build_table() -> [Option<CmdRecipe>; 256] {
    let mut t: [Option<CmdRecipe>; 256] = [None; 256];

    t[TEST_UNIT_READY as usize] = no_data("TEST_UNIT_READY");
    t[REQUEST_SENSE as usize] = cmd("REQUEST_SENSE", NONE, rcp(0, 4, 1, 1), rcp(8, 7, 1, 1));
    t[FORMAT_UNIT as usize] = cmd("FORMAT_UNIT", rcp(12, 0, 0, 0), NONE, NONE);
    t[INQUIRY as usize] = cmd("INQUIRY", NONE, rcp(0, 4, 1, 1), rcp(5, 4, 1, 1));
    t[START_STOP_UNIT as usize] = no_data("START_STOP_UNIT");
    t[PREVENT_ALLOW_MEDIUM_REMOVAL as usize] = no_data("PREVENT_ALLOW_MEDIUM_REMOVAL");
    t[READ_FORMAT_CAPACITIES as usize] = cmd(
        "READ_FORMAT_CAPACITIES",
        NONE,
        rcp(0, 7, 2, 1),
        rcp(4, 3, 1, 1),
    );
    t[READ_CDVD_CAPACITY as usize] = cmd(
        "READ_CDVD_CAPACITY",
        NONE,
        rcp(8, 0, 0, 0),
        rcp(8, 0, 0, 0),
    );
    t[READ_10 as usize] = cmd("READ_10", NONE, rcp(0, 7, 2, CD_FRAME_SIZE), MATCHES);
    t[WRITE_10 as usize] = cmd("WRITE_10", rcp(0, 7, 2, CD_FRAME_SIZE), NONE, NONE);
    t[SEEK as usize] = no_data("SEEK");
    t[WRITE_AND_VERIFY_10 as usize] = cmd(
        "WRITE_AND_VERIFY_10",
        rcp(0, 7, 2, CD_FRAME_SIZE),
        NONE,
        NONE,
    );
    t[VERIFY_10 as usize] = no_data("VERIFY_10");
    t[FLUSH_CACHE as usize] = no_data("FLUSH_CACHE");
    t[WRITE_BUFFER as usize] = cmd("WRITE_BUFFER", rcp(0, 6, 3, 1), NONE, NONE);
    t[READ_BUFFER as usize] = cmd("READ_BUFFER", NONE, rcp(0, 6, 3, 1), rcp(4, 1, 3, 1));
    t[READ_SUBCHANNEL as usize] = cmd("READ_SUBCHANNEL", NONE, rcp(0, 7, 2, 1), rcp(4, 2, 2, 1));
    t[READ_TOC_PMA_ATIP as usize] = cmd("READ_TOC_PMA_ATIP", NONE, rcp(0, 7, 2, 1), rcp(2, 0, 2, 1));
    t[READ_HEADER as usize] = cmd("READ_HEADER", NONE, rcp(0, 7, 2, 1), rcp(8, 0, 0, 0));
    t[PLAY_AUDIO_10 as usize] = no_data("PLAY_AUDIO_10");
    t[GET_CONFIGURATION as usize] = cmd(
        "GET_CONFIGURATION",
        NONE,
        rcp(0, 7, 2, 1),
        rcp(4, 0, 4, 1),
    );
    t[PLAY_AUDIO_MSF as usize] = cmd("PLAY_AUDIO_MSF", NONE, MATCHES, MATCHES);
    t[GET_EVENT_STATUS_NOTIFICATION as usize] = cmd(
        "GET_EVENT_STATUS_NOTIFICATION",
        NONE,
        rcp(0, 7, 2, 1),
        rcp(2, 0, 2, 1),
    );
    t[PAUSE_RESUME as usize] = no_data("PAUSE_RESUME");
    t[STOP_PLAY_SCAN as usize] = no_data("STOP_PLAY_SCAN");
    t[READ_DISC_INFO as usize] = cmd("READ_DISC_INFO", NONE, rcp(0, 7, 2, 1), rcp(2, 0, 2, 1));
    t[READ_TRACK_RZONE_INFO as usize] = cmd(
        "READ_TRACK_RZONE_INFO",
        NONE,
        rcp(0, 7, 2, 1),
        rcp(2, 0, 2, 1),
    );
    t[RESERVE_RZONE_TRACK as usize] = no_data("RESERVE_RZONE_TRACK");
    t[SEND_OPC as usize] = cmd("SEND_OPC", rcp(0, 7, 2, 1), NONE, NONE);
    t[MODE_SELECT_10 as usize] = cmd("MODE_SELECT_10", rcp(0, 7, 2, 1), NONE, NONE);
    t[REPAIR_RZONE_TRACK as usize] = no_data("REPAIR_RZONE_TRACK");
    t[MODE_SENSE_10 as usize] = cmd("MODE_SENSE_10", NONE, rcp(0, 7, 2, 1), rcp(2, 0, 2, 1));
    t[CLOSE_TRACK as usize] = no_data("CLOSE_TRACK");
    t[READ_BUFFER_CAPACITY as usize] = cmd(
        "READ_BUFFER_CAPACITY",
        NONE,
        rcp(0, 7, 2, 1),
        rcp(2, 0, 2, 1),
    );
    t[SEND_CUE_SHEET as usize] = cmd("SEND_CUE_SHEET", rcp(0, 6, 3, 1), NONE, NONE);
    t[BLANK as usize] = no_data("BLANK");
    t[SEND_EVENT as usize] = cmd("SEND_EVENT", rcp(0, 8, 2, 1), NONE, NONE);
    t[SEND_KEY as usize] = cmd("SEND_KEY", rcp(0, 8, 2, 1), NONE, NONE);
    t[REPORT_KEY as usize] = cmd("REPORT_KEY", NONE, rcp(0, 8, 2, 1), rcp(2, 0, 2, 1));
    t[LOAD_UNLOAD as usize] = no_data("LOAD_UNLOAD");
    t[SET_READ_AHEAD as usize] = no_data("SET_READ_AHEAD");
    t[READ_12 as usize] = cmd("READ_12", NONE, rcp(0, 6, 4, CD_FRAME_SIZE), MATCHES);
    t[WRITE_12 as usize] = cmd("WRITE_12", rcp(0, 6, 4, CD_FRAME_SIZE), NONE, NONE);
    t[GET_PERFORMANCE as usize] = cmd("GET_PERFORMANCE", NONE, rcp(0, 8, 2, 1), rcp(4, 0, 4, 1));
    t[READ_DVD_STRUCTURE as usize] = cmd(
        "READ_DVD_STRUCTURE",
        NONE,
        rcp(0, 8, 2, 1),
        rcp(2, 0, 2, 1),
    );
    t[SET_STREAMING as usize] = cmd("SET_STREAMING", rcp(0, 9, 2, 1), NONE, NONE);
    t[READ_CD_MSF as usize] = cmd("READ_CD_MSF", NONE, MATCHES, MATCHES);
    t[SCAN as usize] = no_data("SCAN");
    t[SET_SPEED as usize] = no_data("SET_SPEED");
    t[PLAY_CD as usize] = no_data("PLAY_CD");
    t[MECHANISM_STATUS as usize] = cmd(
        "MECHANISM_STATUS",
        NONE,
        rcp(0, 8, 2, 1),
        rcp(8, 6, 2, 1),
    );
    t[READ_CD as usize] = cmd("READ_CD", NONE, rcp(0, 6, 3, 1), MATCHES);
    t[SEND_DVD_STRUCTURE as usize] = cmd("SEND_DVD_STRUCTURE", rcp(0, 8, 2, 1), NONE, NONE);

    t
}

/// Command name for log messages.
pub fn cmd_name(op: u8) -> &'static str {
    match &CMD_TABLE[op as usize] {
        Some(recipe) => recipe.name,
        None => "UNSUPPORTED",
    }
}

pub fn is_supported(op: u8) -> bool {
    CMD_TABLE[op as usize].is_some()
}

/// Resolve one of the three sizes of `op` against `data`, which is the
/// CDB for [`SizeKind::Dout`] and [`SizeKind::Buffer`] and the reply
/// payload for [`SizeKind::Din`]. `None` means the opcode has no table
/// entry. A field that falls outside `data` reads as zero, truncated
/// replies then resolve to the bare constant.
pub fn resolve_size(op: u8, kind: SizeKind, data: &[u8]) -> Option<u32> {
    let recipes = CMD_TABLE[op as usize].as_ref()?;
    let recipe = match kind {
        SizeKind::Dout => &recipes.dout,
        SizeKind::Buffer => &recipes.buffer,
        SizeKind::Din => &recipes.din,
    };

    let end = recipe.len_offset + recipe.len_size as usize;
    let field = if recipe.len_size == 0 || end > data.len() {
        0
    } else {
        let bytes = &data[recipe.len_offset..end];
        match recipe.len_size {
            1 => u32::from(bytes[0]),
            2 => u32::from(BigEndian::read_u16(bytes)),
            3 => BigEndian::read_u24(bytes),
            _ => BigEndian::read_u32(bytes),
        }
    };

    Some(
        field
            .saturating_mul(recipe.block_size)
            .saturating_add(recipe.len_const),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_10_sizes() {
        // READ(10) of 4 blocks at some LBA.
        let mut cdb = [0_u8; ATAPI_PACKET_LEN];
        cdb[0] = READ_10;
        cdb[8] = 4;

        assert_eq!(resolve_size(READ_10, SizeKind::Dout, &cdb), Some(0));
        assert_eq!(
            resolve_size(READ_10, SizeKind::Buffer, &cdb),
            Some(4 * 2048)
        );
        // The reply carries no length header, the buffer size stands.
        assert_eq!(
            resolve_size(READ_10, SizeKind::Din, &[]),
            Some(SIZE_MATCHES_BUFFER)
        );
    }

    #[test]
    fn test_mode_sense_10_sizes() {
        let mut cdb = [0_u8; ATAPI_PACKET_LEN];
        cdb[0] = MODE_SENSE_10;
        cdb[7] = 0x01;
        cdb[8] = 0x00;
        assert_eq!(
            resolve_size(MODE_SENSE_10, SizeKind::Buffer, &cdb),
            Some(256)
        );

        // Mode data length header plus the two length bytes themselves.
        let reply = [0x00_u8, 0x26, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            resolve_size(MODE_SENSE_10, SizeKind::Din, &reply),
            Some(0x26 + 2)
        );
    }

    #[test]
    fn test_request_sense_sizes() {
        let mut cdb = [0_u8; ATAPI_PACKET_LEN];
        cdb[0] = REQUEST_SENSE;
        cdb[4] = 18;
        assert_eq!(
            resolve_size(REQUEST_SENSE, SizeKind::Buffer, &cdb),
            Some(18)
        );

        // 8 header bytes plus the additional length at offset 7.
        let mut sense = [0_u8; 18];
        sense[7] = 10;
        assert_eq!(resolve_size(REQUEST_SENSE, SizeKind::Din, &sense), Some(18));
    }

    #[test]
    fn test_write_buffer_24bit_field() {
        let mut cdb = [0_u8; ATAPI_PACKET_LEN];
        cdb[0] = WRITE_BUFFER;
        cdb[6] = 0x01;
        cdb[7] = 0x00;
        cdb[8] = 0x10;
        assert_eq!(
            resolve_size(WRITE_BUFFER, SizeKind::Dout, &cdb),
            Some(0x010010)
        );
    }

    #[test]
    fn test_fixed_sizes_ignore_data() {
        let cdb = [0xff_u8; ATAPI_PACKET_LEN];
        assert_eq!(
            resolve_size(READ_CDVD_CAPACITY, SizeKind::Din, &cdb),
            Some(8)
        );
        assert_eq!(resolve_size(FORMAT_UNIT, SizeKind::Dout, &cdb), Some(12));
    }

    #[test]
    fn test_truncated_reply_resolves_to_constant() {
        // Reply shorter than the length field it should carry.
        let reply = [0_u8; 1];
        assert_eq!(resolve_size(MODE_SENSE_10, SizeKind::Din, &reply), Some(2));
    }

    #[test]
    fn test_unsupported_opcodes() {
        assert_eq!(resolve_size(0xc0, SizeKind::Dout, &[]), None);
        assert_eq!(resolve_size(0xff, SizeKind::Buffer, &[]), None);
        assert!(!is_supported(0xc0));
        assert!(is_supported(READ_10));
        assert_eq!(cmd_name(READ_10), "READ_10");
        assert_eq!(cmd_name(0xc0), "UNSUPPORTED");
    }

    #[test]
    fn test_oversized_count_saturates() {
        // A block count whose byte size exceeds u32 must not wrap into a
        // small allocation.
        let mut cdb = [0_u8; ATAPI_PACKET_LEN];
        cdb[0] = READ_12;
        cdb[6] = 0x00;
        cdb[7] = 0x20;
        cdb[8] = 0x00;
        cdb[9] = 0x00;
        assert_eq!(
            resolve_size(READ_12, SizeKind::Buffer, &cdb),
            Some(u32::MAX)
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let mut cdb = [0_u8; ATAPI_PACKET_LEN];
        cdb[0] = READ_12;
        cdb[9] = 3;
        let first = resolve_size(READ_12, SizeKind::Buffer, &cdb);
        assert_eq!(first, Some(3 * 2048));
        assert_eq!(resolve_size(READ_12, SizeKind::Buffer, &cdb), first);
    }
}
