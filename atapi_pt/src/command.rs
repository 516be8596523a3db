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

//! Packet opcodes, sense data and the CDB decoding helpers shared by the
//! translator.

/// Every ATAPI command packet is exactly 12 bytes, shorter CDBs are
/// zero-padded by the guest.
pub const ATAPI_PACKET_LEN: usize = 12;

/// Fixed-format sense data as cached between commands.
pub const SENSE_DATA_LEN: usize = 18;

// Packet command opcodes (MMC / Mt. Fuji).
pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const FORMAT_UNIT: u8 = 0x04;
pub const INQUIRY: u8 = 0x12;
pub const START_STOP_UNIT: u8 = 0x1b;
pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1e;
pub const READ_FORMAT_CAPACITIES: u8 = 0x23;
pub const READ_CDVD_CAPACITY: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2a;
pub const SEEK: u8 = 0x2b;
pub const WRITE_AND_VERIFY_10: u8 = 0x2e;
pub const VERIFY_10: u8 = 0x2f;
pub const FLUSH_CACHE: u8 = 0x35;
pub const WRITE_BUFFER: u8 = 0x3b;
pub const READ_BUFFER: u8 = 0x3c;
pub const READ_SUBCHANNEL: u8 = 0x42;
pub const READ_TOC_PMA_ATIP: u8 = 0x43;
pub const READ_HEADER: u8 = 0x44;
pub const PLAY_AUDIO_10: u8 = 0x45;
pub const GET_CONFIGURATION: u8 = 0x46;
pub const PLAY_AUDIO_MSF: u8 = 0x47;
pub const GET_EVENT_STATUS_NOTIFICATION: u8 = 0x4a;
pub const PAUSE_RESUME: u8 = 0x4b;
pub const STOP_PLAY_SCAN: u8 = 0x4e;
pub const READ_DISC_INFO: u8 = 0x51;
pub const READ_TRACK_RZONE_INFO: u8 = 0x52;
pub const RESERVE_RZONE_TRACK: u8 = 0x53;
pub const SEND_OPC: u8 = 0x54;
pub const MODE_SELECT_10: u8 = 0x55;
pub const REPAIR_RZONE_TRACK: u8 = 0x58;
pub const MODE_SENSE_10: u8 = 0x5a;
pub const CLOSE_TRACK: u8 = 0x5b;
pub const READ_BUFFER_CAPACITY: u8 = 0x5c;
pub const SEND_CUE_SHEET: u8 = 0x5d;
pub const BLANK: u8 = 0xa1;
pub const SEND_EVENT: u8 = 0xa2;
pub const SEND_KEY: u8 = 0xa3;
pub const REPORT_KEY: u8 = 0xa4;
pub const LOAD_UNLOAD: u8 = 0xa6;
pub const SET_READ_AHEAD: u8 = 0xa7;
pub const READ_12: u8 = 0xa8;
pub const WRITE_12: u8 = 0xaa;
pub const GET_PERFORMANCE: u8 = 0xac;
pub const READ_DVD_STRUCTURE: u8 = 0xad;
pub const SET_STREAMING: u8 = 0xb6;
pub const READ_CD_MSF: u8 = 0xb9;
pub const SCAN: u8 = 0xba;
pub const SET_SPEED: u8 = 0xbb;
pub const PLAY_CD: u8 = 0xbc;
pub const MECHANISM_STATUS: u8 = 0xbd;
pub const READ_CD: u8 = 0xbe;
pub const SEND_DVD_STRUCTURE: u8 = 0xbf;

// Sense keys.
pub const NOT_READY: u8 = 2;
pub const ILLEGAL_REQUEST: u8 = 5;

// Additional sense codes.
pub const ASC_ILLEGAL_OPCODE: u8 = 0x20;
pub const ASC_INV_FIELD_IN_CMD_PACKET: u8 = 0x24;
pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3a;

// SAM status codes.
pub const GOOD: u8 = 0x00;
pub const CHECK_CONDITION: u8 = 0x02;

// GET EVENT STATUS NOTIFICATION notification classes and media event codes.
pub const GESN_MEDIA: u8 = 4;
pub const GESN_EC_NOCHG: u8 = 0;
pub const GESN_EC_NEWMEDIA: u8 = 2;
pub const GESN_EC_MEDIAREMOVAL: u8 = 3;

pub const CD_FRAME_SIZE: u32 = 2048;
pub const RAW_SECTOR_SIZE: u32 = 2352;
pub const CD_SECS: u32 = 60;
pub const CD_FRAMES: u32 = 75;

/// Convert a minute/second/frame address to an absolute frame count.
pub fn msf_to_frames(m: u8, s: u8, f: u8) -> u32 {
    (u32::from(m) * CD_SECS + u32::from(s)) * CD_FRAMES + u32::from(f)
}

/// Commands that modify the medium. They are refused up front when the
/// drive was attached read-only.
pub fn is_write_class(op: u8) -> bool {
    matches!(
        op,
        BLANK
            | CLOSE_TRACK
            | FLUSH_CACHE
            | FORMAT_UNIT
            | SEND_DVD_STRUCTURE
            | SEND_OPC
            | WRITE_10
            | WRITE_12
            | WRITE_AND_VERIFY_10
            | WRITE_BUFFER
    )
}

/// Cached sense data in the 18-byte fixed format.
#[derive(Clone, Copy)]
pub struct SenseData([u8; SENSE_DATA_LEN]);

impl Default for SenseData {
    fn default() -> Self {
        SenseData([0; SENSE_DATA_LEN])
    }
}

impl SenseData {
    /// Synthesize fixed-format sense for a locally rejected command.
    pub fn set_fixed(&mut self, key: u8, asc: u8, ascq: u8) {
        self.0 = [0; SENSE_DATA_LEN];
        // Byte 0: fixed format, current error. Byte 7: additional length,
        // the ASC/ASCQ fields fall inside it.
        self.0[0] = 0x70;
        self.0[2] = key;
        self.0[7] = 10;
        self.0[12] = asc;
        self.0[13] = ascq;
    }

    pub fn clear(&mut self) {
        self.0 = [0; SENSE_DATA_LEN];
    }

    /// Drop the leading response-code byte so a later REQUEST SENSE will
    /// go to the drive instead of replaying the cache.
    pub fn consume(&mut self) {
        self.0[0] = 0;
    }

    pub fn is_pending(&self) -> bool {
        self.0[0] != 0
    }

    /// Sense response code with the valid bit masked off.
    pub fn format(&self) -> u8 {
        self.0[0] & 0x7f
    }

    pub fn sense_key(&self) -> u8 {
        match self.format() {
            0x72..=0x73 => self.0[1] & 0x0f,
            _ => self.0[2] & 0x0f,
        }
    }

    pub fn asc(&self) -> u8 {
        match self.format() {
            0x72..=0x73 => self.0[2],
            _ => self.0[12],
        }
    }

    pub fn ascq(&self) -> u8 {
        match self.format() {
            0x72..=0x73 => self.0[3],
            _ => self.0[13],
        }
    }

    pub fn medium_not_present(&self) -> bool {
        self.sense_key() == NOT_READY && self.asc() == ASC_MEDIUM_NOT_PRESENT
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Transfer block size implied by a READ CD or READ CD MSF packet.
///
/// The size depends on the expected sector type in byte 1 and the field
/// selection bits in byte 9, the tables follow MMC-5 table 354. `None`
/// marks a combination the standard does not allow.
pub fn read_cd_block_size(cdb: &[u8; ATAPI_PACKET_LEN]) -> Option<u32> {
    let sector_type = (cdb[1] >> 2) & 0x7;
    let error_flags = (cdb[9] >> 1) & 0x3;
    let flags = cdb[9] & 0xf8;

    let base: u32 = match sector_type {
        // Any type.
        0 => match flags {
            0x00 => 0,
            0x10 => 2048,
            0xf8 => RAW_SECTOR_SIZE,
            _ => return None,
        },
        // CD-DA: every field selection yields the raw sector.
        1 => {
            if flags != 0 {
                RAW_SECTOR_SIZE
            } else {
                0
            }
        }
        // Mode 1.
        2 => match flags {
            0x00 | 0x40 => 0,
            0x10 | 0x50 => 2048,
            0x18 | 0x58 => 2336,
            0x20 | 0x60 => 4,
            0x30 | 0x70 | 0x78 => 2052,
            0x38 => 2340,
            0xa0 | 0xe0 => 16,
            0xb0 | 0xf0 => 2064,
            0xb8 | 0xf8 => RAW_SECTOR_SIZE,
            _ => return None,
        },
        // Mode 2 formless.
        3 => match flags {
            0x00 | 0x40 => 0,
            0x10 | 0x18 | 0x50 | 0x58 => 2336,
            0x20 | 0x60 => 4,
            0x30 | 0x38 | 0x70 | 0x78 => 2340,
            0xa0 | 0xe0 => 16,
            0xb0 | 0xb8 | 0xf0 | 0xf8 => RAW_SECTOR_SIZE,
            _ => return None,
        },
        // Mode 2 form 1.
        4 => match flags {
            0x00 => 0,
            0x10 => 2048,
            0x18 => 2328,
            0x20 => 4,
            0x40 => 8,
            0x50 => 2056,
            0x58 => 2336,
            0x60 => 12,
            0x70 => 2060,
            0x78 => 2340,
            0xa0 => 16,
            0xe0 => 24,
            0xf0 => 2072,
            0xf8 => RAW_SECTOR_SIZE,
            _ => return None,
        },
        // Mode 2 form 2.
        5 => match flags {
            0x00 => 0,
            0x10 | 0x18 => 2328,
            0x20 => 4,
            0x40 => 8,
            0x50 | 0x58 => 2336,
            0x60 => 12,
            0x70 | 0x78 => 2340,
            0xa0 => 16,
            0xe0 => 24,
            0xf0 | 0xf8 => RAW_SECTOR_SIZE,
            _ => return None,
        },
        _ => return None,
    };

    let c2_bytes = match error_flags {
        1 => 294,
        2 => 296,
        _ => 0,
    };
    Some(base + c2_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_cd_cdb(sector_type: u8, byte9: u8) -> [u8; ATAPI_PACKET_LEN] {
        let mut cdb = [0_u8; ATAPI_PACKET_LEN];
        cdb[0] = READ_CD;
        cdb[1] = sector_type << 2;
        cdb[9] = byte9;
        cdb
    }

    #[test]
    fn test_read_cd_block_size_common() {
        // User data only.
        assert_eq!(read_cd_block_size(&read_cd_cdb(0, 0x10)), Some(2048));
        // Everything.
        assert_eq!(read_cd_block_size(&read_cd_cdb(0, 0xf8)), Some(2352));
        // No fields at all moves no data.
        assert_eq!(read_cd_block_size(&read_cd_cdb(0, 0x00)), Some(0));
        // CD-DA always reads the full raw sector.
        assert_eq!(read_cd_block_size(&read_cd_cdb(1, 0x20)), Some(2352));
        assert_eq!(read_cd_block_size(&read_cd_cdb(1, 0x00)), Some(0));
    }

    #[test]
    fn test_read_cd_block_size_mode1() {
        assert_eq!(read_cd_block_size(&read_cd_cdb(2, 0x10)), Some(2048));
        assert_eq!(read_cd_block_size(&read_cd_cdb(2, 0x20)), Some(4));
        assert_eq!(read_cd_block_size(&read_cd_cdb(2, 0xb0)), Some(2064));
        // Sub-header request is invalid for mode 1.
        assert_eq!(read_cd_block_size(&read_cd_cdb(2, 0x08)), None);
    }

    #[test]
    fn test_read_cd_block_size_error_flags() {
        // C2 error bits add 294 bytes, C2 and block bits add 296.
        assert_eq!(read_cd_block_size(&read_cd_cdb(2, 0x12)), Some(2048 + 294));
        assert_eq!(read_cd_block_size(&read_cd_cdb(2, 0x14)), Some(2048 + 296));
    }

    #[test]
    fn test_msf_to_frames() {
        assert_eq!(msf_to_frames(0, 0, 0), 0);
        assert_eq!(msf_to_frames(0, 2, 0), 150);
        assert_eq!(msf_to_frames(1, 0, 40), 4540);
    }

    #[test]
    fn test_sense_lifecycle() {
        let mut sense = SenseData::default();
        assert!(!sense.is_pending());

        sense.set_fixed(ILLEGAL_REQUEST, ASC_INV_FIELD_IN_CMD_PACKET, 0);
        assert!(sense.is_pending());
        assert_eq!(sense.format(), 0x70);
        assert_eq!(sense.sense_key(), ILLEGAL_REQUEST);
        assert_eq!(sense.asc(), ASC_INV_FIELD_IN_CMD_PACKET);
        assert_eq!(sense.as_bytes()[7], 10);

        sense.consume();
        assert!(!sense.is_pending());
        // Only the response code is dropped, the payload stays readable.
        assert_eq!(sense.as_bytes()[12], ASC_INV_FIELD_IN_CMD_PACKET);
    }

    #[test]
    fn test_sense_descriptor_fields() {
        let mut sense = SenseData::default();
        let bytes = sense.as_mut_bytes();
        bytes[0] = 0x72;
        bytes[1] = NOT_READY;
        bytes[2] = ASC_MEDIUM_NOT_PRESENT;
        assert_eq!(sense.format(), 0x72);
        assert_eq!(sense.sense_key(), NOT_READY);
        assert!(sense.medium_not_present());
    }

    #[test]
    fn test_write_class() {
        assert!(is_write_class(WRITE_10));
        assert!(is_write_class(BLANK));
        assert!(is_write_class(FLUSH_CACHE));
        assert!(!is_write_class(READ_10));
        assert!(!is_write_class(TEST_UNIT_READY));
    }
}
