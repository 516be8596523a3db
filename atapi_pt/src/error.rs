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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AtapiPtError {
    #[error("Unsupported packet opcode 0x{0:x}")]
    UnsupportedOpcode(u8),
    #[error("Invalid field in command packet, opcode 0x{0:x}")]
    InvalidField(u8),
    #[error("Transfer length of command 0x{0:x} exceeds the host limit")]
    OversizedTransfer(u8),
    #[error("Write command 0x{0:x} rejected, drive attached read-only")]
    ReadOnlyViolation(u8),
}
