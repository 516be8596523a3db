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

//! ATAPI packet command passthrough.
//!
//! Raw 12-byte packet commands from a guest are forwarded to a physical
//! host optical drive instead of being emulated. The translator resolves
//! the transfer lengths each opcode implies, applies the per-opcode quirks
//! a real drive needs, splits oversized reads and writes into segments the
//! host interface accepts, and reconciles results, sense data and media
//! presence back towards the guest.
//!
//! Command submission runs on a dedicated worker thread so that slow
//! drive operations (a blank can take over an hour) never stall the
//! caller. Ownership of the in-flight command state hands over through a
//! pair of eventfd doorbells, one per direction.

pub mod command;
pub mod device;
pub mod error;
pub mod sizes;

mod dispatch;

pub use device::{AtapiController, AtapiPtConfig, AtapiPtDevice};
pub use error::AtapiPtError;
