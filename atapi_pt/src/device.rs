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

//! Guest-facing half of the passthrough translator.
//!
//! `handle_packet` classifies and preprocesses each raw packet on the
//! caller's thread; actual submission happens on the worker thread which
//! is woken through `cmd_evt` and reports back through `ret_evt`. At most
//! one command is in flight at a time.

use std::cmp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use vmm_sys_util::eventfd::EventFd;

use block_pt::sgio::PassthroughOps;
use block_pt::{MediaState, MediaStateChannel};

use crate::command::*;
use crate::dispatch::dispatch_cmd;
use crate::error::AtapiPtError;
use crate::sizes::{cmd_name, resolve_size, SizeKind, SIZE_MATCHES_BUFFER};

/// Default command timeout in milliseconds. Commands known to keep the
/// drive busy for longer get a larger value during preprocessing.
pub(crate) const DEFAULT_TIMEOUT_MS: u32 = 15_000;
const MINUTE_MS: u32 = 60 * 1000;

/// Seam towards the emulated IDE/SCSI controller that carries the
/// guest's packet commands. The controller owns guest memory access and
/// interrupt delivery; the translator only tells it what to do next.
pub trait AtapiController: Send {
    /// Ask the guest for `len` bytes of outbound payload. The controller
    /// calls [`AtapiPtDevice::dout_fetch_done`] once the bytes arrived.
    fn request_output_data(&mut self, len: u32);

    /// Finish the command without a data phase.
    fn reply_ok(&mut self);

    /// Finish the command with inbound data. `data` is what the device
    /// produced, `buffer_len` the capacity the guest asked for; the
    /// controller truncates to whichever is smaller.
    fn reply_with_data(&mut self, data: &[u8], buffer_len: u32);

    /// Raise an error condition towards the guest. The sense data stays
    /// cached for the next REQUEST SENSE.
    fn reply_error(&mut self);
}

#[derive(Parser, Clone, Debug, Default)]
#[command(no_binary_name(true))]
pub struct AtapiPtConfig {
    #[arg(long)]
    pub id: String,
    /// Host BSG node of the optical drive, eg /dev/bsg/1:0:0:0.
    #[arg(long)]
    pub path: String,
    #[arg(long, default_value = "off", value_parser = parse_bool, action = clap::ArgAction::Set)]
    pub readonly: bool,
    /// Treat descriptor format (0x72/0x73) sense as success. Works around
    /// host drives that report it for commands that actually completed.
    #[arg(long, default_value = "on", value_parser = parse_bool, action = clap::ArgAction::Set)]
    pub suppress_descriptor_sense: bool,
}

fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "on" | "yes" | "true" => Ok(true),
        "off" | "no" | "false" => Ok(false),
        _ => bail!("Invalid boolean value {}", s),
    }
}

/// In-flight command state, owned by whichever side the doorbells say.
pub(crate) struct AtapiPtState {
    pub(crate) request: [u8; ATAPI_PACKET_LEN],
    pub(crate) dout_xfer_len: u32,
    pub(crate) din_xfer_len: u32,
    pub(crate) timeout: u32,
    pub(crate) result: i32,
    pub(crate) sense: SenseData,
    pub(crate) max_xfer_len: u32,
    pub(crate) io_buffer: Vec<u8>,
    pub(crate) suppress_descriptor_sense: bool,
}

impl AtapiPtState {
    pub(crate) fn new(max_xfer_len: u32, suppress_descriptor_sense: bool) -> Self {
        AtapiPtState {
            request: [0; ATAPI_PACKET_LEN],
            dout_xfer_len: 0,
            din_xfer_len: 0,
            timeout: DEFAULT_TIMEOUT_MS,
            result: 0,
            sense: SenseData::default(),
            max_xfer_len,
            io_buffer: Vec::new(),
            suppress_descriptor_sense,
        }
    }
}

/// What preprocessing decided to do with a packet.
enum Action {
    /// Answered locally with success, no drive access.
    CmdOk,
    /// Answered locally from the cached sense data.
    CachedSense { actual: u32, capacity: u32 },
    /// Outbound payload must be fetched from the guest first.
    FetchDout(u32),
    /// Ready for the worker thread.
    Dispatch,
}

pub struct AtapiPtDevice {
    id: String,
    read_only: bool,
    state: Arc<Mutex<AtapiPtState>>,
    ops: Arc<dyn PassthroughOps>,
    media: Arc<MediaStateChannel>,
    ctrl: Arc<Mutex<dyn AtapiController>>,
    cmd_evt: Arc<EventFd>,
    ret_evt: Arc<EventFd>,
    worker_run: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl AtapiPtDevice {
    pub fn new(
        config: &AtapiPtConfig,
        ops: Arc<dyn PassthroughOps>,
        media: Arc<MediaStateChannel>,
        ctrl: Arc<Mutex<dyn AtapiController>>,
    ) -> Result<Self> {
        let reserved = ops
            .max_transfer_len()
            .with_context(|| "Failed to query the host transfer limit")?;
        // Segments must stay a whole number of 2048-byte frames.
        let max_xfer_len = (reserved + CD_FRAME_SIZE - 1) & !(CD_FRAME_SIZE - 1);
        info!(
            "atapi-pt {}: host transfer limit {} bytes (reserved {})",
            config.id, max_xfer_len, reserved
        );

        // Nobody knows yet whether a disc is in the tray; the first media
        // related command will find out.
        media.set_unknown();

        Ok(AtapiPtDevice {
            id: config.id.clone(),
            read_only: config.readonly,
            state: Arc::new(Mutex::new(AtapiPtState::new(
                max_xfer_len,
                config.suppress_descriptor_sense,
            ))),
            ops,
            media,
            ctrl,
            cmd_evt: Arc::new(
                EventFd::new(0).with_context(|| "Failed to create command eventfd")?,
            ),
            ret_evt: Arc::new(
                EventFd::new(libc::EFD_NONBLOCK)
                    .with_context(|| "Failed to create result eventfd")?,
            ),
            worker_run: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    /// Eventfd signalled when the worker finished a command; the owner of
    /// the event loop registers it and calls [`Self::complete_command`] on
    /// each notification.
    pub fn result_notifier(&self) -> Arc<EventFd> {
        self.ret_evt.clone()
    }

    pub fn start(&mut self) -> Result<()> {
        let state = self.state.clone();
        let ops = self.ops.clone();
        let cmd_evt = self.cmd_evt.clone();
        let ret_evt = self.ret_evt.clone();
        let run = self.worker_run.clone();
        run.store(true, Ordering::Release);

        let handle = thread::Builder::new()
            .name(format!("atapi-pt-{}", self.id))
            .spawn(move || {
                while run.load(Ordering::Acquire) {
                    if let Err(e) = cmd_evt.read() {
                        error!("Failed to read command doorbell: {:?}", e);
                        continue;
                    }
                    if !run.load(Ordering::Acquire) {
                        break;
                    }
                    dispatch_cmd(&mut state.lock().unwrap(), ops.as_ref());
                    if let Err(e) = ret_evt.write(1) {
                        error!("Failed to notify command completion: {:?}", e);
                    }
                }
            })
            .with_context(|| "Failed to create atapi-pt worker thread")?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Stop the worker. An in-flight command still runs to completion on
    /// the drive before the join returns.
    pub fn stop(&mut self) -> Result<()> {
        if self.worker.is_none() {
            return Ok(());
        }
        self.worker_run.store(false, Ordering::Release);
        self.cmd_evt
            .write(1)
            .with_context(|| "Failed to wake the worker for shutdown")?;
        if let Some(handle) = self.worker.take() {
            handle
                .join()
                .map_err(|_| anyhow!("atapi-pt worker thread panicked"))?;
        }
        Ok(())
    }

    /// Entry point for a raw 12-byte packet from the guest.
    pub fn handle_packet(&self, packet: &[u8; ATAPI_PACKET_LEN]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match self.preprocess(&mut state, packet) {
            Ok(Action::CmdOk) => {
                drop(state);
                self.ctrl.lock().unwrap().reply_ok();
            }
            Ok(Action::CachedSense { actual, capacity }) => {
                let mut reply = [0_u8; SENSE_DATA_LEN];
                reply.copy_from_slice(state.sense.as_bytes());
                state.sense.consume();
                drop(state);
                let len = cmp::min(actual as usize, SENSE_DATA_LEN);
                self.ctrl
                    .lock()
                    .unwrap()
                    .reply_with_data(&reply[..len], capacity);
            }
            Ok(Action::FetchDout(len)) => {
                drop(state);
                self.ctrl.lock().unwrap().request_output_data(len);
            }
            Ok(Action::Dispatch) => {
                drop(state);
                self.post_command()?;
            }
            Err(e) => {
                warn!("{}: rejected '{}': {}", self.id, cmd_name(packet[0]), e);
                let asc = match e {
                    AtapiPtError::UnsupportedOpcode(_) => ASC_ILLEGAL_OPCODE,
                    _ => ASC_INV_FIELD_IN_CMD_PACKET,
                };
                state.sense.set_fixed(ILLEGAL_REQUEST, asc, 0);
                drop(state);
                self.ctrl.lock().unwrap().reply_error();
            }
        }
        Ok(())
    }

    /// The controller collected the outbound payload the translator asked
    /// for; hand the command over to the worker.
    pub fn dout_fetch_done(&self, data: &[u8]) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            let len = cmp::min(data.len(), state.dout_xfer_len as usize);
            state.io_buffer[..len].copy_from_slice(&data[..len]);
        }
        self.post_command()
    }

    fn post_command(&self) -> Result<()> {
        self.cmd_evt
            .write(1)
            .with_context(|| "Failed to ring the command doorbell")
    }

    fn preprocess(
        &self,
        state: &mut AtapiPtState,
        packet: &[u8; ATAPI_PACKET_LEN],
    ) -> std::result::Result<Action, AtapiPtError> {
        state.request = *packet;
        state.timeout = DEFAULT_TIMEOUT_MS;
        state.result = 0;
        let op = packet[0];

        if op == REQUEST_SENSE && state.sense.is_pending() {
            // The guest polls the outcome of the previous failure; answer
            // from the cache without touching the drive.
            let capacity = resolve_size(op, SizeKind::Buffer, packet).unwrap_or(0);
            let actual = resolve_size(op, SizeKind::Din, state.sense.as_bytes()).unwrap_or(0);
            return Ok(Action::CachedSense { actual, capacity });
        }
        // Any other command invalidates the cache.
        state.sense.consume();

        let (Some(mut dout), Some(mut din)) = (
            resolve_size(op, SizeKind::Dout, packet),
            resolve_size(op, SizeKind::Buffer, packet),
        ) else {
            return Err(AtapiPtError::UnsupportedOpcode(op));
        };

        if self.read_only && is_write_class(op) {
            return Err(AtapiPtError::ReadOnlyViolation(op));
        }

        if op == START_STOP_UNIT && packet[4] & 0x3 == 0 {
            // Stop-motor request. Guests send it on shutdown; honouring it
            // would spin the drive down under every other consumer.
            return Ok(Action::CmdOk);
        }

        match op {
            PREVENT_ALLOW_MEDIUM_REMOVAL => {
                // Never lock the physical tray on behalf of one guest.
                return Ok(Action::CmdOk);
            }
            FLUSH_CACHE | SEND_OPC | WRITE_10 => state.timeout = MINUTE_MS,
            FORMAT_UNIT => {
                if packet[1] & 0x2 == 0 {
                    // Without Immed the drive stays busy for the whole
                    // format.
                    state.timeout = 20 * MINUTE_MS;
                }
                // Format codes other than 1 carry four extra bytes of
                // parameter list.
                if packet[1] & 0x7 != 1 {
                    dout += 4;
                }
            }
            BLANK => state.timeout = 80 * MINUTE_MS,
            CLOSE_TRACK => state.timeout = 5 * MINUTE_MS,
            WRITE_BUFFER => {
                if !matches!(packet[1] & 0x7, 0 | 2) {
                    return Err(AtapiPtError::InvalidField(op));
                }
            }
            READ_CD => {
                let block_size =
                    read_cd_block_size(packet).ok_or(AtapiPtError::InvalidField(op))?;
                // The table resolves the block count, not bytes.
                din = din.saturating_mul(block_size);
            }
            READ_CD_MSF => {
                let block_size =
                    read_cd_block_size(packet).ok_or(AtapiPtError::InvalidField(op))?;
                din = msf_block_count(packet).saturating_mul(block_size);
            }
            PLAY_AUDIO_MSF => {
                din = msf_block_count(packet).saturating_mul(RAW_SECTOR_SIZE);
            }
            GET_PERFORMANCE => {
                let descriptor_size: u32 = match packet[10] {
                    0 => {
                        if packet[1] & 0x3 == 0 {
                            16
                        } else {
                            6
                        }
                    }
                    1 => 8,
                    2 => 2048,
                    3 => 16,
                    4 => 8,
                    _ => return Err(AtapiPtError::InvalidField(op)),
                };
                // Descriptors plus the 8-byte header.
                din = din.saturating_mul(descriptor_size).saturating_add(8);
            }
            _ => {}
        }

        // Only the segmented LBA commands can service a transfer larger
        // than the host limit; reject anything else before the buffer is
        // sized from a guest-controlled length.
        if cmp::max(dout, din) > state.max_xfer_len
            && !matches!(op, READ_10 | WRITE_10 | WRITE_AND_VERIFY_10)
        {
            return Err(AtapiPtError::OversizedTransfer(op));
        }

        state.sense.clear();
        state.dout_xfer_len = dout;
        state.din_xfer_len = din;
        let needed = cmp::max(dout, din) as usize;
        if state.io_buffer.len() < needed {
            state.io_buffer.resize(needed, 0);
        }

        if dout > 0 {
            return Ok(Action::FetchDout(dout));
        }
        Ok(Action::Dispatch)
    }

    /// React to the worker's completion doorbell: reconcile media state,
    /// size the reply and finish the command towards the guest.
    pub fn complete_command(&self) -> Result<()> {
        let _ = self.ret_evt.read();

        let mut state = self.state.lock().unwrap();
        let op = state.request[0];
        let last = self.media.last_state();
        let shared = self.media.shared_state();

        if state.result != 0 {
            if state.sense.medium_not_present() {
                self.media.set_absent();
            }
            drop(state);
            self.ctrl.lock().unwrap().reply_error();
            return Ok(());
        }

        // These only succeed with a disc in the drive.
        if matches!(
            op,
            TEST_UNIT_READY | REQUEST_SENSE | READ_CDVD_CAPACITY | READ_10 | READ_12 | READ_DISC_INFO
        ) && last != MediaState::Present
        {
            self.media.set_present();
        }

        if op == GET_EVENT_STATUS_NOTIFICATION {
            self.reconcile_media_events(&mut state, last, shared);
        }

        if state.din_xfer_len == 0 {
            drop(state);
            self.ctrl.lock().unwrap().reply_ok();
            return Ok(());
        }

        let reply_data = &state.io_buffer[..state.din_xfer_len as usize];
        let mut din_actual = resolve_size(op, SizeKind::Din, reply_data).unwrap_or(0);

        if op == READ_BUFFER {
            // The reply layout depends on the buffer mode; the table only
            // covers the combined header and data mode.
            match state.request[1] & 0x7 {
                0 => {}
                2 => din_actual = state.din_xfer_len,
                3 => din_actual = 4,
                mode => {
                    warn!("{}: unsupported READ_BUFFER mode {}", self.id, mode);
                    state
                        .sense
                        .set_fixed(ILLEGAL_REQUEST, ASC_INV_FIELD_IN_CMD_PACKET, 0);
                    drop(state);
                    self.ctrl.lock().unwrap().reply_error();
                    return Ok(());
                }
            }
        }

        if din_actual == SIZE_MATCHES_BUFFER {
            din_actual = state.din_xfer_len;
        }

        let len = cmp::min(din_actual, state.din_xfer_len) as usize;
        let capacity = state.din_xfer_len;
        let data = state.io_buffer[..len].to_vec();
        drop(state);
        self.ctrl.lock().unwrap().reply_with_data(&data, capacity);
        Ok(())
    }

    /// Patch up a GET EVENT STATUS NOTIFICATION reply against the media
    /// state shared with the drive's other consumers. Reply layout: byte 2
    /// carries the notification class, byte 4 the event code and byte 5
    /// the media status.
    fn reconcile_media_events(
        &self,
        state: &mut AtapiPtState,
        last: MediaState,
        shared: MediaState,
    ) {
        if state.din_xfer_len < 8 || state.io_buffer.len() < 8 {
            return;
        }
        let buf = &mut state.io_buffer;
        match buf[4] {
            GESN_EC_NEWMEDIA if buf[2] == GESN_MEDIA => {
                if last != MediaState::Present {
                    self.media.set_present();
                }
            }
            GESN_EC_MEDIAREMOVAL if buf[2] == GESN_MEDIA => {
                if last != MediaState::Absent {
                    self.media.set_absent();
                }
            }
            GESN_EC_NOCHG => {
                // Only rewrite a genuine "nothing happened" reply.
                let idle = (buf[2] == GESN_MEDIA && buf[5] == 2)
                    || (buf[5] == 0 && buf[6] == 0 && buf[7] == 0);
                if !idle || shared == last || shared == MediaState::Unknown {
                    return;
                }
                // Another consumer changed the disc; synthesize the event
                // this guest has not seen yet.
                match shared {
                    MediaState::Absent => {
                        buf[2] = GESN_MEDIA;
                        buf[4] = GESN_EC_MEDIAREMOVAL;
                        buf[5] = 1;
                        buf[6] = 0;
                        buf[7] = 0;
                        self.media.set_absent();
                    }
                    MediaState::Present => {
                        buf[2] = GESN_MEDIA;
                        buf[4] = GESN_EC_NEWMEDIA;
                        buf[5] = 2;
                        buf[6] = 0;
                        buf[7] = 0;
                        self.media.set_present();
                    }
                    MediaState::Unknown => {}
                }
            }
            _ => {}
        }
    }
}

impl Drop for AtapiPtDevice {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("{}: failed to stop the worker: {:?}", self.id, e);
        }
    }
}

/// Number of frames between the start and end MSF addresses of the
/// packet, clamped at zero.
fn msf_block_count(packet: &[u8; ATAPI_PACKET_LEN]) -> u32 {
    let start = msf_to_frames(packet[3], packet[4], packet[5]);
    let end = msf_to_frames(packet[6], packet[7], packet[8]);
    end.saturating_sub(start)
}
