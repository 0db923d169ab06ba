//! Capture session
//!
//! A [`CaptureSession`] owns every piece of mutable state for one analysed
//! capture: conversations and their call tables, the GSS context store,
//! pending fragment assemblies and statistics. Segments are handed to
//! [`CaptureSession::process`] in frame order.
//!
//! The first time a frame is processed the session runs in
//! [`PassMode::FirstPass`] and may register calls, resolve replies,
//! buffer fragments and stamp GSS contexts. Any later visit to the same
//! frame, or any frame after [`CaptureSession::finish_first_pass`], runs
//! in [`PassMode::Replay`] and only reads what the first pass built.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, trace};
use xdr::XdrReader;

use crate::config::SessionConfig;
use crate::conversation::{
    ConversationId, ConversationKey, ConversationState, ConversationStore, Direction, FrameNumber,
    PacketInfo, Transport,
};
use crate::dissector::{Dissection, DissectionState, MessageDissector};
use crate::error::{NotRpcReason, Result, RpcError};
use crate::fragmentation::{find_reply_start, ConversationMarker, FeedResult, FragmentReassembler};
use crate::gss::GssContextStore;
use crate::message::{
    check_message_start, classify, plausible_message_start, CallHeader, MessageType, MESSAGE_HEADER_SIZE,
    MESSAGE_START_CHECK_LEN,
};
use crate::record::{RecordMark, RECORD_MARK_SIZE};
use crate::registry::ProcedureRegistry;
use crate::security::SecurityLayer;
use crate::stats::RpcStats;

/// Whether a dissection may change session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassMode {
    /// First, in-order pass: tables are built
    FirstPass,
    /// Any later pass: tables are only read
    Replay,
}

impl PassMode {
    pub fn is_first_pass(self) -> bool {
        self == PassMode::FirstPass
    }
}

/// One thing found in a segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentItem {
    /// A message was dissected. `truncated` is set when it was dissected
    /// from fewer bytes than its record announced.
    Message {
        offset: usize,
        dissection: Box<Dissection>,
        truncated: bool,
    },
    /// A fragment that did not complete a message
    Fragment {
        offset: usize,
        marker: ConversationMarker,
    },
    /// Framing or header failure for the PDU at `offset`
    Error { offset: usize, error: RpcError },
    /// Bytes skipped by the reply-start heuristic
    Resync { offset: usize, skipped: usize },
}

/// More bytes are needed to finish the record at `offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedMore {
    pub offset: usize,
    pub bytes: usize,
}

/// Everything [`CaptureSession::process`] found in one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentReport {
    pub frame: FrameNumber,
    pub mode: PassMode,
    pub conversation: Option<ConversationId>,
    pub items: Vec<SegmentItem>,
    /// Set when the transport should redeliver the bytes from `offset`
    /// together with at least `bytes` more
    pub need_more: Option<NeedMore>,
    /// The segment does not look like ONC RPC at all
    pub not_rpc: bool,
}

impl SegmentReport {
    fn new(frame: FrameNumber, mode: PassMode) -> Self {
        Self {
            frame,
            mode,
            conversation: None,
            items: Vec::new(),
            need_more: None,
            not_rpc: false,
        }
    }

    /// Dissected messages in segment order
    pub fn messages(&self) -> impl Iterator<Item = &Dissection> {
        self.items.iter().filter_map(|item| match item {
            SegmentItem::Message { dissection, .. } => Some(dissection.as_ref()),
            _ => None,
        })
    }

    pub fn errors(&self) -> impl Iterator<Item = &RpcError> {
        self.items.iter().filter_map(|item| match item {
            SegmentItem::Error { error, .. } => Some(error),
            _ => None,
        })
    }
}

/// State for one analysed capture
pub struct CaptureSession {
    config: SessionConfig,
    conversations: ConversationStore,
    contexts: GssContextStore,
    reassembler: FragmentReassembler,
    dissector: MessageDissector,
    stats: RpcStats,
    visited: HashSet<FrameNumber>,
    first_pass_complete: bool,
}

impl CaptureSession {
    pub fn new(config: SessionConfig, registry: Arc<ProcedureRegistry>) -> Self {
        Self {
            reassembler: FragmentReassembler::new(&config),
            config,
            conversations: ConversationStore::new(),
            contexts: GssContextStore::new(),
            dissector: MessageDissector::new(registry),
            stats: RpcStats::new(),
            visited: HashSet::new(),
            first_pass_complete: false,
        }
    }

    /// Supply key material for RPCSEC_GSS privacy and integrity payloads
    pub fn with_security_layer(mut self, layer: Arc<dyn SecurityLayer>) -> Self {
        self.dissector = self.dissector.with_security_layer(layer);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProcedureRegistry {
        self.dissector.registry()
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn conversation(&self, id: ConversationId) -> Option<&ConversationState> {
        self.conversations.get(id)
    }

    pub fn contexts(&self) -> &GssContextStore {
        &self.contexts
    }

    pub fn reassembler(&self) -> &FragmentReassembler {
        &self.reassembler
    }

    pub fn stats(&self) -> &RpcStats {
        &self.stats
    }

    pub fn is_first_pass_complete(&self) -> bool {
        self.first_pass_complete
    }

    /// End the first pass. Every later call to [`process`](Self::process)
    /// is a replay.
    pub fn finish_first_pass(&mut self) {
        if !self.first_pass_complete {
            info!(
                "First pass complete: {} frames, {} conversations, {} GSS contexts, {} pending assemblies",
                self.visited.len(),
                self.conversations.len(),
                self.contexts.len(),
                self.reassembler.pending()
            );
        }
        self.first_pass_complete = true;
    }

    /// Process one transport segment, choosing the pass mode from whether
    /// this frame was seen before.
    ///
    /// When the report asks for more data, the transport should deliver
    /// the bytes from `need_more.offset` onward again, joined with what
    /// follows, as part of a later frame.
    pub fn process(&mut self, info: &PacketInfo, data: Bytes) -> SegmentReport {
        let mode = if self.first_pass_complete || self.visited.contains(&info.frame) {
            PassMode::Replay
        } else {
            PassMode::FirstPass
        };
        self.process_with_mode(info, data, mode)
    }

    /// Process one transport segment in an explicit pass mode
    pub fn process_with_mode(&mut self, info: &PacketInfo, data: Bytes, mode: PassMode) -> SegmentReport {
        if mode.is_first_pass() {
            self.visited.insert(info.frame);
        }
        match info.transport {
            Transport::Tcp => self.process_stream(info, data, mode),
            Transport::Udp => self.process_datagram(info, data, mode),
        }
    }

    /// Whether `data` plausibly starts an ONC RPC message
    pub fn probe(&self, info: &PacketInfo, data: &[u8]) -> bool {
        self.check_message_start(info, data).is_ok()
    }

    /// Like [`probe`](Self::probe), but says why a buffer was rejected
    pub fn check_message_start(&self, info: &PacketInfo, data: &[u8]) -> Result<()> {
        let body = match info.transport {
            Transport::Tcp => {
                self.reassembler.framer().read_mark(data)?;
                &data[RECORD_MARK_SIZE..]
            }
            Transport::Udp => data,
        };
        let (xid, msg_type) = classify(body)?;

        match msg_type {
            MessageType::Call => {
                let end = body.len().min(MESSAGE_HEADER_SIZE + 16);
                let mut reader = XdrReader::new(Bytes::copy_from_slice(&body[MESSAGE_HEADER_SIZE..end]));
                let key = CallHeader::decode_procedure(&mut reader)?;
                let plausible_unknown = self.config.dissect_unknown_programs
                    && key.program != 0
                    && key.program != u32::MAX
                    && key.version <= 10;
                if self.registry().knows_program(key.program) || plausible_unknown {
                    Ok(())
                } else {
                    Err(NotRpcReason::UnknownProgram(key.program).into())
                }
            }
            MessageType::Reply => {
                let key = ConversationKey::new(info, Direction::Reply);
                let answered = self
                    .conversations
                    .find(&key)
                    .and_then(|id| self.conversations.get(id))
                    .and_then(|conversation| conversation.calls.get(xid))
                    .is_some_and(|record| !record.is_placeholder());
                if answered {
                    Ok(())
                } else {
                    Err(NotRpcReason::UnmatchedReply.into())
                }
            }
        }
    }

    fn conversation_for(&mut self, key: ConversationKey, info: &PacketInfo, mode: PassMode) -> Option<ConversationId> {
        match mode {
            PassMode::FirstPass => Some(self.conversations.get_or_create(key, info.frame)),
            PassMode::Replay => self.conversations.find(&key),
        }
    }

    fn process_datagram(&mut self, info: &PacketInfo, data: Bytes, mode: PassMode) -> SegmentReport {
        let mut report = SegmentReport::new(info.frame, mode);
        let direction = match classify(&data) {
            Ok((_, MessageType::Call)) => Direction::Call,
            Ok((_, MessageType::Reply)) => Direction::Reply,
            Err(error) => {
                report.not_rpc = error.is_not_rpc();
                report.items.push(SegmentItem::Error { offset: 0, error });
                return report;
            }
        };

        let key = ConversationKey::new(info, direction);
        let Some(conversation) = self.conversation_for(key, info, mode) else {
            report.not_rpc = true;
            return report;
        };
        report.conversation = Some(conversation);

        let item = match self.dissect(conversation, info, data, mode) {
            Ok(dissection) => SegmentItem::Message {
                offset: 0,
                dissection: Box::new(dissection),
                truncated: false,
            },
            Err(error) => SegmentItem::Error { offset: 0, error },
        };
        report.items.push(item);
        report
    }

    fn process_stream(&mut self, info: &PacketInfo, data: Bytes, mode: PassMode) -> SegmentReport {
        let mut report = SegmentReport::new(info.frame, mode);
        let key = ConversationKey::new(info, Direction::Call);
        let port = info.src.port();
        let mut offset = 0;
        let mut resynced = false;

        while offset < data.len() {
            let chunk = data.slice(offset..);
            let seq = info.seq.wrapping_add(offset as u32);

            // Record mark split across segments
            if chunk.len() < RECORD_MARK_SIZE && self.config.desegment {
                report.need_more = Some(NeedMore {
                    offset,
                    bytes: RECORD_MARK_SIZE - chunk.len(),
                });
                break;
            }

            let mark = match self.reassembler.framer().read_mark(&chunk) {
                Ok(mark) => mark,
                Err(error) => {
                    if let Some(next) = self.resync_target(&key, &data, offset, &mut resynced) {
                        report.items.push(SegmentItem::Resync { offset, skipped: next - offset });
                        offset = next;
                        continue;
                    }
                    report.not_rpc |= offset == 0 && error.is_not_rpc();
                    report.items.push(SegmentItem::Error { offset, error });
                    break;
                }
            };

            let conversation = match report.conversation.or_else(|| self.conversations.find(&key)) {
                Some(id) => id,
                None if !mode.is_first_pass() => {
                    report.not_rpc = true;
                    break;
                }
                None => match judge_first_record(&chunk, mark) {
                    Judgement::Plausible => self.conversations.get_or_create(key, info.frame),
                    Judgement::TooShort(bytes) if self.config.desegment => {
                        trace!("Frame {} needs {} more bytes to judge offset {}", info.frame, bytes, offset);
                        report.need_more = Some(NeedMore { offset, bytes });
                        break;
                    }
                    rejected => {
                        if let Some(next) = self.resync_target(&key, &data, offset, &mut resynced) {
                            report.items.push(SegmentItem::Resync { offset, skipped: next - offset });
                            offset = next;
                            continue;
                        }
                        let error = match rejected {
                            Judgement::Rejected(error) => error,
                            _ => RpcError::TruncatedHeader {
                                needed: RECORD_MARK_SIZE + MESSAGE_START_CHECK_LEN,
                                have: chunk.len(),
                            },
                        };
                        report.not_rpc |= offset == 0 && error.is_not_rpc();
                        report.items.push(SegmentItem::Error { offset, error });
                        break;
                    }
                },
            };
            report.conversation = Some(conversation);

            if !self.config.defragment {
                let Some(consumed) = self.frame_fragment(conversation, info, &chunk, offset, mark, mode, &mut report)
                else {
                    break;
                };
                offset += consumed;
                continue;
            }

            let feed = match mode {
                PassMode::FirstPass => self.reassembler.feed(conversation, seq, port, &chunk),
                PassMode::Replay => self.reassembler.revisit(conversation, seq, port, &chunk),
            };
            match feed {
                Ok(FeedResult::NeedMoreData(bytes)) => {
                    if self.config.desegment {
                        trace!("Frame {} needs {} more bytes at offset {}", info.frame, bytes, offset);
                        report.need_more = Some(NeedMore { offset, bytes });
                    } else {
                        let partial = chunk.slice(RECORD_MARK_SIZE..);
                        self.push_message(&mut report, conversation, info, partial, offset, true, mode);
                    }
                    break;
                }
                Ok(FeedResult::Fragment(marker)) => {
                    report.items.push(SegmentItem::Fragment { offset, marker });
                    offset += marker.consumed;
                }
                Ok(FeedResult::Complete(message)) => {
                    let ok = self.push_message(&mut report, conversation, info, message.payload, offset, false, mode);
                    if !ok {
                        if let Some(next) = self.resync_target(&key, &data, offset, &mut resynced) {
                            report.items.pop();
                            report.not_rpc = false;
                            report.items.push(SegmentItem::Resync { offset, skipped: next - offset });
                            offset = next;
                            continue;
                        }
                    }
                    offset += message.consumed;
                }
                Err(error) => {
                    report.not_rpc |= offset == 0 && error.is_not_rpc();
                    report.items.push(SegmentItem::Error { offset, error });
                    break;
                }
            }
        }

        report
    }

    /// Handle one fragment with reassembly switched off. Returns the bytes
    /// consumed, or `None` when the segment is exhausted.
    #[allow(clippy::too_many_arguments)]
    fn frame_fragment(
        &mut self,
        conversation: ConversationId,
        info: &PacketInfo,
        chunk: &Bytes,
        offset: usize,
        mark: RecordMark,
        mode: PassMode,
        report: &mut SegmentReport,
    ) -> Option<usize> {
        let end = mark.wire_len();
        if chunk.len() < end {
            if self.config.desegment {
                report.need_more = Some(NeedMore {
                    offset,
                    bytes: end - chunk.len(),
                });
            } else {
                let partial = chunk.slice(RECORD_MARK_SIZE..);
                self.push_message(report, conversation, info, partial, offset, true, mode);
            }
            return None;
        }

        let payload = chunk.slice(RECORD_MARK_SIZE..end);
        if plausible_message_start(&payload) {
            self.push_message(report, conversation, info, payload, offset, !mark.is_last, mode);
        } else {
            report.items.push(SegmentItem::Fragment {
                offset,
                marker: ConversationMarker {
                    mark,
                    consumed: end,
                    assembly: None,
                },
            });
        }
        Some(end)
    }

    /// Dissect `payload` and append the result. Returns false on error.
    #[allow(clippy::too_many_arguments)]
    fn push_message(
        &mut self,
        report: &mut SegmentReport,
        conversation: ConversationId,
        info: &PacketInfo,
        payload: Bytes,
        offset: usize,
        truncated: bool,
        mode: PassMode,
    ) -> bool {
        match self.dissect(conversation, info, payload, mode) {
            Ok(dissection) => {
                report.items.push(SegmentItem::Message {
                    offset,
                    dissection: Box::new(dissection),
                    truncated,
                });
                true
            }
            Err(error) => {
                report.not_rpc |= offset == 0 && error.is_not_rpc();
                report.items.push(SegmentItem::Error { offset, error });
                false
            }
        }
    }

    /// Where to continue after a failed PDU, if the reply-start heuristic
    /// applies: enabled, not yet used in this segment, and nothing on this
    /// conversation has parsed as RPC.
    fn resync_target(
        &self,
        key: &ConversationKey,
        data: &[u8],
        offset: usize,
        resynced: &mut bool,
    ) -> Option<usize> {
        if !self.config.find_fragment_start || *resynced {
            return None;
        }
        let rpc_seen = self
            .conversations
            .find(key)
            .and_then(|id| self.conversations.get(id))
            .is_some_and(|conversation| conversation.rpc_seen);
        if rpc_seen {
            return None;
        }
        *resynced = true;

        let from = offset + 1;
        let found = find_reply_start(data.get(from..)?, self.config.max_fragment_len)?;
        debug!("Resynchronised at offset {} after skipping {} bytes", from + found, from + found - offset);
        Some(from + found)
    }

    fn dissect(
        &mut self,
        conversation: ConversationId,
        info: &PacketInfo,
        message: Bytes,
        mode: PassMode,
    ) -> Result<Dissection> {
        let Some(state) = self.conversations.get_mut(conversation) else {
            return Err(NotRpcReason::UnmatchedReply.into());
        };
        let dissection = self.dissector.dissect(
            message,
            info,
            DissectionState {
                conversation,
                calls: &mut state.calls,
                contexts: &mut self.contexts,
                mode,
            },
        )?;

        if mode.is_first_pass() {
            state.rpc_seen = true;
            if let (Some(key), false) = (dissection.procedure, dissection.is_duplicate()) {
                if dissection.is_call() {
                    self.stats.record_call(key);
                } else if dissection.request_frame.is_some() {
                    self.stats.record_reply(key, dissection.response_time);
                }
            }
        }
        Ok(dissection)
    }
}

/// What the first record of an unknown stream looks like
enum Judgement {
    Plausible,
    Rejected(RpcError),
    /// This many more bytes are needed to tell
    TooShort(usize),
}

fn judge_first_record(chunk: &Bytes, mark: RecordMark) -> Judgement {
    if (mark.fragment_len as usize) < MESSAGE_START_CHECK_LEN {
        // A whole message is never this short, a leading fragment may be
        return if mark.is_last {
            Judgement::Rejected(RpcError::TruncatedHeader {
                needed: MESSAGE_START_CHECK_LEN,
                have: mark.fragment_len as usize,
            })
        } else {
            Judgement::Plausible
        };
    }
    let available = chunk.len() - RECORD_MARK_SIZE;
    if available < MESSAGE_START_CHECK_LEN {
        return Judgement::TooShort(MESSAGE_START_CHECK_LEN - available);
    }
    match check_message_start(&chunk[RECORD_MARK_SIZE..]) {
        Ok(()) => Judgement::Plausible,
        Err(error) => Judgement::Rejected(error),
    }
}
