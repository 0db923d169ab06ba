//! ONC RPC record fragment reassembly
//!
//! A message sent over a stream may be split into several record
//! fragments, and each fragment may itself be split across transport
//! segments. The reassembler works one fragment at a time:
//!
//! - A fragment whose record mark announces more payload than is present
//!   yields `NeedMoreData(n)` so the transport can desegment.
//! - A first fragment with the last-fragment flag is already a whole
//!   message and is returned as a zero-copy slice of the input.
//! - Otherwise fragments are accumulated under the key the *next*
//!   fragment will arrive with:
//!
//! ```text
//! (conversation, seq, port) ──► fragment 1 [len=L1]
//! (conversation, seq+4+L1, port) ──► fragment 2 [len=L2]
//! (conversation, seq+8+L1+L2, port) ──► fragment 3 [LAST]
//! ```
//!
//! Every fragment seen on the first pass is indexed by its own key, so a
//! later pass over the same capture can answer from the index without
//! touching any pending state.

use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::config::SessionConfig;
use crate::conversation::ConversationId;
use crate::error::Result;
use crate::message::{plausible_message_start, MESSAGE_START_CHECK_LEN};
use crate::record::{RecordFramer, RecordMark, RECORD_MARK_SIZE, RM_FRAGMENT_LEN};

/// Identity of one fragment on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub conversation: ConversationId,
    pub seq: u32,
    pub port: u16,
}

impl FragmentKey {
    pub fn new(conversation: ConversationId, seq: u32, port: u16) -> Self {
        Self {
            conversation,
            seq,
            port,
        }
    }

    fn after(self, mark: RecordMark) -> Self {
        Self {
            seq: self
                .seq
                .wrapping_add(mark.fragment_len)
                .wrapping_add(RECORD_MARK_SIZE as u32),
            ..self
        }
    }
}

/// Progress of a tracked assembly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyProgress {
    /// Sequence number of the first fragment's record mark
    pub start_seq: u32,
    /// Fragments accumulated so far, this one included
    pub fragments: u32,
    /// Payload bytes accumulated so far, this one included
    pub bytes: usize,
}

/// A fragment that did not complete a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationMarker {
    pub mark: RecordMark,
    /// Bytes of input covered, record mark included
    pub consumed: usize,
    /// `None` when no assembly is tracking this fragment: out-of-order
    /// delivery, a capture started mid-stream, or not RPC at all
    pub assembly: Option<AssemblyProgress>,
}

impl ConversationMarker {
    pub fn is_tracked(&self) -> bool {
        self.assembly.is_some()
    }
}

/// A fully reassembled message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteMessage {
    pub payload: Bytes,
    /// Bytes of input covered by the final fragment, record mark included
    pub consumed: usize,
    pub fragments: u32,
    pub start_seq: u32,
}

/// Outcome of feeding one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedResult {
    /// The fragment needs this many more bytes than are available
    NeedMoreData(usize),
    /// Accepted without completing a message
    Fragment(ConversationMarker),
    /// A whole message is available
    Complete(CompleteMessage),
}

type AssemblyId = u64;

struct Assembly {
    start: FragmentKey,
    data: BytesMut,
    fragments: u32,
    /// Keys of every fragment accepted so far
    keys: Vec<FragmentKey>,
    /// The accumulated bytes passed the message start check
    checked: bool,
    /// Set once the last fragment arrived
    completed: Option<Bytes>,
}

/// What the first pass learned about one fragment
#[derive(Debug, Clone, Copy)]
struct FragmentRecord {
    assembly: AssemblyId,
    progress: AssemblyProgress,
    is_last: bool,
}

/// Fragment reassembler for record-marked streams
pub struct FragmentReassembler {
    framer: RecordFramer,
    max_pending_assemblies: usize,
    max_pending_bytes: usize,
    next_id: AssemblyId,
    assemblies: HashMap<AssemblyId, Assembly>,
    /// Pending assemblies by the key their next fragment will carry
    expected: HashMap<FragmentKey, AssemblyId>,
    /// Every fragment that joined an assembly, by its own key
    seen: HashMap<FragmentKey, FragmentRecord>,
    /// Pending assemblies, oldest first
    pending: VecDeque<AssemblyId>,
    pending_bytes: usize,
}

impl Default for FragmentReassembler {
    fn default() -> Self {
        Self::new(&SessionConfig::default())
    }
}

impl FragmentReassembler {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            framer: RecordFramer::new(config.max_fragment_len),
            max_pending_assemblies: config.max_pending_assemblies,
            max_pending_bytes: config.max_pending_bytes,
            next_id: 0,
            assemblies: HashMap::new(),
            expected: HashMap::new(),
            seen: HashMap::new(),
            pending: VecDeque::new(),
            pending_bytes: 0,
        }
    }

    pub fn framer(&self) -> &RecordFramer {
        &self.framer
    }

    /// Number of assemblies still waiting for their last fragment
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Payload bytes held by pending assemblies
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Feed the fragment at the start of `data` on the first pass.
    ///
    /// `seq` is the stream sequence number of `data[0]`. Only one fragment
    /// is consumed per call; see the `consumed` fields of the result.
    pub fn feed(
        &mut self,
        conversation: ConversationId,
        seq: u32,
        port: u16,
        data: &Bytes,
    ) -> Result<FeedResult> {
        let mark = self.framer.read_mark(data)?;
        let Some(payload) = fragment_payload(data, mark) else {
            return Ok(FeedResult::NeedMoreData(mark.wire_len() - data.len()));
        };
        let key = FragmentKey::new(conversation, seq, port);

        // A retransmitted fragment is answered from what we already know
        if self.seen.contains_key(&key) {
            trace!("Fragment at seq {} already seen, answering read-only", seq);
            return Ok(self.revisit_fragment(key, mark, payload));
        }

        if let Some(id) = self.expected.remove(&key) {
            return Ok(self.continue_assembly(id, key, mark, payload));
        }

        if mark.is_last {
            return Ok(FeedResult::Complete(CompleteMessage {
                payload,
                consumed: mark.wire_len(),
                fragments: 1,
                start_seq: seq,
            }));
        }

        // Fragments too short to judge are tracked and checked once the
        // assembly holds enough bytes
        if payload.len() >= MESSAGE_START_CHECK_LEN && !plausible_message_start(&payload) {
            trace!("Untracked continuation fragment at seq {} ({} bytes)", seq, payload.len());
            return Ok(FeedResult::Fragment(ConversationMarker {
                mark,
                consumed: mark.wire_len(),
                assembly: None,
            }));
        }

        Ok(self.start_assembly(key, mark, payload))
    }

    /// Read-only counterpart of [`feed`](Self::feed) for later passes
    pub fn revisit(
        &self,
        conversation: ConversationId,
        seq: u32,
        port: u16,
        data: &Bytes,
    ) -> Result<FeedResult> {
        let mark = self.framer.read_mark(data)?;
        let Some(payload) = fragment_payload(data, mark) else {
            return Ok(FeedResult::NeedMoreData(mark.wire_len() - data.len()));
        };
        let key = FragmentKey::new(conversation, seq, port);
        Ok(self.revisit_fragment(key, mark, payload))
    }

    fn revisit_fragment(&self, key: FragmentKey, mark: RecordMark, payload: Bytes) -> FeedResult {
        let consumed = mark.wire_len();
        match self.seen.get(&key) {
            Some(record) => {
                let completed = self
                    .assemblies
                    .get(&record.assembly)
                    .and_then(|a| a.completed.clone());
                match (record.is_last, completed) {
                    (true, Some(payload)) => FeedResult::Complete(CompleteMessage {
                        payload,
                        consumed,
                        fragments: record.progress.fragments,
                        start_seq: record.progress.start_seq,
                    }),
                    _ => FeedResult::Fragment(ConversationMarker {
                        mark,
                        consumed,
                        assembly: Some(record.progress),
                    }),
                }
            }
            None if mark.is_last => FeedResult::Complete(CompleteMessage {
                payload,
                consumed,
                fragments: 1,
                start_seq: key.seq,
            }),
            None => FeedResult::Fragment(ConversationMarker {
                mark,
                consumed,
                assembly: None,
            }),
        }
    }

    fn start_assembly(&mut self, key: FragmentKey, mark: RecordMark, payload: Bytes) -> FeedResult {
        let id = self.next_id;
        self.next_id += 1;

        let progress = AssemblyProgress {
            start_seq: key.seq,
            fragments: 1,
            bytes: payload.len(),
        };
        debug!(
            "Starting assembly {} for {} at seq {} ({} bytes)",
            id, key.conversation, key.seq, payload.len()
        );

        let mut data = BytesMut::with_capacity(payload.len() * 2);
        data.extend_from_slice(&payload);
        self.assemblies.insert(
            id,
            Assembly {
                start: key,
                data,
                fragments: 1,
                keys: vec![key],
                checked: payload.len() >= MESSAGE_START_CHECK_LEN,
                completed: None,
            },
        );
        self.seen.insert(
            key,
            FragmentRecord {
                assembly: id,
                progress,
                is_last: false,
            },
        );
        self.expected.insert(key.after(mark), id);
        self.pending.push_back(id);
        self.pending_bytes += payload.len();

        self.enforce_limits();
        FeedResult::Fragment(ConversationMarker {
            mark,
            consumed: mark.wire_len(),
            assembly: self.assemblies.contains_key(&id).then_some(progress),
        })
    }

    fn continue_assembly(
        &mut self,
        id: AssemblyId,
        key: FragmentKey,
        mark: RecordMark,
        payload: Bytes,
    ) -> FeedResult {
        let consumed = mark.wire_len();
        let Some(assembly) = self.assemblies.get_mut(&id) else {
            return FeedResult::Fragment(ConversationMarker {
                mark,
                consumed,
                assembly: None,
            });
        };

        assembly.data.extend_from_slice(&payload);
        assembly.fragments += 1;
        assembly.keys.push(key);
        self.pending_bytes += payload.len();

        if !assembly.checked && assembly.data.len() >= MESSAGE_START_CHECK_LEN {
            assembly.checked = plausible_message_start(&assembly.data);
            if !assembly.checked && !mark.is_last {
                debug!(
                    "Dropping assembly {} at seq {}: {} bytes do not start a message",
                    id,
                    assembly.start.seq,
                    assembly.data.len()
                );
                self.remove_assembly(id);
                return FeedResult::Fragment(ConversationMarker {
                    mark,
                    consumed,
                    assembly: None,
                });
            }
        }

        let progress = AssemblyProgress {
            start_seq: assembly.start.seq,
            fragments: assembly.fragments,
            bytes: assembly.data.len(),
        };
        self.seen.insert(
            key,
            FragmentRecord {
                assembly: id,
                progress,
                is_last: mark.is_last,
            },
        );

        if mark.is_last {
            let message = assembly.data.split().freeze();
            assembly.completed = Some(message.clone());
            self.pending_bytes = self.pending_bytes.saturating_sub(message.len());
            self.pending.retain(|pending| *pending != id);
            debug!(
                "Assembly {} complete: {} fragments, {} bytes",
                id, progress.fragments, message.len()
            );
            return FeedResult::Complete(CompleteMessage {
                payload: message,
                consumed,
                fragments: progress.fragments,
                start_seq: progress.start_seq,
            });
        }

        self.expected.insert(key.after(mark), id);
        self.enforce_limits();
        FeedResult::Fragment(ConversationMarker {
            mark,
            consumed,
            assembly: self.assemblies.contains_key(&id).then_some(progress),
        })
    }

    /// Evict the oldest pending assemblies until both limits hold
    fn enforce_limits(&mut self) {
        while self.pending.len() > self.max_pending_assemblies
            || (self.pending_bytes > self.max_pending_bytes && !self.pending.is_empty())
        {
            let Some(&id) = self.pending.front() else {
                break;
            };
            match self.remove_assembly(id) {
                Some(assembly) => warn!(
                    "Evicting incomplete assembly {} for {} at seq {} ({} fragments, {} bytes)",
                    id,
                    assembly.start.conversation,
                    assembly.start.seq,
                    assembly.fragments,
                    assembly.data.len()
                ),
                None => {
                    self.pending.pop_front();
                }
            }
        }
    }

    /// Forget a pending assembly and every fragment it accepted
    fn remove_assembly(&mut self, id: AssemblyId) -> Option<Assembly> {
        let assembly = self.assemblies.remove(&id)?;
        self.pending.retain(|pending| *pending != id);
        self.pending_bytes = self.pending_bytes.saturating_sub(assembly.data.len());
        for key in &assembly.keys {
            self.seen.remove(key);
        }
        self.expected.retain(|_, pending| *pending != id);
        Some(assembly)
    }
}

/// The fragment payload, or `None` if `data` does not hold all of it
fn fragment_payload(data: &Bytes, mark: RecordMark) -> Option<Bytes> {
    let end = mark.wire_len();
    (data.len() >= end).then(|| data.slice(RECORD_MARK_SIZE..end))
}

/// Scan for the start of a record holding a plain successful reply.
///
/// Looks for a record mark whose length is within `max_fragment_len`,
/// followed by an XID, a reply message type and four zero words
/// (accepted, AUTH_NULL verifier of length 0, success):
///
/// ```text
/// [record mark][xid][1][0][0][0][0]
/// ```
///
/// This is a guess and can match arbitrary data; callers only use it to
/// resynchronise on the first PDU of a conversation whose start was not
/// captured.
pub fn find_reply_start(data: &[u8], max_fragment_len: usize) -> Option<usize> {
    const PATTERN_LEN: usize = 28;
    if data.len() < PATTERN_LEN {
        return None;
    }
    let word = |at: usize| u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);

    (0..=data.len() - PATTERN_LEN).find(|&offset| {
        let fragment_len = (word(offset) & RM_FRAGMENT_LEN) as usize;
        fragment_len <= max_fragment_len
            && word(offset + 8) == 1
            && (12..28).step_by(4).all(|rel| word(offset + rel) == 0)
    })
}
