//! XID correlation table
//!
//! Replies carry nothing but the XID of the call they answer, so every
//! call is remembered per conversation until the capture ends. The first
//! call seen for an XID wins: later calls with the same XID are
//! retransmissions and are only annotated.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::conversation::FrameNumber;
use crate::registry::ProcedureKey;
use crate::security::FlavorClass;

/// Informational notes attached to a dissection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Annotation {
    /// Same XID already seen as a call in another frame
    DuplicateCall { original_frame: FrameNumber },
    /// Same XID already answered in another frame
    DuplicateReply { original_frame: FrameNumber },
}

/// What is known about one XID in one conversation
#[derive(Clone)]
pub struct CallRecord {
    pub xid: u32,
    /// Unknown for a placeholder synthesized from an unmatched reply
    pub procedure: Option<ProcedureKey>,
    pub request_frame: Option<FrameNumber>,
    pub reply_frame: Option<FrameNumber>,
    pub request_time: Option<Duration>,
    pub flavor: FlavorClass,
    /// Procedure an indirect call (portmapper CALLIT) was forwarded to
    pub indirect: Option<ProcedureKey>,
    carry: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for CallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRecord")
            .field("xid", &format_args!("{:#010x}", self.xid))
            .field("procedure", &self.procedure)
            .field("request_frame", &self.request_frame)
            .field("reply_frame", &self.reply_frame)
            .field("request_time", &self.request_time)
            .field("flavor", &self.flavor)
            .field("indirect", &self.indirect)
            .field("carry", &self.carry.is_some())
            .finish()
    }
}

impl CallRecord {
    pub(crate) fn call(
        xid: u32,
        procedure: ProcedureKey,
        flavor: FlavorClass,
        frame: FrameNumber,
        timestamp: Duration,
    ) -> Self {
        Self {
            xid,
            procedure: Some(procedure),
            request_frame: Some(frame),
            reply_frame: None,
            request_time: Some(timestamp),
            flavor,
            indirect: None,
            carry: None,
        }
    }

    fn placeholder(xid: u32, reply_frame: FrameNumber) -> Self {
        Self {
            xid,
            procedure: None,
            request_frame: None,
            reply_frame: Some(reply_frame),
            request_time: None,
            flavor: FlavorClass::Unknown,
            indirect: None,
            carry: None,
        }
    }

    /// True when no call has been seen for this XID
    pub fn is_placeholder(&self) -> bool {
        self.request_frame.is_none()
    }

    /// Value a call decoder left behind for the reply decoder
    pub fn carried<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.carry.as_deref().and_then(|value| value.downcast_ref::<T>())
    }

    pub(crate) fn carry_handle(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.carry.clone()
    }
}

/// Result of registering or resolving an XID
#[derive(Debug, Clone)]
pub struct Correlation {
    /// Snapshot of the record after the operation
    pub record: CallRecord,
    pub annotation: Option<Annotation>,
}

/// Per-conversation map from XID to [`CallRecord`]
#[derive(Debug, Default)]
pub struct CallTable {
    calls: HashMap<u32, CallRecord>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn get(&self, xid: u32) -> Option<&CallRecord> {
        self.calls.get(&xid)
    }

    /// Record a call.
    ///
    /// A call for an XID that already has a call in a different frame is a
    /// retransmission: it is annotated and the stored record is left alone.
    /// A placeholder left by an earlier reply is completed in place.
    pub fn register_call(
        &mut self,
        xid: u32,
        procedure: ProcedureKey,
        flavor: FlavorClass,
        frame: FrameNumber,
        timestamp: Duration,
    ) -> Correlation {
        match self.calls.entry(xid) {
            Entry::Vacant(slot) => {
                trace!("Registering call xid={:#x} {} at frame {}", xid, procedure, frame);
                let record = slot.insert(CallRecord::call(xid, procedure, flavor, frame, timestamp));
                Correlation {
                    record: record.clone(),
                    annotation: None,
                }
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                let annotation = match record.request_frame {
                    None => {
                        debug!(
                            "Call xid={:#x} at frame {} completes placeholder from reply frame {:?}",
                            xid, frame, record.reply_frame
                        );
                        record.procedure = Some(procedure);
                        record.request_frame = Some(frame);
                        record.request_time = Some(timestamp);
                        record.flavor = flavor;
                        None
                    }
                    Some(original) => duplicate_call(xid, original, frame),
                };
                Correlation {
                    record: record.clone(),
                    annotation,
                }
            }
        }
    }

    /// Read-only counterpart of [`register_call`](Self::register_call)
    pub fn observe_call(&self, xid: u32, frame: FrameNumber) -> Option<Correlation> {
        let record = self.calls.get(&xid)?;
        let annotation = record
            .request_frame
            .and_then(|original| duplicate_call(xid, original, frame));
        Some(Correlation {
            record: record.clone(),
            annotation,
        })
    }

    /// Match a reply to its call.
    ///
    /// The first reply frame is stored once; later replies are annotated
    /// as duplicates. An XID with no call gets a placeholder record.
    pub fn resolve_reply(&mut self, xid: u32, frame: FrameNumber) -> Correlation {
        match self.calls.entry(xid) {
            Entry::Vacant(slot) => {
                debug!("Reply xid={:#x} at frame {} has no call, synthesizing placeholder", xid, frame);
                let record = slot.insert(CallRecord::placeholder(xid, frame));
                Correlation {
                    record: record.clone(),
                    annotation: None,
                }
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                let annotation = match record.reply_frame {
                    None => {
                        record.reply_frame = Some(frame);
                        None
                    }
                    Some(original) => duplicate_reply(xid, original, frame),
                };
                Correlation {
                    record: record.clone(),
                    annotation,
                }
            }
        }
    }

    /// Read-only counterpart of [`resolve_reply`](Self::resolve_reply).
    ///
    /// An unknown XID yields a transient placeholder that is not stored.
    pub fn observe_reply(&self, xid: u32, frame: FrameNumber) -> Correlation {
        match self.calls.get(&xid) {
            Some(record) => Correlation {
                record: record.clone(),
                annotation: record
                    .reply_frame
                    .and_then(|original| duplicate_reply(xid, original, frame)),
            },
            None => Correlation {
                record: CallRecord::placeholder(xid, frame),
                annotation: None,
            },
        }
    }

    /// Attach carry-over data for the reply decoder. Only the first value
    /// stored for an XID is kept.
    pub fn set_carry(&mut self, xid: u32, value: Arc<dyn Any + Send + Sync>) {
        if let Some(record) = self.calls.get_mut(&xid) {
            if record.carry.is_none() {
                record.carry = Some(value);
            }
        }
    }

    /// Remember where an indirect call was forwarded. The first target
    /// stored for an XID is kept.
    pub fn set_indirect(&mut self, xid: u32, target: ProcedureKey) {
        if let Some(record) = self.calls.get_mut(&xid) {
            if record.indirect.is_none() {
                trace!("Call xid={:#x} forwards to {}", xid, target);
                record.indirect = Some(target);
            }
        }
    }
}

fn duplicate_call(xid: u32, original: FrameNumber, frame: FrameNumber) -> Option<Annotation> {
    if original == frame {
        return None;
    }
    debug!("Duplicate call xid={:#x} at frame {} (original {})", xid, frame, original);
    Some(Annotation::DuplicateCall {
        original_frame: original,
    })
}

fn duplicate_reply(xid: u32, original: FrameNumber, frame: FrameNumber) -> Option<Annotation> {
    if original == frame {
        return None;
    }
    debug!("Duplicate reply xid={:#x} at frame {} (original {})", xid, frame, original);
    Some(Annotation::DuplicateReply {
        original_frame: original,
    })
}
