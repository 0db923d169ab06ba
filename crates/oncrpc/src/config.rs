//! Capture session configuration

use crate::record::DEFAULT_MAX_FRAGMENT_LEN;

/// Default cap on incomplete fragment assemblies
pub const DEFAULT_MAX_PENDING_ASSEMBLIES: usize = 1024;

/// Default byte budget across incomplete fragment assemblies
pub const DEFAULT_MAX_PENDING_BYTES: usize = 64 * 1024 * 1024;

/// Tuning knobs for a [`CaptureSession`](crate::CaptureSession)
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Ask the transport for more bytes when a record mark announces more
    /// payload than the segment holds. When off, the available bytes are
    /// dissected as a truncated message.
    pub desegment: bool,
    /// Reassemble multi-fragment records. When off, every fragment is
    /// dissected on its own.
    pub defragment: bool,
    /// Scan for a plausible reply start when a conversation's first PDU
    /// does not frame.
    pub find_fragment_start: bool,
    /// Let [`CaptureSession::probe`](crate::CaptureSession::probe) accept
    /// calls to programs nobody registered.
    pub dissect_unknown_programs: bool,
    /// Largest record-mark fragment length accepted
    pub max_fragment_len: usize,
    /// Cap on incomplete assemblies
    pub max_pending_assemblies: usize,
    /// Byte budget across incomplete assemblies
    pub max_pending_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            desegment: true,
            defragment: true,
            find_fragment_start: false,
            dissect_unknown_programs: false,
            max_fragment_len: DEFAULT_MAX_FRAGMENT_LEN,
            max_pending_assemblies: DEFAULT_MAX_PENDING_ASSEMBLIES,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_desegment(mut self, enabled: bool) -> Self {
        self.desegment = enabled;
        self
    }

    pub fn with_defragment(mut self, enabled: bool) -> Self {
        self.defragment = enabled;
        self
    }

    pub fn with_find_fragment_start(mut self, enabled: bool) -> Self {
        self.find_fragment_start = enabled;
        self
    }

    pub fn with_dissect_unknown_programs(mut self, enabled: bool) -> Self {
        self.dissect_unknown_programs = enabled;
        self
    }

    pub fn with_max_fragment_len(mut self, len: usize) -> Self {
        self.max_fragment_len = len;
        self
    }

    pub fn with_pending_limits(mut self, assemblies: usize, bytes: usize) -> Self {
        self.max_pending_assemblies = assemblies;
        self.max_pending_bytes = bytes;
        self
    }
}
