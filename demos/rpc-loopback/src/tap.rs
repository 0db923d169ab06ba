//! Wiretap: copies stream bytes off the wire and dissects them
//!
//! [`Tap`] wraps one end of a stream and forwards every byte written
//! through it to a channel. [`Wiretap`] cuts those bytes into segments of
//! a fixed size, the way a capture would see them, and runs each segment
//! through a [`CaptureSession`].

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::ready;
use oncrpc::{
    CaptureSession, Dissection, FrameNumber, Header, Outcome, PacketInfo, Payload, ProcedureRegistry,
    RpcStats, SegmentItem, SessionConfig,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Which way captured bytes travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    ToServer,
    ToClient,
}

/// Bytes seen on the wire
#[derive(Debug, Clone)]
pub struct Captured {
    pub flow: Flow,
    pub data: Bytes,
}

/// Stream wrapper that reports everything written through it
pub struct Tap<T> {
    inner: T,
    flow: Flow,
    tx: UnboundedSender<Captured>,
}

impl<T> Tap<T> {
    pub fn new(inner: T, flow: Flow, tx: UnboundedSender<Captured>) -> Self {
        Self { inner, flow, tx }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Tap<T> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Tap<T> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let n = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        if n > 0 {
            // The analyzer may already be gone at shutdown
            let _ = self.tx.send(Captured {
                flow: self.flow,
                data: Bytes::copy_from_slice(&buf[..n]),
            });
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Per-direction stream position
#[derive(Debug, Default)]
struct FlowState {
    /// Bytes the session asked to see again
    pending: BytesMut,
    seq: u32,
}

/// Segments the capture and feeds a [`CaptureSession`]
pub struct Wiretap {
    session: CaptureSession,
    client: SocketAddr,
    server: SocketAddr,
    segment_size: usize,
    frame: FrameNumber,
    to_server: FlowState,
    to_client: FlowState,
    /// Every segment processed, for a second pass
    segments: Vec<(PacketInfo, Bytes)>,
}

impl Wiretap {
    pub fn new(
        registry: Arc<ProcedureRegistry>,
        config: SessionConfig,
        client: SocketAddr,
        server: SocketAddr,
        segment_size: usize,
    ) -> Self {
        Self {
            session: CaptureSession::new(config, registry),
            client,
            server,
            segment_size: segment_size.max(1),
            frame: 0,
            to_server: FlowState::default(),
            to_client: FlowState::default(),
            segments: Vec::new(),
        }
    }

    /// Segment and dissect captured bytes; returns the messages found
    pub fn feed(&mut self, captured: Captured) -> Vec<Dissection> {
        let mut messages = Vec::new();
        let mut offset = 0;
        while offset < captured.data.len() {
            let end = (offset + self.segment_size).min(captured.data.len());
            messages.extend(self.segment(captured.flow, &captured.data[offset..end]));
            offset = end;
        }
        messages
    }

    fn segment(&mut self, flow: Flow, bytes: &[u8]) -> Vec<Dissection> {
        self.frame += 1;
        let frame = self.frame;
        let (src, dst, state) = match flow {
            Flow::ToServer => (self.client, self.server, &mut self.to_server),
            Flow::ToClient => (self.server, self.client, &mut self.to_client),
        };

        state.pending.extend_from_slice(bytes);
        let data = state.pending.split().freeze();
        let info = PacketInfo::tcp(frame, src, dst, state.seq).with_timestamp(Duration::from_micros(frame * 100));
        let report = self.session.process(&info, data.clone());

        match report.need_more {
            Some(need) => {
                debug!("Frame {} holds back {} bytes, {} more needed", frame, data.len() - need.offset, need.bytes);
                state.pending.extend_from_slice(&data[need.offset..]);
                state.seq = state.seq.wrapping_add(need.offset as u32);
            }
            None => state.seq = state.seq.wrapping_add(data.len() as u32),
        }
        for item in &report.items {
            if let SegmentItem::Error { offset, error } = item {
                warn!("Frame {} offset {}: {}", frame, offset, error);
            }
        }

        self.segments.push((info, data));
        report.messages().cloned().collect()
    }

    /// Close the first pass and dissect every segment again
    pub fn replay(&mut self) -> Vec<Dissection> {
        self.session.finish_first_pass();
        let segments = std::mem::take(&mut self.segments);
        let messages = segments
            .iter()
            .flat_map(|(info, data)| {
                let report = self.session.process(info, data.clone());
                report.messages().cloned().collect::<Vec<_>>()
            })
            .collect();
        self.segments = segments;
        messages
    }

    pub fn stats(&self) -> &RpcStats {
        self.session.stats()
    }

    pub fn frames(&self) -> FrameNumber {
        self.frame
    }
}

/// One-line rendering of a dissected message
pub fn describe(d: &Dissection) -> String {
    let name = match (&d.program_name, &d.procedure_name) {
        (Some(program), Some(procedure)) => format!("{} {}", program, procedure),
        _ => "unknown procedure".to_string(),
    };
    let mut line = match &d.header {
        Header::Call { .. } => format!("frame {:>3} call  xid={:#010x} {}", d.frame, d.xid, name),
        Header::Reply { body, .. } => {
            let status = if body.is_success() { "ok" } else { "failed" };
            format!("frame {:>3} reply xid={:#010x} {} ({})", d.frame, d.xid, name, status)
        }
    };
    if let (false, Some(request)) = (d.is_call(), d.request_frame) {
        line.push_str(&format!(" to frame {}", request));
    }
    if let Some(rtt) = d.response_time {
        line.push_str(&format!(" in {:?}", rtt));
    }
    match &d.outcome {
        Outcome::Dissected {
            payload: Payload::Value(value),
            ..
        } => line.push_str(&format!(": {:?}", value)),
        Outcome::Dissected { .. } => {}
        Outcome::DissectedAsOpaque { reason, bytes } => {
            line.push_str(&format!(": {} opaque bytes ({:?})", bytes.len(), reason))
        }
    }
    for annotation in &d.annotations {
        line.push_str(&format!(" [{:?}]", annotation));
    }
    line
}

/// Log a summary of the capture
pub fn log_stats(tap: &Wiretap) {
    info!(
        "{} frames, {} calls, {} replies",
        tap.frames(),
        tap.stats().total_calls(),
        tap.stats().total_replies()
    );
    for (key, stats) in tap.stats().iter() {
        info!(
            "  {}: {} calls, {} replies, avg {:?}",
            key,
            stats.calls,
            stats.replies,
            stats.average_rtt().unwrap_or_default()
        );
    }
}
