//! Async operation descriptor pools.
//!
//! Every in-flight driver operation owns one descriptor from a fixed
//! array (UDP: 4, TCP: 8). Allocation is a first-free linear scan;
//! freeing validates the handle, releases the descriptor's gather
//! storage (the scatter-send payload, which must outlive the send),
//! and clears the slot. Exhaustion is reported as
//! [`NetError::OutOfMemory`]; callers must not retry tightly.
//!
//! Driver implementations embed these pools so that the
//! freed-exactly-once contract lives in one place.

use std::net::Ipv4Addr;

use crate::net::driver::{EndpointId, NetError, NetResult, StreamId, TcpHandle, UdpHandle};
use crate::protocol::BUFFER_SIZE;

/// UDP descriptor count.
pub const UDP_OP_POOL_SIZE: usize = 4;

/// TCP descriptor count.
pub const TCP_OP_POOL_SIZE: usize = 8;

// ── UDP descriptors ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpOpKind {
    Send,
    Receive,
    BufferReturn,
}

/// One UDP operation in flight.
pub struct UdpOp {
    in_use: bool,
    pub kind: UdpOpKind,
    pub endpoint: EndpointId,
    pub dest_ip: Ipv4Addr,
    pub dest_port: u16,
    /// Gather storage for sends; owned by the descriptor until free.
    pub payload: heapless::Vec<u8, BUFFER_SIZE>,
}

impl UdpOp {
    const fn empty() -> Self {
        Self {
            in_use: false,
            kind: UdpOpKind::Receive,
            endpoint: EndpointId(0),
            dest_ip: Ipv4Addr::UNSPECIFIED,
            dest_port: 0,
            payload: heapless::Vec::new(),
        }
    }
}

pub struct UdpOpPool {
    ops: [UdpOp; UDP_OP_POOL_SIZE],
}

impl UdpOpPool {
    pub const fn new() -> Self {
        Self {
            ops: [const { UdpOp::empty() }; UDP_OP_POOL_SIZE],
        }
    }

    /// First-free scan. The returned handle is opaque to callers.
    pub fn alloc(&mut self, kind: UdpOpKind, endpoint: EndpointId) -> NetResult<UdpHandle> {
        for (i, op) in self.ops.iter_mut().enumerate() {
            if !op.in_use {
                op.in_use = true;
                op.kind = kind;
                op.endpoint = endpoint;
                return Ok(UdpHandle(i as u8));
            }
        }
        Err(NetError::OutOfMemory)
    }

    pub fn get(&self, handle: UdpHandle) -> NetResult<&UdpOp> {
        match self.ops.get(handle.0 as usize) {
            Some(op) if op.in_use => Ok(op),
            _ => Err(NetError::InvalidParam),
        }
    }

    pub fn get_mut(&mut self, handle: UdpHandle) -> NetResult<&mut UdpOp> {
        match self.ops.get_mut(handle.0 as usize) {
            Some(op) if op.in_use => Ok(op),
            _ => Err(NetError::InvalidParam),
        }
    }

    /// Release a descriptor: clears the gather storage and every
    /// associated field. Freeing an already-free or out-of-range
    /// handle is ignored.
    pub fn free(&mut self, handle: UdpHandle) {
        if let Some(op) = self.ops.get_mut(handle.0 as usize) {
            op.in_use = false;
            op.kind = UdpOpKind::Receive;
            op.endpoint = EndpointId(0);
            op.dest_ip = Ipv4Addr::UNSPECIFIED;
            op.dest_port = 0;
            op.payload.clear();
        }
    }

    pub fn in_use_count(&self) -> usize {
        self.ops.iter().filter(|op| op.in_use).count()
    }
}

// ── TCP descriptors ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOpKind {
    Listen,
    Connect,
    Send,
    Receive,
    Close,
}

/// One TCP operation in flight.
pub struct TcpOp {
    in_use: bool,
    pub kind: TcpOpKind,
    pub stream: StreamId,
    /// Remaining unsent bytes for sends.
    pub payload: heapless::Vec<u8, BUFFER_SIZE>,
    pub push: bool,
}

impl TcpOp {
    const fn empty() -> Self {
        Self {
            in_use: false,
            kind: TcpOpKind::Receive,
            stream: StreamId(0),
            payload: heapless::Vec::new(),
            push: false,
        }
    }
}

pub struct TcpOpPool {
    ops: [TcpOp; TCP_OP_POOL_SIZE],
}

impl TcpOpPool {
    pub const fn new() -> Self {
        Self {
            ops: [const { TcpOp::empty() }; TCP_OP_POOL_SIZE],
        }
    }

    pub fn alloc(&mut self, kind: TcpOpKind, stream: StreamId) -> NetResult<TcpHandle> {
        for (i, op) in self.ops.iter_mut().enumerate() {
            if !op.in_use {
                op.in_use = true;
                op.kind = kind;
                op.stream = stream;
                return Ok(TcpHandle(i as u8));
            }
        }
        Err(NetError::OutOfMemory)
    }

    pub fn get(&self, handle: TcpHandle) -> NetResult<&TcpOp> {
        match self.ops.get(handle.0 as usize) {
            Some(op) if op.in_use => Ok(op),
            _ => Err(NetError::InvalidParam),
        }
    }

    pub fn get_mut(&mut self, handle: TcpHandle) -> NetResult<&mut TcpOp> {
        match self.ops.get_mut(handle.0 as usize) {
            Some(op) if op.in_use => Ok(op),
            _ => Err(NetError::InvalidParam),
        }
    }

    pub fn free(&mut self, handle: TcpHandle) {
        if let Some(op) = self.ops.get_mut(handle.0 as usize) {
            op.in_use = false;
            op.kind = TcpOpKind::Receive;
            op.stream = StreamId(0);
            op.payload.clear();
            op.push = false;
        }
    }

    pub fn in_use_count(&self) -> usize {
        self.ops.iter().filter(|op| op.in_use).count()
    }

    /// Handles currently held for `stream`, oldest-allocated first.
    pub fn handles_for_stream(&self, stream: StreamId) -> heapless::Vec<TcpHandle, TCP_OP_POOL_SIZE> {
        let mut out = heapless::Vec::new();
        for (i, op) in self.ops.iter().enumerate() {
            if op.in_use && op.stream == stream {
                let _ = out.push(TcpHandle(i as u8));
            }
        }
        out
    }
}

// ── Tests ────────────────────────────────────────────────────
