//! Canonical byte encoding for commitment digests.
//!
//! Field order is fixed, integers are big-endian, variable-length fields are
//! prefixed with a `u32` length, and optional/enum fields carry a one-byte
//! tag. The encoding never depends on in-memory layout, so any implementation
//! following these rules derives the same digest from the same records.

use crate::types::{ExecutionTrace, SideEffect, TaskDescriptor};
use chrono::{DateTime, Utc};

/// Domain separator for commitment preimages; bump the version on any change
pub const COMMITMENT_DOMAIN: &str = "veritask/commitment/v1";

pub struct CanonicalEncoder {
    buf: Vec<u8>,
}

impl CanonicalEncoder {
    pub fn new(domain: &str) -> Self {
        let mut encoder = Self { buf: Vec::with_capacity(256) };
        encoder.str(domain);
        encoder
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Length-prefixed bytes
    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        // payloads are bounded well below 4 GiB by the executor's limits
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn str(&mut self, v: &str) -> &mut Self {
        self.bytes(v.as_bytes())
    }

    /// Microsecond precision; anything finer is not part of the commitment
    pub fn timestamp(&mut self, v: &DateTime<Utc>) -> &mut Self {
        self.i64(v.timestamp_micros())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub fn encode_descriptor(enc: &mut CanonicalEncoder, task: &TaskDescriptor) {
    enc.bytes(task.task_id.as_bytes())
        .str(task.agent_id.as_str())
        .u8(task.operation_kind.tag())
        .str(task.operation_kind.name())
        .str(&task.input_payload.schema)
        .bytes(&task.input_payload.bytes)
        .i64(task.max_budget.micros())
        .timestamp(&task.created_at);
}

pub fn encode_trace(enc: &mut CanonicalEncoder, trace: &ExecutionTrace) {
    enc.bytes(trace.task_id.as_bytes())
        .u32(trace.attempt)
        .timestamp(&trace.started_at)
        .timestamp(&trace.finished_at)
        .bytes(&trace.output_payload)
        .u64(trace.resource_usage.cpu_time_us)
        .u64(trace.resource_usage.memory_high_watermark)
        .u32(trace.resource_usage.external_calls)
        .u64(trace.resource_usage.fuel_consumed)
        .u8(trace.status.tag());

    enc.u32(trace.external_calls.len() as u32);
    for call in &trace.external_calls {
        enc.str(&call.target).bytes(&call.request).bytes(&call.response);
    }

    match &trace.side_effect {
        SideEffect::None => {
            enc.u8(0);
        }
        SideEffect::Completed { receipt } => {
            enc.u8(1).bytes(receipt);
        }
        SideEffect::Pending { reference } => {
            enc.u8(2).bytes(reference);
        }
    }
}

/// Preimage of a commitment digest: descriptor then trace
pub fn commitment_preimage(task: &TaskDescriptor, trace: &ExecutionTrace) -> Vec<u8> {
    let mut enc = CanonicalEncoder::new(COMMITMENT_DOMAIN);
    encode_descriptor(&mut enc, task);
    encode_trace(&mut enc, trace);
    enc.finish()
}
