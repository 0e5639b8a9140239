//! Source block emitting a bounded sequence of numbered packets.

use quickstream_core::{
    BlockModule, DeclareContext, DeclareStatus, FlowContext, FlowStatus, QsError, Result,
    StartContext, Value,
};

const DEFAULT_COUNT: u64 = 10;

/// Emits `count` packets on its `out` port, each holding the packet's
/// zero-based index as 8 little-endian bytes, then finishes.
///
/// Parameters: constant `count` (the declare-time default), setter
/// `count` (packets per run, applied at the next start if changed while
/// running), getter `emitted`.
pub struct Sequence {
    count: u64,
    emitted: u64,
    out: usize,
}

impl Default for Sequence {
    fn default() -> Self {
        Self {
            count: DEFAULT_COUNT,
            emitted: 0,
            out: 0,
        }
    }
}

impl BlockModule for Sequence {
    fn declare(&mut self, ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
        self.out = ctx.add_output("out")?;
        ctx.add_constant("count", Value::int(self.count as i64))?;
        ctx.add_setter("count", "number of packets emitted per run")?;
        ctx.add_getter("emitted", "packets emitted in the current run")?;
        Ok(DeclareStatus::Keep)
    }

    fn start(&mut self, _ctx: &StartContext) -> Result<()> {
        self.emitted = 0;
        Ok(())
    }

    fn flow(&mut self, ctx: &mut FlowContext) -> Result<FlowStatus> {
        if self.emitted >= self.count {
            return Ok(FlowStatus::Finished);
        }
        ctx.output(self.out, self.emitted.to_le_bytes().to_vec());
        self.emitted += 1;
        if self.emitted >= self.count {
            Ok(FlowStatus::Finished)
        } else {
            Ok(FlowStatus::Again)
        }
    }

    fn set_parameter(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "count" => {
                let n = value
                    .as_i64()
                    .filter(|n| *n >= 0)
                    .ok_or_else(|| QsError::module("count must be a non-negative integer"))?;
                self.count = n as u64;
                Ok(())
            }
            other => Err(QsError::module(format!("setter '{other}' not handled"))),
        }
    }

    fn get_parameter(&mut self, name: &str) -> Result<Value> {
        match name {
            "emitted" => Ok(Value::int(self.emitted as i64)),
            other => Err(QsError::module(format!("getter '{other}' not handled"))),
        }
    }
}
