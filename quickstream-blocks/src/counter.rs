//! Block replacing packets with a running count.

use quickstream_core::{
    BlockModule, DeclareContext, DeclareStatus, FlowContext, FlowStatus, QsError, Result,
    StartContext, Value,
};

/// For each packet arriving on `in`, emits the running total of packets
/// seen this run on `out` as 8 little-endian bytes. The payload of the
/// incoming packet is discarded.
///
/// Parameters: getter `count` (packets seen in the current run).
#[derive(Default)]
pub struct Counter {
    seen: u64,
    input: usize,
    out: usize,
}

impl BlockModule for Counter {
    fn declare(&mut self, ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
        self.input = ctx.add_input("in")?;
        self.out = ctx.add_output("out")?;
        ctx.add_getter("count", "packets seen in the current run")?;
        Ok(DeclareStatus::Keep)
    }

    fn start(&mut self, _ctx: &StartContext) -> Result<()> {
        self.seen = 0;
        Ok(())
    }

    fn flow(&mut self, ctx: &mut FlowContext) -> Result<FlowStatus> {
        for _packet in ctx.take_input(self.input) {
            self.seen += 1;
            ctx.output(self.out, self.seen.to_le_bytes().to_vec());
        }
        Ok(FlowStatus::Idle)
    }

    fn get_parameter(&mut self, name: &str) -> Result<Value> {
        match name {
            "count" => Ok(Value::int(self.seen as i64)),
            other => Err(QsError::module(format!("getter '{other}' not handled"))),
        }
    }
}
