//! Sink block discarding everything it receives.

use quickstream_core::{
    BlockModule, DeclareContext, DeclareStatus, FlowContext, FlowStatus, QsError, Result,
    StartContext, Value,
};

/// Consumes packets on `in` and drops them.
///
/// Parameters: getter `consumed` (packets discarded in the current run).
#[derive(Default)]
pub struct Null {
    consumed: u64,
    input: usize,
}

impl BlockModule for Null {
    fn declare(&mut self, ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
        self.input = ctx.add_input("in")?;
        ctx.add_getter("consumed", "packets discarded in the current run")?;
        Ok(DeclareStatus::Keep)
    }

    fn start(&mut self, _ctx: &StartContext) -> Result<()> {
        self.consumed = 0;
        Ok(())
    }

    fn flow(&mut self, ctx: &mut FlowContext) -> Result<FlowStatus> {
        self.consumed += ctx.take_input(self.input).len() as u64;
        Ok(FlowStatus::Idle)
    }

    fn get_parameter(&mut self, name: &str) -> Result<Value> {
        match name {
            "consumed" => Ok(Value::int(self.consumed as i64)),
            other => Err(QsError::module(format!("getter '{other}' not handled"))),
        }
    }
}
