//! Block forwarding packets unchanged.

use quickstream_core::{
    BlockModule, DeclareContext, DeclareStatus, FlowContext, FlowStatus, QsError, Result,
    StartContext, Value,
};

/// Forwards every packet arriving on `in` to `out`, unmodified.
///
/// Parameters: getter `packets` (packets forwarded in the current run).
#[derive(Default)]
pub struct Passthrough {
    forwarded: u64,
    input: usize,
    out: usize,
}

impl BlockModule for Passthrough {
    fn declare(&mut self, ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
        self.input = ctx.add_input("in")?;
        self.out = ctx.add_output("out")?;
        ctx.add_getter("packets", "packets forwarded in the current run")?;
        Ok(DeclareStatus::Keep)
    }

    fn start(&mut self, _ctx: &StartContext) -> Result<()> {
        self.forwarded = 0;
        Ok(())
    }

    fn flow(&mut self, ctx: &mut FlowContext) -> Result<FlowStatus> {
        for packet in ctx.take_input(self.input) {
            self.forwarded += 1;
            ctx.output(self.out, packet);
        }
        Ok(FlowStatus::Idle)
    }

    fn get_parameter(&mut self, name: &str) -> Result<Value> {
        match name {
            "packets" => Ok(Value::int(self.forwarded as i64)),
            other => Err(QsError::module(format!("getter '{other}' not handled"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_packets_in_order() {
        let mut pt = Passthrough::default();
        pt.start(&StartContext::default()).unwrap();
        let mut ctx = FlowContext::new(vec![vec![b"a".to_vec(), b"b".to_vec()]]);
        assert_eq!(pt.flow(&mut ctx).unwrap(), FlowStatus::Idle);
        let emitted = ctx.into_emitted();
        assert_eq!(emitted, vec![(0, b"a".to_vec()), (0, b"b".to_vec())]);
        assert_eq!(pt.get_parameter("packets").unwrap().as_i64(), Some(2));
    }

    #[test]
    fn idles_without_input() {
        let mut pt = Passthrough::default();
        let mut ctx = FlowContext::new(vec![vec![]]);
        assert_eq!(pt.flow(&mut ctx).unwrap(), FlowStatus::Idle);
        assert!(ctx.into_emitted().is_empty());
    }
}
