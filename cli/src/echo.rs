use async_trait::async_trait;
use chassis_dispatch::RunContext;
use chassis_dispatch::RunLoop;
use chassis_dispatch::RunOutcome;
use chassis_dispatch::RuntimeFault;

/// Makes the run loop fail at once with the flag's value as the reason.
///
/// Fault injection for the end-to-end tests in `tests/suite/child_host.rs`;
/// a real parent never sets it.
pub const FAIL_RUN_LOOP_FLAG: &str = "fail-run-loop";
/// Makes the run loop panic at once. Like [`FAIL_RUN_LOOP_FLAG`], this only
/// exists so the end-to-end tests can reach the runtime fault path.
pub const PANIC_RUN_LOOP_FLAG: &str = "panic-run-loop";

/// Sends every payload from the parent straight back until cancelled.
///
/// Stands in for the child roles' real work. Besides echoing it honours the
/// two fault-injection flags above, which the end-to-end tests use to drive a
/// real child through its fault exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoRunLoop;

#[async_trait]
impl RunLoop for EchoRunLoop {
    async fn run(&self, ctx: RunContext) -> Result<RunOutcome, RuntimeFault> {
        let role = ctx.role();
        let flags = ctx.descriptor().flags();
        if let Some(reason) = flags.get(FAIL_RUN_LOOP_FLAG) {
            return Err(RuntimeFault::failed(if reason.is_empty() {
                FAIL_RUN_LOOP_FLAG
            } else {
                reason
            }));
        }
        if flags.is_enabled(PANIC_RUN_LOOP_FLAG) {
            panic!("{role} asked to panic");
        }

        let channel = ctx.channel().cloned().ok_or(RuntimeFault::ChannelLost)?;
        let mut echoed = 0u64;
        loop {
            tokio::select! {
                _ = ctx.cancellation().cancelled() => {
                    tracing::debug!(%role, echoed, "echo loop cancelled");
                    return Ok(RunOutcome::Cancelled);
                }
                payload = channel.recv() => match payload {
                    Some(data) => {
                        channel.send(data).map_err(RuntimeFault::failed)?;
                        echoed += 1;
                    }
                    // The parent hung up without asking us to stop.
                    None => return Err(RuntimeFault::ChannelLost),
                },
            }
        }
    }
}
