//! Reply correlation: dispatch a compiled invocation and settle exactly once.

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::sleep;

use std::sync::Arc;
use std::time::Duration;

use crate::{
    AckSpec, CompiledInvocation, Connection, EventSink, RequestDetails, ResponseSpec, VolleyError,
    VolleyResult, VuContext, process_response, template,
};

/// Correlation progress for one emitting step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationPhase {
    Idle,
    AwaitingChannelResponse,
    AwaitingAcknowledge,
    Done,
}

/// Templated reply expectations for one dispatch. A channel response may be
/// chained with an acknowledgment on the same dispatch; the strategies are
/// otherwise mutually exclusive.
#[derive(Debug, Clone, Default)]
pub struct ReplyPlan {
    pub response: Option<ResponseSpec>,
    pub acknowledge: Option<AckSpec>,
}

impl ReplyPlan {
    /// Substitute the raw policy blocks against the live context and parse
    /// them into typed specs.
    pub fn prepare(details: &RequestDetails, ctx: &VuContext) -> VolleyResult<ReplyPlan> {
        let response = details
            .response
            .as_ref()
            .map(|raw| {
                serde_json::from_value::<ResponseSpec>(template(raw, ctx)).map_err(|err| {
                    VolleyError::Scenario(format!("invalid response block: {err}"))
                })
            })
            .transpose()?;
        let acknowledge = details
            .acknowledge
            .as_ref()
            .map(|raw| {
                serde_json::from_value::<AckSpec>(template(raw, ctx)).map_err(|err| {
                    VolleyError::Scenario(format!("invalid acknowledge block: {err}"))
                })
            })
            .transpose()?;
        Ok(ReplyPlan {
            response,
            acknowledge,
        })
    }
}

/// Dispatch `invocation` on `conn` and resolve exactly once according to the
/// reply plan:
///
/// - channel response configured: the one-shot listener is registered before
///   dispatch and raced against a timer of `timeout_secs`; the loser of the
///   race has no observable effect. The timer covers only the channel wait.
/// - acknowledgment configured: the completion callback is attached to the
///   dispatch itself, so a chained acknowledge settles on the same dispatch;
///   the wait is unbounded by design.
/// - neither: resolved on successful emission.
pub async fn correlate(
    conn: &Arc<dyn Connection>,
    invocation: &CompiledInvocation,
    plan: &ReplyPlan,
    timeout_secs: u64,
    ctx: &mut VuContext,
    events: &EventSink,
) -> VolleyResult<()> {
    let mut phase = CorrelationPhase::Idle;
    tracing::trace!(event = %invocation.event, ?phase, "correlating");

    let (ack_wait, ack_sender) = match &plan.acknowledge {
        Some(_) => {
            let (tx, rx) = oneshot::channel();
            (Some(rx), Some(tx))
        }
        None => (None, None),
    };

    if let Some(response) = &plan.response {
        let listener = conn.listen_once(&response.channel);
        conn.emit(&invocation.event, invocation.arguments.clone(), ack_sender)
            .await?;
        phase = CorrelationPhase::AwaitingChannelResponse;
        tracing::trace!(event = %invocation.event, ?phase, "dispatched");

        let payload = tokio::select! {
            received = listener => received.map_err(|_| {
                VolleyError::Connection(format!(
                    "channel {:?} closed before a response arrived",
                    response.channel
                ))
            })?,
            () = sleep(Duration::from_secs(timeout_secs)) => {
                return Err(VolleyError::ResponseTimeout {
                    channel: response.channel.clone(),
                    seconds: timeout_secs,
                });
            }
        };
        process_response(&payload, &response.reply_spec(), ctx, events)?;
    } else if ack_sender.is_some() {
        conn.emit(&invocation.event, invocation.arguments.clone(), ack_sender)
            .await?;
    } else {
        // fire-and-forget: resolved on successful emission
        conn.emit(&invocation.event, invocation.arguments.clone(), None)
            .await?;
        return Ok(());
    }

    if let Some(wait) = ack_wait {
        phase = CorrelationPhase::AwaitingAcknowledge;
        tracing::trace!(event = %invocation.event, ?phase, "awaiting acknowledge");
        let args = wait.await.map_err(|_| {
            VolleyError::Connection("connection closed before acknowledgment".to_string())
        })?;
        if let Some(ack) = &plan.acknowledge {
            process_response(&Value::Array(args), &ack.reply_spec(), ctx, events)?;
        }
    }

    phase = CorrelationPhase::Done;
    tracing::trace!(event = %invocation.event, ?phase, "correlated");
    Ok(())
}
