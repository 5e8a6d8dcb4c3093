//! Reply validation, capture/match processing, and context mutation.

use serde_json::Value;

use crate::{
    EngineEvent, EventSink, ReplyEnvelope, ReplySpec, VolleyError, VolleyResult, VuContext,
    capture_or_match,
};

/// Validate an arrived reply against the step's expectations and advance the
/// context. Captures are all-or-nothing: a single failed match commits no
/// variables.
pub fn process_response(
    raw: &Value,
    spec: &ReplySpec<'_>,
    ctx: &mut VuContext,
    events: &EventSink,
) -> VolleyResult<()> {
    // Supplied literal data must equal the decoded reply exactly.
    if let Some(expected) = spec.data
        && expected != raw
    {
        tracing::debug!(reply = %raw, "reply payload did not match expected data");
        return Err(VolleyError::DataMismatch);
    }

    if spec.capture.is_empty() && spec.matches.is_empty() {
        return Ok(());
    }

    let envelope = ReplyEnvelope::wrap(raw)?;
    let result = capture_or_match(spec.capture, spec.matches, &envelope)?;

    if result.matches.values().any(|outcome| !outcome.success) {
        return Err(VolleyError::MatchFailed);
    }

    for outcome in result.matches.values() {
        events.emit(EngineEvent::Match {
            success: outcome.success,
            expected: outcome.expected.clone(),
            got: outcome.got.clone(),
            expression: outcome.expression.clone(),
        });
    }
    for (name, value) in result.captures {
        ctx.vars.insert(name, value);
    }
    // conventional "last body" variable
    ctx.vars.insert("$".to_string(), raw.clone());
    ctx.success_count = ctx.success_count.saturating_add(1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CaptureSpec, MatchSpec};
    use serde_json::json;

    fn reply_spec<'a>(
        data: Option<&'a Value>,
        capture: &'a [CaptureSpec],
        matches: &'a [MatchSpec],
    ) -> ReplySpec<'a> {
        ReplySpec {
            data,
            capture,
            matches,
        }
    }

    fn capture(json: &str, name: &str) -> CaptureSpec {
        CaptureSpec {
            json: json.to_string(),
            capture_as: name.to_string(),
        }
    }

    #[test]
    fn mismatched_data_short_circuits() {
        let (sink, mut rx) = EventSink::channel();
        let mut ctx = VuContext::new(0, 7);
        let expected = json!({"status": "ok"});
        let captures = [capture("$.status", "status")];
        let err = process_response(
            &json!({"status": "down"}),
            &reply_spec(Some(&expected), &captures, &[]),
            &mut ctx,
            &sink,
        )
        .unwrap_err();
        assert!(matches!(err, VolleyError::DataMismatch));
        assert!(ctx.vars.is_empty(), "captures must not run after a mismatch");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn no_expectations_succeed_without_mutation() {
        let (sink, _rx) = EventSink::channel();
        let mut ctx = VuContext::new(0, 7);
        process_response(
            &json!({"anything": 1}),
            &reply_spec(None, &[], &[]),
            &mut ctx,
            &sink,
        )
        .unwrap();
        assert!(ctx.vars.is_empty());
        assert_eq!(ctx.success_count, 0);
    }

    #[test]
    fn failed_matches_commit_no_captures() {
        let (sink, mut rx) = EventSink::channel();
        let mut ctx = VuContext::new(0, 7);
        let captures = [capture("$.id", "id")];
        let matches = [
            MatchSpec {
                json: "$.status".to_string(),
                value: json!("ok"),
            },
            MatchSpec {
                json: "$.id".to_string(),
                value: json!("other"),
            },
        ];
        let err = process_response(
            &json!({"status": "ok", "id": "r1"}),
            &reply_spec(None, &captures, &matches),
            &mut ctx,
            &sink,
        )
        .unwrap_err();
        assert!(matches!(err, VolleyError::MatchFailed));
        assert!(ctx.vars.is_empty());
        assert_eq!(ctx.success_count, 0);
        assert!(rx.try_recv().is_err(), "no match events on failure");
    }

    #[test]
    fn successful_processing_commits_and_counts() {
        let (sink, mut rx) = EventSink::channel();
        let mut ctx = VuContext::new(0, 7);
        let raw = json!({"status": "ok", "id": "r1"});
        let captures = [capture("$.id", "roomId")];
        let matches = [MatchSpec {
            json: "$.status".to_string(),
            value: json!("ok"),
        }];
        process_response(&raw, &reply_spec(None, &captures, &matches), &mut ctx, &sink).unwrap();
        assert_eq!(ctx.vars["roomId"], json!("r1"));
        assert_eq!(ctx.vars["$"], raw);
        assert_eq!(ctx.success_count, 1);
        match rx.try_recv().unwrap() {
            EngineEvent::Match { success, .. } => assert!(success),
            other => panic!("expected match event, got {other:?}"),
        }
    }
}
