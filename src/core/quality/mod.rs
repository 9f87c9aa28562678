//! Quality gate: every configured verifier must accept a candidate artifact.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::error::ToolFailure;
use crate::core::executor::GenerationContext;
use crate::core::tools::{
    Capability, RetryPolicy, ToolInvocation, ToolRegistry, invoke_with_retry,
};
use crate::core::types::{Artifact, Feedback, Rejection, SegmentSpec};

#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Accepted,
    Rejected(Feedback),
}

#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub verdict: Result<GateVerdict, ToolFailure>,
    pub invocations: Vec<ToolInvocation>,
}

pub struct QualityGate {
    registry: Arc<ToolRegistry>,
    verifiers: Vec<String>,
    policy: RetryPolicy,
    deadline: Duration,
}

impl QualityGate {
    pub fn new(
        registry: Arc<ToolRegistry>,
        verifiers: Vec<String>,
        policy: RetryPolicy,
        deadline: Duration,
    ) -> Self {
        if verifiers.is_empty() {
            warn!("No verification tools configured: every artifact will be accepted unchecked");
        }
        Self {
            registry,
            verifiers,
            policy,
            deadline,
        }
    }

    /// Run every verifier. All rejections are merged into one feedback; the
    /// first verifier failure is surfaced instead of a verdict.
    pub async fn verify(
        &self,
        artifact: &Artifact,
        spec: &SegmentSpec,
        ctx: &GenerationContext,
        cancel: &CancellationToken,
    ) -> GateOutcome {
        let mut invocations = Vec::new();
        let mut feedback = Feedback::default();

        for name in &self.verifiers {
            let tool = match self.registry.resolve(name, Capability::Verification) {
                Ok(tool) => tool,
                Err(e) => {
                    return GateOutcome {
                        verdict: Err(e),
                        invocations,
                    };
                }
            };
            let payload = json!({
                "artifact": artifact,
                "segment": spec,
                "style": ctx.style,
                "attempt": ctx.attempt,
            });
            let result = invoke_with_retry(
                &self.registry,
                &tool,
                payload,
                &ctx.task_context(),
                self.deadline,
                &self.policy,
                cancel,
            )
            .await;
            invocations.extend(result.invocations);

            let rejection = result
                .outcome
                .and_then(|value| interpret_verdict(name, &value));
            match rejection {
                Ok(None) => {}
                Ok(Some(rejection)) => feedback.push(rejection),
                Err(e) => {
                    return GateOutcome {
                        verdict: Err(e),
                        invocations,
                    };
                }
            }
        }

        let verdict = if feedback.is_empty() {
            info!(
                "Segment {} attempt {} accepted",
                artifact.segment_ordinal, artifact.attempt
            );
            GateVerdict::Accepted
        } else {
            info!(
                "Segment {} attempt {} rejected: {}",
                artifact.segment_ordinal,
                artifact.attempt,
                feedback.summary()
            );
            GateVerdict::Rejected(feedback)
        };
        GateOutcome {
            verdict: Ok(verdict),
            invocations,
        }
    }
}

/// Read a verifier result: `{"accepted": bool, "reason"?, "details"?}` or
/// `{"verdict": "accepted" | "rejected", ...}`.
pub(crate) fn interpret_verdict(tool: &str, value: &Value) -> Result<Option<Rejection>, ToolFailure> {
    let accepted = match (value.get("accepted"), value.get("verdict")) {
        (Some(Value::Bool(b)), _) => *b,
        (_, Some(Value::String(v))) if v == "accepted" => true,
        (_, Some(Value::String(v))) if v == "rejected" => false,
        _ => {
            return Err(ToolFailure::hard(
                tool,
                "verifier response carries no accepted/verdict field",
            ));
        }
    };
    if accepted {
        return Ok(None);
    }
    Ok(Some(Rejection {
        tool: tool.to_string(),
        reason: value
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("rejected without reason")
            .to_string(),
        details: value.get("details").cloned().unwrap_or(Value::Null),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tools::{Tool, ToolDescriptor, ToolRequest, ToolResponse};
    use crate::core::types::{MediaKind, SourceMode, Verdict};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, BTreeSet};

    struct Judge {
        descriptor: ToolDescriptor,
        answer: ToolResponse,
    }

    #[async_trait]
    impl Tool for Judge {
        fn descriptor(&self) -> &ToolDescriptor {
            &self.descriptor
        }

        async fn invoke(&self, _request: &ToolRequest) -> ToolResponse {
            self.answer.clone()
        }
    }

    fn judge(name: &str, answer: ToolResponse) -> Arc<dyn Tool> {
        Arc::new(Judge {
            descriptor: ToolDescriptor::new(name, Capability::Verification),
            answer,
        })
    }

    fn gate(tools: Vec<Arc<dyn Tool>>, verifiers: &[&str]) -> QualityGate {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        QualityGate::new(
            Arc::new(registry),
            verifiers.iter().map(|v| v.to_string()).collect(),
            RetryPolicy::no_retry(),
            Duration::from_secs(1),
        )
    }

    fn fixtures() -> (Artifact, SegmentSpec, GenerationContext) {
        let artifact = Artifact {
            segment_ordinal: 2,
            plan_revision: 0,
            attempt: 1,
            content_ref: "mem://2".into(),
            metadata: Value::Null,
            verdict: Verdict::Pending,
            feedback: None,
        };
        let spec = SegmentSpec {
            ordinal: 2,
            scene: "a dog on a skateboard".into(),
            duration_secs: 5.0,
            source_mode: SourceMode::Generate,
            media_kind: MediaKind::Video,
            reference_asset: None,
            depends_on: BTreeSet::new(),
            transition: None,
        };
        let ctx = GenerationContext {
            task_id: "t".into(),
            plan_revision: 0,
            attempt: 1,
            style: "promotional".into(),
            aspect_ratio: "9:16".into(),
            continuity: BTreeMap::new(),
            reference_asset: None,
            feedback: Vec::new(),
            caused_by_seq: None,
        };
        (artifact, spec, ctx)
    }

    #[tokio::test]
    async fn all_verifiers_must_accept_and_rejections_merge() {
        let gate = gate(
            vec![
                judge("a", ToolResponse::success(json!({"accepted": true}))),
                judge(
                    "b",
                    ToolResponse::success(json!({"accepted": false, "reason": "blurry"})),
                ),
                judge(
                    "c",
                    ToolResponse::success(json!({"verdict": "rejected", "reason": "off-brand"})),
                ),
            ],
            &["a", "b", "c"],
        );
        let (artifact, spec, ctx) = fixtures();
        let outcome = gate
            .verify(&artifact, &spec, &ctx, &CancellationToken::new())
            .await;
        let Ok(GateVerdict::Rejected(feedback)) = outcome.verdict else {
            panic!("expected a rejection, got {:?}", outcome.verdict);
        };
        let tools: Vec<_> = feedback.rejections.iter().map(|r| r.tool.as_str()).collect();
        assert_eq!(tools, vec!["b", "c"]);
        assert_eq!(outcome.invocations.len(), 3);
    }

    #[tokio::test]
    async fn no_verifiers_means_accepted() {
        let gate = gate(Vec::new(), &[]);
        let (artifact, spec, ctx) = fixtures();
        let outcome = gate
            .verify(&artifact, &spec, &ctx, &CancellationToken::new())
            .await;
        assert_eq!(outcome.verdict, Ok(GateVerdict::Accepted));
        assert!(outcome.invocations.is_empty());
    }

    #[tokio::test]
    async fn verifier_failure_is_surfaced() {
        let gate = gate(
            vec![judge("a", ToolResponse::hard("model offline"))],
            &["a"],
        );
        let (artifact, spec, ctx) = fixtures();
        let outcome = gate
            .verify(&artifact, &spec, &ctx, &CancellationToken::new())
            .await;
        assert!(matches!(outcome.verdict, Err(ToolFailure::Hard { .. })));
    }

    #[tokio::test]
    async fn unknown_verifier_is_unavailable() {
        let gate = gate(Vec::new(), &["ghost"]);
        let (artifact, spec, ctx) = fixtures();
        let outcome = gate
            .verify(&artifact, &spec, &ctx, &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome.verdict,
            Err(ToolFailure::Unavailable { .. })
        ));
    }

    #[test]
    fn malformed_verdicts_are_hard_failures() {
        assert!(interpret_verdict("a", &json!({"score": 0.2})).is_err());
        assert!(interpret_verdict("a", &json!({"verdict": "maybe"})).is_err());
        let rejection = interpret_verdict("a", &json!({"accepted": false}))
            .unwrap()
            .unwrap();
        assert_eq!(rejection.reason, "rejected without reason");
    }
}
