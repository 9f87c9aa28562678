use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Capability, CostClass, LatencyClass, Tool, ToolDescriptor, ToolRequest, ToolResponse};
use crate::config::OutputSettings;
use crate::core::types::{Artifact, SegmentSpec};

pub const TECHNICAL_COMPLIANCE: &str = "technical_compliance";

/// Checks tool-reported clip metadata against the segment and output settings.
///
/// Facts the generator did not report are not judged.
pub struct TechnicalComplianceTool {
    descriptor: ToolDescriptor,
    output: OutputSettings,
}

impl TechnicalComplianceTool {
    pub fn new(output: OutputSettings) -> Self {
        Self {
            descriptor: ToolDescriptor::new(TECHNICAL_COMPLIANCE, Capability::Verification)
                .with_cost(CostClass::Low, 0)
                .with_latency(LatencyClass::Interactive),
            output,
        }
    }

    fn check(&self, artifact: &Artifact, spec: &SegmentSpec) -> Vec<String> {
        let meta = &artifact.metadata;
        let mut problems = Vec::new();

        if spec.media_kind.is_timed()
            && let Some(actual) = meta.get("duration_secs").and_then(Value::as_f64)
        {
            let drift = (actual - spec.duration_secs).abs();
            if drift > self.output.duration_tolerance_secs {
                problems.push(format!(
                    "duration {actual:.2}s is {drift:.2}s off the planned {:.2}s",
                    spec.duration_secs
                ));
            }
        }

        let width = meta.get("width").and_then(Value::as_u64);
        let height = meta.get("height").and_then(Value::as_u64);
        if let (Some(w), Some(h)) = (width, height)
            && (w != u64::from(self.output.width) || h != u64::from(self.output.height))
        {
            problems.push(format!(
                "resolution {w}x{h} differs from target {}x{}",
                self.output.width, self.output.height
            ));
        }

        if let Some(format) = meta.get("format").and_then(Value::as_str)
            && !self.output.formats.iter().any(|f| f.eq_ignore_ascii_case(format))
        {
            problems.push(format!(
                "format '{format}' is not one of {:?}",
                self.output.formats
            ));
        }

        problems
    }
}

#[async_trait]
impl Tool for TechnicalComplianceTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, request: &ToolRequest) -> ToolResponse {
        let artifact = request
            .payload
            .get("artifact")
            .cloned()
            .map(serde_json::from_value::<Artifact>);
        let spec = request
            .payload
            .get("segment")
            .cloned()
            .map(serde_json::from_value::<SegmentSpec>);
        let (Some(Ok(artifact)), Some(Ok(spec))) = (artifact, spec) else {
            return ToolResponse::hard("payload must carry an artifact and its segment");
        };

        let problems = self.check(&artifact, &spec);
        if problems.is_empty() {
            ToolResponse::success(json!({"accepted": true}))
        } else {
            ToolResponse::success(json!({
                "accepted": false,
                "reason": problems.join("; "),
                "details": {"problems": problems},
            }))
        }
    }
}
