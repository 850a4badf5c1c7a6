use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::context::RunContext;
use gateway::template::{DEFAULT_VARIANT, tasks};
use gateway::{Bindings, Gateway, GatewayError, PromptRenderer, Schema, TemplateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Verified,
    Refuted,
    Unsupported,
}

impl Verdict {
    /// Case-insensitive; anything unrecognised is `Unsupported`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "VERIFIED" => Verdict::Verified,
            "REFUTED" => Verdict::Refuted,
            _ => Verdict::Unsupported,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    pub verdict: Verdict,
    pub evidence: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Verified,
    Partial,
    Unverified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub claims: Vec<Claim>,
    pub overall: VerificationStatus,
    /// Share of claims verified at or above the minimum confidence
    pub verified_ratio: f64,
}

impl VerificationReport {
    pub fn from_claims(claims: Vec<Claim>, min_confidence: f64) -> Self {
        let verified = claims
            .iter()
            .filter(|c| c.verdict == Verdict::Verified && c.confidence >= min_confidence)
            .count();

        let overall = if claims.is_empty() || verified == 0 {
            VerificationStatus::Unverified
        } else if verified == claims.len() {
            VerificationStatus::Verified
        } else {
            VerificationStatus::Partial
        };

        let verified_ratio = if claims.is_empty() {
            0.0
        } else {
            verified as f64 / claims.len() as f64
        };

        Self {
            claims,
            overall,
            verified_ratio,
        }
    }

    pub fn refuted(&self) -> impl Iterator<Item = &Claim> {
        self.claims.iter().filter(|c| c.verdict == Verdict::Refuted)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("claim decomposition failed: {0}")]
    Gateway(#[from] GatewayError),
}

#[derive(Deserialize)]
struct ClaimList {
    claims: Vec<String>,
}

#[derive(Deserialize)]
struct RawVerdict {
    verdict: String,
    #[serde(default)]
    evidence: String,
    confidence: f64,
}

pub struct FactVerifier {
    gateway: Arc<Gateway>,
    renderer: Arc<dyn PromptRenderer>,
    variant: String,
    require_evidence: bool,
}

impl FactVerifier {
    pub fn new(gateway: Arc<Gateway>, renderer: Arc<dyn PromptRenderer>) -> Self {
        Self {
            gateway,
            renderer,
            variant: DEFAULT_VARIANT.to_string(),
            require_evidence: true,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = variant.into();
        self
    }

    pub fn require_evidence(mut self, require: bool) -> Self {
        self.require_evidence = require;
        self
    }

    /// Decompose `draft` into atomic claims and judge each against
    /// `context_spans` only. Only a failed decomposition is an error; a failed
    /// verdict call leaves that claim `Unsupported`.
    pub async fn verify(
        &self,
        draft: &str,
        context_spans: &[String],
        min_confidence: f64,
        ctx: &RunContext,
    ) -> Result<VerificationReport, VerifyError> {
        let prompt = self.renderer.render(
            tasks::CLAIM_DECOMPOSITION,
            &self.variant,
            &Bindings::new().with("answer", draft),
        )?;
        let decomposition = self
            .gateway
            .call_structured::<ClaimList>(&prompt, &Schema::claim_decomposition(), &ctx.scope)
            .await?;

        let mut claims: Vec<String> = Vec::new();
        for claim in decomposition.value.claims {
            let claim = claim.trim().to_string();
            if !claim.is_empty() && !claims.contains(&claim) {
                claims.push(claim);
            }
        }

        let context = Arc::new(
            context_spans
                .iter()
                .enumerate()
                .map(|(i, span)| format!("[{}] {}", i, span.trim()))
                .collect::<Vec<_>>()
                .join("\n\n"),
        );
        let haystack = Arc::new(fold(&context_spans.join("\n")));

        let mut verdicts = JoinSet::new();
        for (position, claim) in claims.iter().cloned().enumerate() {
            let prompt = self.renderer.render(
                tasks::FACT_VERIFICATION,
                &self.variant,
                &Bindings::new()
                    .with("claim", claim.as_str())
                    .with("context", context.as_str()),
            )?;
            let gateway = Arc::clone(&self.gateway);
            let scope = ctx.scope.clone();
            let branches = Arc::clone(&ctx.branches);
            let haystack = Arc::clone(&haystack);
            let require_evidence = self.require_evidence;

            verdicts.spawn(async move {
                let _permit = branches.acquire_owned().await.ok();
                let result = gateway
                    .call_structured::<RawVerdict>(&prompt, &Schema::claim_verdict(), &scope)
                    .await;
                let judged = match result {
                    Ok(response) => judge(claim, response.value, &haystack, require_evidence),
                    Err(e) => {
                        warn!(claim = %claim, error = %e, "Claim verification call failed");
                        unsupported(claim)
                    }
                };
                (position, judged)
            });
        }

        let mut judged: Vec<Option<Claim>> = vec![None; claims.len()];
        while let Some(joined) = verdicts.join_next().await {
            match joined {
                Ok((position, claim)) => judged[position] = Some(claim),
                Err(e) => warn!(error = %e, "Claim verification task failed"),
            }
        }

        // A claim whose task died still counts, as unsupported
        let claims: Vec<Claim> = claims
            .into_iter()
            .zip(judged)
            .map(|(text, claim)| claim.unwrap_or_else(|| unsupported(text)))
            .collect();

        let report = VerificationReport::from_claims(claims, min_confidence);
        debug!(
            claims = report.claims.len(),
            overall = ?report.overall,
            ratio = report.verified_ratio,
            "Verified draft"
        );
        Ok(report)
    }
}

/// Turn a raw verdict into a claim. A VERIFIED verdict must quote evidence
/// that occurs in the context, otherwise it is downgraded.
fn judge(text: String, raw: RawVerdict, haystack: &str, require_evidence: bool) -> Claim {
    let mut verdict = Verdict::parse(&raw.verdict);
    let evidence = raw.evidence.trim().to_string();
    let confidence = if raw.confidence.is_finite() {
        raw.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    if verdict == Verdict::Verified && require_evidence {
        let folded = fold(&evidence);
        if folded.is_empty() || !haystack.contains(&folded) {
            verdict = Verdict::Unsupported;
        }
    }

    Claim {
        text,
        verdict,
        evidence,
        confidence,
    }
}

fn unsupported(text: String) -> Claim {
    Claim {
        text,
        verdict: Verdict::Unsupported,
        evidence: String::new(),
        confidence: 0.0,
    }
}

/// Lowercase with whitespace runs collapsed, for evidence matching.
fn fold(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use gateway::mock::ScriptedProvider;
    use gateway::{BuiltinTemplates, GatewayConfig, ProviderError};

    const CONTEXT: &str = "Acme Corp was founded in 1999 by Jane Doe. It builds rockets.";

    fn verifier(provider: Arc<ScriptedProvider>) -> FactVerifier {
        let gateway = Arc::new(Gateway::new(provider, &GatewayConfig::default()));
        FactVerifier::new(gateway, Arc::new(BuiltinTemplates::new()))
    }

    fn responder(prompt: &str) -> Result<String, ProviderError> {
        if prompt.contains("Break the following answer into atomic claims") {
            return Ok(r#"{"claims": ["Acme was founded in 1999", "Acme builds rockets", "Acme is based on Mars", "Acme has 10 staff"]}"#.into());
        }
        let claim = prompt
            .split("CLAIM TO VERIFY: ")
            .nth(1)
            .and_then(|rest| rest.lines().next())
            .unwrap_or_default();
        let reply = match claim {
            "Acme was founded in 1999" => {
                r#"{"verdict": "verified", "evidence": "founded in   1999 by Jane Doe", "confidence": 0.9}"#
            }
            "Acme builds rockets" => {
                r#"{"verdict": "VERIFIED", "evidence": "Acme builds submarines", "confidence": 0.9}"#
            }
            "Acme is based on Mars" => {
                r#"{"verdict": "REFUTED", "evidence": "", "confidence": 0.8}"#
            }
            _ => return Err(ProviderError::Authentication("revoked".into())),
        };
        Ok(reply.into())
    }

    #[tokio::test]
    async fn judges_each_claim_against_context() {
        let provider = Arc::new(ScriptedProvider::new("mock").with_responder(responder));
        let ctx = RunContext::new(&PipelineConfig::default());

        let report = verifier(provider)
            .verify("draft", &[CONTEXT.to_string()], 0.75, &ctx)
            .await
            .unwrap();

        let verdicts: Vec<Verdict> = report.claims.iter().map(|c| c.verdict).collect();
        assert_eq!(
            verdicts,
            vec![
                Verdict::Verified,
                Verdict::Unsupported,
                Verdict::Refuted,
                Verdict::Unsupported
            ]
        );
        assert_eq!(report.claims[3].confidence, 0.0);
        assert_eq!(report.overall, VerificationStatus::Partial);
        assert_eq!(report.verified_ratio, 0.25);
        assert_eq!(report.refuted().count(), 1);
    }

    #[tokio::test]
    async fn crashed_claim_task_counts_as_unsupported() {
        let provider = Arc::new(ScriptedProvider::new("mock").with_responder(|prompt| {
            if prompt.contains("CLAIM TO VERIFY: Acme has 10 staff") {
                panic!("verdict task crashed");
            }
            responder(prompt)
        }));
        let ctx = RunContext::new(&PipelineConfig::default());

        let report = verifier(provider)
            .verify("draft", &[CONTEXT.to_string()], 0.75, &ctx)
            .await
            .unwrap();

        assert_eq!(report.claims.len(), 4);
        assert_eq!(report.claims[3].text, "Acme has 10 staff");
        assert_eq!(report.claims[3].verdict, Verdict::Unsupported);
        assert_eq!(report.claims[3].confidence, 0.0);
        assert_eq!(report.verified_ratio, 0.25);
    }

    #[test]
    fn overall_status_rules() {
        let claim = |verdict, confidence| Claim {
            text: "c".into(),
            verdict,
            evidence: String::new(),
            confidence,
        };

        let all = VerificationReport::from_claims(
            vec![claim(Verdict::Verified, 0.9), claim(Verdict::Verified, 0.8)],
            0.75,
        );
        assert_eq!(all.overall, VerificationStatus::Verified);

        let low = VerificationReport::from_claims(vec![claim(Verdict::Verified, 0.5)], 0.75);
        assert_eq!(low.overall, VerificationStatus::Unverified);

        let none = VerificationReport::from_claims(Vec::new(), 0.75);
        assert_eq!(none.overall, VerificationStatus::Unverified);
        assert_eq!(none.verified_ratio, 0.0);
    }

    #[tokio::test]
    async fn failed_decomposition_is_an_error() {
        let provider = Arc::new(ScriptedProvider::new("mock"));
        provider.push_err(ProviderError::InvalidRequest("bad".into()));
        let ctx = RunContext::new(&PipelineConfig::default());

        let result = verifier(provider)
            .verify("draft", &[CONTEXT.to_string()], 0.75, &ctx)
            .await;

        assert!(matches!(result, Err(VerifyError::Gateway(_))));
    }
}
