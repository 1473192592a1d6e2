//! Tool invocation orchestrator: the per-request state machine.
//!
//! ```text
//! Classifying ─┬─ NoTool ──────────────────────────────┐
//!              └─ ExtractingArgs ─┬─ ToolCalling ──────┼─ Merging ─ Done
//!                                 ├─ AbortToToolless ──┘
//!                                 └─ Clarifying ─ Done
//! ```
//!
//! Classification, extraction and the tool call share one wall-clock
//! budget. A failed, slow or skipped tool call never fails the request: it
//! degrades to plain generation with a caller-visible notice. Only a model
//! that cannot start generating ends in `Failed`.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::time::timeout_at;

use crate::config::{AppConfig, DomainConfig, MergeMode, OrchestratorConfig, RetryConfig, UnresolvedPolicy};
use crate::inference::{ChatMessage, GenerationStream, LanguageModel, ModelClient, SamplingParams};
use crate::tools::{FailureKind, ToolArguments, ToolClient, ToolInvoker, ToolRequest, ToolResponse};
use crate::transport::HttpTransport;

use super::assembler::{deliver, relay, OutputSink, RelayOutcome};
use super::classifier::RequestClassifier;
use super::errors::AgentError;
use super::extractor::ParameterExtractor;
use super::merge::{
    compose_messages, render_tool_result, ToolContext, DEFAULT_CLARIFY_QUESTION, MODEL_UNAVAILABLE_MESSAGE,
};
use super::registry::Registries;
use super::types::{
    ClassificationVerdict, ConversationContext, Domain, ExtractedArgument, ExtractionStrategy, Phase,
    RequestOutcome, TerminalStatus,
};

// ─── Per-request record ──────────────────────────────────────────────────────

/// Everything collected on the way through one request.
struct Run {
    verdict: ClassificationVerdict,
    arguments: Vec<ExtractedArgument>,
    tool_response: Option<ToolResponse>,
    trace: Vec<Phase>,
    notice: Option<String>,
}

impl Run {
    fn new() -> Self {
        Self {
            verdict: ClassificationVerdict::none(),
            arguments: Vec::new(),
            tool_response: None,
            trace: vec![Phase::Classifying],
            notice: None,
        }
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(?phase, "orchestrator: transition");
        self.trace.push(phase);
    }

    fn finish(mut self, status: TerminalStatus, interrupted: Option<String>) -> RequestOutcome {
        self.trace.push(match status {
            TerminalStatus::Done => Phase::Done,
            TerminalStatus::Failed => Phase::Failed,
            TerminalStatus::Cancelled => Phase::Cancelled,
        });
        RequestOutcome {
            status,
            verdict: self.verdict,
            arguments: self.arguments,
            tool_response: self.tool_response,
            trace: self.trace,
            notice: self.notice,
            interrupted,
        }
    }
}

/// Result of probing both servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HealthReport {
    pub tool_server: bool,
    pub model_server: bool,
}

// ─── ToolOrchestrator ────────────────────────────────────────────────────────

/// Built once at startup and shared by reference across requests.
pub struct ToolOrchestrator {
    classifier: RequestClassifier,
    extractor: ParameterExtractor,
    registries: Arc<Registries>,
    model: Arc<dyn LanguageModel>,
    tools: Arc<dyn ToolInvoker>,
    domains: std::collections::BTreeMap<Domain, DomainConfig>,
    retry: RetryConfig,
    settings: OrchestratorConfig,
    sampling: SamplingParams,
    default_model: String,
}

impl ToolOrchestrator {
    pub fn new(config: &AppConfig, model: Arc<dyn LanguageModel>, tools: Arc<dyn ToolInvoker>) -> Self {
        let registries = Arc::new(Registries::from_config(&config.registries));
        Self {
            classifier: RequestClassifier::from_config(config, Arc::clone(&registries)),
            extractor: ParameterExtractor::from_config(config, Arc::clone(&registries)),
            registries,
            model,
            tools,
            domains: config.domains.clone(),
            retry: config.retry.clone(),
            settings: config.orchestrator.clone(),
            sampling: config.model.sampling(),
            default_model: config.model.name.clone(),
        }
    }

    /// Wire real HTTP clients for both servers over one connection pool.
    pub fn from_config(config: &AppConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let transport = HttpTransport::new().map_err(|e| AgentError::TransportSetup { reason: e.to_string() })?;
        let model = ModelClient::new(
            transport.clone(),
            &config.servers.model_server_url,
            config.retry.model.clone(),
            config.model.stream_idle_timeout(),
        );
        let tools = ToolClient::new(transport, &config.servers.tool_server_url, config.retry.tool.clone());
        tracing::info!(
            tool_server = %config.servers.tool_server_url,
            model_server = %config.servers.model_server_url,
            model = %config.model.name,
            domains = config.domains.len(),
            "orchestrator ready"
        );
        Ok(Self::new(config, Arc::new(model), Arc::new(tools)))
    }

    pub fn classifier(&self) -> &RequestClassifier {
        &self.classifier
    }

    /// Classification only, including the model fallback when enabled.
    pub async fn classify(&self, prompt: &str) -> ClassificationVerdict {
        let deadline = tokio::time::Instant::now() + self.settings.tool_phase_budget();
        let classify = self
            .classifier
            .classify_with_fallback(prompt, self.model.as_ref(), &self.default_model);
        match timeout_at(deadline, classify).await {
            Ok(verdict) => verdict,
            Err(_) => {
                tracing::warn!("classification exceeded budget, using pattern verdict");
                self.classifier.classify(prompt)
            }
        }
    }

    /// Best-effort diagnostics for both servers.
    pub async fn health(&self) -> HealthReport {
        let (tool_server, model_server) = tokio::join!(self.tools.health(), self.model.health());
        HealthReport {
            tool_server,
            model_server,
        }
    }

    /// Answer one prompt, streaming into `sink`.
    ///
    /// The sink is owned for the duration of the call and dropped on return,
    /// which closes the caller's stream on every exit path.
    pub async fn classify_and_respond<S>(&self, prompt: &str, context: &ConversationContext, sink: S) -> RequestOutcome
    where
        S: OutputSink,
    {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.settings.tool_phase_budget();
        let model_name = if context.model.trim().is_empty() {
            self.default_model.as_str()
        } else {
            context.model.as_str()
        };
        let mut run = Run::new();

        // ── Classifying ──
        let classify = self
            .classifier
            .classify_with_fallback(prompt, self.model.as_ref(), model_name);
        run.verdict = match timeout_at(deadline, classify).await {
            Ok(verdict) => verdict,
            Err(_) => {
                tracing::warn!("classification exceeded budget, using pattern verdict");
                self.classifier.classify(prompt)
            }
        };

        let routed = run
            .verdict
            .tool_domain(self.classifier.threshold())
            .and_then(|d| self.domains.get(&d).map(|cfg| (d, cfg)));

        tracing::info!(
            domain = run.verdict.domain.map(Domain::as_str).unwrap_or("none"),
            confidence = run.verdict.confidence,
            method = ?run.verdict.method,
            signals = run.verdict.matched_signals.len(),
            ambiguous = run.verdict.is_ambiguous(),
            "request classified"
        );

        let tool_context = match routed {
            None => {
                run.enter(Phase::NoTool);
                ToolContext::None
            }
            Some((domain, domain_cfg)) => {
                run.enter(Phase::ExtractingArgs);
                let resolution = self
                    .resolve_argument(&mut run, domain, domain_cfg, prompt, model_name, deadline)
                    .await;
                match resolution {
                    Resolution::Resolved(argument) => {
                        run.enter(Phase::ToolCalling);
                        let request = build_request(domain_cfg, &argument);
                        run.arguments.push(argument);

                        let policy = self.retry.for_domain(domain);
                        tracing::debug!(%domain, correlation_id = %request.correlation_id(), "tool phase started");

                        let call = self.tools.call(&request, policy);
                        let response = tokio::select! {
                            biased;
                            _ = sink.closed() => {
                                tracing::info!(tool = %request.tool_name(), "caller disconnected during tool call");
                                return run.finish(TerminalStatus::Cancelled, None);
                            }
                            result = timeout_at(deadline, call) => match result {
                                Ok(response) => response,
                                Err(_) => {
                                    let budget_ms = self.settings.tool_phase_budget_ms;
                                    ToolResponse::failed(
                                        &request,
                                        FailureKind::BudgetExceeded,
                                        format!("tool phase exceeded its {budget_ms}ms budget"),
                                        started.elapsed(),
                                        1,
                                    )
                                }
                            },
                        };

                        let context = match response.result() {
                            Some(result) => {
                                tracing::info!(
                                    tool = %response.source,
                                    latency_ms = response.latency.as_millis() as u64,
                                    attempt = response.attempt,
                                    "tool call succeeded"
                                );
                                ToolContext::Data {
                                    domain,
                                    argument: None,
                                    rendered: render_tool_result(domain, result, self.settings.render_limit_bytes),
                                }
                            }
                            None => {
                                let (kind, message) = response.failure().unwrap_or((FailureKind::InvalidResponse, ""));
                                tracing::warn!(
                                    tool = %response.source,
                                    kind = ?kind,
                                    error = %message,
                                    attempt = response.attempt,
                                    "tool call failed, continuing without tool data"
                                );
                                ToolContext::Unavailable { domain }
                            }
                        };
                        run.tool_response = Some(response);
                        context
                    }
                    Resolution::Abort(context) => {
                        run.enter(Phase::AbortToToolless);
                        context
                    }
                    Resolution::Clarify(question) => {
                        run.enter(Phase::Clarifying);
                        if deliver(&question, &sink).await.is_err() {
                            return run.finish(TerminalStatus::Cancelled, None);
                        }
                        return run.finish(TerminalStatus::Done, None);
                    }
                }
            }
        };

        // ── Merging ──
        run.enter(Phase::Merging);
        run.notice = tool_context.notice().map(str::to_string);

        if let (MergeMode::Substitute, ToolContext::Data { rendered, .. }) = (self.settings.merge_mode, &tool_context) {
            let status = match deliver(rendered, &sink).await {
                Ok(()) => TerminalStatus::Done,
                Err(_) => TerminalStatus::Cancelled,
            };
            return run.finish(status, None);
        }

        let notice = tool_context.notice();
        let messages = {
            let tool_context = match tool_context {
                ToolContext::Data { domain, rendered, .. } => ToolContext::Data {
                    domain,
                    argument: run.arguments.last(),
                    rendered,
                },
                other => other,
            };
            compose_messages(&self.settings.system_prompt, context, &tool_context, prompt)
        };

        let stream = tokio::select! {
            biased;
            _ = sink.closed() => return run.finish(TerminalStatus::Cancelled, None),
            opened = self.open_generation(model_name, &messages) => opened,
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e.log_detail(), model = %model_name, "cannot answer request");
                let _ = deliver(MODEL_UNAVAILABLE_MESSAGE, &sink).await;
                return run.finish(TerminalStatus::Failed, None);
            }
        };

        let outcome = match relay(notice, stream, &sink).await {
            RelayOutcome::Completed => run.finish(TerminalStatus::Done, None),
            RelayOutcome::Interrupted { reason } => run.finish(TerminalStatus::Done, Some(reason)),
            RelayOutcome::Cancelled => run.finish(TerminalStatus::Cancelled, None),
        };
        tracing::info!(
            status = ?outcome.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            tool_used = outcome.tool_response.as_ref().is_some_and(|r| r.success),
            "request finished"
        );
        outcome
    }

    async fn open_generation(&self, model_name: &str, messages: &[ChatMessage]) -> Result<GenerationStream, AgentError> {
        self.model
            .stream_generate(model_name, messages, self.sampling)
            .await
            .map_err(|source| AgentError::GenerationUnavailable { source })
    }

    /// Run extraction under the deadline and apply the domain's policy for
    /// an unresolved argument.
    async fn resolve_argument(
        &self,
        run: &mut Run,
        domain: Domain,
        domain_cfg: &DomainConfig,
        prompt: &str,
        model_name: &str,
        deadline: tokio::time::Instant,
    ) -> Resolution {
        let extract = self.extractor.extract(domain, prompt, self.model.as_ref(), model_name);
        let extraction = match timeout_at(deadline, extract).await {
            Ok(extraction) => extraction,
            Err(_) => {
                tracing::warn!(%domain, "argument extraction exceeded budget, answering without tool");
                return Resolution::Abort(ToolContext::Unavailable { domain });
            }
        };

        if let Some(argument) = extraction.resolved() {
            tracing::info!(
                slot = %argument.slot,
                value = argument.value.as_deref().unwrap_or(""),
                strategy = ?argument.strategy,
                confidence = argument.confidence,
                "argument extracted"
            );
            return Resolution::Resolved(argument.clone());
        }

        // Keep an unresolved candidate for the record.
        if let Some(candidate) = extraction.argument {
            run.arguments.push(candidate);
        }

        match domain_cfg.on_unresolved {
            UnresolvedPolicy::DefaultValue => match &domain_cfg.default_argument {
                Some(default) => {
                    tracing::info!(%domain, slot = %extraction.slot, default = %default, "argument unresolved, using configured default");
                    Resolution::Resolved(self.default_argument(domain, &extraction.slot, default))
                }
                None => Resolution::Abort(ToolContext::NotUsed { domain }),
            },
            UnresolvedPolicy::Clarify => {
                tracing::info!(%domain, slot = %extraction.slot, "argument unresolved, asking caller");
                Resolution::Clarify(
                    domain_cfg
                        .clarify_question
                        .clone()
                        .unwrap_or_else(|| DEFAULT_CLARIFY_QUESTION.to_string()),
                )
            }
            UnresolvedPolicy::Fallback => {
                tracing::warn!(
                    %domain,
                    slot = %extraction.slot,
                    attempted = ?extraction.attempted,
                    "required argument unresolved, answering without tool"
                );
                Resolution::Abort(ToolContext::NotUsed { domain })
            }
        }
    }

    fn default_argument(&self, domain: Domain, slot: &str, default: &str) -> ExtractedArgument {
        let entity = self.registries.for_domain(domain).and_then(|r| r.resolve(default));
        ExtractedArgument {
            slot: slot.to_string(),
            raw_text_span: String::new(),
            normalized_name: entity.map(|e| e.name.clone()).or_else(|| Some(default.to_string())),
            value: Some(entity.map(|e| e.tool_value().to_string()).unwrap_or_else(|| default.to_string())),
            alias_resolved: false,
            confidence: 1.0,
            strategy: ExtractionStrategy::ConfiguredDefault,
        }
    }
}

/// What extraction decided for the tool path.
enum Resolution {
    Resolved(ExtractedArgument),
    Abort(ToolContext<'static>),
    Clarify(String),
}

fn build_request(domain_cfg: &DomainConfig, argument: &ExtractedArgument) -> ToolRequest {
    let mut arguments: ToolArguments = domain_cfg.static_arguments.clone();
    if let Some(value) = &argument.value {
        arguments.insert(domain_cfg.argument.clone(), Value::String(value.clone()));
    }
    ToolRequest::new(&domain_cfg.tool_name, arguments)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
