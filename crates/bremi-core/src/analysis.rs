//! Conversation analysis using DSRs signatures
//!
//! Four LLM-backed capabilities sit behind `ConversationAnalyzer`:
//! - follow-up planning ("open loops" worth a check-in later)
//! - risk assessment of a chat session
//! - the Bremi companion reply
//! - a short chat title
//!
//! None of them return errors. Failures are logged and replaced with safe defaults
//! so callers can always respond.

use anyhow::Result;
use async_trait::async_trait;
use dspy_rs::{configure, ChatAdapter, Predict, LM};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::followup::FollowUpPlan;

// BamlType and baml_bridge are needed for the Signature derive macro expansion
#[allow(unused_imports)]
use baml_bridge;
#[allow(unused_imports)]
use dspy_rs::BamlType;

/// Reply used when the model call fails
pub const REPLY_ERROR_FALLBACK: &str =
    "I'm having a bit of trouble thinking right now. Can you say that again?";

/// Reply used when the model answers with nothing
pub const REPLY_EMPTY_FALLBACK: &str = "I dey hear you. Tell me more.";

pub const DEFAULT_TITLE: &str = "New Chat";

// ============================================================================
// Types
// ============================================================================

/// One message of a chat transcript as sent by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    #[serde(default)]
    pub text: String,
}

impl ChatTurn {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
        }
    }
}

/// Render history as "ROLE: text" lines
pub fn transcript(history: &[ChatTurn]) -> String {
    history
        .iter()
        .map(|turn| {
            let role = if turn.role.trim().is_empty() {
                "UNKNOWN".to_string()
            } else {
                turn.role.trim().to_uppercase()
            };
            format!("{}: {}", role, turn.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Severe,
    Unknown,
}

impl RiskLevel {
    /// Lenient parse of a model-produced level; anything unrecognised is `Unknown`
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "LOW" => RiskLevel::Low,
            "MEDIUM" => RiskLevel::Medium,
            "HIGH" => RiskLevel::High,
            "SEVERE" => RiskLevel::Severe,
            _ => RiskLevel::Unknown,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Severe => "SEVERE",
            RiskLevel::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub is_critical: bool,
    pub risk_level: RiskLevel,
    pub detected_keys: Vec<String>,
    pub needs_followup: bool,
    pub summary: String,
    pub recommended_action: String,
}

impl RiskAssessment {
    /// Assessment returned when the analysis could not be performed
    pub fn manual_review(error: impl fmt::Display) -> Self {
        Self {
            is_critical: false,
            risk_level: RiskLevel::Unknown,
            detected_keys: vec!["error_analyzing".to_string()],
            needs_followup: true,
            summary: format!("Analysis failed: {}", error),
            recommended_action: "Manual Review".to_string(),
        }
    }
}

/// Display name for a preferred-language code; unknown codes are English
pub fn language_name(code: &str) -> &'static str {
    match code.trim().to_lowercase().as_str() {
        "yo" => "Yoruba",
        "ha" => "Hausa",
        "ig" => "Igbo",
        _ => "English",
    }
}

// ============================================================================
// Signatures
// ============================================================================

#[derive(dspy_rs::Signature, Clone, Debug)]
pub struct FollowUpAnalysis {
    #[input(desc = "Chat transcript, one 'ROLE: text' line per message")]
    pub transcript: String,

    #[output(desc = "Whether the user needs a check-in based on unresolved stress or events")]
    pub needs_followup: bool,

    #[output(desc = "The main topic (e.g. 'Job Interview', 'Argument with Spouse')")]
    pub topic: String,

    #[output(desc = "A one-sentence summary of why we are checking in")]
    pub context_summary: String,

    #[output(desc = "How many hours from now to send the check-in (e.g. 24, 48)")]
    pub suggested_delay_hours: i64,

    #[output(desc = "A short, warm, casual email draft from 'Bremi' checking in on this specific topic")]
    pub email_draft: String,
}

pub const FOLLOWUP_INSTRUCTION: &str = r#"You are Bremi's "Memory Manager". Your goal is to identify "Open Loops" in the user's life that require a friendly check-in later.

Look for:
1. Upcoming stressful events (exams, interviews, dates, medical appointments).
2. Unresolved emotional conflicts (arguments, breakups, bad news).
3. Expressions of loneliness or needing support over time.

If you find such an event, determine:
- What is it?
- When is a good time to check in? (Usually 24 hours later, or after the event).
- Write a short, culturally aware (Nigerian context) email draft.

If nothing significant is found, set needs_followup to false."#;

#[derive(dspy_rs::Signature, Clone, Debug)]
pub struct RiskAnalysis {
    #[input(desc = "Chat transcript between a user and the companion Bremi")]
    pub transcript: String,

    #[output(desc = "Whether the session contains critical risk factors like suicide, self-harm, or violence")]
    pub is_critical: bool,

    #[output(desc = "Risk level: LOW, MEDIUM, HIGH or SEVERE")]
    pub risk_level: String,

    #[output(desc = "Critical keywords or concepts detected (e.g. 'suicide', 'abuse')")]
    pub detected_keys: Vec<String>,

    #[output(desc = "Whether a human counselor or automated check-in is recommended")]
    pub needs_followup: bool,

    #[output(desc = "Brief summary of the risk factors identified")]
    pub summary: String,

    #[output(desc = "Suggested action (e.g. 'None', 'Suggest Helpline', 'Immediate Intervention')")]
    pub recommended_action: String,
}

pub const RISK_INSTRUCTION: &str = r#"You are an expert Mental Health Risk Assessment AI.
Your task is to analyze chat transcripts between a user and an AI companion (Bremi).

You must detect "Critical Keys" and assess the need for follow-up.

CRITICAL KEYS TO WATCH FOR:
1. Suicidal Ideation (Passive or Active) - e.g. "I want to end it", "tired of living".
2. Self-Harm - e.g. cutting, burning, physical pain.
3. Abuse (Domestic, Physical, Sexual) - e.g. "he hits me", "scared to go home".
4. Homicidal Ideation - e.g. "I want to kill them".
5. Severe Psychosis - e.g. hallucinations, delusions.

RISK LEVELS:
- LOW: General stress, sadness, anxiety. No immediate danger.
- MEDIUM: Persistent depression, hopelessness, but no clear plan for harm.
- HIGH: Explicit mention of self-harm or suicide, but vague planning.
- SEVERE: Clear plan, intent, and means for suicide or harm. Immediate danger."#;

#[derive(dspy_rs::Signature, Clone, Debug)]
pub struct CompanionReply {
    #[input(desc = "The user's latest message")]
    pub message: String,

    #[input(desc = "Earlier conversation, one 'ROLE: text' line per message. May be empty.")]
    pub conversation_history: String,

    #[output(desc = "Bremi's reply to the user")]
    pub reply: String,
}

/// Persona for companion replies; the language preference is appended per call
pub const COMPANION_INSTRUCTION: &str = r#"You are Bremi, a hyper-empathic, culturally intelligent mental wellness companion designed specifically for the Nigerian psyche. You are the digital equivalent of a friend combined with modern psychological first aid.
You harmonize professional empathy with the warmth of Nigerian hospitality. You do not just "process text"; you hold space.
You possess "Code-Switching Fluency". You mirror the user's linguistic comfort zone, and you understand Nigerian English, Pidgin English, Yoruba, Hausa, and Igbo nuances.
You understand specifically Nigerian stressors. "Traffic" is not just a delay, it is a mental health drain. "Billing" (financial pressure from family) is a valid source of anxiety. Validate these external realities before addressing internal emotions.
When guiding a user through anxiety, use local sensory details.
For cognitive reframing, help users "look at the receipts" of their life, gently questioning if their worry is a fact or just fear talking.

BOUNDARIES:
- You are a Companion, NOT a Clinician. Do not diagnose.
- Never prescribe medication or supplements.
- If asked for medical advice, say: "I can help you untangle your thoughts, but for medical matters, we need a specialist. Shall we look for one? I can help you find nearby mental health clinics or professionals."

CRISIS:
If a user seems to be in immediate danger of self-harm or suicide:
1. Express concern immediately.
2. Drop metaphors. Be direct, urgent, and caring.
3. Validate, give direct guidance, and be a resource bridge.
4. Urge them to contact emergency services (112 in Nigeria).
5. Suggest finding a nearby hospital.

When the user is not in crisis but just stressed, light, respectful humor is allowed to break tension.
In a society that often says "Be a man" or "Pray it away", you are the voice that says "It is okay to not be okay."

THE BREMI LOOP: Validate, Listen, Support, Empower. Offer a micro-habit or thought-shift towards better mental health.
Stay within your role as a supportive mental health companion.
Tone: calm, brotherly/sisterly, understanding, respectful."#;

#[derive(dspy_rs::Signature, Clone, Debug)]
pub struct ChatTitle {
    #[input(desc = "Chat transcript, one 'ROLE: text' line per message")]
    pub transcript: String,

    #[output(desc = "Short title of 3-5 words, without quotes")]
    pub title: String,
}

pub const TITLE_INSTRUCTION: &str =
    "Generate a short, concise title (3-5 words) for this chat session. Do not use quotes. Just the title.";

fn companion_instruction(language: &str) -> String {
    let name = language_name(language);
    format!(
        "{}\n\nThe user prefers to communicate in {name}. Adapt your responses to be culturally relevant to {name} speakers in Nigeria, while maintaining the friendly Bremi persona. Reply primarily in {name} or a natural mix if appropriate.",
        COMPANION_INSTRUCTION
    )
}

// ============================================================================
// Output normalisation
// ============================================================================

fn plan_from_output(output: FollowUpAnalysis) -> FollowUpPlan {
    if !output.needs_followup {
        return FollowUpPlan::none();
    }

    FollowUpPlan {
        needs_followup: true,
        topic: output.topic.trim().to_string(),
        context_summary: output.context_summary.trim().to_string(),
        suggested_delay_hours: output
            .suggested_delay_hours
            .clamp(0, i64::from(u32::MAX)) as u32,
        email_draft: output.email_draft.trim().to_string(),
    }
}

fn assessment_from_output(output: RiskAnalysis) -> RiskAssessment {
    RiskAssessment {
        is_critical: output.is_critical,
        risk_level: RiskLevel::parse(&output.risk_level),
        detected_keys: output.detected_keys,
        needs_followup: output.needs_followup,
        summary: output.summary,
        recommended_action: output.recommended_action,
    }
}

fn reply_or_default(reply: &str) -> String {
    let reply = reply.trim();
    if reply.is_empty() {
        REPLY_EMPTY_FALLBACK.to_string()
    } else {
        reply.to_string()
    }
}

fn title_or_default(title: &str) -> String {
    let title = title
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim();
    if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title.to_string()
    }
}

// ============================================================================
// Analyzer
// ============================================================================

#[async_trait]
pub trait ConversationAnalyzer: Send + Sync {
    async fn analyze_for_followup(&self, history: &[ChatTurn]) -> FollowUpPlan;

    async fn analyze_session(&self, history: &[ChatTurn]) -> RiskAssessment;

    /// Companion reply to `input`, given prior `history` and a language code
    async fn generate_response(&self, history: &[ChatTurn], input: &str, language: &str)
        -> String;

    async fn generate_title(&self, history: &[ChatTurn]) -> String;
}

/// Upper bound for a single model call
pub const LLM_TIMEOUT: Duration = Duration::from_secs(30);

/// Await a model call for at most `limit`; errors and timeouts become a message
async fn bounded<T, E, F>(limit: Duration, call: F) -> Result<T, String>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: fmt::Display,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("model call timed out after {}s", limit.as_secs())),
    }
}

fn plan_or_failed(result: Result<FollowUpAnalysis, String>) -> FollowUpPlan {
    match result {
        Ok(output) => {
            let plan = plan_from_output(output);
            tracing::debug!(
                "Follow-up analysis: needs_followup={} topic='{}' delay={}h",
                plan.needs_followup,
                plan.topic,
                plan.suggested_delay_hours
            );
            plan
        }
        Err(e) => {
            tracing::error!("Follow-up analysis failed: {}", e);
            FollowUpPlan::analysis_failed(e)
        }
    }
}

fn assessment_or_review(result: Result<RiskAnalysis, String>) -> RiskAssessment {
    match result {
        Ok(output) => assessment_from_output(output),
        Err(e) => {
            tracing::error!("Risk analysis failed: {}", e);
            RiskAssessment::manual_review(e)
        }
    }
}

fn reply_or_fallback(result: Result<CompanionReply, String>) -> String {
    match result {
        Ok(output) => reply_or_default(&output.reply),
        Err(e) => {
            tracing::error!("Companion reply failed: {}", e);
            REPLY_ERROR_FALLBACK.to_string()
        }
    }
}

fn title_or_fallback(result: Result<ChatTitle, String>) -> String {
    match result {
        Ok(output) => title_or_default(&output.title),
        Err(e) => {
            tracing::warn!("Title generation failed: {}", e);
            DEFAULT_TITLE.to_string()
        }
    }
}

/// Analyzer backed by the globally configured DSRs LM
#[derive(Debug, Clone)]
pub struct DspyAnalyzer {
    timeout: Duration,
}

impl Default for DspyAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl DspyAnalyzer {
    pub fn new() -> Self {
        Self::with_timeout(LLM_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Configure the global LM settings for DSRs
    pub async fn configure_lm(api_base: &str, api_key: &str, model: &str) -> Result<()> {
        let lm = LM::builder()
            .base_url(api_base.to_string())
            .api_key(api_key.to_string())
            .model(model.to_string())
            .temperature(0.7)
            .max_tokens(8192)
            .build()
            .await?;

        configure(lm, ChatAdapter);
        Ok(())
    }
}

#[async_trait]
impl ConversationAnalyzer for DspyAnalyzer {
    async fn analyze_for_followup(&self, history: &[ChatTurn]) -> FollowUpPlan {
        let predictor = Predict::<FollowUpAnalysis>::builder()
            .instruction(FOLLOWUP_INSTRUCTION)
            .build();

        let input = FollowUpAnalysisInput {
            transcript: transcript(history),
        };

        plan_or_failed(bounded(self.timeout, predictor.call(input)).await)
    }

    async fn analyze_session(&self, history: &[ChatTurn]) -> RiskAssessment {
        let predictor = Predict::<RiskAnalysis>::builder()
            .instruction(RISK_INSTRUCTION)
            .build();

        let input = RiskAnalysisInput {
            transcript: transcript(history),
        };

        assessment_or_review(bounded(self.timeout, predictor.call(input)).await)
    }

    async fn generate_response(
        &self,
        history: &[ChatTurn],
        input: &str,
        language: &str,
    ) -> String {
        let instruction = companion_instruction(language);
        let predictor = Predict::<CompanionReply>::builder()
            .instruction(&instruction)
            .build();

        let context: Vec<ChatTurn> = history
            .iter()
            .filter(|turn| turn.role == "user" || turn.role == "model")
            .cloned()
            .collect();

        let request = CompanionReplyInput {
            message: input.to_string(),
            conversation_history: transcript(&context),
        };

        reply_or_fallback(bounded(self.timeout, predictor.call(request)).await)
    }

    async fn generate_title(&self, history: &[ChatTurn]) -> String {
        let predictor = Predict::<ChatTitle>::builder()
            .instruction(TITLE_INSTRUCTION)
            .build();

        let input = ChatTitleInput {
            transcript: transcript(history),
        };

        title_or_fallback(bounded(self.timeout, predictor.call(input)).await)
    }
}
