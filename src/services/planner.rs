//! # Dialog Planning
//!
//! Decides the interviewer's next line. `None` means the interview is over.
//!
//! ## Implementations:
//! - **LlmPlanner**: OpenAI-compatible chat completions with an interviewer prompt
//! - **ScriptedPlanner**: Built-in question bank, used offline or as a fallback

use crate::error::VoiceError;
use crate::session::{Role, Turn};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

/// Marker the model is instructed to emit when it has nothing left to ask.
pub const COMPLETION_MARKER: &str = "[INTERVIEW_COMPLETE]";

/// Facts about the interview that do not change turn to turn.
#[derive(Debug, Clone, PartialEq)]
pub struct InterviewContext {
    pub job_description: String,
    pub interview_type: String,
    /// Questions asked over the whole session, not just the recent history
    pub questions_asked: usize,
}

/// Next-question generation consumed by the conversation actor.
#[async_trait]
pub trait DialogPlanner: Send + Sync {
    fn name(&self) -> &str;

    /// `history` holds the most recent turns only.
    async fn next_turn(
        &self,
        history: &[Turn],
        context: &InterviewContext,
    ) -> Result<Option<String>, VoiceError>;
}

/// Chat-completions planner.
pub struct LlmPlanner {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    max_questions: usize,
}

impl LlmPlanner {
    pub fn new(
        client: Client,
        base_url: &str,
        api_key: &str,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        max_questions: usize,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens,
            temperature,
            max_questions,
        }
    }

    fn build_messages(&self, history: &[Turn], context: &InterviewContext) -> Vec<serde_json::Value> {
        let mut messages = vec![json!({
            "role": "system",
            "content": system_prompt(context, self.max_questions),
        })];

        if history.is_empty() {
            messages.push(json!({
                "role": "user",
                "content": "Please begin the interview with your first question.",
            }));
        }

        messages.extend(history.iter().map(|turn| {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            json!({ "role": role, "content": turn.content })
        }));
        messages
    }
}

#[async_trait]
impl DialogPlanner for LlmPlanner {
    fn name(&self) -> &str {
        "llm"
    }

    async fn next_turn(
        &self,
        history: &[Turn],
        context: &InterviewContext,
    ) -> Result<Option<String>, VoiceError> {
        if context.questions_asked >= self.max_questions {
            return Ok(None);
        }

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": self.build_messages(history, context),
                "max_tokens": self.max_tokens,
                "temperature": self.temperature,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Planning(format!("{} returned {}: {}", url, status, body)));
        }

        let body: serde_json::Value = response.json().await?;
        let reply = extract_reply(&body)?;
        debug!("Planner reply: {} chars", reply.len());
        Ok(interpret_reply(&reply))
    }
}

fn system_prompt(context: &InterviewContext, max_questions: usize) -> String {
    format!(
        "You are a professional AI interviewer running a {} interview for the following role:\n\
         {}\n\n\
         Based on the candidate's answers, ask the next interview question or give brief, \
         constructive feedback followed by a question. Keep each reply concise and suitable \
         for speaking aloud. You have asked {} of at most {} questions. When the interview \
         is finished, reply with {} only.",
        context.interview_type,
        context.job_description,
        context.questions_asked,
        max_questions,
        COMPLETION_MARKER
    )
}

fn extract_reply(body: &serde_json::Value) -> Result<String, VoiceError> {
    body.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| VoiceError::Planning("No choices in LLM response".to_string()))
}

/// Empty replies and the completion marker both end the interview.
fn interpret_reply(reply: &str) -> Option<String> {
    let trimmed = reply.trim();
    if trimmed.is_empty() || trimmed.contains(COMPLETION_MARKER) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Fixed question bank keyed by interview type.
pub struct ScriptedPlanner {
    max_questions: usize,
}

impl ScriptedPlanner {
    pub fn new(max_questions: usize) -> Self {
        Self { max_questions }
    }

    fn bank(interview_type: &str) -> &'static [&'static str] {
        match interview_type {
            "technical" => TECHNICAL_QUESTIONS,
            "situational" => SITUATIONAL_QUESTIONS,
            _ => BEHAVIORAL_QUESTIONS,
        }
    }
}

#[async_trait]
impl DialogPlanner for ScriptedPlanner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn next_turn(
        &self,
        _history: &[Turn],
        context: &InterviewContext,
    ) -> Result<Option<String>, VoiceError> {
        let bank = Self::bank(&context.interview_type);
        let limit = self.max_questions.min(bank.len());
        Ok(bank
            .get(context.questions_asked)
            .filter(|_| context.questions_asked < limit)
            .map(|q| q.to_string()))
    }
}

const TECHNICAL_QUESTIONS: &[&str] = &[
    "Can you explain how the JavaScript event loop works?",
    "What is React's virtual DOM, and how does it improve performance?",
    "What is the difference between HTTP and HTTPS, and how does HTTPS work?",
    "What is responsive design, and what are its core principles?",
    "What advantages does TypeScript offer over JavaScript?",
    "What is a RESTful API, and what are its design principles?",
    "What are common approaches to front-end performance optimization?",
    "Which Git branching strategies have you used, and how did the workflow look?",
    "Can you explain the CSS box model?",
    "What is asynchronous programming? How do Promises compare with async and await?",
];

const BEHAVIORAL_QUESTIONS: &[&str] = &[
    "Describe the most challenging project you have worked on and how you solved its problems.",
    "Tell me about a difficulty you faced working in a team and how you handled it.",
    "Describe a time you had to finish work under a tight deadline.",
    "Give an example of how you handled a disagreement with a colleague.",
    "What work achievement are you most proud of?",
    "Describe a failure that taught you an important lesson.",
    "How do you balance work and personal life?",
    "How do you keep learning and improving your skills?",
    "Describe a time you had to adapt quickly to a new technology or environment.",
    "Give an example of how you helped or mentored a teammate.",
];

const SITUATIONAL_QUESTIONS: &[&str] = &[
    "If you found a serious security flaw whose fix would delay the project, what would you do?",
    "Suppose your manager assigns you a task you consider unreasonable. How would you respond?",
    "A client asks for a complex feature on a very short timeline. How would you plan and deliver it?",
    "You notice a teammate's code falls below the team's standards. How do you handle it?",
    "Requirements change significantly in the middle of a project. What steps do you take?",
    "You must choose between several urgent tasks. How do you set priorities?",
    "You disagree with a technical decision the team has already made. What do you do?",
    "A severe bug is hurting users in production. How do you respond?",
    "How would you explain a complex technical problem to a non-technical stakeholder?",
    "You find a performance bottleneck in the current architecture. How do you propose improvements?",
];
