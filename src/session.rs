//! Conversation session and the tool-dispatch loop.
//!
//! One `ChatSession` owns one growing transcript. Each user utterance runs
//! through `run_turn`: exit handling, a streamed Gemini call, optional
//! dispatch of a single local function call, and transcript bookkeeping.
//! Progress is reported to the caller as `ChatEvent`s over an mpsc channel;
//! the CLI and the web socket handler render those however they like.

use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::gemini::{
    Content, FunctionCall, GeminiClient, GenerateContentRequest, StreamFragment,
};
use crate::tools;

/// Persona instruction seeding every fresh session.
pub const PERSONA: &str = "You are a helpful and knowledgeable assistant. You can tell me the \
                           current UTC time or local time anywhere in the world if asked. When \
                           greeting the user, try to use the current local time to say good \
                           morning/afternoon/evening. Make your responses concise and friendly.";

/// Fixed greeting the model opens every fresh session with.
pub const GREETING: &str =
    "Hello! I'm ready to help you with your questions. How can I assist you today?";

/// Fixed farewell set; one is picked uniformly at random on exit/quit.
pub const FAREWELLS: [&str; 3] = [
    "Goodbye! It was nice chatting with you. To start a new conversation, use the 'New chat' button.",
    "See you next time! Feel free to reach out anytime. Use the 'New chat' button to begin fresh.",
    "Farewell! Hope you have a great day. If you want to chat again, just start a new chat!",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// Progress events emitted while a turn is processed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Transient status line ("Bot is thinking...").
    Status(String),
    /// Accumulated reply text so far; renderers append the cursor glyph.
    Stream(String),
    /// Tool-call announcement banner.
    Info(String),
    /// Tool-result banner.
    Success(String),
    /// A finalized transcript turn.
    Turn { role: Role, text: String },
    /// A user-visible error message.
    Error(String),
}

/// How a turn ended, mostly useful to callers deciding what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The utterance was an exit command; a farewell was appended.
    Farewell,
    /// A plain text reply was appended.
    Replied,
    /// A local function was dispatched and its result fed back to the model.
    ToolDispatched,
    /// The remote call failed; an apology turn was appended.
    Failed,
}

/// Stream-consumption states. The first function call wins; everything after
/// it in the same stream is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    AccumulatingText,
    ToolCallDetected,
    Done,
}

/// Mutable buffer assembling a streamed reply in arrival order.
#[derive(Debug)]
pub struct ReplyAccumulator {
    pub text: String,
    pub pending_call: Option<FunctionCall>,
    state: StreamState,
}

impl ReplyAccumulator {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            pending_call: None,
            state: StreamState::AccumulatingText,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Feed one fragment. Returns false once no further fragments should be
    /// consumed from this stream.
    pub fn accept(&mut self, fragment: StreamFragment) -> bool {
        if self.state != StreamState::AccumulatingText {
            return false;
        }
        match fragment {
            StreamFragment::Text(text) => {
                self.text.push_str(&text);
                true
            }
            StreamFragment::FunctionCall(call) => {
                self.pending_call = Some(call);
                self.state = StreamState::ToolCallDetected;
                false
            }
        }
    }

    /// Mark the stream exhausted.
    pub fn finish(&mut self) {
        if self.state == StreamState::AccumulatingText {
            self.state = StreamState::Done;
        }
    }
}

impl Default for ReplyAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// One conversation: the ordered transcript plus nothing else. Mutated only
/// by the single task driving `run_turn`, so no locking is needed.
#[derive(Debug)]
pub struct ChatSession {
    transcript: Vec<Content>,
}

impl ChatSession {
    /// Fresh session: fixed persona instruction plus fixed greeting.
    pub fn new() -> Self {
        Self {
            transcript: vec![Content::user_text(PERSONA), Content::model_text(GREETING)],
        }
    }

    /// Atomically replace the transcript with a fresh session.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn transcript(&self) -> &[Content] {
        &self.transcript
    }

    fn push(&mut self, content: Content) {
        self.transcript.push(content);
    }

    fn request_with_tools(&self) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: self.transcript.clone(),
            tools: Some(vec![tools::registry_tool()]),
        }
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

/// True for utterances that end the conversation.
pub fn is_exit_command(utterance: &str) -> bool {
    matches!(utterance.trim().to_lowercase().as_str(), "exit" | "quit")
}

/// Pick one farewell uniformly at random. The RNG is injected so tests can
/// seed it.
pub fn pick_farewell<R: Rng + ?Sized>(rng: &mut R) -> &'static str {
    FAREWELLS[rng.gen_range(0..FAREWELLS.len())]
}

/// Process one user utterance end to end.
///
/// Remote failures never propagate: they are converted into a visible error
/// event plus an apology model turn, and the session stays usable.
pub async fn run_turn<R: Rng>(
    session: &mut ChatSession,
    client: &GeminiClient,
    utterance: &str,
    rng: &mut R,
    events: &mpsc::Sender<ChatEvent>,
) -> TurnOutcome {
    session.push(Content::user_text(utterance));
    let _ = events
        .send(ChatEvent::Turn {
            role: Role::User,
            text: utterance.to_string(),
        })
        .await;

    if is_exit_command(utterance) {
        let farewell = pick_farewell(rng);
        session.push(Content::model_text(farewell));
        let _ = events
            .send(ChatEvent::Turn {
                role: Role::Model,
                text: farewell.to_string(),
            })
            .await;
        return TurnOutcome::Farewell;
    }

    // Cosmetic thinking animation before the real call begins.
    for i in 1..=3u32 {
        let _ = events
            .send(ChatEvent::Status(format!(
                "Bot is thinking{}",
                ".".repeat(i as usize)
            )))
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    }

    let request = session.request_with_tools();
    let (tx, mut rx) = mpsc::channel::<StreamFragment>(32);
    let stream_client = client.clone();
    let stream_task =
        tokio::spawn(async move { stream_client.stream_generate(&request, tx).await });

    let mut accumulator = ReplyAccumulator::new();
    while let Some(fragment) = rx.recv().await {
        let keep_going = accumulator.accept(fragment);
        if accumulator.pending_call.is_none() {
            let _ = events.send(ChatEvent::Stream(accumulator.text.clone())).await;
        }
        if !keep_going {
            break;
        }
    }
    // Dropping the receiver makes the streaming task wind down on its own.
    drop(rx);
    accumulator.finish();

    let stream_result = match stream_task.await {
        Ok(result) => result,
        Err(join_err) => {
            error!("Streaming task panicked: {join_err}");
            return fail_turn(session, events, &join_err.to_string()).await;
        }
    };

    if let Some(call) = accumulator.pending_call.take() {
        return dispatch_tool_call(session, client, call, events).await;
    }

    if let Err(e) = stream_result {
        return fail_turn(session, events, &e.to_string()).await;
    }

    // Plain text reply: finalize the accumulator as a model turn, rendered
    // without the streaming cursor.
    session.push(Content::model_text(accumulator.text.clone()));
    let _ = events
        .send(ChatEvent::Turn {
            role: Role::Model,
            text: accumulator.text,
        })
        .await;
    TurnOutcome::Replied
}

/// Execute the requested function, append the result turn, and send it back
/// to the model for continuation.
///
/// Known limitation, kept on purpose: the continuation's text is appended to
/// the transcript but never rendered to the user, so the visible reply for
/// this utterance ends at the tool banners.
async fn dispatch_tool_call(
    session: &mut ChatSession,
    client: &GeminiClient,
    call: FunctionCall,
    events: &mpsc::Sender<ChatEvent>,
) -> TurnOutcome {
    info!("Dispatching function call '{}'", call.name);
    let _ = events
        .send(ChatEvent::Info(format!(
            "Bot is performing an action: Calling '{}'...",
            call.name
        )))
        .await;

    let result = tools::dispatch(&call);
    let _ = events
        .send(ChatEvent::Success(format!(
            "Function '{}' returned: {}",
            call.name, result
        )))
        .await;

    let name = call.name.clone();
    session.push(Content::model_function_call(call));
    session.push(Content::function_response(name, result));

    let request = GenerateContentRequest {
        contents: session.transcript().to_vec(),
        tools: Some(vec![tools::registry_tool()]),
    };
    match client.generate(&request).await {
        Ok(response) => {
            let continuation = response.first_text();
            debug!("Continuation after tool call (not rendered): {continuation}");
            if !continuation.is_empty() {
                session.push(Content::model_text(continuation));
            }
            TurnOutcome::ToolDispatched
        }
        Err(e) => fail_turn(session, events, &e.to_string()).await,
    }
}

/// Convert a remote failure into a visible error plus an apology model turn.
async fn fail_turn(
    session: &mut ChatSession,
    events: &mpsc::Sender<ChatEvent>,
    details: &str,
) -> TurnOutcome {
    error!("Chat turn failed: {details}");
    let _ = events
        .send(ChatEvent::Error(format!(
            "Error: Could not get a response from the bot. Details: {details}"
        )))
        .await;
    let apology = format!("Sorry, something went wrong: {details}");
    session.push(Content::model_text(apology.clone()));
    let _ = events
        .send(ChatEvent::Turn {
            role: Role::Model,
            text: apology,
        })
        .await;
    TurnOutcome::Failed
}
