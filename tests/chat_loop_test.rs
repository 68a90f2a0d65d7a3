//! End-to-end turn tests against a mocked Gemini endpoint.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use wiremock::matchers::{any, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clockwise::gemini::GeminiClient;
use clockwise::session::{run_turn, ChatEvent, ChatSession, Role, FAREWELLS, GREETING, PERSONA};

const MODEL: &str = "gemini-1.5-flash";

fn test_client(server: &MockServer) -> GeminiClient {
    GeminiClient::new(server.uri(), MODEL, "test-key")
}

fn sse_text_chunk(text: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]
        })
    )
}

fn sse_function_call_chunk(name: &str, args: serde_json::Value) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"functionCall": {"name": name, "args": args}}]}}]
        })
    )
}

fn collect_events(mut rx: mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[test_log::test(tokio::test)]
async fn streamed_text_is_concatenated_in_arrival_order() {
    let server = MockServer::start().await;
    let body = [
        sse_text_chunk("Good "),
        sse_text_chunk("morning"),
        sse_text_chunk("!"),
    ]
    .concat();

    Mock::given(method("POST"))
        .and(path(format!("/models/{MODEL}:streamGenerateContent")))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server);
    let mut session = ChatSession::new();
    let mut rng = StdRng::seed_from_u64(1);
    let (tx, rx) = mpsc::channel(64);

    run_turn(&mut session, &client, "hello", &mut rng, &tx).await;
    let events = collect_events(rx);

    // Final model turn equals the fragment concatenation, no dupes or drops.
    let final_turn = events
        .iter()
        .rev()
        .find_map(|e| match e {
            ChatEvent::Turn {
                role: Role::Model,
                text,
            } => Some(text.clone()),
            _ => None,
        })
        .expect("no model turn emitted");
    assert_eq!(final_turn, "Good morning!");

    // Stream events carry the running accumulation.
    let streams: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Stream(text) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streams, ["Good ", "Good morning", "Good morning!"]);

    // Transcript: persona, greeting, user, model.
    assert_eq!(session.transcript().len(), 4);
    assert_eq!(session.transcript()[3].joined_text(), "Good morning!");
}

#[test_log::test(tokio::test)]
async fn tool_call_is_dispatched_and_result_round_tripped() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("/models/{MODEL}:streamGenerateContent")))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sse_function_call_chunk(
                "get_current_local_time",
                serde_json::json!({"timezone_name": "Asia/Tokyo"}),
            ),
            "text/event-stream",
        ))
        .expect(1)
        .mount(&server)
        .await;

    // The continuation request must carry the function result back.
    Mock::given(method("POST"))
        .and(path(format!("/models/{MODEL}:generateContent")))
        .and(body_partial_json(serde_json::json!({
            "contents": [
                {"role": "user", "parts": [{"text": PERSONA}]},
                {"role": "model", "parts": [{"text": GREETING}]},
                {"role": "user", "parts": [{"text": "what time is it in Tokyo"}]},
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "It is evening in Tokyo."}]}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server);
    let mut session = ChatSession::new();
    let mut rng = StdRng::seed_from_u64(1);
    let (tx, rx) = mpsc::channel(64);

    run_turn(
        &mut session,
        &client,
        "what time is it in Tokyo",
        &mut rng,
        &tx,
    )
    .await;
    let events = collect_events(rx);

    // Banner events announce the dispatch and its result.
    assert!(events.iter().any(|e| matches!(
        e,
        ChatEvent::Info(text) if text.contains("Calling 'get_current_local_time'")
    )));
    let success = events
        .iter()
        .find_map(|e| match e {
            ChatEvent::Success(text) => Some(text.clone()),
            _ => None,
        })
        .expect("no success banner");
    assert!(
        success.contains("+0900"),
        "Tokyo result should carry the +0900 offset: {success}"
    );

    // Transcript gained: user turn, model functionCall, functionResponse,
    // and the (invisible) continuation.
    let transcript = session.transcript();
    assert_eq!(transcript.len(), 6);
    let call_part = &transcript[3].parts[0];
    assert_eq!(
        call_part.function_call.as_ref().unwrap().name,
        "get_current_local_time"
    );
    let response_part = &transcript[4].parts[0];
    let function_response = response_part.function_response.as_ref().unwrap();
    assert_eq!(function_response.name, "get_current_local_time");
    assert!(function_response.response["content"]
        .as_str()
        .unwrap()
        .ends_with("+0900"));
    assert_eq!(transcript[5].joined_text(), "It is evening in Tokyo.");

    // Known limitation preserved from the original: the continuation text is
    // never rendered as a visible model turn.
    assert!(!events.iter().any(|e| matches!(
        e,
        ChatEvent::Turn { role: Role::Model, text } if text == "It is evening in Tokyo."
    )));
}

#[test_log::test(tokio::test)]
async fn exit_command_appends_farewell_without_contacting_endpoint() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let client = test_client(&server);
    let mut session = ChatSession::new();
    let mut rng = StdRng::seed_from_u64(42);
    let (tx, rx) = mpsc::channel(64);

    run_turn(&mut session, &client, "  QUIT  ", &mut rng, &tx).await;
    let events = collect_events(rx);

    let farewell = events
        .iter()
        .find_map(|e| match e {
            ChatEvent::Turn {
                role: Role::Model,
                text,
            } => Some(text.clone()),
            _ => None,
        })
        .expect("no farewell turn");
    assert!(FAREWELLS.contains(&farewell.as_str()));

    // Deterministic under the same seed.
    let mut rng_again = StdRng::seed_from_u64(42);
    assert_eq!(farewell, clockwise::session::pick_farewell(&mut rng_again));

    // wiremock verifies expect(0) on drop.
}

#[test_log::test(tokio::test)]
async fn remote_failure_becomes_visible_error_turn_and_loop_survives() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/models/{MODEL}:streamGenerateContent")))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let client = test_client(&server);
    let mut session = ChatSession::new();
    let mut rng = StdRng::seed_from_u64(1);
    let (tx, rx) = mpsc::channel(64);

    run_turn(&mut session, &client, "hello", &mut rng, &tx).await;
    let events = collect_events(rx);

    assert!(events.iter().any(|e| matches!(
        e,
        ChatEvent::Error(text) if text.starts_with("Error: Could not get a response from the bot.")
    )));
    let apology = session.transcript().last().unwrap().joined_text();
    assert!(
        apology.starts_with("Sorry, something went wrong:"),
        "got: {apology}"
    );

    // The session stays usable after a failed turn.
    let (tx2, _rx2) = mpsc::channel(64);
    let outcome = run_turn(&mut session, &client, "exit", &mut rng, &tx2).await;
    assert_eq!(outcome, clockwise::session::TurnOutcome::Farewell);
}
