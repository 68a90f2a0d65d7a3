//! Plain interactive CLI chat loop.
//!
//! No tools and no streaming here: read a line, send the whole history to
//! Gemini, print the reply. `exit`/`quit` ends the loop.

use anyhow::Result;
use std::io::Write;
use tracing::info;

use crate::gemini::{Content, GeminiClient, GenerateContentRequest};
use crate::session::is_exit_command;

pub async fn run_cli_chat(client: &GeminiClient) -> Result<()> {
    info!("Starting interactive CLI chat...");

    println!("Welcome to the Clockwise chatbot! (Type 'exit' or 'quit' to end the chat)");
    println!("{}", "-".repeat(50));

    let mut history: Vec<Content> = Vec::new();

    loop {
        print!("You: ");
        std::io::stdout().flush()?;

        let mut user_input = String::new();
        if std::io::stdin().read_line(&mut user_input)? == 0 {
            // stdin closed
            break;
        }
        let user_input = user_input.trim();
        if user_input.is_empty() {
            continue;
        }

        if is_exit_command(user_input) {
            println!("Chatbot: Goodbye!");
            break;
        }

        let bot_response = get_bot_response(client, &mut history, user_input).await;
        println!("Bot: {bot_response}");
        println!("{}", "-".repeat(50));
    }

    Ok(())
}

/// Send one message and return the reply text. API failures are folded into
/// the returned string; a failed exchange is not recorded in the history.
async fn get_bot_response(
    client: &GeminiClient,
    history: &mut Vec<Content>,
    user_message: &str,
) -> String {
    let mut contents = history.clone();
    contents.push(Content::user_text(user_message));

    let request = GenerateContentRequest {
        contents,
        tools: None,
    };

    match client.generate(&request).await {
        Ok(response) => {
            let reply = response.first_text();
            history.push(Content::user_text(user_message));
            history.push(Content::model_text(reply.clone()));
            reply
        }
        Err(e) => format!("Error: Could not get a response from the bot. Details: {e}"),
    }
}
