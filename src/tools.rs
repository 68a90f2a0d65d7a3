//! Local function registry: the two time-lookup functions the model may call.
//!
//! Both are pure lookups with no shared state. Failures (unknown function,
//! unknown timezone) become textual results handed back to the model, never
//! errors raised to the caller.

use chrono::Utc;
use chrono_tz::Tz;

use crate::constants::DEFAULT_TIMEZONE;
use crate::gemini::{FunctionCall, FunctionDeclaration, Tool};

/// Closed set of callable functions. Dispatch is by exact name match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeTool {
    CurrentUtcTime,
    CurrentLocalTime,
}

impl TimeTool {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "get_current_utc_time" => Some(Self::CurrentUtcTime),
            "get_current_local_time" => Some(Self::CurrentLocalTime),
            _ => None,
        }
    }
}

/// The declaration manifest sent along with every streamed chat request.
pub fn registry_tool() -> Tool {
    Tool {
        function_declarations: vec![
            FunctionDeclaration {
                name: "get_current_utc_time".to_string(),
                description: "Returns the current time in UTC timezone. Use this when the user \
                              asks for the current UTC time, date, or 'what time is it in UTC'."
                    .to_string(),
                parameters: serde_json::json!({
                    "type": "OBJECT",
                    "properties": {},
                }),
            },
            FunctionDeclaration {
                name: "get_current_local_time".to_string(),
                description: "Returns the current local time for a specified timezone. Defaults \
                              to Asia/Kolkata if no timezone is provided. Use this when the user \
                              asks for local time, or general time/date without specifying UTC, \
                              or wants a greeting based on time of day."
                    .to_string(),
                parameters: serde_json::json!({
                    "type": "OBJECT",
                    "properties": {
                        "timezone_name": {
                            "type": "STRING",
                            "description": "The name of the timezone (e.g., 'America/New_York', \
                                            'Europe/London', 'Asia/Kolkata'). Defaults to 'Asia/Kolkata'."
                        }
                    },
                    "required": []
                }),
            },
        ],
    }
}

/// Execute a requested function call and return its string result.
pub fn dispatch(call: &FunctionCall) -> String {
    match TimeTool::from_name(&call.name) {
        Some(TimeTool::CurrentUtcTime) => current_utc_time(),
        Some(TimeTool::CurrentLocalTime) => {
            let timezone_name = call
                .args
                .get("timezone_name")
                .and_then(|v| v.as_str())
                .unwrap_or(DEFAULT_TIMEZONE);
            current_local_time(timezone_name)
        }
        None => format!("Error: Unknown function '{}' requested.", call.name),
    }
}

/// Current wall-clock time in UTC, e.g. `2024-05-01 09:30:00 UTC`.
pub fn current_utc_time() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Current wall-clock time in the named civil timezone, with zone
/// abbreviation and numeric offset, e.g. `2024-05-01 15:00:00 IST+0530`.
pub fn current_local_time(timezone_name: &str) -> String {
    match timezone_name.parse::<Tz>() {
        Ok(tz) => Utc::now()
            .with_timezone(&tz)
            .format("%Y-%m-%d %H:%M:%S %Z%z")
            .to_string(),
        Err(_) => format!(
            "Error: Unknown timezone '{timezone_name}'. Please provide a valid timezone name \
             (e.g., 'America/New_York')."
        ),
    }
}
