//! Console presentation of player callbacks.

use gapless_player::PlayerEvents;

/// Prints display updates and lifecycle messages to stdout.
#[derive(Debug, Default)]
pub struct ConsoleEvents {
    quiet: bool,
}

impl ConsoleEvents {
    /// Only display updates are printed; lifecycle messages go to the log.
    pub fn quiet() -> Self {
        Self { quiet: true }
    }
}

impl PlayerEvents for ConsoleEvents {
    fn on_display_update(&mut self, current: &str, next: &str) {
        println!("{}", display_line(current, next));
    }

    fn on_message(&mut self, text: &str) {
        if self.quiet {
            tracing::info!(event = text, "player");
        } else {
            println!("  {text}");
        }
    }
}

fn display_line(current: &str, next: &str) -> String {
    match (current.is_empty(), next.is_empty()) {
        (true, _) => "[ no track ]".to_string(),
        (false, true) => format!("> {current}"),
        (false, false) => format!("> {current}  (next: {next})"),
    }
}
