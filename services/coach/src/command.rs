/// A keyboard command typed into the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Reconnect,
    HangUp,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "" | "c" | "call" => Some(Command::Connect),
            "r" | "reconnect" => Some(Command::Reconnect),
            "h" | "hangup" | "hang up" => Some(Command::HangUp),
            "q" | "quit" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}
