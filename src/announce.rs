/// Terminal cosmetics around supervised runs: window title, screen clearing,
/// start/finish notices.
use chrono::Local;
use std::io::{IsTerminal, Write};

const GREEN: &str = "\x1b[0;32m";
const YELLOW: &str = "\x1b[0;33m";
const RED: &str = "\x1b[0;31m";
const NC: &str = "\x1b[0m";

/// Home the cursor, clear the screen, then clear the scrollback.
const CLEAR_SCREEN: &str = "\x1b[H\x1b[2J\x1b[3J";

/// Receives lifecycle notices from the supervision loop.
pub trait Announcer: Send + Sync {
    /// A real command run is about to be forked. Called before the child
    /// exists, so anything written here lands above the child's output.
    fn starting(&self, command: &str);
    /// A real command run ended on its own.
    fn finished(&self, command: &str, exit_code: Option<i32>);
    /// The supervisor is going away.
    fn clear_title(&self);
}

/// Announcer writing to the process's stdout.
pub struct Console {
    preserve_output: bool,
    decorate: bool,
}

impl Console {
    pub fn new(preserve_output: bool) -> Self {
        Self {
            preserve_output,
            decorate: std::io::stdout().is_terminal(),
        }
    }

    fn emit(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

fn title(text: &str) -> String {
    format!("\x1b]0;{text}\x07")
}

impl Announcer for Console {
    fn starting(&self, command: &str) {
        let now = Local::now().format("%H:%M:%S");
        if !self.decorate {
            self.emit(&format!("[respawn {now}] starting: {command}\n"));
            return;
        }
        let mut text = String::new();
        if !self.preserve_output {
            text.push_str(CLEAR_SCREEN);
        }
        text.push_str(&title(command));
        text.push_str(&format!("{YELLOW}[respawn {now}] starting: {command}{NC}\n"));
        self.emit(&text);
    }

    fn finished(&self, command: &str, exit_code: Option<i32>) {
        let now = Local::now().format("%H:%M:%S");
        let status = match exit_code {
            Some(code) => format!("exit code {code}"),
            None => "killed by signal".to_string(),
        };
        if !self.decorate {
            self.emit(&format!("[respawn {now}] finished ({status}): {command}\n"));
            return;
        }
        let color = if exit_code == Some(0) { GREEN } else { RED };
        let mut text = title(&format!("finished: {command}"));
        text.push_str(&format!(
            "{color}[respawn {now}] finished ({status}): {command}{NC}\n"
        ));
        text.push_str(&format!(
            "{YELLOW}[respawn] waiting for restart (respawn restart), Ctrl-C to quit{NC}\n"
        ));
        self.emit(&text);
    }

    fn clear_title(&self) {
        if self.decorate {
            self.emit(&title(""));
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Announcer;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Notice {
        Starting(String),
        Finished(String, Option<i32>),
        ClearTitle,
    }

    /// Announcer that records every notice for assertions.
    #[derive(Default)]
    pub struct Recorder {
        notices: Mutex<Vec<Notice>>,
    }

    impl Recorder {
        pub fn notices(&self) -> Vec<Notice> {
            self.notices.lock().unwrap().clone()
        }

        pub fn starts(&self) -> usize {
            self.notices()
                .iter()
                .filter(|n| matches!(n, Notice::Starting(_)))
                .count()
        }

        pub fn finishes(&self) -> usize {
            self.notices()
                .iter()
                .filter(|n| matches!(n, Notice::Finished(..)))
                .count()
        }
    }

    impl Announcer for Recorder {
        fn starting(&self, command: &str) {
            self.notices
                .lock()
                .unwrap()
                .push(Notice::Starting(command.to_string()));
        }

        fn finished(&self, command: &str, exit_code: Option<i32>) {
            self.notices
                .lock()
                .unwrap()
                .push(Notice::Finished(command.to_string(), exit_code));
        }

        fn clear_title(&self) {
            self.notices.lock().unwrap().push(Notice::ClearTitle);
        }
    }
}
