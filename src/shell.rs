use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context as _};
use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Config, Context, Editor, Helper};

use crate::control::{Command, CommandResponse, CommandType};
use crate::ipc::{read_frame, write_frame};

const PROMPT: &str = "taskmaster> ";
const HISTORY_FILE: &str = ".taskmasterctl_history";

/*
    @@@
    @CmdCompleter;
    . Drops CmdCompleter into 'rl.set_helper(Some(...))' and get instant, prefix-based command completion.
    . Only the first word is completed; job names are left to the user.
*/
struct CmdCompleter {
    commands: Vec<String>,
}
impl Helper for CmdCompleter {}
impl Hinter for CmdCompleter {
    type Hint = String;
}
impl Highlighter for CmdCompleter {}
impl Validator for CmdCompleter {}
impl Completer for CmdCompleter {
    type Candidate = Pair;
    fn complete(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> Result<(usize, Vec<Pair>), ReadlineError> {
        let typed = &line[..pos];
        let start = typed.len() - typed.trim_start().len();
        let word = &typed[start..];
        if word.contains(char::is_whitespace) {
            return Ok((pos, Vec::new()));
        }
        let matches = self
            .commands
            .iter()
            .filter(|cmd| cmd.starts_with(word))
            .map(|cmd| Pair {
                display: cmd.clone(),
                replacement: cmd.clone(),
            })
            .collect();
        Ok((start, matches))
    }
}

fn shell_commands() -> Vec<String> {
    CommandType::ALL
        .iter()
        .map(|kind| kind.as_str())
        .chain(["help", "exit"])
        .map(String::from)
        .collect()
}

fn history_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(HISTORY_FILE)
}

/// One connection to taskmasterd, reopened when the daemon went away.
pub struct Client {
    path: PathBuf,
    stream: Option<UnixStream>,
}

impl Client {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            stream: None,
        }
    }

    fn connect(&mut self) -> anyhow::Result<&mut UnixStream> {
        if self.stream.is_none() {
            let stream = UnixStream::connect(&self.path)
                .with_context(|| format!("cannot reach taskmasterd at {}", self.path.display()))?;
            self.stream = Some(stream);
        }
        self.stream.as_mut().ok_or_else(|| anyhow!("not connected"))
    }

    fn exchange(&mut self, command: &Command) -> anyhow::Result<CommandResponse> {
        let stream = self.connect()?;
        write_frame(stream, command)?;
        read_frame(stream)?.ok_or_else(|| anyhow!("taskmasterd closed the connection"))
    }

    /// Sends one command; a broken connection is retried once on a fresh socket.
    pub fn send(&mut self, command: &Command) -> anyhow::Result<CommandResponse> {
        match self.exchange(command) {
            Ok(response) => Ok(response),
            Err(_) if self.stream.is_some() => {
                self.stream = None;
                self.exchange(command)
            }
            Err(err) => Err(err),
        }
    }
}

pub fn print_response(response: &CommandResponse) {
    if response.is_ok() {
        if !response.message.is_empty() {
            println!("{}", response.message.trim_end());
        }
    } else {
        eprintln!("{}: {}", response.status, response.message);
    }
}

fn print_help() {
    for kind in CommandType::ALL {
        println!("  {}", kind.usage());
    }
    println!("  help");
    println!("  exit");
}

/// Returns true when the daemon accepted a terminate request.
pub fn execute(client: &mut Client, line: &str) -> anyhow::Result<bool> {
    let command = match Command::parse(line) {
        Ok(command) => command,
        Err(response) => {
            print_response(&response);
            return Ok(false);
        }
    };
    let response = client.send(&command)?;
    print_response(&response);
    Ok(command.kind == CommandType::Terminate && response.is_ok())
}

/*
    @@@
    @run_shell();
    . Interactive loop on top of rustyline: completion of the command names, history in ~/.taskmasterctl_history.
    . Commands are validated locally before being sent; "help" and "exit" never reach the daemon.
    . Leaves on exit, Ctrl-C/Ctrl-D, or once the daemon acknowledged a terminate.
*/
pub fn run_shell(socket: impl AsRef<Path>) -> rustyline::Result<()> {
    let config = Config::builder().auto_add_history(false).build();
    let mut rl = Editor::with_config(config)?;
    rl.set_helper(Some(CmdCompleter {
        commands: shell_commands(),
    }));
    let history = history_path();
    let _ = rl.load_history(&history);
    let mut client = Client::new(socket);

    loop {
        let line = rl.readline(PROMPT);
        match line {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                rl.add_history_entry(input)?;
                match input {
                    "exit" | "quit" => break,
                    "help" => print_help(),
                    _ => match execute(&mut client, input) {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(err) => eprintln!("Error: {err:#}"),
                    },
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    rl.save_history(&history)?;
    Ok(())
}
