use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rustyline::{error::ReadlineError, DefaultEditor};
use tdbg::{Command, CommandEngine, Reply};
use tracing_subscriber::EnvFilter;

const PROMPT: &str = "tdbg> ";

#[derive(Parser, Debug)]
#[command(name = "tdbg", version, about = "A minimal ptrace debugger")]
struct Opt {
    /// Program to launch and trace.
    program: PathBuf,

    /// Arguments passed to the program verbatim.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::parse();

    let mut argv = vec![opt.program.into_os_string().into_vec()];
    argv.extend(opt.args.into_iter().map(String::into_bytes));

    let mut engine = CommandEngine::new(Command::new(argv)?);

    // Without the first stop there is nothing to control.
    match engine.launch() {
        Ok(pid) => println!("launched process {pid}"),
        Err(err) => {
            eprintln!("tdbg: {err}");
            return Ok(ExitCode::FAILURE);
        },
    }

    let mut rl = DefaultEditor::new()?;

    loop {
        let line = match rl.readline(PROMPT) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        };

        if !line.trim().is_empty() {
            rl.add_history_entry(line.as_str())?;
        }

        let reply = engine.execute(&line);

        match reply {
            Reply::Quit => break,
            Reply::Nothing => {},
            ref reply if reply.is_failure() => eprintln!("{reply}"),
            reply => println!("{reply}"),
        }
    }

    Ok(ExitCode::SUCCESS)
}
