mod session;
mod sim;
mod transcript;

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use charge_core::hv::ProtocolKind;
use session::Session;
use sim::Adapter;
use transcript::TranscriptLogger;

const USAGE: &str =
    "Usage: charge-emulator [--protocol afc|qc] [--adapter plain|afc|qc|qc-stuck] [--transcript <path>]";

struct Options {
    protocol: ProtocolKind,
    adapter: Adapter,
    transcript: Option<PathBuf>,
}

fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let options = parse_options().unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("{USAGE}");
        process::exit(2);
    });

    let mut session = Session::new(options.protocol, options.adapter).unwrap_or_else(|err| {
        eprintln!("{err}");
        process::exit(1);
    });
    if let Some(path) = &options.transcript {
        session = session.with_transcript(TranscriptLogger::create(
            path,
            "Charge port emulator transcript",
        )?);
    }

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut line = String::new();

    writeln!(
        writer,
        "Charge port emulator ready. Type `help` for commands or `exit` to quit."
    )?;

    loop {
        line.clear();
        write!(writer, "[{}] > ", session.now())?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        for response in session.handle_command(trimmed)? {
            writeln!(writer, "{response}")?;
        }
    }

    Ok(())
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn parse_protocol(value: &str) -> Result<ProtocolKind, String> {
    if value.eq_ignore_ascii_case("afc") {
        Ok(ProtocolKind::Afc)
    } else if value.eq_ignore_ascii_case("qc") {
        Ok(ProtocolKind::Qc)
    } else {
        Err(format!("Unknown protocol `{value}`"))
    }
}

fn parse_options() -> Result<Options, String> {
    let mut options = Options {
        protocol: ProtocolKind::Afc,
        adapter: Adapter::Afc,
        transcript: None,
    };

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        let value = match inline {
            Some(value) => value,
            None => args
                .next()
                .ok_or_else(|| format!("Expected value after {flag}"))?,
        };

        match flag.as_str() {
            "--protocol" => options.protocol = parse_protocol(&value)?,
            "--adapter" => {
                options.adapter = Adapter::from_name(&value)
                    .ok_or_else(|| format!("Unknown adapter `{value}`"))?;
            }
            "--transcript" => options.transcript = Some(PathBuf::from(value)),
            other => return Err(format!("Unknown option `{other}`")),
        }
    }

    Ok(options)
}
