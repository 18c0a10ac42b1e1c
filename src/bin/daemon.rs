use std::{
    env, fmt,
    io::{self, Write},
    path::PathBuf,
    process, thread, time,
};

use custodyd::{config::Config, CustodyD, DaemonHandle, VERSION};

const USAGE: &str = "Usage: custodyd [--conf <configuration file path>] [--version]";

#[derive(Debug, PartialEq)]
enum Command {
    Run { conf_file: Option<PathBuf> },
    Version,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command, String> {
    let command = match args.next().as_deref() {
        None => Command::Run { conf_file: None },
        Some("--version") => Command::Version,
        Some("--conf") => match args.next() {
            Some(path) => Command::Run {
                conf_file: Some(PathBuf::from(path)),
            },
            None => return Err("Missing configuration file path after '--conf'".to_string()),
        },
        Some(arg) => return Err(format!("Unknown argument '{}'", arg)),
    };

    match args.next() {
        None => Ok(command),
        Some(arg) => Err(format!("Unexpected argument '{}'", arg)),
    }
}

// Before the logger is set up, errors go to stderr.
fn exit_with(context: &str, e: impl fmt::Display) -> ! {
    eprintln!("{}: {}", context, e);
    process::exit(1);
}

fn setup_logger(log_level: log::LevelFilter) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            let timestamp = time::SystemTime::now()
                .duration_since(time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            out.finish(format_args!(
                "[{}][{}][{}][{}] {}",
                timestamp,
                thread::current().name().unwrap_or("<unnamed>"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log_level)
        // The HTTP transport to bitcoind is chatty
        .level_for("jsonrpc", log::LevelFilter::Warn)
        .chain(io::stdout())
        .apply()?;

    Ok(())
}

fn main() {
    let conf_file = match parse_args(env::args().skip(1)) {
        Ok(Command::Run { conf_file }) => conf_file,
        Ok(Command::Version) => {
            println!("custodyd {}", VERSION);
            return;
        }
        Err(e) => exit_with(USAGE, e),
    };

    let config = Config::from_file(conf_file).unwrap_or_else(|e| exit_with("Configuration", e));
    setup_logger(config.log_level).unwrap_or_else(|e| exit_with("Setting up logger", e));

    let custodyd = CustodyD::from_config(config).unwrap_or_else(|e| {
        log::error!("Error creating global state: {}", e);
        process::exit(1);
    });
    match DaemonHandle::start(custodyd) {
        Ok(handle) => handle.wait(),
        Err(e) => {
            log::error!("Error starting custodyd: {}", e);
            process::exit(1);
        }
    }

    // Everything is logged to stdout, which may be redirected to the log file.
    io::stdout().flush().unwrap_or_else(|e| exit_with("Flushing stdout", e));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command, String> {
        parse_args(args.iter().map(|a| a.to_string()))
    }

    #[test]
    fn command_line() {
        assert_eq!(parse(&[]), Ok(Command::Run { conf_file: None }));
        assert_eq!(
            parse(&["--conf", "/etc/custodyd.toml"]),
            Ok(Command::Run {
                conf_file: Some(PathBuf::from("/etc/custodyd.toml"))
            })
        );
        assert_eq!(parse(&["--version"]), Ok(Command::Version));

        assert!(parse(&["--conf"]).is_err());
        assert!(parse(&["--config", "custodyd.toml"]).is_err());
        assert!(parse(&["--conf", "a.toml", "b.toml"]).is_err());
        assert!(parse(&["--version", "--conf", "a.toml"]).is_err());
    }
}
