//! Evergreen agent entry point
//!
//! Flags: `-i <config>` initial configuration file, `-r <root>` persistence
//! root, `-log <stdout|file>` log sink. Exit codes: 0 normal shutdown,
//! 1 fatal launch error, 2 fatal runtime error.

mod agent;
mod logging;

use std::path::PathBuf;

/// Parsed command line
#[derive(Debug, Default, Clone)]
pub struct Cli {
    /// Initial config file (`-i`)
    pub config: Option<PathBuf>,
    /// Persistence root (`-r`)
    pub root: Option<PathBuf>,
    /// Log sink (`-log`)
    pub log_sink: Option<String>,
}

fn parse_args<I: Iterator<Item = String>>(mut args: I) -> Result<Cli, String> {
    let mut cli = Cli::default();
    while let Some(flag) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| format!("Missing value for {}", flag))
        };
        match flag.as_str() {
            "-i" => cli.config = Some(PathBuf::from(value("-i")?)),
            "-r" => cli.root = Some(PathBuf::from(value("-r")?)),
            "-log" => cli.log_sink = Some(value("-log")?),
            _ => return Err("Undefined command line argument".to_string()),
        }
    }
    if let Some(sink) = &cli.log_sink {
        if sink != "stdout" && sink != "file" {
            return Err(format!("Unknown log sink '{}'", sink));
        }
    }
    Ok(cli)
}

fn main() {
    let cli = match parse_args(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(1);
        }
    };

    let root = agent::resolve_root(&cli);
    let _log_guard = match logging::init(&cli, &root) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    let code = smol::block_on(agent::run(cli, root));
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, String> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_known_flags() {
        let cli = parse(&["-i", "services.yaml", "-r", "/srv/evergreen", "-log", "stdout"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("services.yaml")));
        assert_eq!(cli.root, Some(PathBuf::from("/srv/evergreen")));
        assert_eq!(cli.log_sink.as_deref(), Some("stdout"));
    }

    #[test]
    fn test_parse_no_flags() {
        let cli = parse(&[]).unwrap();
        assert!(cli.config.is_none());
        assert!(cli.root.is_none());
    }

    #[test]
    fn test_unknown_flag_message() {
        let err = parse(&["--weird"]).unwrap_err();
        assert_eq!(err, "Undefined command line argument");
    }

    #[test]
    fn test_missing_value() {
        assert!(parse(&["-i"]).is_err());
    }

    #[test]
    fn test_bad_log_sink() {
        assert!(parse(&["-log", "syslog"]).is_err());
    }
}
