use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use rpcplex_rpc::Arg;
use serde_json::Value;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod notify;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host the demo services on a socket.
    Serve(ServeArgs),
    /// Call a method and print its result.
    Call(CallArgs),
    /// Send a notification; no result is returned.
    Notify(NotifyArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args).await,
        Command::Call(args) => call::run(args, format).await,
        Command::Notify(args) => notify::run(args, format).await,
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Socket file permissions (octal).
    #[arg(long, default_value = "600", value_parser = parse_mode)]
    pub mode: u32,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Proxy name the call is addressed to.
    pub proxy: String,
    /// Method to invoke.
    pub method: String,
    /// Arguments as JSON. An array is spread into positional arguments.
    #[arg(long, env = "RPCPLEX_ARGS")]
    pub args: Option<String>,
    /// Give up after this long (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct NotifyArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Proxy name the notification is addressed to.
    pub proxy: String,
    /// Method to invoke.
    pub method: String,
    /// Arguments as JSON. An array is spread into positional arguments.
    #[arg(long, env = "RPCPLEX_ARGS")]
    pub args: Option<String>,
    /// Connection timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

fn parse_mode(input: &str) -> Result<u32, String> {
    u32::from_str_radix(input.trim_start_matches("0o"), 8)
        .map_err(|_| format!("invalid octal mode: {input}"))
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

/// Positional call arguments from `--args`.
pub(crate) fn parse_call_args(input: Option<&str>) -> CliResult<Vec<Arg>> {
    let Some(input) = input else {
        return Ok(Vec::new());
    };
    let value: Value = serde_json::from_str(input)
        .map_err(|err| CliError::new(USAGE, format!("--args is not valid JSON: {err}")))?;
    Ok(match value {
        Value::Array(items) => items.into_iter().map(Arg::from).collect(),
        other => vec![Arg::from(other)],
    })
}

#[cfg(test)]
mod tests {
    use rpcplex_rpc::{structural_clone, PassthroughConverter};
    use serde_json::json;

    use super::*;

    fn wire(args: &[Arg]) -> Vec<Value> {
        args.iter()
            .map(|arg| structural_clone(arg, &PassthroughConverter).unwrap())
            .collect()
    }

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert_eq!(parse_duration("").unwrap_err().code, USAGE);
    }

    #[test]
    fn array_args_are_spread() {
        let args = parse_call_args(Some("[2, 3]")).unwrap();
        assert_eq!(wire(&args), vec![json!(2), json!(3)]);
    }

    #[test]
    fn scalar_and_object_args_are_single() {
        let args = parse_call_args(Some(r#"{"text":"hi"}"#)).unwrap();
        assert_eq!(wire(&args), vec![json!({"text": "hi"})]);
        assert!(parse_call_args(None).unwrap().is_empty());
    }

    #[test]
    fn invalid_args_are_usage_errors() {
        let err = parse_call_args(Some("[1,")).unwrap_err();
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn mode_is_octal() {
        assert_eq!(parse_mode("600").unwrap(), 0o600);
        assert_eq!(parse_mode("0o660").unwrap(), 0o660);
        assert!(parse_mode("9").is_err());
    }
}
