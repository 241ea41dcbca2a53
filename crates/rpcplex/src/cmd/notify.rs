use crate::cmd::call::open;
use crate::cmd::{parse_call_args, parse_duration, NotifyArgs};
use crate::exit::{rpc_error, CliResult, SUCCESS};
use crate::output::{print_notify, NotifyOutput, OutputFormat};

pub async fn run(args: NotifyArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let call_args = parse_call_args(args.args.as_deref())?;
    let rpc = open(&args.path, timeout).await?;

    let sent = rpc.proxy_for(&args.proxy).notify(&args.method, call_args);
    // Closing waits for the notification to reach the socket.
    rpc.close();
    rpc.closed().await;
    sent.map_err(|err| rpc_error("notify failed", err))?;

    print_notify(
        &NotifyOutput {
            proxy: &args.proxy,
            method: &args.method,
            sent: true,
        },
        format,
    );
    Ok(SUCCESS)
}
