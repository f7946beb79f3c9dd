//! Stdio tool transport: one JSON `ToolCall` per input line, one JSON
//! `ToolResult` per output line. Calls run concurrently, so results come back
//! in completion order; clients match them by `tool_call_id`.

use periph_config::PeriphConfig;
use periph_core::{PeriphError, ToolCall, ToolExecutor, ToolResult};
use periph_device::DeviceTools;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub(super) async fn cmd_serve(config: PeriphConfig) -> periph_core::Result<()> {
    let tools = Arc::new(DeviceTools::from_config(config));
    let token = CancellationToken::new();
    let background = tools.spawn_background(token.clone());
    info!(tools = tools.tools().len(), "serving tool calls on stdio");

    let executor: Arc<dyn ToolExecutor> = tools.clone();
    let stdin = BufReader::new(tokio::io::stdin());
    let outcome = tokio::select! {
        result = serve_lines(executor, stdin, tokio::io::stdout()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(0)
        }
    };

    let stopped = tools.engine().stop_all().await;
    token.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    match outcome {
        Ok(handled) => {
            info!(handled, stopped, "shut down");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Answer every call read from `reader` on `writer` until end of input.
/// Returns how many calls were handled.
pub async fn serve_lines<R, W>(
    executor: Arc<dyn ToolExecutor>,
    reader: R,
    mut writer: W,
) -> periph_core::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut in_flight = JoinSet::new();
    let mut handled = 0;
    let mut reading = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if reading => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    handled += 1;
                    let executor = executor.clone();
                    in_flight.spawn(async move { respond(executor.as_ref(), &line).await });
                }
                None => reading = false,
            },
            Some(done) = in_flight.join_next() => match done {
                Ok(result) => write_result(&mut writer, &result).await?,
                Err(e) => error!(error = %e, "tool call task failed"),
            },
            else => break,
        }
    }
    Ok(handled)
}

/// Execute one request line. Malformed input and unknown tools come back as
/// error results; nothing here ends the session.
pub async fn respond(executor: &dyn ToolExecutor, line: &str) -> ToolResult {
    let call = match parse_call(line) {
        Ok(call) => call,
        Err((call, e)) => {
            warn!(error = %e, "malformed tool call");
            return ToolResult::from_error(&call, &e);
        }
    };
    match executor.execute(&call).await {
        Ok(result) => result,
        Err(e) => {
            warn!(tool = %call.tool_name, error = %e, "tool call rejected");
            ToolResult::from_error(&call, &e)
        }
    }
}

/// On failure, returns whatever id and tool name could be salvaged so the
/// error result can still be correlated.
fn parse_call(line: &str) -> Result<ToolCall, (ToolCall, PeriphError)> {
    let raw: Value = serde_json::from_str(line).map_err(|e| (placeholder(&Value::Null), e.into()))?;
    serde_json::from_value::<ToolCall>(raw.clone()).map_err(|e| (placeholder(&raw), e.into()))
}

fn placeholder(raw: &Value) -> ToolCall {
    ToolCall {
        id: raw["id"].as_str().unwrap_or_default().to_string(),
        tool_name: raw["tool_name"].as_str().unwrap_or_default().to_string(),
        arguments: Value::Null,
    }
}

async fn write_result<W: AsyncWrite + Unpin>(writer: &mut W, result: &ToolResult) -> periph_core::Result<()> {
    let mut line = serde_json::to_vec(result)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
