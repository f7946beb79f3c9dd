use console::style;
use periph_config::PeriphConfig;
use periph_core::{SessionId, ToolCall, ToolExecutor, ToolResult};
use periph_device::DeviceTools;
use periph_session::SessionStatus;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Longest a followed session is waited on before giving up.
const FOLLOW_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

pub(super) async fn cmd_call(
    config: PeriphConfig,
    tool: String,
    arguments: Option<String>,
    follow: bool,
) -> periph_core::Result<()> {
    let arguments: Value = match arguments {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Value::Object(Default::default()),
    };

    let tools = DeviceTools::from_config(config);
    let token = CancellationToken::new();
    let background = tools.spawn_background(token.clone());

    let call = ToolCall {
        id: "cli".into(),
        tool_name: tool,
        arguments,
    };
    let result = tools.execute(&call).await?;
    print_result(&result)?;

    let started = started_session(&result);
    match started {
        Some(id) if follow => follow_session(&tools, id).await?,
        Some(id) => {
            eprintln!(
                "{}",
                style(format!(
                    "session {id} ends with this process; use --follow or `periph serve` to keep it running"
                ))
                .dim()
            );
        }
        None => {}
    }

    let stopped = tools.engine().stop_all().await;
    if stopped > 0 {
        info!(stopped, "stopped sessions on exit");
    }
    token.cancel();
    for handle in background {
        let _ = handle.await;
    }

    if result.is_error {
        return Err(anyhow::anyhow!("{} failed: {}", call.tool_name, result.content).into());
    }
    Ok(())
}

fn print_result(result: &ToolResult) -> periph_core::Result<()> {
    if result.is_error {
        println!("{}", style(&result.content).red());
    } else {
        println!("{}", result.content);
    }
    if let Some(data) = &result.data {
        println!("{}", serde_json::to_string_pretty(data)?);
    }
    Ok(())
}

/// Id of a session the call left running, if any.
fn started_session(result: &ToolResult) -> Option<SessionId> {
    if result.is_error {
        return None;
    }
    let data = result.data.as_ref()?;
    if data["state"].as_str() != Some("running") {
        return None;
    }
    data["session_id"].as_str()?.parse().ok()
}

/// Wait for natural completion; Ctrl-C stops the session instead.
async fn follow_session(tools: &DeviceTools, id: SessionId) -> periph_core::Result<()> {
    let engine = tools.engine();
    eprintln!("{}", style(format!("following session {id}, Ctrl-C to stop")).dim());
    let session = tokio::select! {
        settled = engine.wait_terminal(id, FOLLOW_LIMIT) => settled?,
        _ = tokio::signal::ctrl_c() => engine.stop_session(id).await?,
    };
    let status = SessionStatus::from_session(&session, chrono::Utc::now());
    println!("{}", status.summary());
    Ok(())
}
