// Connects to a server, subscribes, publishes a few messages and prints what comes back.
use std::time::Duration;

use anyhow::{Context, Result};
use natter_client::{Connection, LifecycleEvent, ProtocolOp, observability};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let config_path = std::env::args().nth(1);
    let connection =
        Connection::from_env_or_yaml(config_path.as_deref()).context("load client config")?;

    let _events = connection.events().subscribe(|event: &LifecycleEvent| {
        info!(?event, "lifecycle event");
    });
    let mut ops = connection.ops().subscribe_channel(256);

    connection.connect().await.context("connect")?;
    if let Some(server) = connection.server_info() {
        info!(
            server_id = %server.server_id,
            version = %server.version,
            max_payload = server.max_payload,
            "server info"
        );
    }

    connection
        .subscribe("natter.demo", "1", None)
        .await
        .context("subscribe")?;
    for i in 0..3 {
        let payload = format!("hello #{i}");
        connection
            .publish("natter.demo", payload.as_bytes(), None)
            .await
            .context("publish")?;
    }

    let deadline = tokio::time::sleep(Duration::from_secs(2));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            op = ops.recv() => match op {
                Some(ProtocolOp::Msg(msg)) => info!(
                    subject = %msg.subject,
                    payload = %String::from_utf8_lossy(&msg.payload),
                    "message"
                ),
                Some(other) => info!(op = other.name(), "op"),
                None => break,
            },
        }
    }

    connection
        .unsubscribe("1", None)
        .await
        .context("unsubscribe")?;
    connection.close().await;
    let stats = connection.stats().snapshot();
    info!(
        ops_received = stats.ops_received,
        frames_out = stats.frames_out,
        bytes_out = stats.bytes_out,
        "done"
    );
    Ok(())
}
