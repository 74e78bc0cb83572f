//! Autobahn fuzzing-server client
//!
//! Start the fuzzing server on ws://127.0.0.1:9001, then run this to execute
//! every case against this client and write the reports.

use sockudo_ws_client::error::Result;
use sockudo_ws_client::{CloseReason, Connection, Options, WebSocketClient};

const SERVER: &str = "ws://127.0.0.1:9001";
const AGENT: &str = "sockudo-ws-client";

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::builder()
        .max_frame_size(16 * 1024 * 1024)
        .max_message_size(64 * 1024 * 1024)
        .build()?;
    let client = WebSocketClient::new(options);

    let count = case_count(&client).await?;
    println!("Running {count} cases");

    for case in 1..=count {
        let url = format!("{SERVER}/runCase?case={case}&agent={AGENT}");
        match client.connect_to_url(&url).await {
            Ok(conn) => {
                if let Err(e) = echo(conn).await {
                    println!("case {case}: {e}");
                }
            }
            Err(e) => eprintln!("case {case}: connect failed: {e}"),
        }
    }

    let url = format!("{SERVER}/updateReports?agent={AGENT}");
    let conn = client.connect_to_url(&url).await?;
    conn.close(CloseReason::NORMAL, "").await?;
    println!("Reports updated");
    Ok(())
}

async fn case_count(client: &WebSocketClient) -> Result<u32> {
    let mut conn = client.connect_to_url(&format!("{SERVER}/getCaseCount")).await?;
    let count = match conn.receive().await? {
        Some(message) => message.into_text().await?.trim().parse().unwrap_or(0),
        None => 0,
    };
    conn.close(CloseReason::NORMAL, "").await?;
    Ok(count)
}

/// Echo every message back until the server closes
async fn echo(mut conn: Connection) -> Result<()> {
    while let Some(message) = conn.receive().await? {
        let kind = message.kind();
        let payload = message.buffer().await?;
        conn.send(kind, payload).await?;
    }
    Ok(())
}
