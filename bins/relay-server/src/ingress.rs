//! Line-delimited JSON ingress.
//!
//! The first line of a session is a hello carrying the client id and a
//! credential, answered with `ok` or `denied: <reason>`. Every following line
//! is a publish frame `{"topic": "...", "payload": <json>}`, answered with one
//! status line. End of stream closes the connection.

use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use relay_admission::{ConnectionMetadata, Credential};
use relay_api::{ClientId, ErrorKind, Payload, RelayError};
use relay_engine::{Connection, Engine};

use crate::error::ServerError;

#[derive(Debug, Deserialize)]
struct Hello {
    client_id: String,
    #[serde(default)]
    identity: Option<String>,
    #[serde(default)]
    secret: Option<String>,
    /// `base64("identity:secret")`, instead of `identity` + `secret`.
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    protocols: Vec<String>,
}

impl Hello {
    fn credential(&self) -> Result<Credential, RelayError> {
        match (&self.token, &self.identity, &self.secret) {
            (Some(token), None, None) => Credential::from_token(token),
            (None, Some(identity), Some(secret)) => Ok(Credential::new(identity, secret)),
            _ => Err(RelayError::format(
                "hello: expected either token or identity and secret",
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PublishFrame {
    topic: String,
    payload: serde_json::Value,
}

/// Accept sessions until `token` is cancelled, then wait for open sessions
/// to close.
pub async fn serve(
    engine: Arc<Engine>,
    addr: &str,
    token: CancellationToken,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    tracing::info!(addr, "ingress listening");

    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let engine = engine.clone();
                    let token = token.child_token();
                    sessions.spawn(async move {
                        tracing::debug!(%peer, "session opened");
                        if let Err(e) = session(&engine, stream, token).await {
                            tracing::warn!(%peer, error = %e, "session ended with error");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    while sessions.join_next().await.is_some() {}
    tracing::info!("ingress stopped");
    Ok(())
}

/// Run one session over any byte stream.
pub async fn session<S>(
    engine: &Engine,
    stream: S,
    token: CancellationToken,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();

    let Some(hello) = next_line(&mut lines, &token).await? else {
        return Ok(());
    };
    let conn = match admit(engine, &hello) {
        Ok(conn) => conn,
        Err(e) => {
            reply(&mut write, &format!("denied: {}", e.message)).await?;
            return Ok(());
        }
    };
    reply(&mut write, "ok").await?;

    let result = async {
        while let Some(line) = next_line(&mut lines, &token).await? {
            if line.trim().is_empty() {
                continue;
            }
            let (status, close) = publish_line(&conn, &line).await;
            reply(&mut write, &status).await?;
            if close {
                break;
            }
        }
        Ok::<(), ServerError>(())
    }
    .await;

    conn.disconnect().await;
    result
}

fn admit(engine: &Engine, line: &str) -> Result<Connection, RelayError> {
    let hello: Hello = serde_json::from_str(line)?;
    let credential = hello.credential()?;
    let meta = ConnectionMetadata::new(engine.next_connection_id(), ClientId::new(hello.client_id))
        .with_protocols(hello.protocols);
    engine.connect(meta, &credential)
}

/// Returns the status line and whether the session must close.
async fn publish_line(conn: &Connection, line: &str) -> (String, bool) {
    let frame: PublishFrame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(e) => return (format!("error: {}", RelayError::from(e)), false),
    };
    let payload = match serde_json::to_vec(&frame.payload) {
        Ok(body) => Payload::from(body),
        Err(e) => return (format!("error: {}", RelayError::from(e)), false),
    };

    match conn.publish(&frame.topic, payload).await {
        Ok(results) => {
            let failed = results.iter().filter(|r| !r.is_ok()).count();
            if failed == 0 {
                (format!("ok {}", results.len()), false)
            } else {
                (format!("partial: {failed} of {} actions failed", results.len()), false)
            }
        }
        Err(e) => {
            let expired = e.kind() == ErrorKind::Auth && conn.policy().is_expired(Instant::now());
            (format!("error: {e}"), expired)
        }
    }
}

async fn next_line<R>(
    lines: &mut Lines<BufReader<R>>,
    token: &CancellationToken,
) -> Result<Option<String>, ServerError>
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        _ = token.cancelled() => Ok(None),
        line = lines.next_line() => Ok(line?),
    }
}

async fn reply<W: AsyncWrite + Unpin>(write: &mut W, line: &str) -> Result<(), ServerError> {
    write.write_all(line.as_bytes()).await?;
    write.write_all(b"\n").await?;
    write.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_engine::{HandlerRegistry, RelayConfig};

    const CONFIG: &str = r#"
        [[admission.principals]]
        identity = "sensor"
        secret = "s3cret"
        publish = ["iot/#"]

        [[streams]]
        name = "telemetry"
        partitions = 1

        [[rules]]
        id = "ingest"
        topic = "iot/stream"
        [[rules.actions]]
        type = "put_to_stream"
        stream = "telemetry"
    "#;

    async fn engine() -> Arc<Engine> {
        let config = RelayConfig::parse(CONFIG).unwrap();
        Arc::new(Engine::bootstrap(config, HandlerRegistry::new()).await.unwrap())
    }

    /// Write `input`, close the write side, and collect every reply.
    async fn converse(engine: Arc<Engine>, input: &str) -> Vec<String> {
        let (client, server) = tokio::io::duplex(8 * 1024);
        let task = tokio::spawn(async move {
            session(&engine, server, CancellationToken::new()).await.unwrap();
        });

        let (read, mut write) = tokio::io::split(client);
        write.write_all(input.as_bytes()).await.unwrap();
        write.shutdown().await.unwrap();

        let mut replies = Vec::new();
        let mut lines = BufReader::new(read).lines();
        while let Some(line) = lines.next_line().await.unwrap() {
            replies.push(line);
        }
        task.await.unwrap();
        replies
    }

    #[tokio::test]
    async fn admitted_session_publishes() {
        let engine = engine().await;
        let input = concat!(
            r#"{"client_id":"dev-1","identity":"sensor","secret":"s3cret"}"#,
            "\n",
            r#"{"topic":"iot/stream","payload":{"temp":21}}"#,
            "\n",
            r#"{"topic":"iot/other","payload":1}"#,
            "\n",
            r#"{"topic":"fleet/stream","payload":1}"#,
            "\n",
            "not json\n",
        );
        let replies = converse(engine.clone(), input).await;

        assert_eq!(replies[0], "ok");
        assert_eq!(replies[1], "ok 1");
        assert_eq!(replies[2], "ok 0");
        assert!(replies[3].starts_with("error: auth:"), "{}", replies[3]);
        assert!(replies[4].starts_with("error: format:"), "{}", replies[4]);

        let stream = engine.stream(&"telemetry".into()).unwrap();
        assert_eq!(stream.total_depth(), 1);
        assert!(!engine.presence().is_connected(&ClientId::new("dev-1")));
    }

    #[tokio::test]
    async fn token_hello_is_accepted() {
        let input = concat!(r#"{"client_id":"dev-1","token":"c2Vuc29yOnMzY3JldA=="}"#, "\n");
        assert_eq!(converse(engine().await, input).await, vec!["ok"]);
    }

    #[tokio::test]
    async fn bad_credentials_are_denied() {
        let engine = engine().await;
        let input = concat!(
            r#"{"client_id":"dev-1","identity":"sensor","secret":"nope"}"#,
            "\n",
            r#"{"topic":"iot/stream","payload":1}"#,
            "\n",
        );
        let replies = converse(engine.clone(), input).await;

        assert_eq!(replies, vec!["denied: invalid credentials"]);
        assert_eq!(engine.stream(&"telemetry".into()).unwrap().total_depth(), 0);
    }

    #[tokio::test]
    async fn ambiguous_hello_is_denied() {
        let input = concat!(r#"{"client_id":"dev-1","identity":"sensor"}"#, "\n");
        let replies = converse(engine().await, input).await;
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("denied: hello:"), "{}", replies[0]);
    }
}
