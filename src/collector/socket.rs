//! WebSocket I/O 任务
//!
//! 每个 socket 一个读任务 + 一个写任务，只负责收发文本帧，
//! 所有状态变更以 `Command` 的形式投递给 Collector。

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::Command;
use crate::config::GatewayKey;
use crate::error::Result;

type GatewayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 没有收到 close 帧的异常断开
const ABNORMAL_CLOSURE: u16 = 1006;
/// close 帧里没有状态码
const NO_STATUS: u16 = 1005;

/// 打开 socket 并开始收发
pub(crate) fn spawn(
    key: GatewayKey,
    generation: u64,
    tx: mpsc::UnboundedSender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(run(key, generation, tx))
}

async fn open(key: &GatewayKey) -> Result<GatewayStream> {
    let (stream, _) = connect_async(key.url().as_str()).await?;
    Ok(stream)
}

async fn run(key: GatewayKey, generation: u64, tx: mpsc::UnboundedSender<Command>) {
    tracing::debug!("Connecting to gateway {} (generation={})", key, generation);

    let stream = match open(&key).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = tx.send(Command::Closed {
                key,
                generation,
                reason: format!("connect failed: {}", e),
                error: true,
            });
            return;
        }
    };

    let (mut sink, mut source) = stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    if tx
        .send(Command::Opened {
            key: key.clone(),
            generation,
            outbound: out_tx,
        })
        .is_err()
    {
        return;
    }

    // 写任务：Collector 释放 outbound 后退出并关闭 socket
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                tracing::debug!("Gateway write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let (reason, error) = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame = Command::Frame {
                    key: key.clone(),
                    generation,
                    text: text.to_string(),
                };
                if tx.send(frame).is_err() {
                    writer.abort();
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let code = frame.map(|f| u16::from(f.code)).unwrap_or(NO_STATUS);
                break (format!("disconnected ({})", code), false);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                break (format!("disconnected ({}): {}", ABNORMAL_CLOSURE, e), true);
            }
            None => break (format!("disconnected ({})", ABNORMAL_CLOSURE), false),
        }
    };

    writer.abort();
    let _ = tx.send(Command::Closed {
        key,
        generation,
        reason,
        error,
    });
}
