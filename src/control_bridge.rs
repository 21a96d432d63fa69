use crate::config::Config;
use crate::protocol::{BridgeCommand, BridgeEvent};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Local UDP surface for driving and observing the client.
///
/// A CLI (or test harness) on the remote port sends [`BridgeCommand`]
/// datagrams and receives [`BridgeEvent`] datagrams back.
pub struct ControlBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    tx: mpsc::Sender<BridgeCommand>,
    buffer_size: usize,
}

// 控制进程和Core进程通过本地UDP通信，端口在配置中指定
impl ControlBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<BridgeCommand>) -> anyhow::Result<Self> {
        // 绑定本地UDP端口
        let socket = UdpSocket::bind(format!(
            "{}:{}",
            config.control_local_ip, config.control_local_port
        ))
        .await?;
        let target_addr = format!("{}:{}", config.control_remote_ip, config.control_remote_port);

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            tx,
            buffer_size: config.control_buffer_size,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            // 通过UDP socket接收命令
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            if len > 0 {
                if let Ok(text) = std::str::from_utf8(&buf[..len]) {
                    match serde_json::from_str::<BridgeCommand>(text) {
                        Ok(cmd) => {
                            log::debug!("Control command from {}: {}", peer, cmd.cmd_type);
                            if let Err(e) = self.tx.send(cmd).await {
                                eprintln!("Failed to forward control command: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            // 可能不是JSON，忽略
                            log::warn!("Ignoring malformed control datagram: {}", e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn send_event(&self, event: &BridgeEvent) -> anyhow::Result<()> {
        self.socket
            .send_to(event.to_json().as_bytes(), &self.target_addr)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;

    async fn harness() -> (Arc<ControlBridge>, mpsc::Receiver<BridgeCommand>, UdpSocket) {
        let config = Config::default();
        let (tx, rx) = mpsc::channel(16);
        let bridge = Arc::new(ControlBridge::new(&config, tx).await.unwrap());
        let cli = UdpSocket::bind(format!(
            "{}:{}",
            config.control_remote_ip, config.control_remote_port
        ))
        .await
        .unwrap();
        cli.connect(format!(
            "{}:{}",
            config.control_local_ip, config.control_local_port
        ))
        .await
        .unwrap();
        tokio::spawn({
            let bridge = bridge.clone();
            async move {
                let _ = bridge.run().await;
            }
        });
        (bridge, rx, cli)
    }

    #[tokio::test]
    #[serial]
    async fn forwards_commands_and_sends_events() {
        let (bridge, mut rx, cli) = harness().await;

        cli.send(br#"{"type":"call","to":"bob"}"#).await.unwrap();
        let cmd = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cmd.cmd_type, "call");
        assert_eq!(cmd.to.as_deref(), Some("bob"));

        let event = BridgeEvent {
            event_type: "registered".to_string(),
            ..Default::default()
        };
        bridge.send_event(&event).await.unwrap();
        let mut buf = [0u8; 1024];
        let len = tokio::time::timeout(Duration::from_secs(2), cli.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let text = std::str::from_utf8(&buf[..len]).unwrap();
        assert!(text.contains(r#""type":"registered""#));
    }

    #[tokio::test]
    #[serial]
    async fn skips_malformed_datagrams() {
        let (_bridge, mut rx, cli) = harness().await;

        cli.send(b"definitely not json").await.unwrap();
        cli.send(br#"{"type":"hangup"}"#).await.unwrap();

        let cmd = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        // The bad datagram was dropped; the next valid one still arrives.
        assert_eq!(cmd.cmd_type, "hangup");
    }
}
