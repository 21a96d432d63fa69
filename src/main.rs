mod audio;
mod call;
mod config;
mod control_bridge;
mod controller;
mod engine;
mod protocol;
mod push;
mod registration;

use config::Config;
use control_bridge::ControlBridge;
use controller::{CoreController, InstalledDevice};
use engine::VoiceEngine;
use mac_address::get_mac_address;
use push::{PushCredentials, PushGateway};
use registration::RegistrationClient;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().unwrap_or_default();
    let identity = config.identity.clone();

    // 设备令牌：先从本地文件读取以保持重启间身份一致，不存在则生成新的并保存
    let device_token = load_or_create_device_token(config.token_file);

    // 创建通道，用于组件间通信
    // 控制命令通道
    let (cmd_tx, mut cmd_rx) = mpsc::channel(100);

    // 控制事件通道（控制器 -> 控制桥）
    let (outbound_tx, mut outbound_rx) = mpsc::channel(100);

    // 呼叫与推送事件通道
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    // 启动控制桥，优先启动，用于上报注册进度
    let bridge = Arc::new(ControlBridge::new(&config, cmd_tx).await?);
    let bridge_clone = bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = bridge_clone.run().await {
            eprintln!("ControlBridge error: {}", e);
        }
    });

    // 获取访问令牌，失败则重试
    let registration = RegistrationClient::new(&config)?;
    let access_token = loop {
        match registration.fetch_access_token().await {
            Ok(token) => {
                println!("Access token obtained for {}", registration.identity());
                break token;
            }
            Err(e) => {
                eprintln!("Access token fetch failed: {:#}. Retrying in 5s...", e);
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        }
    };

    // 引擎与音频设备
    let engine = Arc::new(VoiceEngine::new());
    engine.set_ringback(config.call_ringback);
    let device = InstalledDevice::from_config(&config);
    device.install(&engine);

    // 推送网关，凭证更新会触发注册
    let gateway = Arc::new(PushGateway::new(controller::push_delegate(
        events_tx.clone(),
    )));

    let mut controller = CoreController::new(
        config,
        engine,
        device,
        gateway.clone(),
        registration,
        access_token,
        events_tx,
        outbound_tx,
    );

    // 模拟推送服务：启动即交付本机设备令牌，控制器随之完成注册
    gateway
        .credentials_updated(PushCredentials::new(device_token.into_bytes()))
        .await;

    println!("Voice client core started. Identity: {}", identity);

    // 主事件循环，处理控制命令、呼叫事件和推送事件
    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                break;
            }

            Some(cmd) = cmd_rx.recv() => {
                controller.handle_command(cmd).await;
            }

            Some(event) = events_rx.recv() => {
                controller.handle_event(event).await;
            }

            // 控制器产生的事件转发给控制桥
            Some(event) = outbound_rx.recv() => {
                if let Err(e) = bridge.send_event(&event).await {
                    eprintln!("Failed to send bridge event: {}", e);
                }
            }
        }
    }

    // 退出前释放推送绑定
    gateway.credentials_invalidated().await;
    while let Ok(event) = events_rx.try_recv() {
        controller.handle_event(event).await;
    }

    Ok(())
}

// 设备令牌等同于推送令牌，按机器持久化
fn load_or_create_device_token(path: &str) -> String {
    if let Ok(content) = std::fs::read_to_string(path) {
        let trimmed = content.trim();
        if !trimmed.is_empty() {
            println!("Loaded device token from {}", path);
            return trimmed.to_string();
        }
    }

    let token = match get_mac_address() {
        Ok(Some(mac)) => format!("{}-{}", mac.to_string().to_lowercase(), Uuid::new_v4()),
        _ => Uuid::new_v4().to_string(),
    };
    println!("Generated new device token: {}", token);
    if let Err(e) = std::fs::write(path, &token) {
        eprintln!("Failed to save device token to {}: {}", path, e);
    } else {
        println!("Saved device token to {}", path);
    }
    token
}
