use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    client: Client,
    server: Server,
    control: Control,
    audio: Audio,
    call: Call,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Client {
    identity: String,
    token_file: String,
}

#[derive(Deserialize)]
struct Server {
    base_url: String,
}

#[derive(Deserialize)]
struct Control {
    local_port: u16,
    remote_port: u16,
    local_ip: String,
    remote_ip: String,
    buffer_size: usize,
}

#[derive(Deserialize)]
struct Audio {
    sample_rate: u32,
    channels: u32,
    frames_per_buffer: usize,
    music_path: String,
}

#[derive(Deserialize)]
struct Call {
    default_to: String,
    ringback: bool,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 客户端标识
    println!("cargo:rustc-env=CLIENT_IDENTITY={}", config.client.identity);
    println!("cargo:rustc-env=CLIENT_TOKEN_FILE={}", config.client.token_file);

    // 服务端配置
    println!("cargo:rustc-env=SERVER_BASE_URL={}", config.server.base_url);

    // 控制桥配置
    println!("cargo:rustc-env=CONTROL_LOCAL_PORT={}", config.control.local_port);
    println!("cargo:rustc-env=CONTROL_REMOTE_PORT={}", config.control.remote_port);
    println!("cargo:rustc-env=CONTROL_LOCAL_IP={}", config.control.local_ip);
    println!("cargo:rustc-env=CONTROL_REMOTE_IP={}", config.control.remote_ip);
    println!("cargo:rustc-env=CONTROL_BUFFER_SIZE={}", config.control.buffer_size);

    // 音频配置
    println!("cargo:rustc-env=AUDIO_SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=AUDIO_CHANNELS={}", config.audio.channels);
    println!("cargo:rustc-env=AUDIO_FRAMES_PER_BUFFER={}", config.audio.frames_per_buffer);
    println!("cargo:rustc-env=AUDIO_MUSIC_PATH={}", config.audio.music_path);

    // 呼叫配置
    println!("cargo:rustc-env=CALL_DEFAULT_TO={}", config.call.default_to);
    println!("cargo:rustc-env=CALL_RINGBACK={}", config.call.ringback);
}
