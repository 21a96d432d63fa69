use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    // 应用信息
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 客户端标识（动态部分，可在运行时修改）
    pub identity: String,
    pub token_file: &'static str,

    // 令牌/注册服务
    pub server_base_url: &'static str,

    // 控制桥配置
    pub control_local_port: u16,
    pub control_remote_port: u16,
    pub control_local_ip: &'static str,
    pub control_remote_ip: &'static str,
    pub control_buffer_size: usize,

    // 音频首选格式
    pub audio_sample_rate: u32,
    pub audio_channels: u32,
    pub audio_frames_per_buffer: usize,
    pub audio_music_path: &'static str,

    // 呼叫参数
    pub call_default_to: &'static str,
    pub call_ringback: bool,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            // 应用信息
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            // 客户端标识初始化为config.toml中的值
            identity: env!("CLIENT_IDENTITY").to_string(),
            token_file: env!("CLIENT_TOKEN_FILE"),

            // 令牌/注册服务
            server_base_url: env!("SERVER_BASE_URL"),

            // 控制桥配置
            control_local_port: env!("CONTROL_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse CONTROL_LOCAL_PORT")?,
            control_remote_port: env!("CONTROL_REMOTE_PORT").parse()
                .map_err(|_| "Failed to parse CONTROL_REMOTE_PORT")?,
            control_local_ip: env!("CONTROL_LOCAL_IP"),
            control_remote_ip: env!("CONTROL_REMOTE_IP"),
            control_buffer_size: env!("CONTROL_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse CONTROL_BUFFER_SIZE")?,

            // 音频首选格式
            audio_sample_rate: env!("AUDIO_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse AUDIO_SAMPLE_RATE")?,
            audio_channels: env!("AUDIO_CHANNELS").parse()
                .map_err(|_| "Failed to parse AUDIO_CHANNELS")?,
            audio_frames_per_buffer: env!("AUDIO_FRAMES_PER_BUFFER").parse()
                .map_err(|_| "Failed to parse AUDIO_FRAMES_PER_BUFFER")?,
            audio_music_path: env!("AUDIO_MUSIC_PATH"),

            // 呼叫参数
            call_default_to: env!("CALL_DEFAULT_TO"),
            call_ringback: env!("CALL_RINGBACK").parse()
                .map_err(|_| "Failed to parse CALL_RINGBACK")?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_from_build_env() {
        let config = Config::new().unwrap();
        assert!(!config.app_name.is_empty());
        assert!(config.audio_sample_rate > 0);
        assert!(config.audio_channels >= 1);
        assert!(config.audio_frames_per_buffer > 0);
    }
}
